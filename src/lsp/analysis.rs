//! CEL analysis of virtual documents.
//!
//! Produces wire diagnostics in the virtual coordinates of the analyzed
//! document; re-anchoring is the aggregator's job.

use cel_core::{parse, CheckError, CheckErrorKind, Env, ParseError};
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString, Url};

use crate::document::{LineIndex, VirtualDocument};

const SOURCE: &str = "cel";

fn check_error_code(kind: &CheckErrorKind) -> &'static str {
    match kind {
        CheckErrorKind::UndeclaredReference { .. } => "undeclared-reference",
        CheckErrorKind::NoMatchingOverload { .. } => "no-matching-overload",
        CheckErrorKind::TypeMismatch { .. } | CheckErrorKind::NotAssignable { .. } => {
            "type-mismatch"
        }
        CheckErrorKind::UndefinedField { .. } => "undefined-field",
        CheckErrorKind::HeterogeneousAggregate { .. } => "heterogeneous-aggregate",
        CheckErrorKind::NotAType { .. } => "not-a-type",
        CheckErrorKind::Other(_) => "check-error",
    }
}

fn error_diagnostic(
    index: &LineIndex<'_>,
    span: &std::ops::Range<usize>,
    message: String,
    code: Option<&str>,
) -> Diagnostic {
    Diagnostic {
        range: index.range(span),
        severity: Some(DiagnosticSeverity::ERROR),
        code: code.map(|c| NumberOrString::String(c.to_string())),
        source: Some(SOURCE.to_string()),
        message,
        ..Default::default()
    }
}

fn parse_diagnostics(errors: &[ParseError], index: &LineIndex<'_>) -> Vec<Diagnostic> {
    errors
        .iter()
        .map(|e| error_diagnostic(index, &e.span, e.message.clone(), None))
        .collect()
}

fn check_diagnostics(errors: &[CheckError], index: &LineIndex<'_>) -> Vec<Diagnostic> {
    errors
        .iter()
        .map(|e| error_diagnostic(index, &e.span, e.message(), Some(check_error_code(&e.kind))))
        .collect()
}

/// Parse and type-check one CEL program.
pub fn analyze_source(source: &str, env: &Env) -> Vec<Diagnostic> {
    if source.trim().is_empty() {
        return Vec::new();
    }
    let index = LineIndex::new(source);
    let result = parse(source);
    let mut diagnostics = parse_diagnostics(&result.errors, &index);
    if let Some(ast) = result.ast.as_ref() {
        diagnostics.extend(check_diagnostics(&env.check(ast).errors, &index));
    }
    diagnostics
}

/// Diagnostics for every CEL document reachable from `root`, keyed by document uri.
///
/// Documents without content get an empty batch so earlier markers are cleared.
pub fn analyze_tree(root: &VirtualDocument, env: &Env) -> Vec<(Url, Vec<Diagnostic>)> {
    root.walk()
        .filter(|document| document.language() == SOURCE)
        .map(|document| {
            (
                document.uri().clone(),
                analyze_source(&document.value(), env),
            )
        })
        .collect()
}
