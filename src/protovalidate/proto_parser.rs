//! Foreign code extraction of CEL expressions from protovalidate options.
//!
//! Recognizes `expression: "..."` entries inside `(buf.validate.field).cel`,
//! `(buf.validate.message).cel` and `(buf.validate.predefined).cel` option
//! blocks. Commented-out options are ignored. The proto text itself stays
//! in the host document; every expression becomes its own CEL document.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::document::position::position_at_offset;
use crate::document::{ExtractedCode, ForeignCodeExtractor, TextRange};

static OPTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*buf\.validate\.(?:field|message|predefined)\s*\)\s*\.cel\s*=\s*\{")
        .expect("option pattern is valid")
});

/// Does not include the opening quote; the literal is read separately.
static EXPRESSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"expression\s*:\s*").expect("expression pattern is valid"));

/// One `expression:` string literal.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpressionLiteral {
    /// Byte range of the literal contents, quotes excluded.
    contents: Range<usize>,
    /// Contents with escape sequences decoded.
    decoded: String,
}

/// Extracts protovalidate CEL expressions out of `.proto` sources.
#[derive(Debug, Clone, Default)]
pub struct ProtovalidateExtractor;

impl ProtovalidateExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl ForeignCodeExtractor for ProtovalidateExtractor {
    fn language(&self) -> &str {
        "cel"
    }

    fn standalone(&self) -> bool {
        true
    }

    fn file_extension(&self) -> &str {
        "cel"
    }

    fn has_foreign_code(&self, text: &str) -> bool {
        OPTION_PATTERN.is_match(text) && !find_expressions(text).is_empty()
    }

    fn extract_foreign_code(&self, text: &str) -> Vec<ExtractedCode> {
        let mut results = Vec::new();
        let mut last_end = 0;

        for literal in find_expressions(text) {
            let range = TextRange::new(
                position_at_offset(text, literal.contents.start),
                position_at_offset(text, literal.contents.end),
            );
            results.push(ExtractedCode {
                range: Some(range),
                foreign_code: Some(literal.decoded),
                host_code: Some(text[last_end..literal.contents.end].to_string()),
                virtual_shift: None,
            });
            last_end = literal.contents.end;
        }

        if last_end < text.len() {
            results.push(ExtractedCode::host(&text[last_end..]));
        }
        results
    }
}

/// All expression literals of `source`, in source order.
fn find_expressions(source: &str) -> Vec<ExpressionLiteral> {
    let comments = find_comment_ranges(source);
    let mut literals: Vec<ExpressionLiteral> = OPTION_PATTERN
        .find_iter(source)
        .filter(|option| !comments.iter().any(|c| c.contains(&option.start())))
        .filter_map(|option| {
            let open = option.end() - 1;
            let close = find_matching_brace(source, open)?;
            let body = &source[option.end()..close];
            let key = EXPRESSION_PATTERN.find(body)?;
            read_string_literal(source, option.end() + key.end())
        })
        .collect();
    literals.sort_by_key(|l| l.contents.start);
    literals.dedup_by_key(|l| l.contents.start);
    literals
}

/// Byte ranges of `//` and `/* */` comments, ignoring comment markers inside strings.
fn find_comment_ranges(source: &str) -> Vec<Range<usize>> {
    let bytes = source.as_bytes();
    let mut ranges = Vec::new();
    let mut quote: Option<u8> = None;
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if let Some(q) = quote {
            if c == b'\\' {
                pos += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            pos += 1;
            continue;
        }

        match (c, bytes.get(pos + 1)) {
            (b'"' | b'\'', _) => {
                quote = Some(c);
                pos += 1;
            }
            (b'/', Some(b'/')) => {
                let start = pos;
                pos = source[pos..]
                    .find('\n')
                    .map(|n| pos + n)
                    .unwrap_or(bytes.len());
                ranges.push(start..pos);
            }
            (b'/', Some(b'*')) => {
                let start = pos;
                pos = source[pos + 2..]
                    .find("*/")
                    .map(|n| pos + 2 + n + 2)
                    .unwrap_or(bytes.len());
                ranges.push(start..pos);
            }
            _ => pos += 1,
        }
    }
    ranges
}

/// Offset of the `}` closing the `{` at `open`, skipping braces inside strings.
fn find_matching_brace(source: &str, open: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    if bytes.get(open) != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut pos = open;
    while pos < bytes.len() {
        let c = bytes[pos];
        match quote {
            Some(_) if c == b'\\' => pos += 1,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                b'"' | b'\'' => quote = Some(c),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(pos);
                    }
                }
                _ => {}
            },
        }
        pos += 1;
    }
    None
}

/// Read the quoted literal starting at `start`. Unterminated literals yield `None`.
fn read_string_literal(source: &str, start: usize) -> Option<ExpressionLiteral> {
    let rest = source.get(start..)?;
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let contents_start = start + 1;

    let mut decoded = String::new();
    let mut chars = source[contents_start..].char_indices();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            return Some(ExpressionLiteral {
                contents: contents_start..contents_start + i,
                decoded,
            });
        }
        if c == '\n' {
            return None;
        }
        if c != '\\' {
            decoded.push(c);
            continue;
        }
        let (_, escaped) = chars.next()?;
        decoded.push(match escaped {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            other => other,
        });
    }
    None
}
