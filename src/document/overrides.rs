//! Bidirectional text overrides for marker syntax.
//!
//! A marker line such as `%time expensive()` is not valid code in the
//! language it is embedded in. Override rules rewrite such lines (or whole
//! blocks) into something an analyzer accepts, and their declared inverse
//! turns the rewritten text back into the original marker syntax.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::{Captures, Regex};

use crate::error::OverrideError;

/// Substitution applied to the text matched by a rule.
#[derive(Clone)]
pub enum Replacement {
    /// Regex template with `$1` / `${name}` expansion.
    Template(String),
    /// Pure function of the match.
    Function(Arc<dyn Fn(&Captures<'_>) -> String + Send + Sync>),
}

impl Replacement {
    pub fn function(f: impl Fn(&Captures<'_>) -> String + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }

    fn apply(&self, pattern: &Regex, text: &str) -> String {
        match self {
            Replacement::Template(template) => pattern.replace(text, template.as_str()).into_owned(),
            Replacement::Function(f) => pattern
                .replace(text, |caps: &Captures<'_>| f(caps))
                .into_owned(),
        }
    }
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replacement::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Replacement::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<&str> for Replacement {
    fn from(template: &str) -> Self {
        Replacement::Template(template.to_string())
    }
}

impl From<String> for Replacement {
    fn from(template: String) -> Self {
        Replacement::Template(template)
    }
}

#[derive(Debug, Clone)]
struct Rewrite {
    pattern: Regex,
    replacement: Replacement,
}

impl Rewrite {
    fn compile(pattern: &str, replacement: Replacement) -> Result<Self, OverrideError> {
        let pattern = Regex::new(pattern).map_err(|source| OverrideError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern,
            replacement,
        })
    }
}

/// One rewrite rule together with its optional inverse.
#[derive(Debug, Clone)]
pub struct OverrideRule {
    forward: Rewrite,
    reverse: Option<Rewrite>,
}

impl OverrideRule {
    pub fn new(pattern: &str, replacement: impl Into<Replacement>) -> Result<Self, OverrideError> {
        Ok(Self {
            forward: Rewrite::compile(pattern, replacement.into())?,
            reverse: None,
        })
    }

    /// Declare how text produced by this rule is turned back into the original.
    pub fn with_reverse(
        mut self,
        pattern: &str,
        replacement: impl Into<Replacement>,
    ) -> Result<Self, OverrideError> {
        self.reverse = Some(Rewrite::compile(pattern, replacement.into())?);
        Ok(self)
    }

    fn inverted(&self) -> Option<Self> {
        let reverse = self.reverse.clone()?;
        Some(Self {
            forward: reverse,
            reverse: Some(self.forward.clone()),
        })
    }
}

/// Result of [`OverrideMap::replace_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacedLines {
    pub lines: Vec<String>,
    /// `true` for every line that was produced by a rule.
    pub rewritten: Vec<bool>,
}

/// Ordered rule list where the first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct OverrideMap {
    rules: Vec<OverrideRule>,
}

impl OverrideMap {
    pub fn new(rules: Vec<OverrideRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite `text` with the first rule whose pattern matches, if any.
    pub fn override_for(&self, text: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|rule| rule.forward.pattern.is_match(text))
            .map(|rule| rule.forward.replacement.apply(&rule.forward.pattern, text))
    }

    /// Apply [`Self::override_for`] to every line independently.
    pub fn replace_all<S: AsRef<str>>(&self, lines: &[S]) -> ReplacedLines {
        let mut result = ReplacedLines {
            lines: Vec::with_capacity(lines.len()),
            rewritten: Vec::with_capacity(lines.len()),
        };
        for line in lines {
            let line = line.as_ref();
            match self.override_for(line) {
                Some(replaced) => {
                    result.lines.push(replaced);
                    result.rewritten.push(true);
                }
                None => {
                    result.lines.push(line.to_string());
                    result.rewritten.push(false);
                }
            }
        }
        result
    }

    /// Map built from the inverse of every rule that declares one.
    pub fn reverse(&self) -> OverrideMap {
        OverrideMap {
            rules: self.rules.iter().filter_map(OverrideRule::inverted).collect(),
        }
    }
}

/// Whether a rule applies to a whole block or to individual lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverrideScope {
    Block,
    Line,
}

impl std::str::FromStr for OverrideScope {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" | "cell" => Ok(OverrideScope::Block),
            "line" => Ok(OverrideScope::Line),
            other => Err(OverrideError::UnknownScope(other.to_string())),
        }
    }
}

/// Rules registered per language and scope.
#[derive(Debug, Clone, Default)]
pub struct OverrideRegistry {
    rules: HashMap<(String, OverrideScope), Vec<OverrideRule>>,
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, language: &str, scope: OverrideScope, rule: OverrideRule) {
        self.rules
            .entry((language.to_string(), scope))
            .or_default()
            .push(rule);
    }

    pub fn map_for(&self, language: &str, scope: OverrideScope) -> OverrideMap {
        self.rules
            .get(&(language.to_string(), scope))
            .cloned()
            .map(OverrideMap::new)
            .unwrap_or_default()
    }
}
