//! Contract for pulling foreign-language code out of a host block.
//!
//! Extractors are registered per host language. The composition engine
//! calls them in registration order; whatever host code one extractor keeps
//! is the input of the next, so nested sub-languages can be peeled off in
//! layers.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use super::position::{position_at_offset, SourcePosition, TextRange};
use crate::error::RegistryError;

/// One piece of an extraction result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedCode {
    /// Where the foreign code sits in the raw block text.
    pub range: Option<TextRange>,
    /// Code to append to the foreign document.
    pub foreign_code: Option<String>,
    /// Code that stays in the host document.
    pub host_code: Option<String>,
    /// Offset of the foreign code inside `range`, when the extractor prefixed it.
    pub virtual_shift: Option<SourcePosition>,
}

impl ExtractedCode {
    pub fn host(code: impl Into<String>) -> Self {
        Self {
            host_code: Some(code.into()),
            ..Default::default()
        }
    }
}

/// A per-language capability that finds foreign code inside host text.
pub trait ForeignCodeExtractor: Send + Sync {
    /// Language of the extracted code.
    fn language(&self) -> &str;

    /// Whether every extraction goes to a fresh document.
    fn standalone(&self) -> bool;

    fn file_extension(&self) -> &str;

    /// Whether this extractor claims entire blocks of its host.
    fn is_exclusive(&self) -> bool {
        false
    }

    fn has_foreign_code(&self, text: &str) -> bool;

    fn extract_foreign_code(&self, text: &str) -> Vec<ExtractedCode>;
}

/// Extractors available for each host language.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_host: HashMap<String, Vec<Arc<dyn ForeignCodeExtractor>>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        host: &str,
        extractor: Arc<dyn ForeignCodeExtractor>,
    ) -> Result<(), RegistryError> {
        let extractors = self.by_host.entry(host.to_string()).or_default();
        if extractor.is_exclusive() {
            if let Some(existing) = extractors.iter().find(|e| e.is_exclusive()) {
                return Err(RegistryError::ConflictingExclusive {
                    host: host.to_string(),
                    existing: existing.language().to_string(),
                    added: extractor.language().to_string(),
                });
            }
        }
        extractors.push(extractor);
        Ok(())
    }

    pub fn for_host(&self, host: &str) -> &[Arc<dyn ForeignCodeExtractor>] {
        self.by_host.get(host).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (host, extractors) in &self.by_host {
            let languages: Vec<_> = extractors.iter().map(|e| e.language()).collect();
            map.entry(host, &languages);
        }
        map.finish()
    }
}

/// Configuration for a [`RegexExtractor`].
#[derive(Debug, Clone)]
pub struct RegexExtractorOptions {
    pub language: String,
    pub pattern: String,
    /// Capture group holding the foreign code. Group 0 takes the whole match.
    pub group: usize,
    /// Keep the matched text in the host document as well.
    pub keep_in_host: bool,
    pub standalone: bool,
    pub file_extension: String,
    pub exclusive: bool,
}

/// Extractor driven by a single regular expression.
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    options: RegexExtractorOptions,
    pattern: Regex,
}

impl RegexExtractor {
    pub fn new(options: RegexExtractorOptions) -> Result<Self, RegistryError> {
        let pattern =
            Regex::new(&options.pattern).map_err(|source| RegistryError::InvalidPattern {
                pattern: options.pattern.clone(),
                source,
            })?;
        Ok(Self { options, pattern })
    }
}

impl ForeignCodeExtractor for RegexExtractor {
    fn language(&self) -> &str {
        &self.options.language
    }

    fn standalone(&self) -> bool {
        self.options.standalone
    }

    fn file_extension(&self) -> &str {
        &self.options.file_extension
    }

    fn is_exclusive(&self) -> bool {
        self.options.exclusive
    }

    fn has_foreign_code(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    fn extract_foreign_code(&self, text: &str) -> Vec<ExtractedCode> {
        let mut results = Vec::new();
        let mut last_end = 0;

        for caps in self.pattern.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            let Some(foreign) = caps.get(self.options.group) else {
                continue;
            };

            let host_code = if self.options.keep_in_host {
                // unmatched text before this match stays in the host too
                Some(text[last_end..whole.end()].to_string())
            } else if last_end < whole.start() {
                Some(text[last_end..whole.start()].to_string())
            } else {
                None
            };

            let range = TextRange::new(
                position_at_offset(text, foreign.start()),
                position_at_offset(text, foreign.end()),
            );
            results.push(ExtractedCode {
                range: Some(range),
                foreign_code: Some(foreign.as_str().to_string()),
                host_code,
                virtual_shift: None,
            });
            last_end = whole.end();
        }

        if last_end < text.len() {
            results.push(ExtractedCode::host(&text[last_end..]));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::position::EditorPosition;

    fn options(keep_in_host: bool) -> RegexExtractorOptions {
        RegexExtractorOptions {
            language: "sql".to_string(),
            pattern: r"%sql (.*)".to_string(),
            group: 1,
            keep_in_host,
            standalone: false,
            file_extension: "sql".to_string(),
            exclusive: false,
        }
    }

    fn host_text(results: &[ExtractedCode]) -> String {
        results
            .iter()
            .filter_map(|r| r.host_code.as_deref())
            .collect()
    }

    #[test]
    fn extracts_with_ranges() {
        let extractor = RegexExtractor::new(options(true)).unwrap();
        let text = "x = 1\n%sql SELECT 1\ny = 2";
        assert!(extractor.has_foreign_code(text));

        let results = extractor.extract_foreign_code(text);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].foreign_code.as_deref(), Some("SELECT 1"));
        assert_eq!(
            results[0].range,
            Some(TextRange::new(
                EditorPosition::new(1, 5),
                EditorPosition::new(1, 13)
            ))
        );
        assert_eq!(results[1].foreign_code, None);
        assert_eq!(host_text(&results), text);
    }

    #[test]
    fn dropping_foreign_code_from_host() {
        let extractor = RegexExtractor::new(options(false)).unwrap();
        let results = extractor.extract_foreign_code("a\n%sql SELECT 1\nb");
        assert_eq!(host_text(&results), "a\n\nb");
    }

    #[test]
    fn nothing_to_extract() {
        let extractor = RegexExtractor::new(options(true)).unwrap();
        assert!(!extractor.has_foreign_code("plain"));
        let results = extractor.extract_foreign_code("plain");
        assert_eq!(results, vec![ExtractedCode::host("plain")]);
    }

    #[test]
    fn second_exclusive_extractor_is_rejected() {
        let mut exclusive = options(false);
        exclusive.exclusive = true;
        let mut registry = ExtractorRegistry::new();
        registry
            .register("python", Arc::new(RegexExtractor::new(exclusive.clone()).unwrap()))
            .unwrap();
        registry
            .register("python", Arc::new(RegexExtractor::new(options(true)).unwrap()))
            .unwrap();
        let err = registry
            .register("python", Arc::new(RegexExtractor::new(exclusive).unwrap()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ConflictingExclusive { .. }));
        assert_eq!(registry.for_host("python").len(), 2);
        assert!(registry.for_host("r").is_empty());
    }

    #[test]
    fn invalid_pattern() {
        let mut opts = options(true);
        opts.pattern = "(".to_string();
        assert!(matches!(
            RegexExtractor::new(opts),
            Err(RegistryError::InvalidPattern { .. })
        ));
    }
}
