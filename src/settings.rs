//! Settings infrastructure for polydoc.
//!
//! `settings.toml` tunes the composition engine, declares override rules and
//! extra extractors, and adds variables to the CEL environment. Every
//! section is optional; configuration mistakes are logged and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cel_core::{CelType, Env};
use serde::Deserialize;
use tracing::{info, warn};

use crate::document::{
    CompositionConfig, CompositionContext, OverrideRule, OverrideScope, RegexExtractor,
    RegexExtractorOptions, RetryPolicy,
};
use crate::error::{OverrideError, RegistryError};
use crate::protovalidate::{protovalidate_env, ProtovalidateExtractor};

/// Root settings structure loaded from settings.toml.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub composition: CompositionSettings,
    pub update: UpdateSettings,
    pub overrides: Vec<OverrideSettings>,
    pub extractors: Vec<ExtractorSettings>,
    pub cel: CelSettings,
}

/// `[composition]`
#[derive(Debug, Default, Deserialize)]
pub struct CompositionSettings {
    pub blank_lines_between_blocks: Option<u32>,
    pub foreign_document_lifetime: Option<u32>,
}

impl CompositionSettings {
    pub fn config(&self) -> CompositionConfig {
        let defaults = CompositionConfig::default();
        CompositionConfig {
            blank_lines_between_blocks: self
                .blank_lines_between_blocks
                .unwrap_or(defaults.blank_lines_between_blocks),
            foreign_document_lifetime: self
                .foreign_document_lifetime
                .unwrap_or(defaults.foreign_document_lifetime)
                .max(1),
        }
    }
}

/// `[update]`
#[derive(Debug, Default, Deserialize)]
pub struct UpdateSettings {
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

impl UpdateSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            backoff: self
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
        }
    }
}

fn default_scope() -> String {
    "line".to_string()
}

/// One `[[overrides]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideSettings {
    pub language: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    pub pattern: String,
    pub replacement: String,
    pub reverse_pattern: Option<String>,
    pub reverse_replacement: Option<String>,
}

impl OverrideSettings {
    pub fn rule(&self) -> Result<(OverrideScope, OverrideRule), OverrideError> {
        let scope = self.scope.parse()?;
        let rule = OverrideRule::new(&self.pattern, self.replacement.as_str())?;
        let rule = match (&self.reverse_pattern, &self.reverse_replacement) {
            (Some(pattern), Some(replacement)) => rule.with_reverse(pattern, replacement.as_str())?,
            (None, None) => rule,
            _ => {
                return Err(OverrideError::IncompleteReverse {
                    pattern: self.pattern.clone(),
                })
            }
        };
        Ok((scope, rule))
    }
}

fn default_group() -> usize {
    1
}

/// One `[[extractors]]` entry, turned into a [`RegexExtractor`].
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorSettings {
    pub host: String,
    pub language: String,
    pub pattern: String,
    #[serde(default = "default_group")]
    pub group: usize,
    #[serde(default)]
    pub keep_in_host: bool,
    #[serde(default)]
    pub standalone: bool,
    pub file_extension: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
}

impl ExtractorSettings {
    pub fn extractor(&self) -> Result<RegexExtractor, RegistryError> {
        RegexExtractor::new(RegexExtractorOptions {
            language: self.language.clone(),
            pattern: self.pattern.clone(),
            group: self.group,
            keep_in_host: self.keep_in_host,
            standalone: self.standalone,
            file_extension: self
                .file_extension
                .clone()
                .unwrap_or_else(|| self.language.clone()),
            exclusive: self.exclusive,
        })
    }
}

/// `[cel]`
#[derive(Debug, Default, Deserialize)]
pub struct CelSettings {
    /// Variable declarations: name -> type string, see [`parse_type_string`].
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Settings {
    /// Extractors and override rules for every document tree.
    ///
    /// The protovalidate extractor is always registered for `proto` hosts.
    pub fn composition_context(&self) -> CompositionContext {
        let mut context = CompositionContext {
            config: self.composition.config(),
            ..Default::default()
        };

        if let Err(e) = context
            .extractors
            .register("proto", Arc::new(ProtovalidateExtractor::new()))
        {
            warn!(error = %e, "failed to register protovalidate extractor");
        }

        for entry in &self.extractors {
            let registered = entry.extractor().and_then(|extractor| {
                context.extractors.register(&entry.host, Arc::new(extractor))
            });
            if let Err(e) = registered {
                warn!(host = %entry.host, language = %entry.language, error = %e, "skipping extractor");
            }
        }

        for entry in &self.overrides {
            match entry.rule() {
                Ok((scope, rule)) => context.overrides.add(&entry.language, scope, rule),
                Err(e) => {
                    warn!(language = %entry.language, error = %e, "skipping override rule")
                }
            }
        }

        context
    }

    /// The protovalidate environment plus the configured variables.
    pub fn cel_env(&self) -> Env {
        let mut env = protovalidate_env();
        for (name, type_str) in &self.cel.variables {
            match parse_type_string(type_str) {
                Ok(cel_type) => {
                    env.add_variable(name.as_str(), cel_type);
                }
                Err(e) => warn!(variable = %name, error = %e, "skipping variable"),
            }
        }
        env
    }
}

/// Everything the server derives from settings once, at initialization.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub context: Arc<CompositionContext>,
    pub retry: RetryPolicy,
    pub env: Arc<Env>,
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            context: Arc::new(settings.composition_context()),
            retry: settings.update.retry_policy(),
            env: Arc::new(settings.cel_env()),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Parse a type string into a CelType.
///
/// Supports primitives, `null`, `dyn`, `timestamp`, `duration`, `list(T)`,
/// `map(K, V)`, `optional(T)`; anything else names a message type.
pub fn parse_type_string(s: &str) -> Result<CelType, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty type string".to_string());
    }

    if let Some((name, rest)) = s.split_once('(') {
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| format!("missing closing paren in '{}'", s))?;
        return match (name.trim(), split_params(inner).as_slice()) {
            ("list", [elem]) => Ok(CelType::list(parse_type_string(elem)?)),
            ("map", [key, value]) => Ok(CelType::map(
                parse_type_string(key)?,
                parse_type_string(value)?,
            )),
            ("optional", [elem]) => Ok(CelType::optional(parse_type_string(elem)?)),
            (name, params) => Err(format!(
                "unsupported type '{}' with {} parameter(s)",
                name,
                params.len()
            )),
        };
    }

    Ok(match s {
        "bool" => CelType::Bool,
        "int" => CelType::Int,
        "uint" => CelType::UInt,
        "double" => CelType::Double,
        "string" => CelType::String,
        "bytes" => CelType::Bytes,
        "null" => CelType::Null,
        "dyn" => CelType::Dyn,
        "timestamp" => CelType::Timestamp,
        "duration" => CelType::Duration,
        message => CelType::message(message),
    })
}

/// Split type parameters on top-level commas.
fn split_params(s: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                params.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(s[start..].trim());
    params
}

/// Load settings from a settings.toml file.
///
/// Returns default settings if the file doesn't exist or can't be parsed.
pub fn load_settings(path: &Path) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse settings");
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    }
}

/// Discover settings.toml by searching up the directory tree, then direct children.
///
/// Returns `(settings, settings_dir)`; when nothing is found the directory is `start_dir`.
pub fn discover_settings(start_dir: &Path) -> (Settings, PathBuf) {
    let candidates = start_dir.ancestors().map(Path::to_path_buf).chain(
        std::fs::read_dir(start_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .map(|entry| entry.path()),
    );

    for dir in candidates {
        let candidate = dir.join("settings.toml");
        if candidate.is_file() {
            info!(path = %candidate.display(), "using settings");
            return (load_settings(&candidate), dir);
        }
    }
    (Settings::default(), start_dir.to_path_buf())
}
