//! Error types for the composition engine and its collaborators.

use thiserror::Error;

/// Errors raised while composing a virtual document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document was disposed and can no longer receive content.
    #[error("virtual document '{id_path}' is disposed")]
    Disposed { id_path: String },

    /// A derived document URI could not be built.
    #[error("cannot derive uri for '{id_path}' from '{path}': {message}")]
    InvalidUri {
        path: String,
        id_path: String,
        message: String,
    },

    /// A source line that should exist in the coordinate tables is missing.
    #[error("source line {line} is not mapped in '{id_path}'")]
    UnmappedSourceLine { line: u32, id_path: String },

    /// A virtual line that should exist in the coordinate tables is missing.
    #[error("virtual line {line} is not mapped in '{id_path}'")]
    UnmappedVirtualLine { line: u32, id_path: String },

    /// A virtual line exists but was synthesized (block separator).
    #[error("virtual line {line} of '{id_path}' has no source line")]
    SyntheticLine { line: u32, id_path: String },

    /// A child that was just claimed is not owned by its parent.
    #[error("foreign document '{key}' is not owned by '{id_path}'")]
    MissingForeignDocument { key: String, id_path: String },

    /// No block of the given editor covers the requested position.
    #[error("editor '{editor}' has no block covering line {line}")]
    NoEditorAtPosition { editor: String, line: u32 },
}

/// Errors raised by the update manager.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The guards stayed held for the whole wait budget.
    #[error("document tree still busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// The rebuild itself failed.
    #[error("rebuild failed: {0}")]
    Document(#[from] DocumentError),
}

/// Errors raised while building override rules.
#[derive(Debug, Error)]
pub enum OverrideError {
    /// A rule pattern is not a valid regular expression.
    #[error("invalid override pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A reverse pattern was given without a reverse replacement, or the other way around.
    #[error("override '{pattern}' declares only half of its reverse rule")]
    IncompleteReverse { pattern: String },

    /// Unknown override scope name in configuration.
    #[error("unknown override scope '{0}' (expected \"block\" or \"line\")")]
    UnknownScope(String),
}

/// Errors raised when registering foreign code extractors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two extractors both claim to own whole blocks of the same host.
    #[error("host '{host}' already has exclusive extractor '{existing}', cannot add '{added}'")]
    ConflictingExclusive {
        host: String,
        existing: String,
        added: String,
    },

    /// An extractor pattern is not a valid regular expression.
    #[error("invalid extractor pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors reported by an external marker renderer.
#[derive(Debug, Error)]
pub enum MarkerError {
    /// The renderer refused the marker.
    #[error("marker rejected: {0}")]
    Rejected(String),
}
