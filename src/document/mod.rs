//! Virtual document composition.
//!
//! This module provides:
//! - coordinate types for the source, editor and virtual spaces
//! - bidirectional override maps for marker syntax
//! - the foreign code extraction contract
//! - `VirtualDocument`, the composed buffer with its coordinate tables
//! - `UpdateManager`, which serializes rebuilds of a document tree
//! - `DocumentStore` for per-file lifecycle in the server

pub mod extraction;
pub mod overrides;
pub mod position;
mod state;
pub mod text;
pub mod update;
pub mod virtual_document;

pub use extraction::{
    ExtractedCode, ExtractorRegistry, ForeignCodeExtractor, RegexExtractor, RegexExtractorOptions,
};
pub use overrides::{OverrideMap, OverrideRegistry, OverrideRule, OverrideScope, Replacement};
pub use position::{
    EditorId, EditorPosition, EditorRange, SourcePosition, TextRange, VirtualPosition,
};
pub use state::{ComposedDocument, DocumentStore};
pub use text::LineIndex;
pub use update::{RetryPolicy, UpdateEvent, UpdateManager};
pub use virtual_document::{
    CodeBlock, CompositionConfig, CompositionContext, DocumentEvent, DocumentInfo, VirtualDocument,
};
