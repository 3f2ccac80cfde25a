//! Language-server side of the composition engine.
//!
//! This module provides:
//! - CEL analysis of virtual documents
//! - the diagnostic aggregator that re-anchors results onto editors
//! - a marker store the server publishes from

pub mod analysis;
pub mod diagnostics;
pub mod markers;

pub use analysis::{analyze_source, analyze_tree};
pub use diagnostics::{
    BatchOutcome, DiagnosticAggregator, DiagnosticTable, EditorDiagnostic, Marker, MarkerId,
    MarkerRenderer,
};
pub use markers::MarkerStore;
