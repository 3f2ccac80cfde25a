//! Marker renderer backed by published diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tower_lsp::lsp_types::Diagnostic;

use super::diagnostics::{Marker, MarkerId, MarkerRenderer};
use crate::document::EditorId;
use crate::error::MarkerError;

/// Keeps attached markers so the server can publish them per editor.
#[derive(Debug, Default)]
pub struct MarkerStore {
    next_id: AtomicU64,
    markers: DashMap<MarkerId, Marker>,
}

impl MarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Markers shown in `editor`, ordered by position.
    pub fn markers_for(&self, editor: &EditorId) -> Vec<Marker> {
        let mut markers: Vec<Marker> = self
            .markers
            .iter()
            .filter(|entry| &entry.value().editor == editor)
            .map(|entry| entry.value().clone())
            .collect();
        markers.sort_by(|a, b| {
            (a.range.start, a.range.end, &a.title).cmp(&(b.range.start, b.range.end, &b.title))
        });
        markers
    }

    /// Markers of `editor` as wire diagnostics.
    pub fn to_diagnostics(&self, editor: &EditorId) -> Vec<Diagnostic> {
        self.markers_for(editor)
            .into_iter()
            .map(|marker| Diagnostic {
                range: marker.range.into(),
                severity: Some(marker.severity),
                message: marker.title,
                ..Default::default()
            })
            .collect()
    }
}

impl MarkerRenderer for MarkerStore {
    fn attach(&self, marker: &Marker) -> Result<MarkerId, MarkerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.markers.insert(id, marker.clone());
        Ok(id)
    }

    fn detach(&self, id: MarkerId) -> Result<(), MarkerError> {
        self.markers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| MarkerError::Rejected(format!("unknown marker {}", id)))
    }
}
