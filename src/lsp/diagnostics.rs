//! Re-anchoring of virtual-document diagnostics onto editors.
//!
//! Analysis runs against virtual buffers, so diagnostics come back in
//! virtual coordinates. The aggregator collapses diagnostics that share a
//! range, moves them to editor coordinates, drops the ones that no longer
//! make sense for the current tree, and diffs the resulting markers against
//! the ones already shown so re-sending a batch never flickers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, NumberOrString, Range, Url};
use tracing::{debug, warn};

use crate::document::{
    EditorId, EditorPosition, EditorRange, VirtualDocument, VirtualPosition,
};
use crate::error::{DocumentError, MarkerError};

/// Handle returned by a renderer for an attached marker.
pub type MarkerId = u64;

/// A merged annotation as handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub editor: EditorId,
    pub range: EditorRange,
    pub title: String,
    pub severity: DiagnosticSeverity,
}

/// Whatever draws markers in an editor.
pub trait MarkerRenderer: Send + Sync {
    fn attach(&self, marker: &Marker) -> Result<MarkerId, MarkerError>;
    fn detach(&self, id: MarkerId) -> Result<(), MarkerError>;
}

/// One diagnostic placed in an editor.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorDiagnostic {
    pub diagnostic: Diagnostic,
    pub editor: EditorId,
    pub range: EditorRange,
}

/// Latest placed diagnostics of every virtual document, for presentation layers.
#[derive(Debug, Default)]
pub struct DiagnosticTable {
    entries: DashMap<Url, Vec<EditorDiagnostic>>,
}

impl DiagnosticTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, document: &Url) -> Option<Vec<EditorDiagnostic>> {
        self.entries.get(document).map(|entry| entry.clone())
    }

    /// Everything placed in `editor`, across documents.
    pub fn for_editor(&self, editor: &EditorId) -> Vec<EditorDiagnostic> {
        let mut placed: Vec<EditorDiagnostic> = self
            .entries
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|d| &d.editor == editor)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        placed.sort_by_key(|d| (d.range.start, d.range.end));
        placed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn replace(&self, document: Url, diagnostics: Vec<EditorDiagnostic>) {
        self.entries.insert(document, diagnostics);
    }

    fn remove(&self, document: &Url) {
        self.entries.remove(document);
    }
}

/// Counts reported by [`DiagnosticAggregator::handle_diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Diagnostics placed in an editor.
    pub accepted: usize,
    /// Diagnostics dropped individually.
    pub discarded: usize,
    /// The batch addressed a document outside the current tree.
    pub rejected: bool,
}

impl BatchOutcome {
    pub fn rejected() -> Self {
        Self {
            rejected: true,
            ..Self::default()
        }
    }
}

/// Why a group of diagnostics was not placed.
#[derive(Debug)]
enum Discard {
    Stale { line: u32, last_line: u32 },
    Covered { owner: Url },
    Silenced,
    Unplaceable(DocumentError),
}

impl From<DocumentError> for Discard {
    fn from(error: DocumentError) -> Self {
        Discard::Unplaceable(error)
    }
}

/// Exact range of a wire diagnostic, used to collapse duplicates.
type RangeKey = (u32, u32, u32, u32);

fn range_key(range: &Range) -> RangeKey {
    (
        range.start.line,
        range.start.character,
        range.end.line,
        range.end.character,
    )
}

/// Lower is more severe; a missing severity counts as an error.
fn severity_rank(severity: Option<DiagnosticSeverity>) -> u8 {
    match severity {
        Some(s) if s == DiagnosticSeverity::WARNING => 2,
        Some(s) if s == DiagnosticSeverity::INFORMATION => 3,
        Some(s) if s == DiagnosticSeverity::HINT => 4,
        _ => 1,
    }
}

fn severity_from_rank(rank: u8) -> DiagnosticSeverity {
    match rank {
        2 => DiagnosticSeverity::WARNING,
        3 => DiagnosticSeverity::INFORMATION,
        4 => DiagnosticSeverity::HINT,
        _ => DiagnosticSeverity::ERROR,
    }
}

fn code_text(code: &Option<NumberOrString>) -> String {
    match code {
        Some(NumberOrString::String(s)) => s.clone(),
        Some(NumberOrString::Number(n)) => n.to_string(),
        None => String::new(),
    }
}

/// Places diagnostics of one document tree and keeps their markers in sync.
pub struct DiagnosticAggregator {
    renderer: Arc<dyn MarkerRenderer>,
    table: Arc<DiagnosticTable>,
    markers: HashMap<Url, HashMap<String, MarkerId>>,
    editor_ids: HashMap<EditorId, u32>,
}

impl DiagnosticAggregator {
    pub fn new(renderer: Arc<dyn MarkerRenderer>, table: Arc<DiagnosticTable>) -> Self {
        Self {
            renderer,
            table,
            markers: HashMap::new(),
            editor_ids: HashMap::new(),
        }
    }

    pub fn table(&self) -> &Arc<DiagnosticTable> {
        &self.table
    }

    /// Number of markers currently attached for `document`.
    pub fn marker_count(&self, document: &Url) -> usize {
        self.markers.get(document).map(HashMap::len).unwrap_or(0)
    }

    fn editor_number(&mut self, editor: &EditorId) -> u32 {
        let next = self.editor_ids.len() as u32;
        *self.editor_ids.entry(editor.clone()).or_insert(next)
    }

    /// Place a batch of diagnostics computed against the virtual document `target`.
    pub fn handle_diagnostics(
        &mut self,
        root: &VirtualDocument,
        target: &Url,
        diagnostics: &[Diagnostic],
    ) -> BatchOutcome {
        let Some(document) = root.find_by_uri(target) else {
            warn!(uri = %target, "diagnostics for a document outside the current tree, ignoring batch");
            return BatchOutcome::rejected();
        };

        let mut groups: BTreeMap<RangeKey, Vec<&Diagnostic>> = BTreeMap::new();
        for diagnostic in diagnostics {
            groups
                .entry(range_key(&diagnostic.range))
                .or_default()
                .push(diagnostic);
        }

        let previous = self.markers.remove(target).unwrap_or_default();
        let mut retained: HashMap<String, MarkerId> = HashMap::new();
        let mut placed = Vec::new();
        let mut outcome = BatchOutcome::default();

        for group in groups.into_values() {
            let (editor, range) = match anchor(root, document, &group[0].range) {
                Ok(anchored) => anchored,
                Err(reason) => {
                    log_discard(target, &reason, group.len());
                    outcome.discarded += group.len();
                    continue;
                }
            };

            let mut members: Vec<(u8, &str, String, &str)> = group
                .iter()
                .map(|d| {
                    (
                        severity_rank(d.severity),
                        d.message.as_str(),
                        code_text(&d.code),
                        d.source.as_deref().unwrap_or(""),
                    )
                })
                .collect();
            members.sort();
            let key = format!(
                "{:?}|{:?}|{}",
                members,
                range,
                self.editor_number(&editor)
            );

            if let Some(id) = previous.get(&key).copied() {
                retained.insert(key, id);
            } else {
                let marker = Marker {
                    editor: editor.clone(),
                    range,
                    title: title(&members),
                    severity: severity_from_rank(members[0].0),
                };
                match self.renderer.attach(&marker) {
                    Ok(id) => {
                        retained.insert(key, id);
                    }
                    Err(e) => {
                        warn!(uri = %target, error = %e, "failed to attach diagnostic marker");
                        outcome.discarded += group.len();
                        continue;
                    }
                }
            }

            outcome.accepted += group.len();
            placed.extend(group.into_iter().map(|diagnostic| EditorDiagnostic {
                diagnostic: diagnostic.clone(),
                editor: editor.clone(),
                range,
            }));
        }

        for (key, id) in previous {
            if retained.contains_key(&key) {
                continue;
            }
            if let Err(e) = self.renderer.detach(id) {
                warn!(uri = %target, error = %e, "failed to detach diagnostic marker");
            }
        }

        self.markers.insert(target.clone(), retained);
        self.table.replace(target.clone(), placed);
        outcome
    }

    /// Drop everything known about a document that left the tree.
    pub fn forget(&mut self, document: &Url) {
        for (_, id) in self.markers.remove(document).unwrap_or_default() {
            if let Err(e) = self.renderer.detach(id) {
                warn!(uri = %document, error = %e, "failed to detach diagnostic marker");
            }
        }
        self.table.remove(document);
    }

    /// Forget every document that is no longer reachable from `root`.
    pub fn prune(&mut self, root: &VirtualDocument) {
        let gone: Vec<Url> = self
            .markers
            .keys()
            .filter(|uri| root.find_by_uri(uri).is_none())
            .cloned()
            .collect();
        for uri in gone {
            debug!(uri = %uri, "document left the tree, dropping its markers");
            self.forget(&uri);
        }
    }
}

/// Move a virtual range of `document` into its editor, or explain why not.
fn anchor(
    root: &VirtualDocument,
    document: &VirtualDocument,
    range: &Range,
) -> Result<(EditorId, EditorRange), Discard> {
    let start = VirtualPosition::from(range.start);
    let end = VirtualPosition::from(range.end);

    let last_line = document
        .last_virtual_line()
        .saturating_sub(document.blank_lines_between_blocks());
    if start.line > last_line {
        return Err(Discard::Stale {
            line: start.line,
            last_line,
        });
    }

    let editor = document.editor_at_virtual_line(start)?.clone();
    let start_in_editor = document.transform_virtual_to_editor(start)?;

    // a more specific nested document renders its own diagnostics
    let root_source = root.transform_editor_to_source(&editor, start_in_editor)?;
    let owner = root.document_at_source_position(root_source);
    if owner.id_path() != document.id_path() {
        return Err(Discard::Covered {
            owner: owner.uri().clone(),
        });
    }

    if document.is_inspection_skipped(start.line, document.id_path()) {
        return Err(Discard::Silenced);
    }

    let end_in_editor = document.transform_virtual_to_editor(end).unwrap_or_else(|e| {
        debug!(error = %e, "malformed diagnostic end, using one character");
        EditorPosition::new(start_in_editor.line, start_in_editor.column + 1)
    });

    Ok((
        editor,
        EditorRange {
            start: start_in_editor,
            end: end_in_editor,
        },
    ))
}

fn title(members: &[(u8, &str, String, &str)]) -> String {
    members
        .iter()
        .map(|(_, message, _, source)| {
            if source.is_empty() {
                message.to_string()
            } else {
                format!("{} ({})", message, source)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn log_discard(target: &Url, reason: &Discard, count: usize) {
    match reason {
        Discard::Stale { line, last_line } => {
            warn!(uri = %target, line, last_line, count, "diagnostic beyond the end of the document, discarding")
        }
        Discard::Covered { owner } => {
            debug!(uri = %target, owner = %owner, count, "range belongs to a nested document, discarding")
        }
        Discard::Silenced => {
            debug!(uri = %target, count, "diagnostic on a rewritten line, discarding")
        }
        Discard::Unplaceable(e) => {
            warn!(uri = %target, error = %e, count, "could not place diagnostic, discarding")
        }
    }
}
