//! Virtual documents: single-language buffers composed from mixed-language blocks.
//!
//! A root document receives the raw blocks of one logical document. Foreign
//! code found by the registered extractors is moved into child documents,
//! recursively, and every appended line is recorded in two tables:
//! - `virtual_lines`: virtual line -> source line, editor, skip tags
//! - `source_lines`: source line -> editor line, editor shift, foreign ranges
//!
//! Children are owned by their parent; a child only knows its parent's id path.
//! Lifecycle events are queued on each node and drained by the parent after
//! every operation that touches the child, so they always flow towards the root.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tower_lsp::lsp_types::Url;
use tracing::{debug, warn};

use super::extraction::{ExtractorRegistry, ForeignCodeExtractor};
use super::overrides::{OverrideMap, OverrideRegistry, OverrideScope};
use super::position::{EditorId, EditorPosition, SourcePosition, TextRange, VirtualPosition};
use crate::error::DocumentError;

/// Blank lines inserted between two blocks of a virtual document.
pub const DEFAULT_BLANK_LINES_BETWEEN_BLOCKS: u32 = 2;

/// Rebuilds a foreign document survives without receiving content.
pub const DEFAULT_FOREIGN_DOCUMENT_LIFETIME: u32 = 6;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Tunables shared by every document of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionConfig {
    pub blank_lines_between_blocks: u32,
    pub foreign_document_lifetime: u32,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            blank_lines_between_blocks: DEFAULT_BLANK_LINES_BETWEEN_BLOCKS,
            foreign_document_lifetime: DEFAULT_FOREIGN_DOCUMENT_LIFETIME,
        }
    }
}

/// Extractors, override rules and tunables for one document tree.
#[derive(Debug, Clone, Default)]
pub struct CompositionContext {
    pub extractors: ExtractorRegistry,
    pub overrides: OverrideRegistry,
    pub config: CompositionConfig,
}

/// Addressing information carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    pub uri: Url,
    pub language: String,
    pub id_path: String,
}

/// Lifecycle notification emitted by a document or one of its descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    ForeignDocumentOpened(DocumentInfo),
    ForeignDocumentClosed(DocumentInfo),
    Changed(DocumentInfo),
}

/// One raw block of source text, belonging to one editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub value: String,
    pub editor: EditorId,
}

impl CodeBlock {
    pub fn new(value: impl Into<String>, editor: EditorId) -> Self {
        Self {
            value: value.into(),
            editor,
        }
    }
}

/// Entry of the virtual line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualLine {
    /// `None` for block separators and for lines an override added.
    pub source_line: Option<u32>,
    pub editor: EditorId,
    /// Id paths of the documents that must not surface diagnostics on this line.
    pub skip_inspect: Vec<String>,
}

/// Where a foreign range of a block went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignBlock {
    /// First virtual line of the foreign content in the child.
    pub virtual_line: u32,
    /// First source line of the foreign content in the child.
    pub source_line: u32,
    /// Key of the child in its parent.
    pub document: String,
    pub editor: EditorId,
    /// Where the foreign range starts inside the code handed to the child.
    pub shift: SourcePosition,
}

impl ForeignBlock {
    /// Child source position of a point given relative to the foreign range.
    fn child_position(&self, relative: EditorPosition) -> SourcePosition {
        let line = relative.line + self.shift.line;
        // only the child's first line carries the column shift
        let column = if line == 0 {
            relative.column + self.shift.column
        } else {
            relative.column
        };
        SourcePosition::new(self.source_line + line, column)
    }
}

/// Entry of the source line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// Line index within the block.
    pub editor_line: u32,
    /// Origin of the block in its editor. The column applies to the first block line only.
    pub editor_shift: EditorPosition,
    pub editor: EditorId,
    /// Foreign ranges of the block this line belongs to.
    pub foreign_blocks: Arc<[(TextRange, ForeignBlock)]>,
    pub virtual_line: u32,
}

/// One output line of a block after overrides.
struct PreparedLine {
    text: String,
    rewritten: bool,
    /// Raw line this line stands for.
    origin: Option<u32>,
}

/// A synthetic single-language buffer with its coordinate tables.
#[derive(Debug)]
pub struct VirtualDocument {
    language: String,
    path: Url,
    file_extension: String,
    instance_id: u64,
    standalone: bool,
    parent_id_path: Option<String>,
    id_path: String,
    uri: Url,
    context: Arc<CompositionContext>,
    block_overrides: OverrideMap,
    line_overrides: OverrideMap,
    remaining_lifetime: u32,
    disposed: bool,

    line_blocks: Vec<String>,
    virtual_lines: Vec<VirtualLine>,
    source_lines: Vec<SourceLine>,

    foreign_documents: BTreeMap<String, VirtualDocument>,
    unused_documents: BTreeSet<String>,
    unused_standalone: HashMap<String, Vec<VirtualDocument>>,

    previous_value: Option<String>,
    events: Vec<DocumentEvent>,
}

impl VirtualDocument {
    /// Create the root of a document tree for the file at `path`.
    pub fn root(
        language: &str,
        path: Url,
        file_extension: &str,
        context: Arc<CompositionContext>,
    ) -> Self {
        let id_path = language.to_string();
        Self::build(
            NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            language,
            path.clone(),
            file_extension,
            false,
            None,
            id_path,
            path,
            context,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        instance_id: u64,
        language: &str,
        path: Url,
        file_extension: &str,
        standalone: bool,
        parent_id_path: Option<String>,
        id_path: String,
        uri: Url,
        context: Arc<CompositionContext>,
    ) -> Self {
        Self {
            language: language.to_string(),
            file_extension: file_extension.to_string(),
            instance_id,
            standalone,
            parent_id_path,
            id_path,
            uri,
            path,
            block_overrides: context.overrides.map_for(language, OverrideScope::Block),
            line_overrides: context.overrides.map_for(language, OverrideScope::Line),
            remaining_lifetime: context.config.foreign_document_lifetime,
            context,
            disposed: false,
            line_blocks: Vec::new(),
            virtual_lines: Vec::new(),
            source_lines: Vec::new(),
            foreign_documents: BTreeMap::new(),
            unused_documents: BTreeSet::new(),
            unused_standalone: HashMap::new(),
            previous_value: None,
            events: Vec::new(),
        }
    }

    fn open_foreign(
        &mut self,
        extractor: &dyn ForeignCodeExtractor,
    ) -> Result<VirtualDocument, DocumentError> {
        let language = extractor.language();
        let standalone = extractor.standalone();
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let virtual_id = if standalone {
            format!("{}({})", instance_id, language)
        } else {
            language.to_string()
        };
        let id_path = format!("{}-{}", self.id_path, virtual_id);
        let raw_uri = format!("{}.{}.{}", self.path, id_path, extractor.file_extension());
        let uri = Url::parse(&raw_uri).map_err(|e| DocumentError::InvalidUri {
            path: self.path.to_string(),
            id_path: id_path.clone(),
            message: e.to_string(),
        })?;

        let document = Self::build(
            instance_id,
            language,
            self.path.clone(),
            extractor.file_extension(),
            standalone,
            Some(self.id_path.clone()),
            id_path,
            uri,
            Arc::clone(&self.context),
        );
        debug!(id_path = %document.id_path, uri = %document.uri, "opened foreign document");
        self.events
            .push(DocumentEvent::ForeignDocumentOpened(document.info()));
        Ok(document)
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn language(&self) -> &str {
        &self.language
    }

    /// The owning file.
    pub fn path(&self) -> &Url {
        &self.path
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn file_extension(&self) -> &str {
        &self.file_extension
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn standalone(&self) -> bool {
        self.standalone
    }

    pub fn is_root(&self) -> bool {
        self.parent_id_path.is_none()
    }

    pub fn parent_id_path(&self) -> Option<&str> {
        self.parent_id_path.as_deref()
    }

    /// Key of this document in its parent.
    pub fn virtual_id(&self) -> String {
        if self.standalone {
            format!("{}({})", self.instance_id, self.language)
        } else {
            self.language.clone()
        }
    }

    /// Dash-joined virtual ids from the root down to this document.
    pub fn id_path(&self) -> &str {
        &self.id_path
    }

    pub fn info(&self) -> DocumentInfo {
        DocumentInfo {
            uri: self.uri.clone(),
            language: self.language.clone(),
            id_path: self.id_path.clone(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Rebuilds left before an idle foreign document is closed. Roots never expire.
    pub fn remaining_lifetime(&self) -> u32 {
        if self.is_root() {
            u32::MAX
        } else {
            self.remaining_lifetime
        }
    }

    pub fn blank_lines_between_blocks(&self) -> u32 {
        self.context.config.blank_lines_between_blocks
    }

    // ------------------------------------------------------------------
    // Content and tables
    // ------------------------------------------------------------------

    /// The synthetic buffer sent to analysis.
    pub fn value(&self) -> String {
        let padding = "\n".repeat(self.blank_lines_between_blocks() as usize);
        self.line_blocks.join(&padding)
    }

    pub fn last_virtual_line(&self) -> u32 {
        self.virtual_lines.len() as u32
    }

    pub fn last_source_line(&self) -> u32 {
        self.source_lines.len() as u32
    }

    pub fn virtual_line(&self, line: u32) -> Option<&VirtualLine> {
        self.virtual_lines.get(line as usize)
    }

    pub fn source_line(&self, line: u32) -> Option<&SourceLine> {
        self.source_lines.get(line as usize)
    }

    /// Whether diagnostics of the document `id_path` are silenced on `line`.
    pub fn is_inspection_skipped(&self, line: u32, id_path: &str) -> bool {
        self.virtual_line(line)
            .map(|l| l.skip_inspect.iter().any(|p| p == id_path))
            .unwrap_or(false)
    }

    /// Children that are part of the current tree.
    pub fn foreign_documents(&self) -> impl Iterator<Item = &VirtualDocument> {
        self.foreign_documents.values()
    }

    pub fn foreign_document(&self, virtual_id: &str) -> Option<&VirtualDocument> {
        self.foreign_documents.get(virtual_id)
    }

    /// Idle standalone children parked for reuse.
    pub fn recycled(&self, language: &str) -> &[VirtualDocument] {
        self.unused_standalone
            .get(language)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Pre-order traversal of this document and all reachable descendants.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    pub fn find_by_uri(&self, uri: &Url) -> Option<&VirtualDocument> {
        self.walk().find(|doc| doc.uri() == uri)
    }

    /// Drain queued lifecycle events.
    pub fn take_events(&mut self) -> Vec<DocumentEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Append one raw block, extracting foreign code into children.
    ///
    /// `editor_shift` is where the block starts in its editor; `virtual_shift`
    /// compensates for text an extractor prepended to the foreign code.
    pub fn append_code_block(
        &mut self,
        block: &CodeBlock,
        editor_shift: EditorPosition,
        virtual_shift: Option<SourcePosition>,
    ) -> Result<(), DocumentError> {
        if self.disposed {
            return Err(DocumentError::Disposed {
                id_path: self.id_path.clone(),
            });
        }

        let source_line_count = block.value.split('\n').count() as u32;
        let (kept, foreign_blocks) = self.extract_foreign_code(block, editor_shift)?;
        let prepared = self.prepare_lines(&kept);

        let first_virtual = self.last_virtual_line();
        let first_source = self.last_source_line();

        // first output line of every raw line
        let mut first_output: Vec<Option<u32>> = vec![None; source_line_count as usize];
        let mut lines = Vec::with_capacity(prepared.len());
        for (index, line) in prepared.into_iter().enumerate() {
            // lines an override added have no source counterpart
            let origin = line.origin.filter(|&origin| origin < source_line_count);
            if let Some(origin) = origin {
                first_output[origin as usize].get_or_insert(index as u32);
            }
            self.virtual_lines.push(VirtualLine {
                source_line: origin.map(|origin| first_source + origin),
                editor: block.editor.clone(),
                skip_inspect: if line.rewritten {
                    vec![self.id_path.clone()]
                } else {
                    Vec::new()
                },
            });
            lines.push(line.text);
        }

        let shift = virtual_shift.unwrap_or_default();
        let mut output = 0;
        for (i, first) in first_output.into_iter().enumerate() {
            let i = i as u32;
            // raw lines a block override swallowed map to the last line produced
            if let Some(first) = first {
                output = first;
            }
            self.source_lines.push(SourceLine {
                editor_line: i,
                editor_shift: EditorPosition::new(
                    editor_shift.line.saturating_sub(shift.line),
                    if i == 0 {
                        editor_shift.column.saturating_sub(shift.column)
                    } else {
                        0
                    },
                ),
                editor: block.editor.clone(),
                foreign_blocks: Arc::clone(&foreign_blocks),
                virtual_line: first_virtual + output,
            });
        }

        let mut text = lines.join("\n");
        text.push('\n');
        self.line_blocks.push(text);

        for _ in 0..self.blank_lines_between_blocks() {
            self.virtual_lines.push(VirtualLine {
                source_line: None,
                editor: block.editor.clone(),
                skip_inspect: vec![self.id_path.clone()],
            });
        }

        self.remaining_lifetime = self.context.config.foreign_document_lifetime;
        Ok(())
    }

    fn extract_foreign_code(
        &mut self,
        block: &CodeBlock,
        editor_shift: EditorPosition,
    ) -> Result<(String, Arc<[(TextRange, ForeignBlock)]>), DocumentError> {
        let context = Arc::clone(&self.context);
        let mut code = block.value.clone();
        let mut foreign_blocks = Vec::new();

        for extractor in context.extractors.for_host(&self.language) {
            if !extractor.has_foreign_code(&code) {
                continue;
            }

            let mut kept = String::new();
            for result in extractor.extract_foreign_code(&code) {
                if let Some(foreign_code) = result.foreign_code {
                    let Some(range) = result.range else {
                        warn!(
                            language = extractor.language(),
                            "extractor returned foreign code without a range, skipping"
                        );
                        continue;
                    };

                    let foreign_shift = EditorPosition::new(
                        editor_shift.line + range.start.line,
                        range.start.column
                            + if range.start.line == 0 {
                                editor_shift.column
                            } else {
                                0
                            },
                    );

                    let child = self.choose_foreign_document(extractor.as_ref())?;
                    let entry = ForeignBlock {
                        virtual_line: child.last_virtual_line(),
                        source_line: child.last_source_line(),
                        document: child.virtual_id(),
                        editor: block.editor.clone(),
                        shift: result.virtual_shift.unwrap_or_default(),
                    };
                    child.append_code_block(
                        &CodeBlock::new(foreign_code, block.editor.clone()),
                        foreign_shift,
                        result.virtual_shift,
                    )?;
                    let forwarded = child.take_events();
                    self.events.extend(forwarded);
                    foreign_blocks.push((range, entry));
                }
                if let Some(host_code) = result.host_code {
                    kept.push_str(&host_code);
                }
            }
            // the next extractor sees only what this one kept
            code = kept;
        }

        Ok((code, foreign_blocks.into()))
    }

    /// Apply the block override, or failing that the line overrides.
    ///
    /// Replacements spanning several lines are flattened; only the first
    /// piece keeps the raw line as its origin.
    fn prepare_lines(&self, code: &str) -> Vec<PreparedLine> {
        if let Some(replaced) = self.block_overrides.override_for(code) {
            return replaced
                .split('\n')
                .enumerate()
                .map(|(i, text)| PreparedLine {
                    text: text.to_string(),
                    rewritten: true,
                    origin: Some(i as u32),
                })
                .collect();
        }
        let raw: Vec<&str> = code.split('\n').collect();
        let result = self.line_overrides.replace_all(&raw);
        let mut prepared = Vec::with_capacity(result.lines.len());
        for (i, (line, rewritten)) in result.lines.iter().zip(result.rewritten).enumerate() {
            for (piece, text) in line.split('\n').enumerate() {
                prepared.push(PreparedLine {
                    text: text.to_string(),
                    rewritten,
                    origin: (piece == 0).then_some(i as u32),
                });
            }
        }
        prepared
    }

    /// Pick the child that receives the next extraction of `extractor`'s language.
    fn choose_foreign_document(
        &mut self,
        extractor: &dyn ForeignCodeExtractor,
    ) -> Result<&mut VirtualDocument, DocumentError> {
        let language = extractor.language();

        let key = if !extractor.standalone() && self.foreign_documents.contains_key(language) {
            self.unused_documents.remove(language);
            language.to_string()
        } else {
            let recycled = if extractor.standalone() {
                self.unused_standalone
                    .get_mut(language)
                    .and_then(Vec::pop)
            } else {
                None
            };
            let document = match recycled {
                Some(document) => {
                    debug!(id_path = %document.id_path, "reusing idle standalone document");
                    document
                }
                None => self.open_foreign(extractor)?,
            };
            let key = document.virtual_id();
            self.foreign_documents.insert(key.clone(), document);
            key
        };

        let lifetime = self.context.config.foreign_document_lifetime;
        let child = self
            .foreign_documents
            .get_mut(&key)
            .ok_or_else(|| DocumentError::MissingForeignDocument {
                key,
                id_path: self.id_path.clone(),
            })?;
        child.remaining_lifetime = lifetime;
        Ok(child)
    }

    /// Reset content and tables, keeping identity.
    ///
    /// Standalone children are parked for reuse; the others stay owned but
    /// are marked unused until a rebuild claims them again.
    pub fn clear(&mut self) {
        let children = std::mem::take(&mut self.foreign_documents);
        self.unused_documents.clear();

        for (key, mut child) in children {
            child.clear();
            self.events.extend(child.take_events());
            if child.standalone {
                self.unused_standalone
                    .entry(child.language.clone())
                    .or_default()
                    .push(child);
            } else {
                self.unused_documents.insert(key.clone());
                self.foreign_documents.insert(key, child);
            }
        }
        // lowest instance ids are reused first
        for pool in self.unused_standalone.values_mut() {
            pool.sort_by_key(|doc| Reverse(doc.instance_id));
        }

        self.line_blocks.clear();
        self.virtual_lines.clear();
        self.source_lines.clear();
    }

    /// Age every child that received nothing during the last rebuild and
    /// close the ones whose lifetime ran out.
    pub fn close_expired_documents(&mut self) {
        for key in std::mem::take(&mut self.unused_documents) {
            let expired = match self.foreign_documents.get_mut(&key) {
                Some(child) => {
                    child.remaining_lifetime = child.remaining_lifetime.saturating_sub(1);
                    child.remaining_lifetime == 0
                }
                None => false,
            };
            if expired {
                if let Some(mut child) = self.foreign_documents.remove(&key) {
                    child.dispose();
                    self.events.extend(child.take_events());
                }
            }
        }

        let events = &mut self.events;
        for pool in self.unused_standalone.values_mut() {
            pool.retain_mut(|child| {
                child.remaining_lifetime = child.remaining_lifetime.saturating_sub(1);
                if child.remaining_lifetime > 0 {
                    return true;
                }
                child.dispose();
                events.extend(child.take_events());
                false
            });
        }
        self.unused_standalone.retain(|_, pool| !pool.is_empty());

        for child in self.foreign_documents.values_mut() {
            child.close_expired_documents();
            self.events.extend(child.take_events());
        }
    }

    /// Tear down this document and all of its descendants.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let owned = std::mem::take(&mut self.foreign_documents)
            .into_values()
            .chain(std::mem::take(&mut self.unused_standalone).into_values().flatten());
        for mut child in owned {
            child.dispose();
            self.events.extend(child.take_events());
        }
        self.unused_documents.clear();
        self.line_blocks.clear();
        self.virtual_lines.clear();
        self.source_lines.clear();

        if !self.is_root() {
            debug!(id_path = %self.id_path, "closing foreign document");
            self.events
                .push(DocumentEvent::ForeignDocumentClosed(self.info()));
        }
    }

    /// Queue `Changed` for every document whose value differs from the last snapshot.
    pub fn maybe_emit_changed(&mut self) {
        let value = self.value();
        if self.previous_value.as_deref() != Some(value.as_str()) {
            self.events.push(DocumentEvent::Changed(self.info()));
            self.previous_value = Some(value);
        }
        for child in self.foreign_documents.values_mut() {
            child.maybe_emit_changed();
            self.events.extend(child.take_events());
        }
    }

    // ------------------------------------------------------------------
    // Coordinate mapping
    // ------------------------------------------------------------------

    /// The innermost document whose foreign range contains `position`.
    pub fn document_at_source_position(&self, position: SourcePosition) -> &VirtualDocument {
        let Some(source_line) = self.source_line(position.line) else {
            return self;
        };
        let local = EditorPosition::new(source_line.editor_line, position.column);
        for (range, block) in source_line.foreign_blocks.iter() {
            if !range.contains(local) {
                continue;
            }
            if let Some(child) = self.foreign_documents.get(&block.document) {
                return child.document_at_source_position(
                    block.child_position(range.relative(local)),
                );
            }
        }
        self
    }

    /// Like [`Self::document_at_source_position`], also returning the
    /// position in the virtual space of the document found.
    pub fn virtual_position_at_document(
        &self,
        position: SourcePosition,
    ) -> Result<(&VirtualDocument, VirtualPosition), DocumentError> {
        let source_line = self.source_line(position.line).ok_or_else(|| {
            DocumentError::UnmappedSourceLine {
                line: position.line,
                id_path: self.id_path.clone(),
            }
        })?;
        let local = EditorPosition::new(source_line.editor_line, position.column);
        for (range, block) in source_line.foreign_blocks.iter() {
            if !range.contains(local) {
                continue;
            }
            if let Some(child) = self.foreign_documents.get(&block.document) {
                return child.virtual_position_at_document(
                    block.child_position(range.relative(local)),
                );
            }
        }
        Ok((
            self,
            VirtualPosition::new(source_line.virtual_line, position.column),
        ))
    }

    pub fn transform_source_to_editor(
        &self,
        position: SourcePosition,
    ) -> Result<EditorPosition, DocumentError> {
        let source_line = self.source_line(position.line).ok_or_else(|| {
            DocumentError::UnmappedSourceLine {
                line: position.line,
                id_path: self.id_path.clone(),
            }
        })?;
        let column_shift = if source_line.editor_line == 0 {
            source_line.editor_shift.column
        } else {
            0
        };
        Ok(EditorPosition::new(
            source_line.editor_line + source_line.editor_shift.line,
            position.column + column_shift,
        ))
    }

    pub fn transform_virtual_to_source(
        &self,
        position: VirtualPosition,
    ) -> Result<SourcePosition, DocumentError> {
        let virtual_line = self.virtual_line(position.line).ok_or_else(|| {
            DocumentError::UnmappedVirtualLine {
                line: position.line,
                id_path: self.id_path.clone(),
            }
        })?;
        let line = virtual_line
            .source_line
            .ok_or_else(|| DocumentError::SyntheticLine {
                line: position.line,
                id_path: self.id_path.clone(),
            })?;
        Ok(SourcePosition::new(line, position.column))
    }

    pub fn transform_virtual_to_editor(
        &self,
        position: VirtualPosition,
    ) -> Result<EditorPosition, DocumentError> {
        let source = self.transform_virtual_to_source(position)?;
        self.transform_source_to_editor(source)
    }

    /// Inverse of [`Self::transform_source_to_editor`] for the blocks of `editor`.
    pub fn transform_editor_to_source(
        &self,
        editor: &EditorId,
        position: EditorPosition,
    ) -> Result<SourcePosition, DocumentError> {
        self.source_lines
            .iter()
            .enumerate()
            .find(|(_, line)| {
                &line.editor == editor
                    && line.editor_line + line.editor_shift.line == position.line
            })
            .map(|(index, line)| {
                let column_shift = if line.editor_line == 0 {
                    line.editor_shift.column
                } else {
                    0
                };
                SourcePosition::new(index as u32, position.column.saturating_sub(column_shift))
            })
            .ok_or_else(|| DocumentError::NoEditorAtPosition {
                editor: editor.to_string(),
                line: position.line,
            })
    }

    /// Editor owning a virtual line; one line past the end resolves to the last line.
    pub fn editor_at_virtual_line(
        &self,
        position: VirtualPosition,
    ) -> Result<&EditorId, DocumentError> {
        let line = if position.line as usize == self.virtual_lines.len() {
            position.line.saturating_sub(1)
        } else {
            position.line
        };
        self.virtual_line(line)
            .map(|l| &l.editor)
            .ok_or_else(|| DocumentError::UnmappedVirtualLine {
                line: position.line,
                id_path: self.id_path.clone(),
            })
    }

    pub fn editor_at_source_line(
        &self,
        position: SourcePosition,
    ) -> Result<&EditorId, DocumentError> {
        self.source_line(position.line)
            .map(|l| &l.editor)
            .ok_or_else(|| DocumentError::UnmappedSourceLine {
                line: position.line,
                id_path: self.id_path.clone(),
            })
    }
}

/// Pre-order iterator returned by [`VirtualDocument::walk`].
pub struct Walk<'a> {
    stack: Vec<&'a VirtualDocument>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a VirtualDocument;

    fn next(&mut self) -> Option<Self::Item> {
        let document = self.stack.pop()?;
        self.stack
            .extend(document.foreign_documents.values().rev());
        Some(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::extraction::{RegexExtractor, RegexExtractorOptions};
    use crate::document::overrides::OverrideRule;

    fn extractor(standalone: bool) -> Arc<dyn ForeignCodeExtractor> {
        Arc::new(
            RegexExtractor::new(RegexExtractorOptions {
                language: "cel".to_string(),
                pattern: r"%cel (.*)".to_string(),
                group: 1,
                keep_in_host: false,
                standalone,
                file_extension: "cel".to_string(),
                exclusive: false,
            })
            .unwrap(),
        )
    }

    fn context(standalone: bool) -> Arc<CompositionContext> {
        let mut context = CompositionContext::default();
        context
            .extractors
            .register("python", extractor(standalone))
            .unwrap();
        Arc::new(context)
    }

    fn root(context: Arc<CompositionContext>) -> VirtualDocument {
        VirtualDocument::root(
            "python",
            Url::parse("file:///notebook.ipynb").unwrap(),
            "py",
            context,
        )
    }

    fn cell(id: &str) -> EditorId {
        EditorId::new(id)
    }

    fn append(doc: &mut VirtualDocument, text: &str, editor: &str) {
        doc.append_code_block(&CodeBlock::new(text, cell(editor)), EditorPosition::default(), None)
            .unwrap();
    }

    fn only_child(doc: &VirtualDocument) -> &VirtualDocument {
        let children: Vec<_> = doc.foreign_documents().collect();
        assert_eq!(children.len(), 1, "expected exactly one child");
        children[0]
    }

    #[test]
    fn blocks_are_separated_by_blank_lines() {
        let mut doc = root(Arc::new(CompositionContext::default()));
        append(&mut doc, "a = 1\nb = 2", "c1");
        append(&mut doc, "c = 3", "c2");

        assert_eq!(doc.value(), "a = 1\nb = 2\n\n\nc = 3\n");
        // 2 + 2 separators + 1 + 2 separators
        assert_eq!(doc.last_virtual_line(), 7);
        assert_eq!(doc.last_source_line(), 3);
        for line in 0..doc.last_virtual_line() {
            assert!(doc.virtual_line(line).is_some(), "gap at {line}");
        }
        assert_eq!(doc.virtual_line(2).unwrap().source_line, None);
        assert!(doc.is_inspection_skipped(2, "python"));
        assert_eq!(doc.virtual_line(4).unwrap().source_line, Some(2));
        assert_eq!(doc.virtual_line(4).unwrap().editor, cell("c2"));
    }

    #[test]
    fn foreign_snippet_moves_into_child() {
        let mut doc = root(context(true));
        append(&mut doc, "x = 1\n%cel this > 0\ny = 2", "c1");

        assert_eq!(doc.value(), "x = 1\n\ny = 2\n");
        let child = only_child(&doc);
        assert_eq!(child.language(), "cel");
        assert_eq!(child.value(), "this > 0\n");
        assert!(child.id_path().starts_with("python-"));
        assert!(child.uri().as_str().starts_with("file:///notebook.ipynb.python-"));
        assert!(child.uri().as_str().ends_with(".cel"));

        // inside the marker's range
        let found = doc.document_at_source_position(SourcePosition::new(1, 7));
        assert_eq!(found.id_path(), child.id_path());
        // outside
        let found = doc.document_at_source_position(SourcePosition::new(0, 2));
        assert_eq!(found.id_path(), "python");
        let found = doc.document_at_source_position(SourcePosition::new(1, 2));
        assert_eq!(found.id_path(), "python");
    }

    #[test]
    fn coordinates_round_trip_through_child() {
        let mut doc = root(context(false));
        append(&mut doc, "import os", "c1");
        append(&mut doc, "x = 1\n%cel this > 0\ny = 2", "c2");

        // line 1 of the second cell is source line 2 of the root
        let editor_position = EditorPosition::new(1, 9);
        let source = doc
            .transform_editor_to_source(&cell("c2"), editor_position)
            .unwrap();
        assert_eq!(source, SourcePosition::new(2, 9));

        let (child, virtual_position) = doc.virtual_position_at_document(source).unwrap();
        assert_eq!(child.language(), "cel");
        assert_eq!(virtual_position, VirtualPosition::new(0, 4));
        assert_eq!(
            child.transform_virtual_to_editor(virtual_position).unwrap(),
            editor_position
        );
        assert_eq!(
            child.editor_at_virtual_line(virtual_position).unwrap(),
            &cell("c2")
        );

        // host positions round-trip as well
        let host = SourcePosition::new(3, 4);
        let (host_doc, host_virtual) = doc.virtual_position_at_document(host).unwrap();
        assert_eq!(host_doc.id_path(), "python");
        assert_eq!(
            doc.transform_virtual_to_editor(host_virtual).unwrap(),
            EditorPosition::new(2, 4)
        );
    }

    #[test]
    fn editor_shift_applies_to_first_line_column_only() {
        let mut doc = root(Arc::new(CompositionContext::default()));
        doc.append_code_block(
            &CodeBlock::new("ab\ncd", cell("c1")),
            EditorPosition::new(10, 4),
            None,
        )
        .unwrap();
        assert_eq!(
            doc.transform_source_to_editor(SourcePosition::new(0, 1))
                .unwrap(),
            EditorPosition::new(10, 5)
        );
        assert_eq!(
            doc.transform_source_to_editor(SourcePosition::new(1, 1))
                .unwrap(),
            EditorPosition::new(11, 1)
        );
        assert_eq!(
            doc.transform_editor_to_source(&cell("c1"), EditorPosition::new(10, 5))
                .unwrap(),
            SourcePosition::new(0, 1)
        );
    }

    #[test]
    fn non_standalone_blocks_share_one_child() {
        let mut doc = root(context(false));
        append(&mut doc, "%cel a > 1", "c1");
        append(&mut doc, "%cel b < 2", "c2");

        let child = only_child(&doc);
        assert_eq!(child.value(), "a > 1\n\n\nb < 2\n");
        assert_eq!(child.virtual_id(), "cel");
        assert_eq!(child.id_path(), "python-cel");
    }

    #[test]
    fn standalone_blocks_get_their_own_children() {
        let mut doc = root(context(true));
        append(&mut doc, "%cel a > 1", "c1");
        append(&mut doc, "%cel b < 2", "c2");
        assert_eq!(doc.foreign_documents().count(), 2);
    }

    #[test]
    fn idle_standalone_child_is_recycled_then_expires() {
        let mut doc = root(context(true));
        append(&mut doc, "%cel a > 1", "c1");
        let original_id = only_child(&doc).id_path().to_string();
        doc.take_events();

        // B-less rebuilds park the child, then age it out
        for round in 1..DEFAULT_FOREIGN_DOCUMENT_LIFETIME {
            doc.clear();
            append(&mut doc, "x = 1", "c1");
            doc.close_expired_documents();
            assert_eq!(doc.foreign_documents().count(), 0);
            assert_eq!(doc.recycled("cel").len(), 1, "round {round}");
            assert!(doc.take_events().is_empty());
        }

        doc.clear();
        append(&mut doc, "x = 1", "c1");
        doc.close_expired_documents();
        assert!(doc.recycled("cel").is_empty());
        let events = doc.take_events();
        assert!(matches!(
            &events[..],
            [DocumentEvent::ForeignDocumentClosed(info)] if info.id_path == original_id
        ));
    }

    #[test]
    fn recycled_child_is_reused_before_creating_new_one() {
        let mut doc = root(context(true));
        append(&mut doc, "%cel a > 1", "c1");
        let original_id = only_child(&doc).id_path().to_string();

        doc.clear();
        append(&mut doc, "%cel b > 2", "c1");
        doc.close_expired_documents();

        let child = only_child(&doc);
        assert_eq!(child.id_path(), original_id);
        assert_eq!(child.value(), "b > 2\n");
        assert_eq!(child.remaining_lifetime(), DEFAULT_FOREIGN_DOCUMENT_LIFETIME);
        assert!(doc.recycled("cel").is_empty());
    }

    #[test]
    fn unused_non_standalone_child_expires() {
        let mut doc = root(context(false));
        append(&mut doc, "%cel a > 1", "c1");

        for _ in 0..DEFAULT_FOREIGN_DOCUMENT_LIFETIME - 1 {
            doc.clear();
            append(&mut doc, "x = 1", "c1");
            doc.close_expired_documents();
        }
        assert_eq!(doc.foreign_documents().count(), 1);

        doc.clear();
        append(&mut doc, "x = 1", "c1");
        doc.close_expired_documents();
        assert_eq!(doc.foreign_documents().count(), 0);
    }

    #[test]
    fn events_bubble_to_root() {
        let mut doc = root(context(true));
        append(&mut doc, "%cel a > 1", "c1");
        let events = doc.take_events();
        assert!(matches!(
            &events[..],
            [DocumentEvent::ForeignDocumentOpened(info)] if info.language == "cel"
        ));

        doc.maybe_emit_changed();
        let changed = doc.take_events();
        assert_eq!(changed.len(), 2);

        // same content, no change
        doc.clear();
        append(&mut doc, "%cel a > 1", "c1");
        doc.maybe_emit_changed();
        assert!(doc.take_events().is_empty());
    }

    #[test]
    fn dispose_is_recursive_and_terminal() {
        let mut doc = root(context(false));
        append(&mut doc, "%cel a > 1", "c1");
        doc.take_events();

        doc.dispose();
        assert!(doc.is_disposed());
        let events = doc.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DocumentEvent::ForeignDocumentClosed(_)));

        let err = doc
            .append_code_block(&CodeBlock::new("x", cell("c1")), EditorPosition::default(), None)
            .unwrap_err();
        assert!(matches!(err, DocumentError::Disposed { .. }));
    }

    #[test]
    fn overrides_mark_lines_as_skipped() {
        let mut context = CompositionContext::default();
        context.overrides.add(
            "python",
            OverrideScope::Line,
            OverrideRule::new(r"^%time (.*)$", "${1}").unwrap(),
        );
        let mut doc = root(Arc::new(context));
        append(&mut doc, "x = 1\n%time f(x)", "c1");

        assert_eq!(doc.value(), "x = 1\nf(x)\n");
        assert!(!doc.is_inspection_skipped(0, "python"));
        assert!(doc.is_inspection_skipped(1, "python"));
    }

    #[test]
    fn multi_line_replacement_keeps_tables_aligned() {
        let mut context = CompositionContext::default();
        context.overrides.add(
            "python",
            OverrideScope::Line,
            OverrideRule::new(r"^%load (.*)$", "import ${1}\n${1}.run()").unwrap(),
        );
        let mut doc = root(Arc::new(context));
        append(&mut doc, "%load m\nx = 1", "c1");
        append(&mut doc, "y = 2", "c2");

        assert_eq!(doc.value(), "import m\nm.run()\nx = 1\n\n\ny = 2\n");
        assert_eq!(doc.last_virtual_line(), 8);
        assert_eq!(doc.value().split('\n').count(), 7);

        // both pieces of the replacement are silenced, only the first maps back
        assert_eq!(doc.virtual_line(0).unwrap().source_line, Some(0));
        assert_eq!(doc.virtual_line(1).unwrap().source_line, None);
        assert!(doc.is_inspection_skipped(0, "python"));
        assert!(doc.is_inspection_skipped(1, "python"));

        assert_eq!(doc.virtual_line(2).unwrap().source_line, Some(1));
        assert!(!doc.is_inspection_skipped(2, "python"));
        assert_eq!(doc.source_line(1).unwrap().virtual_line, 2);

        assert_eq!(doc.virtual_line(5).unwrap().source_line, Some(2));
        assert_eq!(
            doc.transform_virtual_to_editor(VirtualPosition::new(5, 0))
                .unwrap(),
            EditorPosition::new(0, 0)
        );
        assert_eq!(
            doc.editor_at_virtual_line(VirtualPosition::new(5, 0)).unwrap(),
            &cell("c2")
        );
        let (host, position) = doc
            .virtual_position_at_document(SourcePosition::new(2, 3))
            .unwrap();
        assert!(host.is_root());
        assert_eq!(position, VirtualPosition::new(5, 3));
    }

    #[test]
    fn block_override_takes_precedence() {
        let mut context = CompositionContext::default();
        context.overrides.add(
            "python",
            OverrideScope::Block,
            OverrideRule::new(r"(?s)^%%bash\n.*$", "pass").unwrap(),
        );
        context.overrides.add(
            "python",
            OverrideScope::Line,
            OverrideRule::new(r"^%%bash$", "never").unwrap(),
        );
        let mut doc = root(Arc::new(context));
        append(&mut doc, "%%bash\nls\npwd", "c1");

        assert_eq!(doc.value(), "pass\n");
        assert!(doc.is_inspection_skipped(0, "python"));
        assert_eq!(doc.last_source_line(), 3);
        assert_eq!(doc.source_line(2).unwrap().virtual_line, 0);
    }

    #[test]
    fn lookups_outside_tables_fail_locally() {
        let doc = root(Arc::new(CompositionContext::default()));
        assert!(doc
            .transform_virtual_to_editor(VirtualPosition::new(3, 0))
            .is_err());
        assert!(doc
            .virtual_position_at_document(SourcePosition::new(0, 0))
            .is_err());
        assert_eq!(
            doc.document_at_source_position(SourcePosition::new(9, 9))
                .id_path(),
            "python"
        );
        assert_eq!(doc.remaining_lifetime(), u32::MAX);
    }

    #[test]
    fn walk_and_find_by_uri() {
        let mut doc = root(context(true));
        append(&mut doc, "%cel a > 1\n%cel b > 1", "c1");
        let uris: Vec<_> = doc.walk().map(|d| d.uri().clone()).collect();
        assert_eq!(uris.len(), 3);
        for uri in &uris {
            assert_eq!(doc.find_by_uri(uri).unwrap().uri(), uri);
        }
        assert!(doc
            .find_by_uri(&Url::parse("file:///other").unwrap())
            .is_none());
    }
}
