//! Coordinate spaces used by the composition engine.
//!
//! Three spaces are involved when a document mixes languages:
//! - *source*: the concatenation of the raw blocks appended to one virtual document
//! - *editor*: local to one physical edit surface (a file, a notebook cell)
//! - *virtual*: the synthetic single-language buffer sent to analysis
//!
//! Each space gets its own position type so values cannot be mixed up.

use std::fmt;
use std::sync::Arc;

use tower_lsp::lsp_types;

macro_rules! position_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name {
            pub line: u32,
            pub column: u32,
        }

        impl $name {
            pub const fn new(line: u32, column: u32) -> Self {
                Self { line, column }
            }
        }
    };
}

position_type!(
    /// Position in the concatenated raw blocks of one virtual document.
    SourcePosition
);
position_type!(
    /// Position local to one edit surface.
    EditorPosition
);
position_type!(
    /// Position in the synthetic buffer of one virtual document.
    VirtualPosition
);

impl From<lsp_types::Position> for VirtualPosition {
    fn from(position: lsp_types::Position) -> Self {
        Self::new(position.line, position.character)
    }
}

impl From<EditorPosition> for lsp_types::Position {
    fn from(position: EditorPosition) -> Self {
        lsp_types::Position::new(position.line, position.column)
    }
}

/// Range local to one source block, as reported by an extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextRange {
    pub start: EditorPosition,
    pub end: EditorPosition,
}

impl TextRange {
    pub const fn new(start: EditorPosition, end: EditorPosition) -> Self {
        Self { start, end }
    }

    /// Inclusive containment: a cursor right after the last character is inside.
    pub fn contains(&self, position: EditorPosition) -> bool {
        if self.start.line == self.end.line {
            return position.line == self.start.line
                && position.column >= self.start.column
                && position.column <= self.end.column;
        }
        let after_start = position.line > self.start.line
            || (position.line == self.start.line && position.column >= self.start.column);
        let before_end = position.line < self.end.line
            || (position.line == self.end.line && position.column <= self.end.column);
        after_start && before_end
    }

    /// Express `position` relative to the start of this range.
    ///
    /// Only the first line of the range carries a column offset.
    pub fn relative(&self, position: EditorPosition) -> EditorPosition {
        let line = position.line.saturating_sub(self.start.line);
        let column = if line == 0 {
            position.column.saturating_sub(self.start.column)
        } else {
            position.column
        };
        EditorPosition::new(line, column)
    }
}

/// Range in editor coordinates of a re-anchored annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditorRange {
    pub start: EditorPosition,
    pub end: EditorPosition,
}

impl From<EditorRange> for lsp_types::Range {
    fn from(range: EditorRange) -> Self {
        lsp_types::Range::new(range.start.into(), range.end.into())
    }
}

/// Opaque identity of one physical edit surface.
///
/// Only ever compared and hashed; the engine never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EditorId(Arc<str>);

impl EditorId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EditorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert a byte offset within `text` to a line/column position.
///
/// Columns count UTF-16 code units, as the wire protocol does.
pub fn position_at_offset(text: &str, offset: usize) -> EditorPosition {
    let offset = offset.min(text.len());
    let before = &text[..offset];
    let line = before.matches('\n').count() as u32;
    let line_start = before.rfind('\n').map(|p| p + 1).unwrap_or(0);
    let column = before[line_start..].encode_utf16().count() as u32;
    EditorPosition::new(line, column)
}
