//! Byte offset to wire position conversion over a virtual buffer.

use std::ops::Range;

use tower_lsp::lsp_types::{self, Position};

/// Line starts of a borrowed buffer, for repeated span lookups.
///
/// Analyzers report byte spans into a virtual document value; the
/// aggregator consumes line/UTF-16 column ranges.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { text, line_starts }
    }

    /// Offsets past the end clamp to the end; offsets inside a character
    /// round down to its start.
    pub fn position(&self, offset: usize) -> Position {
        let mut offset = offset.min(self.text.len());
        while !self.text.is_char_boundary(offset) {
            offset -= 1;
        }
        let line = self
            .line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1);
        let start = self.line_starts[line];
        let column = self.text[start..offset].encode_utf16().count() as u32;
        Position::new(line as u32, column)
    }

    pub fn range(&self, span: &Range<usize>) -> lsp_types::Range {
        lsp_types::Range::new(self.position(span.start), self.position(span.end))
    }
}
