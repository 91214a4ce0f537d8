use serde::Deserialize;
use tessera_core::{Position, Range};

/// A `didChange` content change: a full replacement when `range` is absent, otherwise a ranged
/// edit expressed in (line, UTF-16 code unit) positions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentChange {
    #[serde(default)]
    pub range: Option<Range>,
    pub text: String,
}

impl ContentChange {
    pub fn full(text: impl Into<String>) -> Self {
        Self {
            range: None,
            text: text.into(),
        }
    }

    pub fn replace(range: Range, text: impl Into<String>) -> Self {
        Self {
            range: Some(range),
            text: text.into(),
        }
    }
}

#[cfg(feature = "lsp")]
impl From<lsp_types::TextDocumentContentChangeEvent> for ContentChange {
    fn from(value: lsp_types::TextDocumentContentChangeEvent) -> Self {
        Self {
            range: value.range.map(Into::into),
            text: value.text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("document not open: {0}")]
    NotOpen(String),
    #[error("invalid range {start:?}..{end:?}")]
    InvalidRange { start: Position, end: Position },
}

/// An open editor buffer.
#[derive(Debug, Clone)]
pub struct Document {
    text: String,
    version: i32,
    line_starts: Vec<usize>,
}

impl Document {
    pub fn new(text: impl Into<String>, version: i32) -> Self {
        let text = text.into();
        let line_starts = line_starts(&text);
        Self {
            text,
            version,
            line_starts,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.line_starts = line_starts(&self.text);
    }

    /// Apply `changes` in order, then move to `version`.
    ///
    /// Either every change applies or the document is left untouched.
    pub fn apply_changes(&mut self, version: i32, changes: &[ContentChange]) -> Result<(), DocumentError> {
        let mut scratch = self.clone();
        for change in changes {
            scratch.apply_change(change)?;
        }
        scratch.version = version;
        *self = scratch;
        Ok(())
    }

    fn apply_change(&mut self, change: &ContentChange) -> Result<(), DocumentError> {
        let Some(range) = change.range else {
            self.set_text(change.text.as_str());
            return Ok(());
        };

        let start = self.offset_of(range.start);
        let end = self.offset_of(range.end);
        if start > end {
            return Err(DocumentError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }

        self.text.replace_range(start..end, &change.text);
        self.line_starts = line_starts(&self.text);
        Ok(())
    }

    /// Byte offset of `position`, clamped to the end of its line (or of the text).
    fn offset_of(&self, position: Position) -> usize {
        let line = position.line as usize;
        let Some(&start) = self.line_starts.get(line) else {
            return self.text.len();
        };
        let end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.text.len());

        let content = self.text[start..end].trim_end_matches(['\n', '\r']);
        start + utf16_to_byte_offset(content, position.character)
    }
}

fn line_starts(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut starts = vec![0];
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' if bytes.get(i + 1) == Some(&b'\n') => {
                i += 2;
                starts.push(i);
            }
            b'\r' | b'\n' => {
                i += 1;
                starts.push(i);
            }
            _ => i += 1,
        }
    }
    starts
}

/// A column that lands inside a surrogate pair maps to the start of that character.
fn utf16_to_byte_offset(line: &str, column: u32) -> usize {
    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        let width = ch.len_utf16() as u32;
        if units + width > column {
            return idx;
        }
        units += width;
    }
    line.len()
}
