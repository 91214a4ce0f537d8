//! Core shared types for Tessera.
//!
//! This crate is intentionally small: positions, tagged lookup results, file URI helpers and
//! the file walking used by provisioning and symbol search.

mod fs;
mod lookup;
mod panic;
pub mod uri;

use serde::{Deserialize, Serialize};

pub use fs::{collect_files, fingerprint_files, is_vendored_path};
pub use lookup::{LookupError, LookupResult};
pub use panic::panic_payload_to_string;

/// A position in a text document expressed as (line, UTF-16 code unit offset).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[inline]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// A half-open range in a text document expressed with protocol positions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[inline]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A range inside a document identified by URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

#[cfg(feature = "lsp")]
mod lsp_compat {
    use super::{Location, Position, Range};

    impl From<lsp_types::Position> for Position {
        fn from(value: lsp_types::Position) -> Self {
            Position::new(value.line, value.character)
        }
    }

    impl From<Position> for lsp_types::Position {
        fn from(value: Position) -> Self {
            lsp_types::Position::new(value.line, value.character)
        }
    }

    impl From<lsp_types::Range> for Range {
        fn from(value: lsp_types::Range) -> Self {
            Range::new(value.start.into(), value.end.into())
        }
    }

    impl From<lsp_types::Location> for Location {
        fn from(value: lsp_types::Location) -> Self {
            Location {
                uri: value.uri.as_str().to_string(),
                range: value.range.into(),
            }
        }
    }
}
