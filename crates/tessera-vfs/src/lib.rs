//! Overlay file system for a single workspace handler.
//!
//! Editor buffers that have not been written to disk shadow the backing file system. Every
//! mutating operation reports whether the effective content of the file changed, so callers can
//! invalidate derived state only when it matters.

mod document;
mod fs;
mod overlay;

pub use document::{ContentChange, Document, DocumentError};
pub use fs::{FileSystem, LocalFs};
pub use overlay::OverlayFs;
