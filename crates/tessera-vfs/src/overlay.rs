use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::document::{ContentChange, Document, DocumentError};
use crate::fs::FileSystem;

/// Serves open documents before delegating to a base file system.
#[derive(Debug, Clone)]
pub struct OverlayFs<F: FileSystem> {
    base: F,
    docs: Arc<RwLock<HashMap<PathBuf, Document>>>,
}

impl<F: FileSystem> OverlayFs<F> {
    pub fn new(base: F) -> Self {
        Self {
            base,
            docs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open (or reopen) `path` with `text`. Returns whether the effective content changed.
    pub fn open(&self, path: PathBuf, text: String, version: i32) -> bool {
        let before = self.effective_text(&path);
        let changed = before.as_deref() != Some(text.as_str());
        self.docs.write().insert(path, Document::new(text, version));
        changed
    }

    /// Apply `didChange` content changes. Returns whether the effective content changed.
    pub fn change(&self, path: &Path, version: i32, changes: &[ContentChange]) -> Result<bool, DocumentError> {
        let mut docs = self.docs.write();
        let doc = docs
            .get_mut(path)
            .ok_or_else(|| DocumentError::NotOpen(path.display().to_string()))?;
        let before = doc.text().to_owned();
        doc.apply_changes(version, changes)?;
        Ok(doc.text() != before)
    }

    /// Replace the buffer with the text carried by `didSave`, if any.
    ///
    /// Saving a document that is not open adopts it into the overlay.
    pub fn save(&self, path: &Path, text: Option<String>) -> bool {
        let Some(text) = text else {
            return false;
        };
        let mut docs = self.docs.write();
        match docs.get_mut(path) {
            Some(doc) if doc.text() == text => false,
            Some(doc) => {
                doc.set_text(text);
                true
            }
            None => {
                docs.insert(path.to_path_buf(), Document::new(text, 0));
                true
            }
        }
    }

    /// Drop the buffer for `path`. Returns whether the effective content changed, i.e. the buffer
    /// differed from what the base file system holds.
    pub fn close(&self, path: &Path) -> bool {
        let Some(doc) = self.docs.write().remove(path) else {
            return false;
        };
        match self.base.read_to_string(path) {
            Ok(disk) => disk != doc.text(),
            Err(_) => true,
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.docs.read().contains_key(path)
    }

    pub fn document_text(&self, path: &Path) -> Option<String> {
        self.docs.read().get(path).map(|doc| doc.text().to_owned())
    }

    pub fn version(&self, path: &Path) -> Option<i32> {
        self.docs.read().get(path).map(Document::version)
    }

    /// Paths of every open document, sorted.
    pub fn open_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.docs.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn effective_text(&self, path: &Path) -> Option<String> {
        self.document_text(path)
            .or_else(|| self.base.read_to_string(path).ok())
    }
}

impl<F: FileSystem> FileSystem for OverlayFs<F> {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        if let Some(text) = self.document_text(path) {
            return Ok(text);
        }
        self.base.read_to_string(path)
    }

    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        if let Some(text) = self.document_text(path) {
            return Ok(text.into_bytes());
        }
        self.base.read_bytes(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.is_open(path) || self.base.exists(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use pretty_assertions::assert_eq;
    use tessera_core::{Position, Range};

    use crate::fs::LocalFs;

    #[test]
    fn overlay_precedence_over_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("main.go");
        fs::write(&path, "disk").unwrap();

        let overlay = OverlayFs::new(LocalFs::new());
        assert_eq!(overlay.read_to_string(&path).unwrap(), "disk");

        assert!(overlay.open(path.clone(), "overlay".to_string(), 1));
        assert_eq!(overlay.read_to_string(&path).unwrap(), "overlay");

        assert!(overlay.close(&path));
        assert_eq!(overlay.read_to_string(&path).unwrap(), "disk");
    }

    #[test]
    fn opening_with_disk_content_is_not_a_change() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.go");
        fs::write(&path, "same").unwrap();

        let overlay = OverlayFs::new(LocalFs::new());
        assert!(!overlay.open(path.clone(), "same".into(), 1));
        assert!(!overlay.close(&path));
        assert!(!overlay.close(&path));
    }

    #[test]
    fn change_reports_whether_content_moved() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("b.go");
        let overlay = OverlayFs::new(LocalFs::new());
        overlay.open(path.clone(), "abc".into(), 1);

        let noop = ContentChange::replace(Range::new(Position::new(0, 1), Position::new(0, 2)), "b");
        assert_eq!(overlay.change(&path, 2, &[noop]), Ok(false));
        assert_eq!(overlay.version(&path), Some(2));

        assert_eq!(overlay.change(&path, 3, &[ContentChange::full("xyz")]), Ok(true));
        assert_eq!(overlay.document_text(&path).as_deref(), Some("xyz"));
    }

    #[test]
    fn change_to_unopened_document_fails() {
        let overlay = OverlayFs::new(LocalFs::new());
        let err = overlay
            .change(Path::new("/nowhere/x.go"), 1, &[ContentChange::full("x")])
            .unwrap_err();
        assert!(matches!(err, DocumentError::NotOpen(_)));
    }

    #[test]
    fn save_with_text_updates_buffer() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("c.go");
        let overlay = OverlayFs::new(LocalFs::new());
        overlay.open(path.clone(), "v1".into(), 1);

        assert!(!overlay.save(&path, None));
        assert!(!overlay.save(&path, Some("v1".into())));
        assert!(overlay.save(&path, Some("v2".into())));
        assert_eq!(overlay.read_to_string(&path).unwrap(), "v2");
        assert!(overlay.exists(&path));
        assert_eq!(overlay.open_paths(), vec![path]);
    }
}
