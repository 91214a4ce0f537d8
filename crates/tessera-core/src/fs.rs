use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

/// Recursively collect every regular file under `root`, sorted by path.
///
/// Missing directories are treated as empty. Version-control metadata directories (`.git`,
/// `.hg`, `.svn`) are skipped.
pub fn collect_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && is_vcs_dir(entry.path())));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => match err.io_error().map(io::Error::kind) {
                Some(io::ErrorKind::NotFound) => continue,
                _ => return Err(err.into()),
            },
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn is_vcs_dir(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|name| name.to_str()),
        Some(".git" | ".hg" | ".svn")
    )
}

/// Stable fingerprint over the identity, size and modification time of `paths`.
///
/// Files that disappeared since they were listed still contribute their path, so deleting a
/// file changes the fingerprint.
pub fn fingerprint_files<'a>(paths: impl IntoIterator<Item = &'a Path>) -> io::Result<u64> {
    let mut hasher = DefaultHasher::new();

    for path in paths {
        path.hash(&mut hasher);
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                0u8.hash(&mut hasher);
                continue;
            }
            Err(err) => return Err(err),
        };
        metadata.len().hash(&mut hasher);
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        modified.as_nanos().hash(&mut hasher);
    }

    Ok(hasher.finish())
}

/// Whether a workspace-relative path points into third-party vendored code.
pub fn is_vendored_path(path: &str) -> bool {
    path.starts_with("vendor/") || path.contains("/vendor/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_files_is_sorted_and_skips_vcs_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("b/nested")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::write(root.join("b/nested/z.go"), "package nested").unwrap();
        fs::write(root.join("a.go"), "package a").unwrap();
        fs::write(root.join(".git/objects/blob"), "ignored").unwrap();

        let files = collect_files(root).unwrap();
        assert_eq!(files, vec![root.join("a.go"), root.join("b/nested/z.go")]);
    }

    #[test]
    fn missing_root_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        assert!(collect_files(&temp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn fingerprint_changes_when_file_grows() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("main.go");
        fs::write(&file, "a").unwrap();
        let before = fingerprint_files([file.as_path()]).unwrap();
        assert_eq!(before, fingerprint_files([file.as_path()]).unwrap());

        fs::write(&file, "abc").unwrap();
        assert_ne!(before, fingerprint_files([file.as_path()]).unwrap());
    }

    #[test]
    fn vendored_paths() {
        assert!(is_vendored_path("vendor/github.com/x/y.go"));
        assert!(is_vendored_path("cmd/tool/vendor/lib/z.go"));
        assert!(!is_vendored_path("vendored/x.go"));
        assert!(!is_vendored_path("src/vendor.go"));
    }
}
