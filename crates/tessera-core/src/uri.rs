//! Conversions between `file://` URIs and local paths.
//!
//! Only the `file` scheme is ever translated; every other scheme is passed through by callers
//! untouched.

use std::path::{Path, PathBuf};

use url::Url;

/// Returns the local path of a `file://` URI, or `None` for other schemes and malformed input.
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// Returns the `file://` URI for an absolute path.
pub fn path_to_file_uri(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(|url| url.to_string())
}

/// Moves a `file://` URI from the `from` root to the `to` root.
///
/// The rebase works on the serialized URI path: only the root prefix is replaced, and the rest
/// of the URI (percent-escapes, query, fragment) is kept byte for byte. Returns `None` when the
/// URI is not a file URI or does not lie under `from`.
pub fn rebase_file_uri(uri: &str, from: &Path, to: &Path) -> Option<String> {
    let mut url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    let from_root = root_uri_path(from)?;
    let to_root = root_uri_path(to)?;

    let suffix = url.path().strip_prefix(from_root.as_str())?;
    if !(suffix.is_empty() || suffix.starts_with('/')) {
        return None;
    }
    let rebased = format!("{to_root}{suffix}");
    url.set_path(&rebased);
    Some(url.to_string())
}

/// The encoded URI path of a root directory, without a trailing separator.
fn root_uri_path(root: &Path) -> Option<String> {
    let url = Url::from_file_path(root).ok()?;
    Some(url.path().trim_end_matches('/').to_string())
}

/// Moves `path` from the `from` root to the `to` root, or `None` when it is outside `from`.
pub fn rebase_path(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(from).ok()?;
    if rel.as_os_str().is_empty() {
        return Some(to.to_path_buf());
    }
    Some(to.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_file_schemes_are_not_paths() {
        assert_eq!(file_uri_to_path("git://github.com/a/b?rev#x.go"), None);
        assert_eq!(file_uri_to_path("not a uri"), None);
    }

    #[cfg(unix)]
    #[test]
    fn rebases_only_under_root() {
        let from = Path::new("/work/project");
        let to = Path::new("/tmp/private/copy");

        assert_eq!(
            rebase_file_uri("file:///work/project/pkg/a.go", from, to).as_deref(),
            Some("file:///tmp/private/copy/pkg/a.go")
        );
        assert_eq!(
            rebase_file_uri("file:///work/project", from, to).as_deref(),
            Some("file:///tmp/private/copy")
        );
        assert_eq!(rebase_file_uri("file:///elsewhere/b.go", from, to), None);
        assert_eq!(rebase_file_uri("file:///work/project-other/c.go", from, to), None);
    }

    #[cfg(unix)]
    #[test]
    fn rebase_keeps_escapes_in_the_suffix() {
        let from = Path::new("/home/dev/project");
        let to = Path::new("/tmp/copy");

        let inward = rebase_file_uri("file:///home/dev/project/a%40b.go", from, to);
        assert_eq!(inward.as_deref(), Some("file:///tmp/copy/a%40b.go"));
        let outward = rebase_file_uri(inward.as_deref().unwrap_or_default(), to, from);
        assert_eq!(outward.as_deref(), Some("file:///home/dev/project/a%40b.go"));

        assert_eq!(
            rebase_file_uri("file:///home/dev/project/dir%20name/x.go#L3", from, to).as_deref(),
            Some("file:///tmp/copy/dir%20name/x.go#L3")
        );
    }

    #[cfg(unix)]
    #[test]
    fn roots_with_reserved_characters_are_matched_encoded() {
        let from = Path::new("/home/dev/my project");
        let to = Path::new("/tmp/copy");
        assert_eq!(
            rebase_file_uri("file:///home/dev/my%20project/main.go", from, to).as_deref(),
            Some("file:///tmp/copy/main.go")
        );
    }
}
