use crate::SymbolKind;

/// A parsed `workspace/symbol` query.
///
/// Whitespace separates fields. `is:exported`, `file:<path>`, `dir:<path>` and `kind:<k>` are
/// filters; anything else is split on `.` and `/` into lowercased tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub tokens: Vec<String>,
    pub kind: Option<SymbolKind>,
    pub exported_only: bool,
    pub file: Option<String>,
    pub dir: Option<String>,
}

impl Query {
    pub fn parse(text: &str) -> Self {
        let mut query = Query::default();

        for field in text.split_whitespace() {
            if field == "is:exported" {
                query.exported_only = true;
            } else if let Some(path) = field.strip_prefix("file:") {
                query.file = Some(normalize_scope(path));
            } else if let Some(path) = field.strip_prefix("dir:") {
                query.dir = Some(normalize_scope(path));
            } else if let Some(kind) = field.strip_prefix("kind:") {
                match SymbolKind::from_keyword(&kind.to_ascii_lowercase()) {
                    Some(kind) => query.kind = Some(kind),
                    None => tracing::debug!(target: "tessera.symbols", kind, "ignoring unknown kind filter"),
                }
            } else {
                query.tokens.extend(
                    field
                        .split(['.', '/'])
                        .filter(|token| !token.is_empty())
                        .map(str::to_lowercase),
                );
            }
        }

        // `func` on its own means "all functions", not "symbols matching func".
        if query.kind.is_none() && query.tokens.len() == 1 {
            if let Some(kind) = SymbolKind::from_keyword(&query.tokens[0]) {
                query.kind = Some(kind);
                query.tokens.clear();
            }
        }

        query
    }

    pub fn has_scope(&self) -> bool {
        self.file.is_some() || self.dir.is_some()
    }

    /// Whether `path` (workspace-relative) lies inside the file/dir scope, if any.
    pub fn in_scope(&self, path: &str) -> bool {
        if let Some(file) = &self.file {
            if path != file {
                return false;
            }
        }
        if let Some(dir) = &self.dir {
            if !dir.is_empty() && !(path.starts_with(dir.as_str()) && path[dir.len()..].starts_with('/')) {
                return false;
            }
        }
        true
    }
}

fn normalize_scope(path: &str) -> String {
    let path = path.trim_start_matches("./").trim_start_matches('/');
    let path = path.trim_end_matches('/');
    if path == "." {
        String::new()
    } else {
        path.to_string()
    }
}
