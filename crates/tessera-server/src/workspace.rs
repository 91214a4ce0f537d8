use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lsp_types::{DocumentSymbol, DocumentSymbolResponse, TextDocumentIdentifier, Uri};
use serde::Deserialize;
use serde_json::Value;
use tessera_core::uri::{file_uri_to_path, path_to_file_uri};
use tessera_core::{collect_files, fingerprint_files, Location, LookupResult};
use tessera_jsonrpc::ResponseError;
use tessera_symbols::{PackageId, Symbol, SymbolKind, SymbolSource, WorkspaceSymbolSearch};
use tessera_vfs::{LocalFs, OverlayFs};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

/// Everything a handler owns once `initialize` has succeeded.
pub(crate) struct Workspace<B> {
    pub(crate) root: PathBuf,
    pub(crate) overlay: OverlayFs<LocalFs>,
    pub(crate) search: WorkspaceSymbolSearch<WorkspaceSource<B>>,
    pub(crate) token: CancellationToken,
}

impl<B> Workspace<B> {
    /// Resolve a document URI to a path inside the workspace root.
    pub(crate) fn path_for_uri(&self, uri: &str) -> Result<PathBuf, ResponseError> {
        let path = file_uri_to_path(uri)
            .ok_or_else(|| ResponseError::invalid_params(format!("unsupported document URI: {uri}")))?;
        if !path.starts_with(&self.root) {
            return Err(ResponseError::invalid_params(format!(
                "document {uri} is outside the workspace root {}",
                self.root.display()
            )));
        }
        Ok(path)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentTarget {
    text_document: TextDocumentIdentifier,
}

/// Extract `textDocument.uri` from the params of a document request.
pub(crate) fn document_uri(params: &Value) -> Result<Uri, ResponseError> {
    DocumentTarget::deserialize(params)
        .map(|target| target.text_document.uri)
        .map_err(|err| ResponseError::invalid_params(format!("missing textDocument.uri: {err}")))
}

/// Packages are the directories of the workspace; symbols come from the backend's
/// `documentSymbol`, one batch per package.
///
/// Open documents count as package files, and their buffer contents are part of the package
/// fingerprint, so an edit only invalidates the package that holds the document.
pub(crate) struct WorkspaceSource<B> {
    root: PathBuf,
    backend: Arc<B>,
    overlay: OverlayFs<LocalFs>,
}

impl<B: Backend> WorkspaceSource<B> {
    pub(crate) fn new(root: PathBuf, backend: Arc<B>, overlay: OverlayFs<LocalFs>) -> Self {
        Self {
            root,
            backend,
            overlay,
        }
    }

    fn package_dir(&self, package: &PackageId) -> PathBuf {
        if package.as_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(package.as_str())
        }
    }

    /// Files directly inside the package directory plus open buffers there, sorted.
    async fn package_files(&self, package: &PackageId) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.package_dir(package);
        let scan = dir.clone();
        let mut files = tokio::task::spawn_blocking(move || files_in_dir(&scan)).await??;
        for path in self.overlay.open_paths() {
            if path.parent() == Some(dir.as_path()) && !files.contains(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Regular files directly in `dir`; a directory that does not exist (yet) is empty.
fn files_in_dir(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[async_trait]
impl<B: Backend> SymbolSource for WorkspaceSource<B> {
    async fn packages(&self) -> anyhow::Result<Vec<PackageId>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&root)).await??;

        let open = self.overlay.open_paths();
        let packages: BTreeSet<String> = files
            .iter()
            .chain(open.iter().filter(|path| path.starts_with(&self.root)))
            .filter_map(|file| file.parent())
            .map(|dir| self.relative(dir))
            .collect();
        Ok(packages.into_iter().map(PackageId::new).collect())
    }

    async fn fingerprint(&self, package: &PackageId) -> anyhow::Result<u64> {
        let files = self.package_files(package).await?;
        let on_disk = files.clone();
        let disk = tokio::task::spawn_blocking(move || fingerprint_files(on_disk.iter().map(PathBuf::as_path)))
            .await??;

        let mut hasher = DefaultHasher::new();
        disk.hash(&mut hasher);
        for path in &files {
            if let Some(text) = self.overlay.document_text(path) {
                path.hash(&mut hasher);
                text.hash(&mut hasher);
            }
        }
        Ok(hasher.finish())
    }

    async fn symbols(&self, package: &PackageId) -> anyhow::Result<Vec<Symbol>> {
        let files = self.package_files(package).await?;
        let uris: Vec<String> = files.iter().filter_map(|path| path_to_file_uri(path)).collect();
        let results = self
            .backend
            .document_symbols(&uris, &CancellationToken::new())
            .await;

        let mut symbols = Vec::new();
        for (uri, result) in uris.iter().zip(results) {
            let path = file_uri_to_path(uri)
                .map(|p| self.relative(&p))
                .unwrap_or_default();
            match result {
                LookupResult::Found(value) => match serde_json::from_value::<DocumentSymbolResponse>(value) {
                    Ok(response) => collect_document_symbols(response, uri, &path, package.as_str(), &mut symbols),
                    Err(err) => {
                        tracing::debug!(target: "tessera.server", uri = %uri, error = %err, "malformed documentSymbol result");
                    }
                },
                LookupResult::NotFound => {}
                LookupResult::Error(err) => {
                    tracing::debug!(target: "tessera.server", uri = %uri, error = %err, "documentSymbol failed");
                }
            }
        }
        Ok(symbols)
    }
}

/// Names starting with an uppercase letter count as exported.
fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

fn symbol_kind(kind: lsp_types::SymbolKind) -> Option<SymbolKind> {
    use lsp_types::SymbolKind as Lsp;

    Some(match kind {
        Lsp::FILE => SymbolKind::File,
        Lsp::MODULE => SymbolKind::Module,
        Lsp::NAMESPACE => SymbolKind::Namespace,
        Lsp::PACKAGE => SymbolKind::Package,
        Lsp::CLASS => SymbolKind::Class,
        Lsp::METHOD => SymbolKind::Method,
        Lsp::PROPERTY => SymbolKind::Property,
        Lsp::FIELD => SymbolKind::Field,
        Lsp::CONSTRUCTOR => SymbolKind::Constructor,
        Lsp::ENUM => SymbolKind::Enum,
        Lsp::INTERFACE => SymbolKind::Interface,
        Lsp::FUNCTION => SymbolKind::Function,
        Lsp::VARIABLE => SymbolKind::Variable,
        Lsp::CONSTANT => SymbolKind::Constant,
        Lsp::STRUCT => SymbolKind::Struct,
        _ => return None,
    })
}

/// Accepts both result shapes of `documentSymbol`: flat `SymbolInformation[]` and nested
/// `DocumentSymbol[]` (whose children take the parent's name as container).
fn collect_document_symbols(
    response: DocumentSymbolResponse,
    uri: &str,
    path: &str,
    package: &str,
    out: &mut Vec<Symbol>,
) {
    let default_container = package.rsplit('/').next().unwrap_or(package);
    match response {
        DocumentSymbolResponse::Flat(items) => {
            for item in items {
                let Some(kind) = symbol_kind(item.kind) else {
                    continue;
                };
                let container = item.container_name.as_deref().unwrap_or(default_container).to_string();
                out.push(Symbol {
                    exported: is_exported(&item.name),
                    name: item.name,
                    kind,
                    container,
                    path: path.to_string(),
                    location: item.location.into(),
                });
            }
        }
        DocumentSymbolResponse::Nested(items) => flatten_nested(items, default_container, uri, path, out),
    }
}

fn flatten_nested(items: Vec<DocumentSymbol>, container: &str, uri: &str, path: &str, out: &mut Vec<Symbol>) {
    for item in items {
        if let Some(kind) = symbol_kind(item.kind) {
            out.push(Symbol {
                name: item.name.clone(),
                kind,
                container: container.to_string(),
                path: path.to_string(),
                location: Location {
                    uri: uri.to_string(),
                    range: item.selection_range.into(),
                },
                exported: is_exported(&item.name),
            });
        }
        if let Some(children) = item.children {
            flatten_nested(children, &item.name, uri, path, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(value: Value) -> DocumentSymbolResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn flattens_nested_document_symbols() {
        let response = parse(json!([
            {
                "name": "Server",
                "kind": 23,
                "range": { "start": { "line": 3, "character": 0 }, "end": { "line": 9, "character": 1 } },
                "selectionRange": { "start": { "line": 3, "character": 5 }, "end": { "line": 3, "character": 11 } },
                "children": [
                    {
                        "name": "addr",
                        "kind": 8,
                        "range": { "start": { "line": 4, "character": 1 }, "end": { "line": 4, "character": 12 } },
                        "selectionRange": { "start": { "line": 4, "character": 1 }, "end": { "line": 4, "character": 5 } }
                    }
                ]
            }
        ]));
        let mut out = Vec::new();
        collect_document_symbols(response, "file:///ws/net/server.go", "net/server.go", "net", &mut out);

        let summary: Vec<_> = out
            .iter()
            .map(|s| (s.container.as_str(), s.name.as_str(), s.kind, s.exported, s.location.range.start))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("net", "Server", SymbolKind::Struct, true, tessera_core::Position::new(3, 5)),
                ("Server", "addr", SymbolKind::Field, false, tessera_core::Position::new(4, 1)),
            ]
        );
    }

    #[test]
    fn accepts_flat_symbol_information() {
        let response = parse(json!([{
            "name": "Parse",
            "kind": 12,
            "containerName": "config",
            "location": {
                "uri": "file:///ws/config/parse.go",
                "range": { "start": { "line": 1, "character": 5 }, "end": { "line": 1, "character": 10 } }
            }
        }, {
            "name": "event",
            "kind": 24,
            "location": {
                "uri": "file:///ws/config/parse.go",
                "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 2, "character": 5 } }
            }
        }]));
        let mut out = Vec::new();
        collect_document_symbols(response, "file:///ws/config/parse.go", "config/parse.go", "config", &mut out);

        // Kinds outside the searchable set are skipped.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].container, "config");
        assert_eq!(out[0].kind, SymbolKind::Function);
        assert_eq!(out[0].location.uri, "file:///ws/config/parse.go");
        assert!(out[0].exported);
    }

    #[test]
    fn document_uri_requires_a_text_document() {
        let uri = document_uri(&json!({ "textDocument": { "uri": "file:///ws/a.go" }, "position": {} })).unwrap();
        assert_eq!(uri.as_str(), "file:///ws/a.go");
        assert!(document_uri(&json!({ "position": {} })).is_err());
    }

    #[test]
    fn missing_directories_hold_no_files() {
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(files_in_dir(&temp.path().join("absent")).unwrap(), Vec::<PathBuf>::new());

        std::fs::write(temp.path().join("a.go"), "package a\n").unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        assert_eq!(files_in_dir(temp.path()).unwrap(), vec![temp.path().join("a.go")]);
    }
}
