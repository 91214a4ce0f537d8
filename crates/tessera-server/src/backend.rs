use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tessera_core::LookupResult;
use tessera_jsonrpc::Connection;
use tokio_util::sync::CancellationToken;

/// Analysis requests forwarded to a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisMethod {
    Definition,
    Hover,
    References,
    DocumentSymbol,
    SignatureHelp,
    Formatting,
    XReferences,
}

impl AnalysisMethod {
    pub fn from_method(method: &str) -> Option<Self> {
        Some(match method {
            "textDocument/definition" => AnalysisMethod::Definition,
            "textDocument/hover" => AnalysisMethod::Hover,
            "textDocument/references" => AnalysisMethod::References,
            "textDocument/documentSymbol" => AnalysisMethod::DocumentSymbol,
            "textDocument/signatureHelp" => AnalysisMethod::SignatureHelp,
            "textDocument/formatting" => AnalysisMethod::Formatting,
            "workspace/xreferences" => AnalysisMethod::XReferences,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMethod::Definition => "textDocument/definition",
            AnalysisMethod::Hover => "textDocument/hover",
            AnalysisMethod::References => "textDocument/references",
            AnalysisMethod::DocumentSymbol => "textDocument/documentSymbol",
            AnalysisMethod::SignatureHelp => "textDocument/signatureHelp",
            AnalysisMethod::Formatting => "textDocument/formatting",
            AnalysisMethod::XReferences => "workspace/xreferences",
        }
    }

    /// Whether the params carry a `textDocument.uri` that must lie in the workspace.
    pub fn targets_document(self) -> bool {
        !matches!(self, AnalysisMethod::XReferences)
    }
}

/// The language-specific analysis behind a workspace handler.
///
/// "Nothing here" answers are [`LookupResult::NotFound`]; only real failures are errors.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Prepare the backend for the workspace rooted at `root`.
    async fn initialize(&self, root: &Path, params: Value) -> LookupResult<Value>;

    async fn analyze(
        &self,
        method: AnalysisMethod,
        params: Value,
        token: &CancellationToken,
    ) -> LookupResult<Value>;

    /// `textDocument/documentSymbol` for many documents at once, one slot per URI.
    async fn document_symbols(&self, uris: &[String], token: &CancellationToken) -> Vec<LookupResult<Value>>;

    /// Mirror an overlay change; `None` means the document was closed.
    async fn sync_document(&self, uri: &str, text: Option<&str>);

    /// Current diagnostics of `uri` as a protocol `Diagnostic[]`.
    async fn diagnostics(&self, uri: &str, token: &CancellationToken) -> LookupResult<Value>;

    /// Relay whatever the backend sends on its own (diagnostics, log messages, requests) to
    /// `client`. Runs for the lifetime of the serve loop.
    async fn forward_to_client(&self, _client: Connection) {}

    async fn shutdown(&self) {}
}
