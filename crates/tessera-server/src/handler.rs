use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, HoverProviderCapability, InitializeParams, OneOf,
    SaveOptions, ServerCapabilities, ServerInfo, SignatureHelpOptions, TextDocumentSyncCapability,
    TextDocumentSyncKind, TextDocumentSyncOptions, TextDocumentSyncSaveOptions, Uri,
    WorkspaceSymbolParams,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tessera_cache::Namespace;
use tessera_config::TesseraConfig;
use tessera_core::uri::file_uri_to_path;
use tessera_core::{panic_payload_to_string, LookupError, LookupResult};
use tessera_jsonrpc::{Connection, Incoming, IncomingMessage, Notification, Request, RequestId, ResponseError};
use tessera_scheduler::{spawn_supervised, CancellationRegistry};
use tessera_symbols::{PackageSymbolCache, SearchError, SearchOptions, WorkspaceSymbolSearch};
use tessera_vfs::{ContentChange, LocalFs, OverlayFs};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::backend::{AnalysisMethod, Backend};
use crate::state::{HandlerState, Lifecycle};
use crate::workspace::{document_uri, Workspace, WorkspaceSource};

const DEFAULT_DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a cancelled request may take to wind down before its task is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Package symbol cache, usually shared by every handler of the process.
    pub cache: Arc<PackageSymbolCache>,
    pub search: SearchOptions,
    pub warmup_timeout: Duration,
    pub diagnostics_timeout: Duration,
}

impl HandlerOptions {
    pub fn new(cache: Arc<PackageSymbolCache>) -> Self {
        Self {
            cache,
            search: SearchOptions::default(),
            warmup_timeout: Duration::from_secs(30),
            diagnostics_timeout: DEFAULT_DIAGNOSTICS_TIMEOUT,
        }
    }

    pub fn from_config(config: &TesseraConfig, cache: Arc<PackageSymbolCache>) -> Self {
        Self {
            cache,
            search: SearchOptions {
                workers: config.symbols.effective_workers(),
                default_limit: config.symbols.default_limit,
            },
            warmup_timeout: config.server.warmup_timeout(),
            diagnostics_timeout: DEFAULT_DIAGNOSTICS_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Inner<B> {
    backend: Arc<B>,
    options: HandlerOptions,
    lifecycle: Lifecycle<Workspace<B>>,
    registry: CancellationRegistry<RequestId>,
    namespace: Arc<Namespace>,
    token: CancellationToken,
}

/// Serves one client's view of one workspace.
///
/// Lifecycle messages and document notifications are handled in arrival order on the serve
/// loop; every other request runs on its own task and may complete out of order.
pub struct WorkspaceHandler<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for WorkspaceHandler<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> WorkspaceHandler<B> {
    pub fn new(backend: Arc<B>, options: HandlerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                options,
                lifecycle: Lifecycle::new(),
                registry: CancellationRegistry::new(),
                namespace: Arc::new(Namespace::new()),
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> HandlerState {
        self.inner.lifecycle.state()
    }

    /// Requests currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    /// Serve `client` until it sends `exit` or disconnects.
    pub async fn serve(&self, client: Connection, mut incoming: Incoming) {
        let forwarding = {
            let backend = self.inner.backend.clone();
            let client = client.clone();
            tokio::spawn(async move { backend.forward_to_client(client).await })
        };

        while let Some(message) = incoming.next().await {
            let flow = match message {
                IncomingMessage::Request(request) => self.on_request(&client, request).await,
                IncomingMessage::Notification(notification) => {
                    self.on_notification(&client, notification).await
                }
            };
            if flow == Flow::Exit {
                break;
            }
        }

        self.inner.registry.cancel_all();
        if let Ok(Some(workspace)) = self.inner.lifecycle.shutdown() {
            // Disconnected without a shutdown handshake.
            workspace.token.cancel();
            self.inner.backend.shutdown().await;
        }
        self.inner.token.cancel();
        forwarding.abort();
        client.close();
        tracing::debug!(target: "tessera.server", "workspace handler stopped");
    }

    async fn on_request(&self, client: &Connection, request: Request) -> Flow {
        let result = match request.method.as_str() {
            "initialize" => self.initialize(request.params).await,
            "shutdown" => self.shutdown().await,
            "exit" => {
                respond(client, request.id, Ok(Value::Null)).await;
                return Flow::Exit;
            }
            _ => {
                match self.inner.lifecycle.workspace() {
                    Ok(workspace) => self.spawn_request(client.clone(), workspace, request),
                    Err(err) => respond(client, request.id, Err(err)).await,
                }
                return Flow::Continue;
            }
        };
        respond(client, request.id, result).await;
        Flow::Continue
    }

    async fn on_notification(&self, client: &Connection, notification: Notification) -> Flow {
        let Notification { method, params } = notification;
        match method.as_str() {
            "exit" => return Flow::Exit,
            "initialized" => {}
            "$/cancelRequest" => {
                // `lsp_types::CancelParams` narrows numeric ids to i32; keep the wire id as is.
                match params.get("id").cloned().map(serde_json::from_value::<RequestId>) {
                    Some(Ok(id)) => {
                        self.inner.registry.cancel(&id);
                    }
                    _ => tracing::debug!(target: "tessera.server", params = %params, "malformed $/cancelRequest"),
                }
            }
            "textDocument/didOpen" | "textDocument/didChange" | "textDocument/didClose"
            | "textDocument/didSave" => self.on_document_notification(client, &method, params).await,
            other => {
                tracing::debug!(target: "tessera.server", method = other, "ignoring notification");
            }
        }
        Flow::Continue
    }

    async fn initialize(&self, params: Value) -> Result<Value, ResponseError> {
        self.inner.lifecycle.check_initialize()?;
        let initialize: InitializeParams = parse_params(&params)?;
        let root = root_from_initialize_params(&initialize)?;

        match self.inner.backend.initialize(&root, params).await {
            LookupResult::Found(_) | LookupResult::NotFound => {}
            LookupResult::Error(LookupError::InvalidInput(message)) => {
                return Err(ResponseError::invalid_params(message));
            }
            LookupResult::Error(LookupError::Failed(message)) => {
                return Err(ResponseError::internal(format!("backend failed to initialize: {message}")));
            }
        }

        let overlay = OverlayFs::new(LocalFs::new());
        let source = Arc::new(WorkspaceSource::new(
            root.clone(),
            self.inner.backend.clone(),
            overlay.clone(),
        ));
        let workspace = Arc::new(Workspace {
            root,
            overlay,
            search: WorkspaceSymbolSearch::new(
                source,
                self.inner.options.cache.clone(),
                self.inner.namespace.clone(),
                self.inner.options.search.clone(),
            ),
            token: self.inner.token.child_token(),
        });
        self.inner.lifecycle.initialized(workspace.clone())?;
        tracing::info!(target: "tessera.server", root = %workspace.root.display(), "workspace initialized");

        let search = workspace.search.clone();
        spawn_supervised(
            "symbol-warmup",
            self.inner.options.warmup_timeout,
            &workspace.token,
            move |token| async move {
                let packages = search.warm(&token).await?;
                tracing::debug!(target: "tessera.server", packages, "symbol cache warmed");
                Ok::<(), SearchError>(())
            },
        );

        let server_info = ServerInfo {
            name: "tessera".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        Ok(json!({ "capabilities": server_capabilities(), "serverInfo": server_info }))
    }

    async fn shutdown(&self) -> Result<Value, ResponseError> {
        match self.inner.lifecycle.shutdown()? {
            Some(workspace) => {
                workspace.token.cancel();
                self.inner.registry.cancel_all();
                self.inner.backend.shutdown().await;
            }
            None => tracing::warn!(target: "tessera.server", "shutdown requested more than once"),
        }
        Ok(Value::Null)
    }

    fn spawn_request(&self, client: Connection, workspace: Arc<Workspace<B>>, request: Request) {
        let Request { id, method, params } = request;
        let (token, guard) = self.inner.registry.with_cancel(&workspace.token, id.clone());
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut work = tokio::spawn(dispatch(inner, workspace, method.clone(), params, token.clone()));
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    // The backend call watches the same token and sends its own `$/cancelRequest`;
                    // give it time to do so instead of tearing it down mid-flight.
                    match tokio::time::timeout(CANCEL_GRACE, &mut work).await {
                        Ok(Err(err)) if err.is_panic() => {
                            log_panic(&method, &id, err);
                        }
                        Ok(_) => {}
                        Err(_) => {
                            tracing::debug!(target: "tessera.server", method = %method, id = %id, "cancelled request did not stop in time");
                            work.abort();
                        }
                    }
                    Err(ResponseError::request_cancelled())
                }
                joined = &mut work => match joined {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => {
                        let message = log_panic(&method, &id, err);
                        Err(ResponseError::internal(format!("internal error while handling {method}: {message}")))
                    }
                    Err(_) => Err(ResponseError::request_cancelled()),
                },
            };
            guard.finish();
            respond(&client, id, result).await;
        });
    }

    async fn on_document_notification(&self, client: &Connection, method: &str, params: Value) {
        let workspace = match self.inner.lifecycle.workspace() {
            Ok(workspace) => workspace,
            Err(err) => {
                tracing::warn!(target: "tessera.server", method, error = %err, "dropping document notification");
                return;
            }
        };
        let event = match DocumentEvent::parse(method, params) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(target: "tessera.server", method, error = %err, "dropping malformed document notification");
                return;
            }
        };
        let uri = event.uri().as_str().to_string();
        let path = match workspace.path_for_uri(&uri) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(target: "tessera.server", method, error = %err, "dropping document notification");
                return;
            }
        };

        let closing = matches!(event, DocumentEvent::Close(_));
        let changed = match apply_document_event(&workspace.overlay, path.clone(), event) {
            Ok(changed) => changed,
            Err(err) => {
                tracing::warn!(target: "tessera.server", method, uri = %uri, error = %err, "failed to apply document change");
                return;
            }
        };

        if closing {
            self.inner.backend.sync_document(&uri, None).await;
        }
        if !changed {
            return;
        }

        // Cached package symbols are keyed by a fingerprint that covers open buffers, so only
        // the package holding this document misses on the next search.
        if !closing {
            let text = workspace.overlay.document_text(&path);
            self.inner.backend.sync_document(&uri, text.as_deref()).await;
        }
        self.republish_diagnostics(client.clone(), &workspace, uri);
    }

    fn republish_diagnostics(&self, client: Connection, workspace: &Workspace<B>, uri: String) {
        let backend = self.inner.backend.clone();
        spawn_supervised(
            "diagnostics",
            self.inner.options.diagnostics_timeout,
            &workspace.token,
            move |token| async move {
                let diagnostics = match backend.diagnostics(&uri, &token).await {
                    LookupResult::Found(diagnostics) => diagnostics,
                    LookupResult::NotFound => json!([]),
                    LookupResult::Error(err) => return Err(anyhow::Error::from(err)),
                };
                client
                    .notify(
                        "textDocument/publishDiagnostics",
                        json!({ "uri": uri, "diagnostics": diagnostics }),
                    )
                    .await?;
                Ok::<(), anyhow::Error>(())
            },
        );
    }
}

async fn respond(client: &Connection, id: RequestId, result: Result<Value, ResponseError>) {
    if let Err(err) = client.respond(id.clone(), result).await {
        tracing::debug!(target: "tessera.server", id = %id, error = %err, "failed to send response");
    }
}

fn log_panic(method: &str, id: &RequestId, err: JoinError) -> String {
    let message = panic_payload_to_string(err.into_panic().as_ref());
    tracing::error!(target: "tessera.server", method = %method, id = %id, panic = %message, "request handler panicked");
    message
}

fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, ResponseError> {
    T::deserialize(params).map_err(|err| ResponseError::invalid_params(err.to_string()))
}

#[derive(Debug, Deserialize)]
struct WorkspaceSymbolRequest {
    #[serde(flatten)]
    params: WorkspaceSymbolParams,
    /// Result cap; 0 selects the configured default.
    #[serde(default)]
    limit: usize,
}

async fn dispatch<B: Backend>(
    inner: Arc<Inner<B>>,
    workspace: Arc<Workspace<B>>,
    method: String,
    params: Value,
    token: CancellationToken,
) -> Result<Value, ResponseError> {
    if method == "workspace/symbol" {
        let request: WorkspaceSymbolRequest = parse_params(&params)?;
        let symbols = workspace
            .search
            .search(&request.params.query, request.limit, &token)
            .await
            .map_err(|err| match err {
                SearchError::Cancelled => ResponseError::request_cancelled(),
                other => ResponseError::internal(other.to_string()),
            })?;
        return serde_json::to_value(symbols).map_err(|err| ResponseError::internal(err.to_string()));
    }

    let Some(analysis) = AnalysisMethod::from_method(&method) else {
        return Err(ResponseError::method_not_found(&method));
    };
    if analysis.targets_document() {
        workspace.path_for_uri(document_uri(&params)?.as_str())?;
    }

    match inner.backend.analyze(analysis, params, &token).await {
        LookupResult::Found(value) => Ok(value),
        LookupResult::NotFound => Ok(Value::Null),
        LookupResult::Error(LookupError::InvalidInput(message)) => Err(ResponseError::invalid_params(message)),
        LookupResult::Error(LookupError::Failed(message)) => Err(ResponseError::internal(message)),
    }
}

/// The workspace root: `rootUri`, then `rootPath`, then the first workspace folder.
#[allow(deprecated)]
fn root_from_initialize_params(params: &InitializeParams) -> Result<PathBuf, ResponseError> {
    if let Some(uri) = &params.root_uri {
        return file_uri_to_path(uri.as_str())
            .ok_or_else(|| ResponseError::invalid_params(format!("rootUri must be a file URI: {}", uri.as_str())));
    }
    if let Some(path) = &params.root_path {
        return Ok(PathBuf::from(path));
    }
    if let Some(folder) = params.workspace_folders.as_ref().and_then(|folders| folders.first()) {
        return file_uri_to_path(folder.uri.as_str()).ok_or_else(|| {
            ResponseError::invalid_params(format!("workspace folder must be a file URI: {}", folder.uri.as_str()))
        });
    }
    Err(ResponseError::invalid_params("initialize requires rootUri, rootPath or a workspace folder"))
}

/// A typed document-sync notification.
#[derive(Debug)]
enum DocumentEvent {
    Open(DidOpenTextDocumentParams),
    Change(DidChangeTextDocumentParams),
    Save(DidSaveTextDocumentParams),
    Close(DidCloseTextDocumentParams),
}

impl DocumentEvent {
    fn parse(method: &str, params: Value) -> anyhow::Result<Self> {
        Ok(match method {
            "textDocument/didOpen" => DocumentEvent::Open(serde_json::from_value(params)?),
            "textDocument/didChange" => DocumentEvent::Change(serde_json::from_value(params)?),
            "textDocument/didSave" => DocumentEvent::Save(serde_json::from_value(params)?),
            "textDocument/didClose" => DocumentEvent::Close(serde_json::from_value(params)?),
            other => anyhow::bail!("not a document notification: {other}"),
        })
    }

    fn uri(&self) -> &Uri {
        match self {
            DocumentEvent::Open(params) => &params.text_document.uri,
            DocumentEvent::Change(params) => &params.text_document.uri,
            DocumentEvent::Save(params) => &params.text_document.uri,
            DocumentEvent::Close(params) => &params.text_document.uri,
        }
    }
}

/// Returns whether the effective document content changed.
fn apply_document_event(overlay: &OverlayFs<LocalFs>, path: PathBuf, event: DocumentEvent) -> anyhow::Result<bool> {
    Ok(match event {
        DocumentEvent::Open(params) => overlay.open(path, params.text_document.text, params.text_document.version),
        DocumentEvent::Change(params) => {
            let changes: Vec<ContentChange> = params.content_changes.into_iter().map(ContentChange::from).collect();
            overlay.change(&path, params.text_document.version, &changes)?
        }
        DocumentEvent::Save(params) => overlay.save(&path, params.text),
        DocumentEvent::Close(_) => overlay.close(&path),
    })
}

fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
            open_close: Some(true),
            change: Some(TextDocumentSyncKind::INCREMENTAL),
            save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                include_text: Some(true),
            })),
            ..TextDocumentSyncOptions::default()
        })),
        definition_provider: Some(OneOf::Left(true)),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        references_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        workspace_symbol_provider: Some(OneOf::Left(true)),
        signature_help_provider: Some(SignatureHelpOptions {
            trigger_characters: Some(vec!["(".to_string(), ",".to_string()]),
            ..SignatureHelpOptions::default()
        }),
        document_formatting_provider: Some(OneOf::Left(true)),
        experimental: Some(json!({ "xworkspaceReferencesProvider": true })),
        ..ServerCapabilities::default()
    }
}
