use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tessera_cache::SingleFlightCache;
use tessera_core::uri::path_to_file_uri;
use tessera_core::LookupResult;
use tessera_jsonrpc::{codes, Connection, Incoming, IncomingMessage, RpcError};
use tessera_server::{AnalysisMethod, Backend, HandlerOptions, HandlerState, WorkspaceHandler};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeBackend {
    symbol_batches: AtomicUsize,
    /// Symbol batches block until their token is cancelled.
    hold_symbols: AtomicBool,
    synced: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl Backend for FakeBackend {
    async fn initialize(&self, _root: &Path, _params: Value) -> LookupResult<Value> {
        LookupResult::Found(json!({}))
    }

    async fn analyze(
        &self,
        method: AnalysisMethod,
        params: Value,
        token: &CancellationToken,
    ) -> LookupResult<Value> {
        match method {
            AnalysisMethod::Definition => LookupResult::Found(json!([{
                "uri": params["textDocument"]["uri"],
                "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } }
            }])),
            AnalysisMethod::Hover if params["position"]["line"] == json!(99) => {
                panic!("hover exploded")
            }
            AnalysisMethod::References => {
                token.cancelled().await;
                LookupResult::failed("cancelled")
            }
            AnalysisMethod::SignatureHelp => LookupResult::invalid_input("no call at position"),
            _ => LookupResult::NotFound,
        }
    }

    async fn document_symbols(&self, uris: &[String], token: &CancellationToken) -> Vec<LookupResult<Value>> {
        self.symbol_batches.fetch_add(1, Ordering::SeqCst);
        if self.hold_symbols.load(Ordering::SeqCst) {
            token.cancelled().await;
            return uris.iter().map(|_| LookupResult::failed("cancelled")).collect();
        }
        uris.iter()
            .map(|uri| {
                let (dir, file) = uri.rsplit_once('/').unwrap();
                let container = dir.rsplit('/').next().unwrap();
                let name = file.trim_end_matches(".go");
                LookupResult::Found(json!([{
                    "name": name,
                    "kind": 12,
                    "containerName": container,
                    "location": {
                        "uri": uri,
                        "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } }
                    }
                }]))
            })
            .collect()
    }

    async fn sync_document(&self, uri: &str, text: Option<&str>) {
        self.synced.lock().push((uri.to_string(), text.map(str::to_string)));
    }

    async fn diagnostics(&self, uri: &str, _token: &CancellationToken) -> LookupResult<Value> {
        LookupResult::Found(json!([{
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 1 } },
            "message": format!("checked {uri}"),
        }]))
    }
}

struct Harness {
    client: Connection,
    incoming: Incoming,
    handler: WorkspaceHandler<FakeBackend>,
    backend: Arc<FakeBackend>,
    root: tempfile::TempDir,
}

impl Harness {
    fn start() -> Self {
        Self::with(FakeBackend::default(), HandlerOptions::new(Arc::new(SingleFlightCache::new(64))))
    }

    fn with(backend: FakeBackend, options: HandlerOptions) -> Self {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend);
        let handler = WorkspaceHandler::new(backend.clone(), options);

        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        let (server_conn, server_incoming) = Connection::new(server_io);
        let serving = handler.clone();
        tokio::spawn(async move { serving.serve(server_conn, server_incoming).await });

        let (client, incoming) = Connection::new(client_io);
        Self {
            client,
            incoming,
            handler,
            backend,
            root,
        }
    }

    fn uri(&self, rel: &str) -> String {
        path_to_file_uri(&self.root.path().join(rel)).unwrap()
    }

    async fn initialize(&self) -> Result<Value, RpcError> {
        let root_uri = path_to_file_uri(self.root.path()).unwrap();
        self.client
            .request_and_wait("initialize", json!({ "rootUri": root_uri, "capabilities": {} }))
            .await
    }

    fn position_params(&self, rel: &str, line: u32) -> Value {
        json!({
            "textDocument": { "uri": self.uri(rel) },
            "position": { "line": line, "character": 3 },
        })
    }
}

fn remote_error(result: Result<Value, RpcError>) -> (i32, String) {
    match result {
        Err(RpcError::Remote(err)) => (err.code, err.message),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() -> anyhow::Result<()> {
    let h = Harness::start();

    let result = h
        .client
        .request_and_wait("textDocument/definition", h.position_params("main.go", 1))
        .await;
    assert_eq!(
        remote_error(result),
        (codes::SERVER_NOT_INITIALIZED, "server must be initialized".to_string())
    );

    let init = h.initialize().await?;
    assert_eq!(init["capabilities"]["workspaceSymbolProvider"], json!(true));
    assert_eq!(h.handler.state(), HandlerState::Initialized);

    let definition = h
        .client
        .request_and_wait("textDocument/definition", h.position_params("main.go", 1))
        .await?;
    assert_eq!(definition[0]["uri"], json!(h.uri("main.go")));
    Ok(())
}

#[tokio::test]
async fn shutdown_rejects_later_requests_and_exit_closes() -> anyhow::Result<()> {
    let h = Harness::start();
    h.initialize().await?;

    assert_eq!(h.client.request_and_wait("shutdown", Value::Null).await?, Value::Null);
    assert_eq!(h.handler.state(), HandlerState::ShuttingDown);

    let result = h
        .client
        .request_and_wait("textDocument/hover", h.position_params("main.go", 1))
        .await;
    assert_eq!(
        remote_error(result),
        (codes::INVALID_REQUEST, "server is shutting down".to_string())
    );

    // A repeated shutdown is tolerated.
    assert_eq!(h.client.request_and_wait("shutdown", Value::Null).await?, Value::Null);

    h.client.notify("exit", Value::Null).await?;
    tokio::time::timeout(Duration::from_secs(5), h.client.closed()).await?;
    Ok(())
}

#[tokio::test]
async fn second_initialize_is_rejected() -> anyhow::Result<()> {
    let h = Harness::start();
    h.initialize().await?;
    assert_eq!(
        remote_error(h.initialize().await),
        (codes::INVALID_REQUEST, "server is already initialized".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn panic_fails_only_its_own_request() -> anyhow::Result<()> {
    let h = Harness::start();
    h.initialize().await?;

    let (code, message) = remote_error(
        h.client
            .request_and_wait("textDocument/hover", h.position_params("main.go", 99))
            .await,
    );
    assert_eq!(code, codes::INTERNAL_ERROR);
    assert!(message.contains("hover exploded"), "{message}");

    h.client
        .request_and_wait("textDocument/definition", h.position_params("main.go", 1))
        .await?;
    assert_eq!(h.handler.state(), HandlerState::Initialized);
    Ok(())
}

#[tokio::test]
async fn lookup_results_map_to_protocol_answers() -> anyhow::Result<()> {
    let h = Harness::start();
    h.initialize().await?;

    let hover = h
        .client
        .request_and_wait("textDocument/hover", h.position_params("main.go", 1))
        .await?;
    assert_eq!(hover, Value::Null);

    let (code, _) = remote_error(
        h.client
            .request_and_wait("textDocument/signatureHelp", h.position_params("main.go", 1))
            .await,
    );
    assert_eq!(code, codes::INVALID_PARAMS);

    let (code, message) = remote_error(h.client.request_and_wait("textDocument/rename", json!({})).await);
    assert_eq!(code, codes::METHOD_NOT_FOUND);
    assert_eq!(message, "method not found: textDocument/rename");
    Ok(())
}

#[tokio::test]
async fn documents_outside_the_root_are_invalid() -> anyhow::Result<()> {
    let h = Harness::start();
    h.initialize().await?;

    let outside = tempfile::tempdir()?;
    let uri = path_to_file_uri(&outside.path().join("x.go")).unwrap();
    let (code, _) = remote_error(
        h.client
            .request_and_wait(
                "textDocument/definition",
                json!({ "textDocument": { "uri": uri }, "position": { "line": 0, "character": 0 } }),
            )
            .await,
    );
    assert_eq!(code, codes::INVALID_PARAMS);

    let (code, _) = remote_error(
        h.client
            .request_and_wait("textDocument/definition", json!({ "position": {} }))
            .await,
    );
    assert_eq!(code, codes::INVALID_PARAMS);
    Ok(())
}

#[tokio::test]
async fn cancel_request_answers_request_cancelled() -> anyhow::Result<()> {
    let h = Harness::start();
    h.initialize().await?;

    // Request ids are allocated sequentially; `initialize` used 1.
    let pending = {
        let client = h.client.clone();
        let params = h.position_params("main.go", 1);
        tokio::spawn(async move { client.request_and_wait("textDocument/references", params).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.handler.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    h.client.notify("$/cancelRequest", json!({ "id": 2 })).await?;
    assert_eq!(pending.await?, Err(RpcError::Cancelled));

    // A cancel for a finished or unknown request is ignored.
    h.client.notify("$/cancelRequest", json!({ "id": 2 })).await?;
    h.client.notify("$/cancelRequest", json!({ "id": "nope" })).await?;
    h.client
        .request_and_wait("textDocument/definition", h.position_params("main.go", 1))
        .await?;
    assert_eq!(h.handler.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn overlay_changes_republish_diagnostics() -> anyhow::Result<()> {
    let mut h = Harness::start();
    h.initialize().await?;

    let uri = h.uri("main.go");
    h.client
        .notify(
            "textDocument/didOpen",
            json!({ "textDocument": { "uri": uri, "languageId": "go", "version": 1, "text": "package main\n" } }),
        )
        .await?;

    let message = tokio::time::timeout(Duration::from_secs(5), h.incoming.next()).await?;
    let Some(IncomingMessage::Notification(published)) = message else {
        panic!("expected publishDiagnostics, got {message:?}");
    };
    assert_eq!(published.method, "textDocument/publishDiagnostics");
    assert_eq!(published.params["uri"], json!(uri));
    assert_eq!(published.params["diagnostics"][0]["message"], json!(format!("checked {uri}")));

    assert_eq!(
        h.backend.synced.lock().clone(),
        vec![(uri.clone(), Some("package main\n".to_string()))]
    );
    Ok(())
}

#[tokio::test]
async fn workspace_symbols_are_ranked_and_invalidated_by_edits() -> anyhow::Result<()> {
    let h = Harness::start();
    for rel in ["foo/bar.go", "asdf/asdf.go", "one/two.go"] {
        let path = h.root.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, "package x\n")?;
    }
    h.initialize().await?;

    let results = h
        .client
        .request_and_wait("workspace/symbol", json!({ "query": "foo bar" }))
        .await?;
    assert_eq!(results[0]["name"], json!("bar"));
    assert_eq!(results[0]["containerName"], json!("foo"));
    assert_eq!(results[0]["location"]["uri"], json!(h.uri("foo/bar.go")));

    let batches = h.backend.symbol_batches.load(Ordering::SeqCst);
    assert_eq!(batches, 3);
    h.client
        .request_and_wait("workspace/symbol", json!({ "query": "asdf" }))
        .await?;
    assert_eq!(h.backend.symbol_batches.load(Ordering::SeqCst), batches);

    h.client
        .notify(
            "textDocument/didOpen",
            json!({ "textDocument": { "uri": h.uri("foo/bar.go"), "languageId": "go", "version": 1, "text": "package foo\n" } }),
        )
        .await?;
    // Notifications are applied in order before the next request is dispatched.
    h.client
        .request_and_wait("workspace/symbol", json!({ "query": "asdf" }))
        .await?;
    // Only the edited package is walked again.
    assert_eq!(h.backend.symbol_batches.load(Ordering::SeqCst), batches + 1);

    h.client
        .request_and_wait("workspace/symbol", json!({ "query": "bar" }))
        .await?;
    assert_eq!(h.backend.symbol_batches.load(Ordering::SeqCst), batches + 1);
    Ok(())
}

#[tokio::test]
async fn initialize_does_not_wait_for_symbol_warm_up() -> anyhow::Result<()> {
    let backend = FakeBackend::default();
    backend.hold_symbols.store(true, Ordering::SeqCst);
    let mut options = HandlerOptions::new(Arc::new(SingleFlightCache::new(64)));
    options.warmup_timeout = Duration::from_millis(200);
    let h = Harness::with(backend, options);

    let path = h.root.path().join("pkg/lib.go");
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(&path, "package pkg\n")?;

    let init = tokio::time::timeout(Duration::from_secs(2), h.initialize()).await??;
    assert_eq!(init["capabilities"]["workspaceSymbolProvider"], json!(true));

    // The warm-up is now stuck inside the backend; other requests are still served.
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.backend.symbol_batches.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    tokio::time::timeout(
        Duration::from_secs(2),
        h.client
            .request_and_wait("textDocument/definition", h.position_params("pkg/lib.go", 1)),
    )
    .await??;

    // Past the warm-up deadline the handler keeps serving.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.handler.state(), HandlerState::Initialized);
    tokio::time::timeout(
        Duration::from_secs(2),
        h.client
            .request_and_wait("textDocument/definition", h.position_params("pkg/lib.go", 2)),
    )
    .await??;
    Ok(())
}
