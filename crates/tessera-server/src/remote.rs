use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tessera_core::{uri::path_to_file_uri, LookupResult};
use tessera_jsonrpc::{
    codes, Connection, Incoming, IncomingMessage, Notification, Request, ResponseError, RpcError,
};
use tokio_util::sync::CancellationToken;

use crate::backend::{AnalysisMethod, Backend};

/// A [`Backend`] that is itself a JSON-RPC analysis server.
#[derive(Debug)]
pub struct RemoteBackend {
    conn: Connection,
    /// Backend-initiated traffic, taken once a client is attached.
    incoming: Mutex<Option<Incoming>>,
    /// Open documents and their last sent version.
    versions: Mutex<HashMap<String, i32>>,
}

impl RemoteBackend {
    pub fn new(conn: Connection, incoming: Incoming) -> Self {
        Self {
            conn,
            incoming: Mutex::new(Some(incoming)),
            versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn lookup_from_rpc(result: Result<Value, RpcError>) -> LookupResult<Value> {
    match result {
        Ok(Value::Null) => LookupResult::NotFound,
        Ok(value) => LookupResult::Found(value),
        Err(RpcError::Remote(err)) if err.code == codes::INVALID_PARAMS => {
            LookupResult::invalid_input(err.message)
        }
        Err(err) => LookupResult::failed(err.to_string()),
    }
}

/// Pass backend-initiated traffic through to the client until either side closes.
///
/// Notifications (`publishDiagnostics`, `window/logMessage`, ...) are forwarded as they are.
/// Requests are asked of the client and its answer is returned to the backend.
pub(crate) async fn relay_backend_traffic(mut incoming: Incoming, backend: Connection, client: Connection) {
    while let Some(message) = incoming.next().await {
        match message {
            IncomingMessage::Notification(Notification { method, params }) => {
                if let Err(err) = client.notify(&method, params).await {
                    tracing::debug!(target: "tessera.server", method = %method, error = %err, "client gone; dropping backend notification");
                    break;
                }
            }
            IncomingMessage::Request(Request { id, method, params }) => {
                let backend = backend.clone();
                let client = client.clone();
                tokio::spawn(async move {
                    let result = client.request_and_wait(&method, params).await.map_err(|err| match err {
                        RpcError::Remote(err) => err,
                        RpcError::Cancelled => ResponseError::request_cancelled(),
                        other => ResponseError::internal(format!("client could not answer {method}: {other}")),
                    });
                    if let Err(err) = backend.respond(id, result).await {
                        tracing::debug!(target: "tessera.server", method = %method, error = %err, "failed to answer backend request");
                    }
                });
            }
        }
    }
    tracing::debug!(target: "tessera.server", "backend traffic relay stopped");
}

fn language_id(uri: &str) -> &'static str {
    let ext = uri.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext {
        "go" => "go",
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "java" => "java",
        _ => "plaintext",
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn initialize(&self, root: &Path, mut params: Value) -> LookupResult<Value> {
        if let (Some(obj), Some(uri)) = (params.as_object_mut(), path_to_file_uri(root)) {
            obj.insert("rootUri".into(), Value::String(uri));
            obj.insert("rootPath".into(), Value::String(root.display().to_string()));
        }
        let result = self.conn.request_and_wait("initialize", params).await;
        if result.is_ok() {
            if let Err(err) = self.conn.notify("initialized", json!({})).await {
                tracing::warn!(target: "tessera.server", error = %err, "failed to notify backend of initialization");
            }
        }
        lookup_from_rpc(result)
    }

    async fn analyze(
        &self,
        method: AnalysisMethod,
        params: Value,
        token: &CancellationToken,
    ) -> LookupResult<Value> {
        lookup_from_rpc(self.conn.request_with_cancel(method.as_str(), params, token).await)
    }

    async fn document_symbols(&self, uris: &[String], token: &CancellationToken) -> Vec<LookupResult<Value>> {
        if token.is_cancelled() {
            return uris.iter().map(|_| LookupResult::failed("request cancelled")).collect();
        }
        let requests = uris
            .iter()
            .map(|uri| {
                (
                    AnalysisMethod::DocumentSymbol.as_str().to_string(),
                    json!({ "textDocument": { "uri": uri } }),
                )
            })
            .collect();
        self.conn
            .request_batch_and_wait(requests)
            .await
            .into_iter()
            .map(lookup_from_rpc)
            .collect()
    }

    async fn sync_document(&self, uri: &str, text: Option<&str>) {
        let message = {
            let mut versions = self.versions.lock();
            let current = versions.get(uri).copied();
            match (text, current) {
                (Some(text), Some(version)) => {
                    let version = version + 1;
                    versions.insert(uri.to_string(), version);
                    (
                        "textDocument/didChange",
                        json!({
                            "textDocument": { "uri": uri, "version": version },
                            "contentChanges": [{ "text": text }],
                        }),
                    )
                }
                (Some(text), None) => {
                    versions.insert(uri.to_string(), 1);
                    (
                        "textDocument/didOpen",
                        json!({
                            "textDocument": {
                                "uri": uri,
                                "languageId": language_id(uri),
                                "version": 1,
                                "text": text,
                            }
                        }),
                    )
                }
                (None, Some(_)) => {
                    versions.remove(uri);
                    ("textDocument/didClose", json!({ "textDocument": { "uri": uri } }))
                }
                (None, None) => return,
            }
        };

        let (method, params) = message;
        if let Err(err) = self.conn.notify(method, params).await {
            tracing::warn!(target: "tessera.server", method, uri, error = %err, "failed to sync document");
        }
    }

    async fn diagnostics(&self, uri: &str, token: &CancellationToken) -> LookupResult<Value> {
        let report = self
            .conn
            .request_with_cancel("textDocument/diagnostic", json!({ "textDocument": { "uri": uri } }), token)
            .await;
        // A pull-diagnostics report carries the list under `items`.
        lookup_from_rpc(report).map(|report| match report {
            Value::Object(mut obj) => obj.remove("items").unwrap_or(Value::Array(Vec::new())),
            other => other,
        })
    }

    async fn forward_to_client(&self, client: Connection) {
        let taken = self.incoming.lock().take();
        let Some(incoming) = taken else {
            tracing::debug!(target: "tessera.server", "backend traffic is already relayed");
            return;
        };
        relay_backend_traffic(incoming, self.conn.clone(), client).await;
    }

    async fn shutdown(&self) {
        if let Err(err) = self.conn.request_and_wait("shutdown", Value::Null).await {
            tracing::debug!(target: "tessera.server", error = %err, "backend shutdown failed");
        }
        let _ = self.conn.notify("exit", Value::Null).await;
        self.conn.close();
    }
}
