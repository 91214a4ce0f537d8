use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tessera_config::RelayConfig;
use tessera_core::uri::file_uri_to_path;
use tessera_jsonrpc::codec::{read_frame, write_frame, write_message, DEFAULT_MAX_FRAME_BYTES};
use tessera_jsonrpc::{Message, Notification, Request, RequestId, Response, ResponseError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use crate::provision::{provision, WorkingCopy};
use crate::uri_map::UriMapper;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    /// Parent directory for working copies; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Close the session after this long without a message in either direction.
    pub idle_timeout: Option<Duration>,
    /// Reject `textDocument/didChange` and `textDocument/didSave`.
    pub read_only: bool,
    pub max_frame_bytes: usize,
}

impl RelayOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            scratch_dir: config.scratch_dir.clone(),
            idle_timeout: config.idle_timeout(),
            read_only: config.read_only,
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            idle_timeout: None,
            read_only: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Why a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientDisconnected,
    BackendDisconnected,
    /// The client sent `exit`, or any other method after `shutdown`.
    Exit,
    Idle,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionEnd::ClientDisconnected => "client disconnected",
            SessionEnd::BackendDisconnected => "backend disconnected",
            SessionEnd::Exit => "client exited",
            SessionEnd::Idle => "idle timeout",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingInitialize,
    Initialized,
    ShutdownRequested,
}

struct Mapping {
    to_backend: UriMapper,
    to_client: UriMapper,
}

struct Session<W> {
    id: u64,
    options: RelayOptions,
    client: tokio::sync::Mutex<W>,
    mapping: OnceLock<Mapping>,
    working_copy: Mutex<Option<WorkingCopy>>,
    activity: watch::Sender<u64>,
}

/// Relay one client connection to one backend connection until either side goes away.
///
/// Request ids pass through unchanged in both directions. Locations are rewritten between the
/// client's workspace and a private working copy created on the first `initialize`; the copy is
/// removed before this returns.
pub async fn relay_session<C, B>(client: C, backend: B, options: RelayOptions) -> SessionEnd
where
    C: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let (activity, activity_rx) = watch::channel(0u64);

    let session = Session {
        id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        options,
        client: tokio::sync::Mutex::new(client_write),
        mapping: OnceLock::new(),
        working_copy: Mutex::new(None),
        activity,
    };
    let idle_timeout = session.options.idle_timeout;

    let end = tokio::select! {
        end = session.client_pump(BufReader::new(client_read), backend_write) => end,
        end = session.backend_pump(BufReader::new(backend_read)) => end,
        _ = idle(activity_rx, idle_timeout) => SessionEnd::Idle,
    };

    let _ = session.client.lock().await.shutdown().await;
    let working_copy = session.working_copy.lock().take();
    if let Some(copy) = working_copy {
        let path = copy.root().display().to_string();
        match tokio::task::spawn_blocking(move || copy.remove()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                target: "tessera.relay",
                session = session.id,
                path = %path,
                error = %err,
                "failed to remove working copy"
            ),
            Err(err) => tracing::warn!(
                target: "tessera.relay",
                session = session.id,
                error = %err,
                "working copy cleanup task failed"
            ),
        }
    }

    tracing::info!(target: "tessera.relay", session = session.id, reason = %end, "relay session ended");
    end
}

async fn idle(mut activity: watch::Receiver<u64>, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        match tokio::time::timeout(timeout, activity.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return std::future::pending().await,
            Err(_) => return,
        }
    }
}

fn is_mutation(method: &str) -> bool {
    matches!(method, "textDocument/didChange" | "textDocument/didSave")
}

/// The logical workspace root named by `initialize` params.
fn initialize_root(params: &Value) -> Option<PathBuf> {
    if let Some(path) = params.get("rootUri").and_then(Value::as_str).and_then(file_uri_to_path) {
        return Some(path);
    }
    if let Some(path) = params.get("rootPath").and_then(Value::as_str) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    params
        .get("workspaceFolders")
        .and_then(Value::as_array)
        .and_then(|folders| folders.first())
        .and_then(|folder| folder.get("uri"))
        .and_then(Value::as_str)
        .and_then(file_uri_to_path)
}

impl<W> Session<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn touch(&self) {
        self.activity.send_modify(|count| *count = count.wrapping_add(1));
    }

    /// Write to the client; `false` once the client side is gone.
    async fn send_to_client(&self, message: &Message) -> bool {
        let mut client = self.client.lock().await;
        match write_message(&mut *client, message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(target: "tessera.relay", session = self.id, error = %err, "client write failed");
                false
            }
        }
    }

    async fn reply_error(&self, id: RequestId, error: ResponseError) -> bool {
        self.send_to_client(&Message::response(id, Err(error))).await
    }

    async fn backend_pump<R>(&self, mut reader: BufReader<R>) -> SessionEnd
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let body = match read_frame(&mut reader, self.options.max_frame_bytes).await {
                Ok(Some(body)) => body,
                Ok(None) => return SessionEnd::BackendDisconnected,
                Err(err) => {
                    tracing::warn!(target: "tessera.relay", session = self.id, error = %err, "backend read failed");
                    return SessionEnd::BackendDisconnected;
                }
            };
            self.touch();

            let delivered = match Message::from_slice(&body) {
                Ok(mut message) => {
                    if let Some(mapping) = self.mapping.get() {
                        mapping.to_client.rewrite_message(&mut message);
                    }
                    self.send_to_client(&message).await
                }
                // Undecodable frames are the client's business; pass them on untouched.
                Err(err) => {
                    tracing::debug!(target: "tessera.relay", session = self.id, error = %err, "relaying undecodable backend frame");
                    let mut client = self.client.lock().await;
                    write_frame(&mut *client, &body).await.is_ok()
                }
            };
            if !delivered {
                return SessionEnd::ClientDisconnected;
            }
        }
    }

    async fn client_pump<R, B>(&self, mut reader: BufReader<R>, mut backend: B) -> SessionEnd
    where
        R: AsyncRead + Unpin,
        B: AsyncWrite + Unpin,
    {
        let mut phase = Phase::AwaitingInitialize;
        loop {
            let body = match read_frame(&mut reader, self.options.max_frame_bytes).await {
                Ok(Some(body)) => body,
                Ok(None) => return SessionEnd::ClientDisconnected,
                Err(err) => {
                    tracing::warn!(target: "tessera.relay", session = self.id, error = %err, "client read failed");
                    return SessionEnd::ClientDisconnected;
                }
            };
            self.touch();

            let message = match Message::from_slice(&body) {
                Ok(message) => message,
                Err(err) => {
                    let reply = Message::Response(Response {
                        id: None,
                        result: Err(err.to_response_error()),
                    });
                    if !self.send_to_client(&reply).await {
                        return SessionEnd::ClientDisconnected;
                    }
                    continue;
                }
            };

            let end = match message {
                Message::Request(req) => self.on_client_request(&mut phase, req, &mut backend).await,
                Message::Notification(not) => {
                    self.on_client_notification(phase, not, &mut backend).await
                }
                Message::Response(resp) => {
                    // Answers to backend-initiated requests.
                    let mut message = Message::Response(resp);
                    self.forward(&mut message, &mut backend).await;
                    None
                }
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    async fn on_client_request<B>(
        &self,
        phase: &mut Phase,
        req: Request,
        backend: &mut B,
    ) -> Option<SessionEnd>
    where
        B: AsyncWrite + Unpin,
    {
        if req.method == "exit" || *phase == Phase::ShutdownRequested {
            return Some(self.exit(backend).await);
        }

        let rejection = match (*phase, req.method.as_str()) {
            (Phase::AwaitingInitialize, "initialize") => {
                return self.initialize(phase, req, backend).await;
            }
            (Phase::Initialized, "initialize") => {
                Some(ResponseError::invalid_request("already initialized"))
            }
            (Phase::AwaitingInitialize, _) => Some(ResponseError::server_not_initialized()),
            (_, method) if self.options.read_only && is_mutation(method) => Some(
                ResponseError::invalid_request("text document modifications not allowed"),
            ),
            _ => None,
        };
        if let Some(error) = rejection {
            return (!self.reply_error(req.id, error).await).then_some(SessionEnd::ClientDisconnected);
        }

        if req.method == "shutdown" {
            *phase = Phase::ShutdownRequested;
        }
        self.forward_request(req, backend).await
    }

    async fn initialize<B>(
        &self,
        phase: &mut Phase,
        req: Request,
        backend: &mut B,
    ) -> Option<SessionEnd>
    where
        B: AsyncWrite + Unpin,
    {
        let Some(root) = initialize_root(&req.params) else {
            let error = ResponseError::invalid_params("initialize requires a file rootUri or rootPath");
            return (!self.reply_error(req.id, error).await).then_some(SessionEnd::ClientDisconnected);
        };

        let copy = match provision(root.clone(), self.options.scratch_dir.clone()).await {
            Ok(copy) => copy,
            Err(err) => {
                tracing::warn!(
                    target: "tessera.relay",
                    session = self.id,
                    root = %root.display(),
                    error = %err,
                    "failed to provision working copy"
                );
                let error = ResponseError::internal(format!("failed to provision workspace: {err}"));
                return (!self.reply_error(req.id, error).await).then_some(SessionEnd::ClientDisconnected);
            }
        };

        tracing::info!(
            target: "tessera.relay",
            session = self.id,
            root = %root.display(),
            copy = %copy.root().display(),
            files = copy.file_count(),
            "workspace provisioned"
        );

        let to_backend = UriMapper::new(root, copy.root());
        let to_client = to_backend.inverse();
        *self.working_copy.lock() = Some(copy);
        // Only the first successful initialize gets here.
        let _ = self.mapping.set(Mapping {
            to_backend,
            to_client,
        });
        *phase = Phase::Initialized;

        self.forward_request(req, backend).await
    }

    async fn on_client_notification<B>(
        &self,
        phase: Phase,
        not: Notification,
        backend: &mut B,
    ) -> Option<SessionEnd>
    where
        B: AsyncWrite + Unpin,
    {
        if not.method == "exit" || phase == Phase::ShutdownRequested {
            return Some(self.exit(backend).await);
        }
        if phase == Phase::AwaitingInitialize {
            tracing::debug!(target: "tessera.relay", session = self.id, method = %not.method, "dropping notification before initialize");
            return None;
        }
        if self.options.read_only && is_mutation(&not.method) {
            tracing::warn!(
                target: "tessera.relay",
                session = self.id,
                method = %not.method,
                "text document modifications not allowed"
            );
            return None;
        }

        let mut message = Message::Notification(not);
        self.forward(&mut message, backend).await;
        None
    }

    /// Forward `req`; the client gets an internal error for it if the backend cannot take it.
    async fn forward_request<B>(&self, req: Request, backend: &mut B) -> Option<SessionEnd>
    where
        B: AsyncWrite + Unpin,
    {
        let id = req.id.clone();
        let method = req.method.clone();
        let mut message = Message::Request(req);
        if self.forward(&mut message, backend).await {
            return None;
        }
        let error = ResponseError::internal(format!("failed to forward {method} to the backend"));
        (!self.reply_error(id, error).await).then_some(SessionEnd::ClientDisconnected)
    }

    async fn forward<B>(&self, message: &mut Message, backend: &mut B) -> bool
    where
        B: AsyncWrite + Unpin,
    {
        if let Some(mapping) = self.mapping.get() {
            mapping.to_backend.rewrite_message(message);
        }
        match write_message(backend, message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    target: "tessera.relay",
                    session = self.id,
                    method = message.method().unwrap_or("<response>"),
                    error = %err,
                    "failed to forward message to backend"
                );
                false
            }
        }
    }

    async fn exit<B>(&self, backend: &mut B) -> SessionEnd
    where
        B: AsyncWrite + Unpin,
    {
        let mut exit = Message::notification("exit", Value::Null);
        self.forward(&mut exit, backend).await;
        let _ = backend.shutdown().await;
        SessionEnd::Exit
    }
}
