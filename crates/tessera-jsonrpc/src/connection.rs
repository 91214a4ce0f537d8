use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, DEFAULT_MAX_FRAME_BYTES};
use crate::{
    Message, Notification, Request, RequestId, Response, ResponseError, RpcError, TransportError,
};

const OUTBOUND_QUEUE: usize = 256;
const INCOMING_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_frame_bytes: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// A request or notification sent by the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Request(Request),
    Notification(Notification),
}

/// Peer-initiated traffic, delivered in arrival order.
///
/// The stream ends once the connection is closed.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::Receiver<IncomingMessage>,
}

impl Incoming {
    pub async fn next(&mut self) -> Option<IncomingMessage> {
        self.rx.recv().await
    }
}

/// One end of a JSON-RPC connection.
///
/// Cloning is cheap; all clones share the same id counter and pending-response table.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pending", &self.inner.pending.lock().len())
            .field("closed", &self.inner.closed.lock().is_some())
            .finish()
    }
}

struct Inner {
    next_id: AtomicI64,
    tx: mpsc::Sender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    closed: Mutex<Option<TransportError>>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, RpcError>>>>,
}

impl Connection {
    pub fn new<S>(stream: S) -> (Self, Incoming)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_options(stream, ConnectionOptions::default())
    }

    pub fn with_options<S>(stream: S, options: ConnectionOptions) -> (Self, Incoming)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, write_half, options)
    }

    /// Build a connection from separate halves, e.g. stdin and stdout.
    pub fn from_parts<R, W>(reader: R, writer: W, options: ConnectionOptions) -> (Self, Incoming)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        let inner = Arc::new(Inner {
            next_id: AtomicI64::new(1),
            tx,
            shutdown_tx,
            closed: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        });

        tokio::spawn(read_loop(
            BufReader::new(reader),
            inner.clone(),
            shutdown_rx.clone(),
            incoming_tx,
            options.max_frame_bytes,
        ));
        tokio::spawn(write_loop(writer, inner.clone(), shutdown_rx, rx));

        (Self { inner }, Incoming { rx: incoming_rx })
    }

    /// Send one request and wait for its response.
    pub async fn request_and_wait(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let (id, rx) = self.inner.register()?;
        let _slot = PendingSlot::new(&self.inner, id.clone());
        self.send(&Message::request(id, method, params)).await?;
        await_response(rx).await
    }

    /// Like [`Connection::request_and_wait`], but gives up when `token` is cancelled.
    ///
    /// On cancellation the peer is sent `$/cancelRequest` for the request and the waiter is
    /// released with [`RpcError::Cancelled`].
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Value,
        token: &CancellationToken,
    ) -> Result<Value, RpcError> {
        if token.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let (id, rx) = self.inner.register()?;
        let slot = PendingSlot::new(&self.inner, id.clone());
        self.send(&Message::request(id.clone(), method, params)).await?;

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                drop(slot);
                if let Err(err) = self.notify("$/cancelRequest", json!({ "id": id })).await {
                    tracing::debug!(target: "tessera.jsonrpc", error = %err, "failed to forward cancellation");
                }
                Err(RpcError::Cancelled)
            }
            result = await_response(rx) => result,
        }
    }

    /// Send every request, then wait for all responses.
    ///
    /// The returned vector has one slot per request, in input order. An error response only
    /// fails its own slot.
    pub async fn request_batch_and_wait(
        &self,
        requests: Vec<(String, Value)>,
    ) -> Vec<Result<Value, RpcError>> {
        let mut waiters = Vec::with_capacity(requests.len());
        let mut slots = Vec::with_capacity(requests.len());
        for (method, params) in requests {
            let waiter = match self.inner.register() {
                Ok((id, rx)) => {
                    slots.push(PendingSlot::new(&self.inner, id.clone()));
                    self.send(&Message::request(id, method, params)).await.map(|()| rx)
                }
                Err(err) => Err(err),
            };
            waiters.push(waiter);
        }

        let mut results = Vec::with_capacity(waiters.len());
        for waiter in waiters {
            results.push(match waiter {
                Ok(rx) => await_response(rx).await,
                Err(err) => Err(err),
            });
        }
        results
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if let Some(err) = self.inner.closed_error() {
            return Err(RpcError::Transport(err));
        }
        self.send(&Message::notification(method, params)).await
    }

    /// Answer a request received through [`Incoming`].
    pub async fn respond(
        &self,
        id: RequestId,
        result: Result<Value, ResponseError>,
    ) -> Result<(), RpcError> {
        self.send(&Message::response(id, result)).await
    }

    pub async fn respond_error(&self, id: RequestId, error: ResponseError) -> Result<(), RpcError> {
        self.respond(id, Err(error)).await
    }

    /// Close the connection and fail every pending waiter.
    pub fn close(&self) {
        self.inner.close(TransportError::ConnectionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed_error().is_some()
    }

    /// Resolves once the connection has been closed, by either side.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        // `wait_for` checks the current value first.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Number of requests still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    async fn send(&self, message: &Message) -> Result<(), RpcError> {
        let bytes = message.to_vec().map_err(|err| RpcError::Encode {
            message: err.to_string(),
        })?;
        self.inner
            .tx
            .send(bytes)
            .await
            .map_err(|_| RpcError::Transport(TransportError::ConnectionClosed))
    }
}

impl Inner {
    fn alloc_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(
        &self,
    ) -> Result<(RequestId, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = self.alloc_id();
        let mut pending = self.pending.lock();
        // Checked under the pending lock so `close` cannot drain before this insert lands.
        if let Some(err) = self.closed_error() {
            return Err(RpcError::Transport(err));
        }
        pending.insert(id.clone(), tx);
        Ok((id, rx))
    }

    fn closed_error(&self) -> Option<TransportError> {
        self.closed.lock().clone()
    }

    fn close(&self, err: TransportError) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(err.clone());
        }

        let _ = self.shutdown_tx.send(true);

        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Transport(err.clone())));
        }
    }

    fn complete(&self, response: Response) {
        let Some(id) = response.id else {
            tracing::warn!(
                target: "tessera.jsonrpc",
                error = ?response.result.err(),
                "peer reported an error for an unidentifiable message"
            );
            return;
        };

        let Some(tx) = self.pending.lock().remove(&id) else {
            tracing::warn!(target: "tessera.jsonrpc", id = %id, "ignoring response with unknown id");
            return;
        };

        let mapped = match response.result {
            Ok(value) => Ok(value),
            Err(error) if error.code == crate::codes::REQUEST_CANCELLED => Err(RpcError::Cancelled),
            Err(error) => Err(RpcError::Remote(error)),
        };
        let _ = tx.send(mapped);
    }
}

/// Removes a pending entry when its waiter goes away, including when the waiting future is
/// dropped before the response arrives.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: RequestId,
}

impl<'a> PendingSlot<'a> {
    fn new(inner: &'a Inner, id: RequestId) -> Self {
        Self { inner, id }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

async fn await_response(
    rx: oneshot::Receiver<Result<Value, RpcError>>,
) -> Result<Value, RpcError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Transport(TransportError::ConnectionClosed)),
    }
}

async fn write_loop<W: AsyncWrite + Unpin + Send + 'static>(
    mut w: W,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            bytes = rx.recv() => {
                let Some(bytes) = bytes else { break; };
                if let Err(err) = codec::write_frame(&mut w, &bytes).await {
                    inner.close(err);
                    break;
                }
            }
        }
    }

    let _ = w.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin + Send + 'static>(
    mut r: BufReader<R>,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    max_frame_bytes: usize,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            frame = codec::read_frame(&mut r, max_frame_bytes) => frame,
        };

        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => {
                inner.close(TransportError::ConnectionClosed);
                break;
            }
            Err(err) => {
                tracing::debug!(target: "tessera.jsonrpc", error = %err, "read loop failed");
                inner.close(err);
                break;
            }
        };

        let message = match Message::from_slice(&body) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: "tessera.jsonrpc", error = %err, "dropping undecodable message");
                let reply = Message::Response(Response {
                    id: None,
                    result: Err(err.to_response_error()),
                });
                if let Ok(bytes) = reply.to_vec() {
                    let _ = inner.tx.send(bytes).await;
                }
                continue;
            }
        };

        let incoming = match message {
            Message::Response(response) => {
                inner.complete(response);
                continue;
            }
            Message::Request(request) => IncomingMessage::Request(request),
            Message::Notification(notification) => IncomingMessage::Notification(notification),
        };

        if incoming_tx.send(incoming).await.is_err() {
            tracing::debug!(target: "tessera.jsonrpc", "incoming receiver dropped; discarding peer message");
        }
    }
}
