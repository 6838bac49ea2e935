//! JSON-RPC client over a tool server's stdio streams
//!
//! Requests are written to the child's stdin, one frame each. A reader task
//! decodes frames from stdout and resolves the caller whose request id
//! matches. Any number of calls may be in flight; responses can arrive in
//! any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::framing::Framing;
use super::message::{
    ErrorResponse, Incoming, Notification, Request, Response, RpcError, JSONRPC_VERSION,
    METHOD_NOT_FOUND,
};
use crate::process::ToolProcess;
use crate::{Error, Result};

/// Default request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 8 * 1024;
const NOTIFICATION_CAPACITY: usize = 64;
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of the channel to the tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Process spawned, waiting for its readiness signal
    Starting,
    /// Accepting calls
    Ready,
    /// Process exited or a stream closed; terminal
    Closed,
}

/// Per-channel settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub framing: Framing,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// A caller awaiting the response to one request
struct PendingCall {
    method: String,
    responder: oneshot::Sender<Result<JsonValue>>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<u64, PendingCall>,
    /// Set once the channel is closed; no call may register afterwards
    closed: Option<String>,
}

/// State shared between the client handle and its reader task
struct Shared {
    framing: Framing,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<PendingTable>,
    state: watch::Sender<ChannelState>,
    notifications: broadcast::Sender<Notification>,
}

impl Shared {
    fn register(&self, id: u64, method: &str, responder: oneshot::Sender<Result<JsonValue>>) -> Result<()> {
        let mut table = self.pending.lock();
        if let Some(reason) = &table.closed {
            return Err(Error::ChannelClosed(reason.clone()));
        }
        if table.calls.contains_key(&id) {
            return Err(Error::Protocol(format!("request id {} is already pending", id)));
        }
        table.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                responder,
            },
        );
        Ok(())
    }

    fn closed_reason(&self) -> Option<String> {
        self.pending.lock().closed.clone()
    }

    /// Move to Closed and fail every pending call. Idempotent.
    fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let drained: Vec<(u64, PendingCall)> = {
            let mut table = self.pending.lock();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.clone());
            table.calls.drain().collect()
        };

        self.state.send_replace(ChannelState::Closed);

        if !drained.is_empty() {
            tracing::warn!(
                "Channel closed ({}), failing {} pending call(s)",
                reason,
                drained.len()
            );
        } else {
            tracing::info!("Channel closed: {}", reason);
        }

        for (id, call) in drained {
            tracing::debug!("Failing pending call {} (id {})", call.method, id);
            let _ = call
                .responder
                .send(Err(Error::ChannelClosed(reason.clone())));
        }
    }

    /// Frame and write one message, closing the channel on failure.
    ///
    /// Dropping the future part way through a frame also closes the channel,
    /// since the peer can no longer find the next frame boundary.
    async fn write_frame(&self, body: &[u8]) -> Result<()> {
        let frame = self.framing.encode(body);
        let mut writer = self.writer.lock().await;

        let mut torn = TornWriteGuard {
            shared: self,
            armed: true,
        };
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        torn.armed = false;

        if let Err(e) = written {
            drop(writer);
            tracing::error!("Failed to write to tool server stdin: {}", e);
            let reason = format!("write to stdin failed: {}", e);
            self.close(reason.clone());
            return Err(Error::ChannelClosed(reason));
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, frame: &[u8]) {
        let message = match Incoming::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    "Discarding frame from tool server: {} - {}",
                    e,
                    String::from_utf8_lossy(frame)
                );
                return;
            }
        };

        match message {
            Incoming::Response(response) => self.resolve(response),
            Incoming::Notification(notification) => {
                tracing::debug!("Notification from tool server: {}", notification.method);
                // No subscribers is fine
                let _ = self.notifications.send(notification);
            }
            Incoming::Request { id, method, .. } => {
                tracing::warn!("Tool server sent unsupported request '{}' (id {})", method, id);
                let reply = ErrorResponse {
                    jsonrpc: JSONRPC_VERSION,
                    id: &id,
                    error: RpcError {
                        code: Some(METHOD_NOT_FOUND),
                        message: format!("Method not found: {}", method),
                        data: None,
                    },
                };
                match serde_json::to_vec(&reply) {
                    Ok(body) => {
                        // Replies go through the writer lock; never block the reader on it
                        let shared = Arc::clone(self);
                        tokio::spawn(async move {
                            let reply = shared.write_frame(&body);
                            let _ = tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, reply).await;
                        });
                    }
                    Err(e) => tracing::error!("Failed to serialize error reply: {}", e),
                }
            }
        }
    }

    fn resolve(&self, response: Response) {
        let call = response
            .numeric_id()
            .and_then(|id| self.pending.lock().calls.remove(&id));

        match call {
            Some(call) => {
                tracing::debug!("Response for {} (id {})", call.method, response.id);
                // The caller may have gone away; nothing to do then
                let _ = call.responder.send(response.outcome.into_result());
            }
            None => {
                tracing::warn!(
                    "Discarding response with unexpected id {} (stale, duplicate or never sent)",
                    response.id
                );
            }
        }
    }
}

/// Closes the channel if a frame write is abandoned midway
struct TornWriteGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for TornWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!("Write to tool server stdin abandoned mid-frame");
            self.shared
                .close("write to stdin did not complete before the deadline");
        }
    }
}

/// Removes a call's table entry however the call ends
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().calls.remove(&self.id);
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = shared.framing.decoder();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = 'read: loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                if decoder.buffered() > 0 {
                    tracing::debug!(
                        "Dropping {} trailing bytes of an incomplete frame",
                        decoder.buffered()
                    );
                }
                break "tool server closed stdout (EOF)".to_string();
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => shared.dispatch(&frame).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!("Unrecoverable framing error: {}", e);
                            break 'read format!("framing error: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error reading from tool server stdout: {}", e);
                break format!("read from stdout failed: {}", e);
            }
        }
    };

    shared.close(reason);
}

/// Lets a task outside the client, such as the process exit watcher, close
/// the channel
#[derive(Clone)]
pub(crate) struct ChannelCloser(Arc<Shared>);

impl ChannelCloser {
    pub(crate) fn close(&self, reason: impl Into<String>) {
        self.0.close(reason);
    }
}

/// Client for one tool server channel
///
/// Built either by [`StdioRpcClient::spawn`](crate::process) from a config,
/// or over arbitrary streams with [`StdioRpcClient::from_streams`].
pub struct StdioRpcClient {
    shared: Arc<Shared>,

    /// Request ID counter, never reused
    next_id: AtomicU64,

    request_timeout: Duration,

    reader_task: JoinHandle<()>,

    /// The child process, when this client spawned one
    process: Option<tokio::sync::Mutex<ToolProcess>>,
}

impl StdioRpcClient {
    /// Build a Ready client over an already connected pair of streams
    pub fn from_streams<R, W>(reader: R, writer: W, options: ClientOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_state(reader, writer, options, ChannelState::Ready)
    }

    pub(crate) fn with_state<R, W>(
        reader: R,
        writer: W,
        options: ClientOptions,
        initial: ChannelState,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(initial);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let shared = Arc::new(Shared {
            framing: options.framing,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(PendingTable::default()),
            state,
            notifications,
        });

        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Self {
            shared,
            next_id: AtomicU64::new(1),
            request_timeout: options.request_timeout,
            reader_task,
            process: None,
        }
    }

    pub(crate) fn attach_process(&mut self, process: ToolProcess) {
        self.process = Some(tokio::sync::Mutex::new(process));
    }

    pub(crate) fn process(&self) -> Option<&tokio::sync::Mutex<ToolProcess>> {
        self.process.as_ref()
    }

    /// Starting -> Ready; no effect once Closed
    pub(crate) fn mark_ready(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Starting {
                *state = ChannelState::Ready;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn close(&self, reason: impl Into<String>) {
        self.shared.close(reason);
    }

    pub(crate) fn closer(&self) -> ChannelCloser {
        ChannelCloser(Arc::clone(&self.shared))
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Number of calls currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().calls.len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Receive notifications emitted by the tool server from now on
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    /// Resolve once the channel reaches Closed
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == ChannelState::Closed).await;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its response, using the default timeout
    pub async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        self.call_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send a request and wait at most `timeout` for it to complete.
    ///
    /// The deadline covers writing the request as well as the wait for the
    /// response, so a server that stops reading stdin cannot stall the call.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();

        self.shared.register(id, method, tx)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let body = serde_json::to_vec(&Request::new(id, method, &params))?;
        let exchange = async {
            tracing::debug!("-> {} (id {})", method, id);
            self.shared.write_frame(&body).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ChannelClosed(
                    self.shared
                        .closed_reason()
                        .unwrap_or_else(|| "response channel dropped".to_string()),
                )),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Request {} (id {}) timed out after {:?}", method, id, timeout);
                Err(Error::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Typed variant of [`call`](Self::call)
    pub async fn call_typed<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, params).await?;
        serde_json::from_value(result).map_err(Error::Json)
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<JsonValue>) -> Result<()> {
        if let Some(reason) = self.shared.closed_reason() {
            return Err(Error::ChannelClosed(reason));
        }
        let body = serde_json::to_vec(&Notification::new(method, params))?;
        tracing::debug!("-> {} (notification)", method);
        tokio::time::timeout(self.request_timeout, self.shared.write_frame(&body))
            .await
            .map_err(|_| Error::Timeout {
                method: method.to_string(),
                timeout: self.request_timeout,
            })?
    }

    /// Close the channel and stop the tool server, if this client owns one.
    ///
    /// Pending calls fail with `ChannelClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.close("client shut down");

        // The server should exit once stdin is closed. A writer stuck on a
        // full pipe is left alone; terminating the process unblocks it.
        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, self.shared.writer.lock()).await {
            Ok(mut writer) => {
                let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await;
            }
            Err(_) => tracing::warn!("Tool server stdin is busy, skipping graceful close"),
        }

        if let Some(process) = &self.process {
            process.lock().await.terminate().await;
        }

        self.reader_task.abort();
        Ok(())
    }
}

impl Drop for StdioRpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        // kill_on_drop on the child handles the process itself
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::time::Instant;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Client wired to an in-memory fake server.
    /// Returns (client, server_reader, server_writer).
    fn mock_channel() -> (
        StdioRpcClient,
        tokio::io::Lines<BufReader<DuplexStream>>,
        DuplexStream,
    ) {
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);
        let client = StdioRpcClient::from_streams(client_in, client_out, ClientOptions::default());
        (client, BufReader::new(server_in).lines(), server_out)
    }

    async fn next_request(lines: &mut tokio::io::Lines<BufReader<DuplexStream>>) -> Request {
        let line = tokio::time::timeout(TEST_TIMEOUT, lines.next_line())
            .await
            .expect("Test timed out")
            .expect("Read failed")
            .expect("Client closed stdin");
        serde_json::from_str(&line).expect("Client sent invalid JSON")
    }

    async fn send(server_out: &mut DuplexStream, value: JsonValue) {
        let mut line = serde_json::to_vec(&value).unwrap();
        line.push(b'\n');
        server_out.write_all(&line).await.unwrap();
    }

    async fn wait_pending(client: &StdioRpcClient, count: usize) {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while client.pending_count() != count {
            assert!(Instant::now() < deadline, "pending count never reached {}", count);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_call_resolves_matching_response() {
        let (client, mut requests, mut server_out) = mock_channel();

        let server = async {
            let req = next_request(&mut requests).await;
            assert_eq!(req.method, "tools/call");
            assert_eq!(req.params, json!({"name": "get_system_time", "arguments": {}}));
            send(
                &mut server_out,
                json!({"jsonrpc": "2.0", "id": req.id, "result": {"content": [{"text": "12:00:00"}]}}),
            )
            .await;
        };

        let (result, ()) = tokio::join!(
            client.call("tools/call", json!({"name": "get_system_time", "arguments": {}})),
            server
        );

        assert_eq!(result.unwrap(), json!({"content": [{"text": "12:00:00"}]}));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_unique_while_pending() {
        let (client, mut requests, _server_out) = mock_channel();
        let client = Arc::new(client);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client
                    .call_with_timeout("ping", json!({}), Duration::from_millis(500))
                    .await
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for _ in 0..5 {
            let req = next_request(&mut requests).await;
            assert!(ids.insert(req.id), "id {} reused while pending", req.id);
        }
        assert_eq!(client.pending_count(), 5);

        for handle in handles {
            assert!(handle.await.unwrap().unwrap_err().is_timeout());
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_resolve_by_id() {
        let (client, mut requests, mut server_out) = mock_channel();
        let client = Arc::new(client);

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("first", json!({})).await }
        });
        let req1 = next_request(&mut requests).await;

        let second = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("second", json!({})).await }
        });
        let req2 = next_request(&mut requests).await;
        assert_eq!((req1.id, req2.id), (1, 2));

        send(&mut server_out, json!({"jsonrpc": "2.0", "id": 2, "result": "two"})).await;
        let second = tokio::time::timeout(TEST_TIMEOUT, second)
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(second.unwrap(), json!("two"));

        // id=1 is still waiting
        assert_eq!(client.pending_count(), 1);
        assert!(!first.is_finished());

        send(&mut server_out, json!({"jsonrpc": "2.0", "id": 1, "result": "one"})).await;
        assert_eq!(first.await.unwrap().unwrap(), json!("one"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let (client, mut requests, mut server_out) = mock_channel();
        let client = Arc::new(client);

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("tools/list", json!({})).await }
        });
        let req = next_request(&mut requests).await;

        // Unknown id, non-numeric id and garbage leave the pending call alone
        send(&mut server_out, json!({"jsonrpc": "2.0", "id": 999, "result": "stale"})).await;
        send(&mut server_out, json!({"jsonrpc": "2.0", "id": "abc", "result": "odd"})).await;
        server_out.write_all(b"not json at all\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(client.pending_count(), 1);
        assert_eq!(client.state(), ChannelState::Ready);

        send(&mut server_out, json!({"jsonrpc": "2.0", "id": req.id, "result": {"tools": []}})).await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_two_responses_in_one_chunk() {
        let (client, mut requests, mut server_out) = mock_channel();
        let client = Arc::new(client);

        let a = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("a", json!({})).await }
        });
        let b = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("b", json!({})).await }
        });
        let r1 = next_request(&mut requests).await;
        let r2 = next_request(&mut requests).await;

        let chunk = format!(
            "{}\n{}\n",
            json!({"jsonrpc": "2.0", "id": r2.id, "result": r2.method}),
            json!({"jsonrpc": "2.0", "id": r1.id, "result": r1.method}),
        );
        server_out.write_all(chunk.as_bytes()).await.unwrap();

        assert_eq!(a.await.unwrap().unwrap(), json!("a"));
        assert_eq!(b.await.unwrap().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (client, mut requests, mut server_out) = mock_channel();

        let server = async {
            let req = next_request(&mut requests).await;
            send(
                &mut server_out,
                json!({"jsonrpc": "2.0", "id": req.id, "error": {"code": -32602, "message": "Unknown tool: nope"}}),
            )
            .await;
        };

        let (result, ()) = tokio::join!(
            client.call("tools/call", json!({"name": "nope", "arguments": {}})),
            server
        );

        match result.unwrap_err() {
            Error::Remote { code, message, .. } => {
                assert_eq!(code, Some(-32602));
                assert_eq!(message, "Unknown tool: nope");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
        assert_eq!(client.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_timeout_fires_after_deadline() {
        let (client, _requests, _server_out) = mock_channel();

        let started = Instant::now();
        let err = client
            .call_with_timeout("tools/list", json!({}), Duration::from_millis(5))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "Expected timeout, got {:?}", err);
        assert!(elapsed >= Duration::from_millis(5), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "fired late: {:?}", elapsed);
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_timeout_covers_blocked_write() {
        // Tiny pipe the server never reads from
        let (client_out, _server_in) = tokio::io::duplex(64);
        let (_server_out, client_in) = tokio::io::duplex(64);
        let client = StdioRpcClient::from_streams(client_in, client_out, ClientOptions::default());

        let arguments = json!({"name": "x".repeat(4096)});
        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            client.call_with_timeout("tools/call", arguments, Duration::from_millis(5)),
        )
        .await
        .expect("call outlived its own deadline")
        .unwrap_err();

        assert!(err.is_timeout(), "Expected timeout, got {:?}", err);
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(client.pending_count(), 0);

        // Half a frame is on the wire; the stream is unusable
        assert_eq!(client.state(), ChannelState::Closed);
        let err = tokio::time::timeout(TEST_TIMEOUT, client.call("tools/list", json!({})))
            .await
            .expect("Test timed out")
            .unwrap_err();
        assert!(err.is_channel_closed(), "Expected ChannelClosed, got {:?}", err);

        tokio::time::timeout(TEST_TIMEOUT, client.shutdown())
            .await
            .expect("shutdown hung on the writer")
            .unwrap();
    }

    #[tokio::test]
    async fn test_channel_close_fails_all_pending() {
        let (client, mut requests, server_out) = mock_channel();
        let client = Arc::new(client);

        let mut calls = Vec::new();
        for method in ["a", "b", "c"] {
            let client = Arc::clone(&client);
            calls.push(tokio::spawn(async move { client.call(method, json!({})).await }));
        }
        for _ in 0..3 {
            next_request(&mut requests).await;
        }
        wait_pending(&client, 3).await;

        // Server exits: stdout EOF
        drop(server_out);

        for call in calls {
            let err = tokio::time::timeout(TEST_TIMEOUT, call)
                .await
                .expect("Test timed out")
                .unwrap()
                .unwrap_err();
            assert!(err.is_channel_closed(), "Expected ChannelClosed, got {:?}", err);
        }
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.state(), ChannelState::Closed);

        // No way back from Closed
        let err = client.call("again", json!({})).await.unwrap_err();
        assert!(err.is_channel_closed());
        client.mark_ready();
        assert_eq!(client.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_write_failure_closes_channel() {
        let (client_out, server_in) = tokio::io::duplex(1024);
        let (_server_out, client_in) = tokio::io::duplex(1024);
        let client = StdioRpcClient::from_streams(client_in, client_out, ClientOptions::default());

        // Server stops reading stdin
        drop(server_in);

        let err = client.call("tools/list", json!({})).await.unwrap_err();
        assert!(err.is_channel_closed(), "Expected ChannelClosed, got {:?}", err);
        assert_eq!(client.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded() {
        let (client, _requests, mut server_out) = mock_channel();
        let mut notes = client.subscribe_notifications();

        send(
            &mut server_out,
            json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"data": "hi"}}),
        )
        .await;

        let note = tokio::time::timeout(TEST_TIMEOUT, notes.recv())
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(note.method, "notifications/message");
        assert_eq!(note.params, Some(json!({"data": "hi"})));
    }

    #[tokio::test]
    async fn test_server_request_gets_method_not_found() {
        let (_client, mut requests, mut server_out) = mock_channel();

        send(
            &mut server_out,
            json!({"jsonrpc": "2.0", "id": "srv-7", "method": "sampling/createMessage"}),
        )
        .await;

        let line = tokio::time::timeout(TEST_TIMEOUT, requests.next_line())
            .await
            .expect("Test timed out")
            .unwrap()
            .unwrap();
        let reply: JsonValue = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["id"], json!("srv-7"));
        assert_eq!(reply["error"]["code"], json!(METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_closes_stdin() {
        let (client, mut requests, _server_out) = mock_channel();
        let client = Arc::new(client);

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call("slow", json!({})).await }
        });
        next_request(&mut requests).await;
        wait_pending(&client, 1).await;

        client.shutdown().await.unwrap();

        assert!(call.await.unwrap().unwrap_err().is_channel_closed());
        tokio::time::timeout(TEST_TIMEOUT, client.closed())
            .await
            .expect("closed() never resolved");
        // stdin EOF on the server side
        let next = tokio::time::timeout(TEST_TIMEOUT, requests.next_line())
            .await
            .expect("Test timed out")
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_content_length_framing() {
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (mut server_out, client_in) = tokio::io::duplex(64 * 1024);
        let client = StdioRpcClient::from_streams(
            client_in,
            client_out,
            ClientOptions {
                framing: Framing::ContentLength,
                request_timeout: TEST_TIMEOUT,
            },
        );

        let server = async {
            let mut reader = BufReader::new(server_in);
            let mut decoder = Framing::ContentLength.decoder();
            let mut buf = [0u8; 256];
            let frame = loop {
                if let Some(frame) = decoder.next_frame().unwrap() {
                    break frame;
                }
                let n = reader.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed stdin");
                decoder.push(&buf[..n]);
            };
            let req: Request = serde_json::from_slice(&frame).unwrap();
            let body = serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": req.id, "result": 42})).unwrap();
            server_out
                .write_all(&Framing::ContentLength.encode(&body))
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client.call("answer", json!({})), server);
        assert_eq!(result.unwrap(), json!(42));
    }
}
