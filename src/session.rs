//! Server session: one live worker process, many concurrent callers.
//!
//! A [`Session`] multiplexes calls over the worker's single stdio pair.
//! Requests are written in `send` order under a single writer lock and
//! tagged with a monotonically increasing correlation id; a dedicated
//! reader task decodes worker output and fulfills the matching pending
//! call, so responses may complete out of submission order. The reader
//! never waits on caller logic — a slow caller cannot stall dispatch
//! for anyone else.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, VmError};
use crate::permissions::PermissionSet;
use crate::process::WorkerProcess;
use crate::protocol::{self, DecodeError, Message, RemoteError};
use crate::vm::ConsoleMode;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Running,
    Closed,
}

/// Console events and other async notifications buffered for one
/// execution handle.
struct EventSink {
    mode: ConsoleMode,
    queue: VecDeque<Value>,
}

struct Inner {
    permissions: PermissionSet,
    state: Mutex<SessionState>,
    next_id: AtomicU64,
    /// Correlation id → the waiter for that call. Insert in `send`,
    /// remove on dispatch or shutdown; entries are fulfilled exactly
    /// once.
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    /// Execution handle id → its event sink.
    events: Mutex<HashMap<u64, EventSink>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    worker: tokio::sync::Mutex<Option<WorkerProcess>>,
    shutdown_grace: Duration,
}

/// Handle to one running vm-server process. Cheap to clone; all clones
/// share the same process, and any number of execution handles may be
/// bound to it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

/// A call in flight: the single-assignment slot the caller awaits.
/// Fulfilled exactly once, by the reader task (response arrived) or by
/// session shutdown.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Suspends until the matching response arrives or the session
    /// shuts down.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or_else(|_| Err(VmError::ProcessExited))
    }
}

impl Session {
    /// Spawns a worker process restricted to `permissions` and performs
    /// the initial ping round-trip.
    pub async fn start(permissions: PermissionSet, config: &ServerConfig) -> Result<Session> {
        permissions.validate()?;
        let (worker, stdin, stdout) = WorkerProcess::spawn(config, &permissions)?;
        let session = Session::build(
            Box::new(stdout),
            Box::new(stdin),
            permissions,
            Some(worker),
            config.shutdown_grace(),
        );

        // The worker confirms its command loop is up before the session
        // is handed to the caller.
        let ping = async {
            session.send("ping", Value::Null).await?.wait().await
        };
        if let Err(e) = ping.await {
            session.close().await;
            return Err(VmError::Initialization(format!("vm-server did not answer ping: {e}")));
        }
        info!("vm-server started");
        Ok(session)
    }

    /// Builds a session over arbitrary stream halves with no child
    /// process — the seam used by in-crate tests and by callers
    /// supplying their own transport. No handshake is performed; the
    /// peer is assumed to already speak the protocol.
    ///
    /// Must be called from within a tokio runtime (the reader task is
    /// spawned immediately).
    pub fn over_transport(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        permissions: PermissionSet,
    ) -> Session {
        Session::build(
            Box::new(reader),
            Box::new(writer),
            permissions,
            None,
            Duration::from_secs(0),
        )
    }

    fn build(
        reader: BoxedReader,
        writer: BoxedWriter,
        permissions: PermissionSet,
        worker: Option<WorkerProcess>,
        shutdown_grace: Duration,
    ) -> Session {
        let inner = Arc::new(Inner {
            permissions,
            state: Mutex::new(SessionState::Running),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            worker: tokio::sync::Mutex::new(worker),
            shutdown_grace,
        });
        tokio::spawn(read_loop(Arc::clone(&inner), reader));
        Session { inner }
    }

    /// The permission set this session's process was launched with.
    pub fn permissions(&self) -> &PermissionSet {
        &self.inner.permissions
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.lock().unwrap() == SessionState::Running
    }

    /// Encodes and writes one request, registering its waiter first.
    /// Fails with a state error once the session is closed.
    pub(crate) async fn send(&self, op: &str, payload: Value) -> Result<PendingCall> {
        if !self.is_running() {
            return Err(VmError::State("session is not running".into()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, tx);

        let bytes = protocol::encode(&Message::Request {
            id,
            op: op.to_string(),
            payload,
        });

        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                let written = async {
                    w.write_all(&bytes).await?;
                    w.flush().await
                };
                if let Err(e) = written.await {
                    // The waiter was either already failed by shutdown
                    // or is removed here; either way it never leaks.
                    self.inner.pending.lock().unwrap().remove(&id);
                    return Err(VmError::Process(format!("write to vm-server failed: {e}")));
                }
            }
            None => {
                // Shut down between the state check and the write.
                self.inner.pending.lock().unwrap().remove(&id);
                return Err(VmError::State("session is not running".into()));
            }
        }
        debug!(id, op, "request sent");
        Ok(PendingCall { id, rx })
    }

    /// Closes the session: every outstanding call fails with
    /// [`VmError::ProcessExited`], the worker's stdin is closed to
    /// signal clean exit, and the process is reaped (killed after the
    /// grace period). Idempotent; teardown faults are logged, never
    /// raised.
    pub async fn close(&self) {
        self.inner.shutdown(|| VmError::ProcessExited).await;
    }

    pub(crate) fn register_events(&self, handle: u64, mode: ConsoleMode) {
        self.inner.events.lock().unwrap().insert(
            handle,
            EventSink {
                mode,
                queue: VecDeque::new(),
            },
        );
    }

    pub(crate) fn deregister_events(&self, handle: u64) {
        self.inner.events.lock().unwrap().remove(&handle);
    }

    /// Removes and returns every event currently queued for `handle`.
    pub(crate) fn drain_events(&self, handle: u64) -> Vec<Value> {
        match self.inner.events.lock().unwrap().get_mut(&handle) {
            Some(sink) => sink.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

impl Inner {
    /// Fulfills one pending call. Runs on the reader task; must never
    /// block beyond the map lock.
    fn fulfill(&self, id: u64, result: Option<Value>, error: Option<RemoteError>) {
        let tx = self.pending.lock().unwrap().remove(&id);
        match tx {
            Some(tx) => {
                let outcome = match error {
                    Some(RemoteError { message, stack }) => Err(VmError::Script { message, stack }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if tx.send(outcome).is_err() {
                    debug!(id, "caller no longer waiting, dropping response");
                }
            }
            None => warn!(id, "response for unknown correlation id, dropping"),
        }
    }

    /// Routes an unsolicited event to its handle's sink.
    fn push_event(&self, handle: u64, payload: Value) {
        let mut events = self.events.lock().unwrap();
        let Some(sink) = events.get_mut(&handle) else {
            // The handle was destroyed while the event was in flight.
            debug!(handle, "event for unknown handle, dropping");
            return;
        };
        match sink.mode {
            ConsoleMode::Off => {}
            ConsoleMode::Redirect => sink.queue.push_back(payload),
            ConsoleMode::Inherit => {
                let name = payload.get("name").and_then(Value::as_str).unwrap_or("");
                let text = payload.get("value").and_then(Value::as_str).unwrap_or("");
                if name == "console.error" {
                    eprintln!("{text}");
                } else {
                    println!("{text}");
                }
            }
        }
    }

    /// Transitions to `Closed`, fails all outstanding calls, releases
    /// the streams and reaps the worker. Safe to run more than once.
    async fn shutdown(&self, err: impl Fn() -> VmError) {
        // No early return when already closed: a racing `send` may have
        // registered a waiter after a previous shutdown drained the
        // map, and it must still be failed below.
        *self.state.lock().unwrap() = SessionState::Closed;

        let waiters: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (id, tx) in waiters {
            debug!(id, "failing pending call on shutdown");
            let _ = tx.send(Err(err()));
        }

        // Dropping the writer closes the worker's stdin — its signal to
        // exit cleanly.
        *self.writer.lock().await = None;

        if let Some(worker) = self.worker.lock().await.take() {
            worker.terminate(self.shutdown_grace).await;
        }
    }
}

/// Dedicated reader: drains the worker's output stream until it closes
/// or turns malformed, dispatching each record by discriminator.
async fn read_loop(inner: Arc<Inner>, reader: BoxedReader) {
    let mut lines = BufReader::new(reader).lines();
    let fatal: VmError = loop {
        match lines.next_line().await {
            Ok(Some(line)) => match protocol::decode(line.as_bytes()) {
                Ok(Message::Response { id, result, error }) => inner.fulfill(id, result, error),
                Ok(Message::Event { handle, payload }) => inner.push_event(handle, payload),
                Ok(Message::Request { id, op, .. }) => {
                    warn!(id, op = %op, "worker sent a request record, dropping");
                }
                Err(DecodeError::UnknownType(t)) => {
                    warn!(message_type = %t, "unknown message type, dropping");
                }
                Err(e @ DecodeError::Malformed(_)) => {
                    error!("malformed record from vm-server: {e}");
                    break e.into();
                }
            },
            Ok(None) => {
                debug!("vm-server output stream closed");
                break VmError::ProcessExited;
            }
            Err(e) => {
                error!("read from vm-server failed: {e}");
                break VmError::Process(format!("read from vm-server failed: {e}"));
            }
        }
    };

    inner
        .shutdown(|| match &fatal {
            VmError::Protocol(msg) => VmError::Protocol(msg.clone()),
            VmError::Process(msg) => VmError::Process(msg.clone()),
            _ => VmError::ProcessExited,
        })
        .await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{ReadHalf, WriteHalf};

    /// The scripted peer on the far side of an in-memory duplex pipe.
    pub(crate) struct FakeWorker {
        lines: tokio::io::Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>,
        writer: WriteHalf<tokio::io::DuplexStream>,
    }

    impl FakeWorker {
        pub(crate) fn pair(permissions: PermissionSet) -> (Session, FakeWorker) {
            let (host, remote) = tokio::io::duplex(64 * 1024);
            let (host_r, host_w) = tokio::io::split(host);
            let session = Session::over_transport(host_r, host_w, permissions);
            let (remote_r, remote_w) = tokio::io::split(remote);
            (
                session,
                FakeWorker {
                    lines: BufReader::new(remote_r).lines(),
                    writer: remote_w,
                },
            )
        }

        /// Reads the next request off the wire.
        pub(crate) async fn next_request(&mut self) -> (u64, String, Value) {
            let line = self.lines.next_line().await.unwrap().expect("host closed");
            match protocol::decode(line.as_bytes()).unwrap() {
                Message::Request { id, op, payload } => (id, op, payload),
                other => panic!("expected request, got {other:?}"),
            }
        }

        pub(crate) async fn respond(&mut self, id: u64, result: Value) {
            self.send(&Message::Response {
                id,
                result: Some(result),
                error: None,
            })
            .await;
        }

        pub(crate) async fn respond_err(&mut self, id: u64, message: &str, stack: Option<&str>) {
            self.send(&Message::Response {
                id,
                result: None,
                error: Some(RemoteError {
                    message: message.into(),
                    stack: stack.map(Into::into),
                }),
            })
            .await;
        }

        pub(crate) async fn send_event(&mut self, handle: u64, payload: Value) {
            self.send(&Message::Event { handle, payload }).await;
        }

        pub(crate) async fn send(&mut self, msg: &Message) {
            self.writer.write_all(&protocol::encode(msg)).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        pub(crate) async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_matches_response() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", json!({"code": "1+1"})).await.unwrap();
        let (id, op, payload) = worker.next_request().await;
        assert_eq!(op, "run");
        assert_eq!(payload, json!({"code": "1+1"}));
        worker.respond(id, json!(2)).await;

        assert_eq!(call.wait().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_correlation_ids_increase() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let a = session.send("run", Value::Null).await.unwrap();
        let b = session.send("run", Value::Null).await.unwrap();
        assert!(b.id() > a.id());

        // Requests hit the wire in send order.
        let (id_a, ..) = worker.next_request().await;
        let (id_b, ..) = worker.next_request().await;
        assert_eq!(id_a, a.id());
        assert_eq!(id_b, b.id());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_matched_by_id() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let first = session.send("run", json!({"code": "slow()"})).await.unwrap();
        let second = session.send("run", json!({"code": "fast()"})).await.unwrap();
        let (id1, ..) = worker.next_request().await;
        let (id2, ..) = worker.next_request().await;

        // The worker completes the second call first.
        worker.respond(id2, json!("fast")).await;
        worker.respond(id1, json!("slow")).await;

        assert_eq!(second.wait().await.unwrap(), json!("fast"));
        assert_eq!(first.wait().await.unwrap(), json!("slow"));
    }

    #[tokio::test]
    async fn test_remote_error_becomes_script_error() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", json!({"code": "nope()"})).await.unwrap();
        let (id, ..) = worker.next_request().await;
        worker
            .respond_err(id, "ReferenceError: nope is not defined", Some("at <anonymous>:1:1"))
            .await;

        match call.wait().await {
            Err(VmError::Script { message, stack }) => {
                assert!(message.contains("nope"));
                assert_eq!(stack.as_deref(), Some("at <anonymous>:1:1"));
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_rejects_new_sends() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", Value::Null).await.unwrap();
        let _ = worker.next_request().await;

        session.close().await;
        assert!(matches!(call.wait().await, Err(VmError::ProcessExited)));
        assert!(!session.is_running());
        assert!(matches!(
            session.send("run", Value::Null).await,
            Err(VmError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _worker) = FakeWorker::pair(PermissionSet::none());
        session.close().await;
        session.close().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_peer_eof_fails_pending_with_process_exited() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", Value::Null).await.unwrap();
        let _ = worker.next_request().await;
        drop(worker); // the "process" dies

        assert!(matches!(call.wait().await, Err(VmError::ProcessExited)));
    }

    #[tokio::test]
    async fn test_malformed_record_is_fatal_protocol_error() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", Value::Null).await.unwrap();
        let _ = worker.next_request().await;
        worker.send_raw("{this is not json}\n").await;

        assert!(matches!(call.wait().await, Err(VmError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped_not_fatal() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", Value::Null).await.unwrap();
        let (id, ..) = worker.next_request().await;
        worker.send_raw("{\"type\":\"heartbeat\",\"seq\":1}\n").await;
        worker.respond(id, json!(42)).await;

        assert_eq!(call.wait().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let call = session.send("run", Value::Null).await.unwrap();
        let (id, ..) = worker.next_request().await;
        worker.respond(9999, json!("orphan")).await;
        worker.respond(id, json!("mine")).await;

        assert_eq!(call.wait().await.unwrap(), json!("mine"));
    }

    #[tokio::test]
    async fn test_events_queue_and_drain() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());
        session.register_events(7, ConsoleMode::Redirect);

        worker
            .send_event(7, json!({"name": "console.log", "value": "hello"}))
            .await;
        worker
            .send_event(7, json!({"name": "console.error", "value": "oops"}))
            .await;

        // A response round-trip guarantees the events were dispatched.
        let call = session.send("run", Value::Null).await.unwrap();
        let (id, ..) = worker.next_request().await;
        worker.respond(id, Value::Null).await;
        call.wait().await.unwrap();

        let events = session.drain_events(7);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["value"], "hello");
        // Each drain removes what it returns.
        assert!(session.drain_events(7).is_empty());
    }

    #[tokio::test]
    async fn test_event_for_unknown_handle_is_dropped() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        worker
            .send_event(99, json!({"name": "console.log", "value": "ghost"}))
            .await;

        let call = session.send("run", Value::Null).await.unwrap();
        let (id, ..) = worker.next_request().await;
        worker.respond(id, json!(1)).await;
        assert_eq!(call.wait().await.unwrap(), json!(1));
        assert!(session.drain_events(99).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_each_get_their_result() {
        let (session, mut worker) = FakeWorker::pair(PermissionSet::none());

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let call = session.send("run", json!({"n": i})).await.unwrap();
                (i, call.wait().await.unwrap())
            }));
        }

        // Echo each request's payload back in reverse arrival order.
        let mut requests = Vec::new();
        for _ in 0..8 {
            requests.push(worker.next_request().await);
        }
        for (id, _, payload) in requests.into_iter().rev() {
            worker.respond(id, json!(payload["n"].as_u64().unwrap() * 10)).await;
        }

        for handle in handles {
            let (i, result) = handle.await.unwrap();
            assert_eq!(result, json!(i * 10));
        }
    }
}
