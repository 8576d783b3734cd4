use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use stp_frame::Frame;
use stp_transport::ScopeStream;
use tracing::{debug, info, trace};

use crate::config::RuntimeConfig;
use crate::error::{Result, ScopeError};
use crate::events::{spawn_dispatcher, Event, EventDispatcher, EventHandlerError};
use crate::handshake::perform_handshake;
use crate::message::{encode_payload, Message, Response};
use crate::pending::{CallResult, ResultSlot};
use crate::reactor::{spawn_reactor, ConnectionState, Shared};
use crate::registry::{Capability, HostInfo, ServiceRegistry};

/// The call engine: reactor and event threads plus the shared state they
/// work on. Dropping it closes the socket and joins both threads.
pub(crate) struct Runtime {
    shared: Arc<Shared>,
    dispatcher: Arc<EventDispatcher>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    events_thread: Mutex<Option<JoinHandle<()>>>,
    default_timeout: Duration,
}

impl Runtime {
    fn start(stream: ScopeStream, config: &RuntimeConfig) -> Result<Self> {
        let dispatcher = Arc::new(EventDispatcher::new(config.event_handler_budget));
        let (sink, events_thread) =
            spawn_dispatcher(Arc::clone(&dispatcher), config.event_queue_capacity)?;
        let (shared, reactor) = spawn_reactor(stream, config, sink)?;

        Ok(Self {
            shared,
            dispatcher,
            reactor: Mutex::new(Some(reactor)),
            events_thread: Mutex::new(Some(events_thread)),
            default_timeout: config.default_timeout,
        })
    }

    /// Send a command and block until its response, a timeout, or
    /// connection loss.
    pub(crate) fn call(
        &self,
        service: &str,
        command_id: u32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Response> {
        let (tx, rx) = mpsc::sync_channel::<CallResult>(1);
        let tag = self.send_command(service, command_id, payload, ResultSlot::Blocking(tx))?;

        let result = match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(call) = self.shared.pending.cancel(tag) {
                    debug!(
                        service = %call.service,
                        command_id = call.command_id,
                        tag,
                        waited_ms = call.started.elapsed().as_millis() as u64,
                        "call timed out"
                    );
                    return Err(ScopeError::Timeout {
                        service: service.to_string(),
                        command_id,
                        tag,
                        after: timeout,
                    });
                }
                // The reactor resolved the call while we were timing out;
                // its outcome is already on the way.
                rx.recv().unwrap_or_else(|_| Err(slot_dropped()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(slot_dropped()),
        };

        result.and_then(Response::from_frame)
    }

    #[cfg(feature = "async")]
    pub(crate) async fn call_async(
        &self,
        service: &str,
        command_id: u32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Response> {
        let (tx, mut rx) = tokio::sync::oneshot::channel::<CallResult>();
        let tag = self.send_command(service, command_id, payload, ResultSlot::Async(tx))?;

        let result = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(slot_dropped()),
            Err(_) => {
                if let Some(call) = self.shared.pending.cancel(tag) {
                    debug!(
                        service = %call.service,
                        command_id = call.command_id,
                        tag,
                        waited_ms = call.started.elapsed().as_millis() as u64,
                        "call timed out"
                    );
                    return Err(ScopeError::Timeout {
                        service: service.to_string(),
                        command_id,
                        tag,
                        after: timeout,
                    });
                }
                rx.await.unwrap_or_else(|_| Err(slot_dropped()))
            }
        };

        result.and_then(Response::from_frame)
    }

    fn send_command(
        &self,
        service: &str,
        command_id: u32,
        payload: Bytes,
        slot: ResultSlot,
    ) -> Result<u32> {
        let tag = self.shared.pending.register(service, command_id, slot)?;
        let frame = Frame::command(service, command_id, tag, payload);
        if let Err(err) = self.shared.enqueue(&frame) {
            self.shared.pending.cancel(tag);
            return Err(err);
        }
        Ok(tag)
    }

    /// Stop the reactor, then wait for queued events to finish dispatching.
    ///
    /// The dispatcher exits once the reactor drops its sink. When the last
    /// handle is released from inside an event handler, this runs on the
    /// dispatcher thread itself and the dispatcher join is skipped.
    fn close(&self) {
        self.shared.request_close();
        let reactor = self.reactor.lock().take();
        if let Some(handle) = reactor {
            if handle.join().is_err() {
                debug!("reactor thread panicked");
            }
        }

        let events_thread = self.events_thread.lock().take();
        if let Some(handle) = events_thread {
            if handle.thread().id() == thread::current().id() {
                trace!("closing from the event thread; not joining it");
            } else if handle.join().is_err() {
                debug!("event dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.close();
    }
}

fn slot_dropped() -> ScopeError {
    ScopeError::Disconnected("result slot dropped before completion".to_string())
}

struct ConnectionInner {
    runtime: Runtime,
    registry: ServiceRegistry,
}

/// A negotiated STP connection to a browser.
///
/// Cheap to clone; all clones share one socket. Calls may be issued from
/// any number of threads at once. The connection closes when the last
/// clone is dropped or [`close`](Self::close) is called.
///
/// Event handlers must not capture a `Connection`: the handler table is
/// owned by the connection, so doing so keeps it alive forever.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start the runtime on a connected stream and negotiate services.
    pub fn establish(stream: ScopeStream, config: RuntimeConfig) -> Result<Self> {
        let runtime = Runtime::start(stream, &config)?;
        runtime.shared.advance(ConnectionState::Handshaking);

        let registry = perform_handshake(&runtime, &config.handshake)?;

        let state = runtime.shared.advance(ConnectionState::Ready);
        if state != ConnectionState::Ready {
            return Err(ScopeError::Disconnected(format!(
                "connection {state} before handshake completed"
            )));
        }
        info!(
            peer = ?runtime.shared.peer_addr(),
            services = registry.len(),
            "connection ready"
        );

        Ok(Self {
            inner: Arc::new(ConnectionInner { runtime, registry }),
        })
    }

    /// Send a raw command and wait for the response.
    pub fn call(
        &self,
        service: &str,
        command_id: u32,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Response> {
        self.inner
            .runtime
            .call(service, command_id, payload.into(), timeout)
    }

    /// Send a typed command with a JSON body, using the default timeout.
    pub fn execute<M, T>(&self, message: M, payload: &T) -> Result<Response>
    where
        M: Message,
        T: Serialize + ?Sized,
    {
        self.execute_with_timeout(message, payload, self.default_timeout())
    }

    /// Send a typed command with a JSON body and an explicit timeout.
    pub fn execute_with_timeout<M, T>(
        &self,
        message: M,
        payload: &T,
        timeout: Duration,
    ) -> Result<Response>
    where
        M: Message,
        T: Serialize + ?Sized,
    {
        let service = message.service_name();
        self.inner.registry.require_service(service)?;
        self.call(service, message.id(), encode_payload(payload)?, timeout)
    }

    /// Send a typed command that carries no body.
    pub fn execute_empty<M: Message>(&self, message: M) -> Result<Response> {
        let service = message.service_name();
        self.inner.registry.require_service(service)?;
        self.call(service, message.id(), Bytes::new(), self.default_timeout())
    }

    /// Like [`execute`](Self::execute), but fails with `FeatureUnavailable`
    /// without sending anything when `capability` was not negotiated.
    pub fn execute_gated<M, T>(
        &self,
        capability: Capability,
        message: M,
        payload: &T,
    ) -> Result<Response>
    where
        M: Message,
        T: Serialize + ?Sized,
    {
        self.require(capability)?;
        self.execute(message, payload)
    }

    #[cfg(feature = "async")]
    pub async fn call_async(
        &self,
        service: &str,
        command_id: u32,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Response> {
        self.inner
            .runtime
            .call_async(service, command_id, payload.into(), timeout)
            .await
    }

    #[cfg(feature = "async")]
    pub async fn execute_async<M, T>(&self, message: M, payload: &T) -> Result<Response>
    where
        M: Message,
        T: Serialize + ?Sized,
    {
        let service = message.service_name();
        self.inner.registry.require_service(service)?;
        let body = encode_payload(payload)?;
        self.call_async(service, message.id(), body, self.default_timeout())
            .await
    }

    /// Route events of `service` to `handler`, replacing any previous one.
    pub fn subscribe<F>(&self, service: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> std::result::Result<(), EventHandlerError> + Send + Sync + 'static,
    {
        self.inner.runtime.dispatcher.subscribe(service, handler);
    }

    /// Stop routing events of `service`. Returns true if a handler existed.
    pub fn unsubscribe(&self, service: &str) -> bool {
        self.inner.runtime.dispatcher.unsubscribe(service)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn host_info(&self) -> &HostInfo {
        self.inner.registry.host_info()
    }

    pub fn is_version_at_least(&self, service: &str, version: &str) -> bool {
        self.inner.registry.is_version_at_least(service, version)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.inner.registry.has_capability(capability)
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        self.inner.registry.require(capability)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.runtime.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.runtime.shared.peer_addr()
    }

    /// Calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.runtime.shared.pending.len()
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.runtime.default_timeout
    }

    /// Close the socket, fail outstanding calls with `Disconnected` and wait
    /// for the reactor to stop. Safe to call more than once.
    pub fn close(&self) {
        self.inner.runtime.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer_addr())
            .field("state", &self.state())
            .field("services", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use bytes::{BufMut, BytesMut};
    use stp_frame::{encode_frame, Status, HEADER_SIZE};

    use super::*;
    use crate::connector::{connect, connect_with_config};
    use crate::testing::{FakeBrowser, Reply};

    const WAIT: Duration = Duration::from_secs(5);

    fn echo_browser() -> FakeBrowser {
        FakeBrowser::builder()
            .service("exec", "2.2")
            .service("prefs", "1.0")
            .respond(|frame| Reply::Ok(frame.payload.clone()))
            .spawn()
            .expect("fake browser should start")
    }

    fn wait_for_state(conn: &Connection, state: ConnectionState) {
        let deadline = Instant::now() + WAIT;
        while conn.state() != state {
            assert!(Instant::now() < deadline, "state stuck at {}", conn.state());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[derive(Clone, Copy)]
    struct GetPref;

    impl Message for GetPref {
        fn id(&self) -> u32 {
            1
        }

        fn service_name(&self) -> &'static str {
            "prefs"
        }
    }

    #[test]
    fn concurrent_calls_receive_their_own_responses() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let conn = conn.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let body = format!("worker-{worker}-call-{i}");
                        let response = conn
                            .call("exec", 1, body.clone(), WAIT)
                            .expect("call should succeed");
                        assert_eq!(response.payload.as_ref(), body.as_bytes());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker should finish");
        }
        assert_eq!(conn.pending_calls(), 0);
    }

    #[test]
    fn out_of_order_responses_are_correlated_by_tag() {
        let stash = Arc::new(Mutex::new(Vec::<Frame>::new()));
        let held = Arc::clone(&stash);
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(move |frame| {
                let mut held = held.lock();
                held.push(frame.clone());
                if held.len() < 3 {
                    return Reply::Ignore;
                }
                let replies = held
                    .drain(..)
                    .rev()
                    .map(|f| {
                        let body = f.payload.clone();
                        f.reply(body)
                    })
                    .collect();
                Reply::Frames(replies)
            })
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let calls: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|body| {
                let conn = conn.clone();
                thread::spawn(move || {
                    let response = conn.call("exec", 1, body, WAIT).expect("call should succeed");
                    assert_eq!(response.payload.as_ref(), body.as_bytes());
                })
            })
            .collect();
        for call in calls {
            call.join().expect("call thread should finish");
        }
    }

    #[test]
    fn timeout_then_late_response_is_discarded() {
        let first = Arc::new(Mutex::new(None::<Frame>));
        let slot = Arc::clone(&first);
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(move |frame| {
                let mut slot = slot.lock();
                if slot.is_none() {
                    *slot = Some(frame.clone());
                    return Reply::Ignore;
                }
                Reply::Ok(Bytes::from_static(b"fresh"))
            })
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let err = conn
            .call("exec", 1, "slow", Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Timeout { ref service, command_id: 1, .. } if service == "exec"));
        assert_eq!(conn.pending_calls(), 0);

        let stale = first.lock().clone().expect("first command should be recorded");
        browser
            .send(&stale.reply("stale"))
            .expect("late reply should be written");

        let response = conn.call("exec", 1, "next", WAIT).expect("call should succeed");
        assert_eq!(response.payload.as_ref(), b"fresh");
        assert!(conn.is_ready());
    }

    #[test]
    fn peer_close_fails_every_pending_call() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(|_| Reply::Ignore)
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let waiting: Vec<_> = (0..5)
            .map(|_| {
                let conn = conn.clone();
                thread::spawn(move || conn.call("exec", 1, "", Duration::from_secs(30)))
            })
            .collect();
        assert_eq!(browser.wait_for_commands("exec", 5, WAIT).len(), 5);

        let started = Instant::now();
        browser.close();
        for call in waiting {
            let result = call.join().expect("call thread should finish");
            assert!(matches!(result, Err(ScopeError::Disconnected(_))));
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        wait_for_state(&conn, ConnectionState::Closed);
        assert_eq!(conn.pending_calls(), 0);
        assert!(matches!(
            conn.call("exec", 1, "", WAIT),
            Err(ScopeError::Disconnected(_))
        ));
    }

    #[test]
    fn local_close_fails_pending_calls() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(|_| Reply::Ignore)
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let caller = {
            let conn = conn.clone();
            thread::spawn(move || conn.call("exec", 1, "", Duration::from_secs(30)))
        };
        browser.wait_for_commands("exec", 1, WAIT);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            caller.join().expect("caller should finish"),
            Err(ScopeError::Disconnected(_))
        ));
        conn.close();
    }

    #[test]
    fn error_status_becomes_remote_error() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(|_| Reply::Error("window 7 not found".to_string()))
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let err = conn.call("exec", 5, "{}", WAIT).unwrap_err();
        match err {
            ScopeError::Remote {
                service,
                command_id,
                detail,
            } => {
                assert_eq!(service, "exec");
                assert_eq!(command_id, 5);
                assert_eq!(detail, "window 7 not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(conn.is_ready());
    }

    #[test]
    fn events_reach_subscriber_between_responses() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        conn.subscribe("window-manager", move |event| {
            tx.lock().send((event.command_id, event.payload.clone()))?;
            Ok(())
        });

        browser
            .push_event("window-manager", 7, r#"{"window_id":3}"#)
            .expect("event should be written");
        conn.call("exec", 1, "x", WAIT).expect("call should succeed");
        browser
            .push_event("window-manager", 6, r#"{"window_id":3}"#)
            .expect("event should be written");

        let (first, _) = rx.recv_timeout(WAIT).expect("first event");
        let (second, payload) = rx.recv_timeout(WAIT).expect("second event");
        assert_eq!((first, second), (7, 6));
        assert_eq!(payload.as_ref(), br#"{"window_id":3}"#);
    }

    #[test]
    fn failing_handler_does_not_affect_calls_or_later_events() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        conn.subscribe("window-manager", move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.command_id == 5 {
                panic!("handler bug");
            }
            Err("not interested".into())
        });

        for id in [5, 6, 7] {
            browser
                .push_event("window-manager", id, "{}")
                .expect("event should be written");
        }
        conn.call("exec", 1, "still works", WAIT)
            .expect("call should succeed");

        let deadline = Instant::now() + WAIT;
        while seen.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "events were not all dispatched");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(conn.unsubscribe("window-manager"));
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let mut bad = BytesMut::new();
        encode_frame(&Frame::event("exec", 1, "x"), &mut bad).expect("encode");
        bad[HEADER_SIZE] = 0x7F;
        browser.send_raw(&bad).expect("raw write");

        let response = conn.call("exec", 1, "after", WAIT).expect("call should succeed");
        assert_eq!(response.payload.as_ref(), b"after");
    }

    #[test]
    fn oversized_inbound_frame_is_skipped() {
        let browser = echo_browser();
        let config = RuntimeConfig::default().with_max_frame_size(1024);
        let conn = connect_with_config(browser.addr(), config).expect("client should connect");

        let mut oversized = BytesMut::new();
        oversized.put_slice(b"ST");
        oversized.put_u32_le(2048);
        oversized.put_slice(&[0x5A; 2048]);
        browser.send_raw(&oversized).expect("raw write");

        let response = conn.call("exec", 1, "after", WAIT).expect("call should succeed");
        assert_eq!(response.payload.as_ref(), b"after");
        assert!(conn.is_ready());
    }

    #[test]
    fn bad_magic_closes_connection() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(|_| Reply::Ignore)
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let caller = {
            let conn = conn.clone();
            thread::spawn(move || conn.call("exec", 1, "", Duration::from_secs(30)))
        };
        browser.wait_for_commands("exec", 1, WAIT);

        let mut garbage = BytesMut::new();
        garbage.put_slice(b"XX");
        garbage.put_u32_le(4);
        browser.send_raw(&garbage).expect("raw write");

        assert!(matches!(
            caller.join().expect("caller should finish"),
            Err(ScopeError::Disconnected(_))
        ));
        wait_for_state(&conn, ConnectionState::Closed);
    }

    #[test]
    fn gated_command_sends_nothing_without_capability() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.0")
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        struct Click;
        impl Message for Click {
            fn id(&self) -> u32 {
                5
            }
            fn service_name(&self) -> &'static str {
                "exec"
            }
        }

        let err = conn
            .execute_gated(Capability::MouseRepeatCount, Click, &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, ScopeError::FeatureUnavailable { .. }));
        assert!(browser.commands("exec").is_empty());
    }

    #[test]
    fn execute_requires_negotiated_service() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        assert!(matches!(
            conn.execute_empty(GetPref),
            Err(ScopeError::UnknownService(name)) if name == "prefs"
        ));
    }

    #[test]
    fn execute_serializes_and_decodes_json() {
        let browser = FakeBrowser::builder()
            .service("prefs", "1.0")
            .respond(|frame| {
                let request: serde_json::Value =
                    serde_json::from_slice(&frame.payload).unwrap_or_default();
                Reply::json(&serde_json::json!({ "echo": request["key"] }))
            })
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let response = conn
            .execute(GetPref, &serde_json::json!({ "key": "User Prefs" }))
            .expect("execute should succeed");
        let body: serde_json::Value = response.decode().expect("decode");
        assert_eq!(body["echo"], "User Prefs");

        let sent = browser.commands("prefs");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_id, 1);
        assert_eq!(sent[0].status, Status::Command);
        assert_ne!(sent[0].tag, 0);
    }

    #[test]
    fn close_waits_for_running_event_handler() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        conn.subscribe("window-manager", move |_| {
            started_tx.lock().send(())?;
            thread::sleep(Duration::from_millis(200));
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        browser
            .push_event("window-manager", 7, "{}")
            .expect("event should be written");
        started_rx.recv_timeout(WAIT).expect("handler should start");

        conn.close();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn last_handle_released_inside_handler_closes_without_deadlock() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let held = Arc::new(Mutex::new(Some(conn.clone())));
        let slot = Arc::clone(&held);
        let (released_tx, released_rx) = mpsc::channel();
        let released_tx = Mutex::new(released_tx);
        conn.subscribe("window-manager", move |_| {
            let last = slot.lock().take();
            drop(last);
            released_tx.lock().send(())?;
            Ok(())
        });
        drop(conn);
        assert!(held.lock().as_ref().is_some_and(Connection::is_ready));

        browser
            .push_event("window-manager", 1, "{}")
            .expect("event should be written");
        released_rx
            .recv_timeout(WAIT)
            .expect("handler should release the connection and return");

        let deadline = Instant::now() + WAIT;
        while browser.push_event("exec", 1, "{}").is_ok() {
            assert!(Instant::now() < deadline, "browser never saw the close");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn send_backlog_above_high_water_is_fully_delivered() {
        let browser = echo_browser();
        let conn = connect(browser.addr()).expect("client should connect");

        let callers: Vec<_> = (0..32u8)
            .map(|i| {
                let conn = conn.clone();
                thread::spawn(move || {
                    let payload = vec![i; 64 * 1024];
                    let response = conn
                        .call("exec", 1, payload.clone(), WAIT)
                        .expect("call should succeed");
                    assert_eq!(response.payload.as_ref(), payload.as_slice());
                })
            })
            .collect();
        for caller in callers {
            caller.join().expect("caller should not panic");
        }
        assert_eq!(conn.pending_calls(), 0);
    }

    #[test]
    fn oversized_command_rejected_locally() {
        let browser = echo_browser();
        let config = RuntimeConfig::default().with_max_frame_size(1024);
        let conn = connect_with_config(browser.addr(), config).expect("client should connect");

        let err = conn.call("exec", 1, vec![0u8; 4096], WAIT).unwrap_err();
        assert!(matches!(err, ScopeError::Frame(_)));
        assert_eq!(conn.pending_calls(), 0);
        assert!(conn.is_ready());
    }

    #[test]
    fn drop_of_last_handle_closes_connection() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");
        let clone = conn.clone();
        drop(conn);
        assert!(clone.is_ready());
        drop(clone);

        // The browser sees EOF, stops serving and refuses further writes.
        let deadline = Instant::now() + WAIT;
        while browser.push_event("exec", 1, "{}").is_ok() {
            assert!(Instant::now() < deadline, "browser never saw the close");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(all(test, feature = "async"))]
mod async_tests {
    use super::*;
    use crate::connector::connect;
    use crate::testing::{FakeBrowser, Reply};

    #[tokio::test(flavor = "multi_thread")]
    async fn call_async_round_trip_and_timeout() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .respond(|frame| {
                if frame.payload.as_ref() == b"ignore" {
                    Reply::Ignore
                } else {
                    Reply::Ok(frame.payload.clone())
                }
            })
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let response = conn
            .call_async("exec", 1, "ping", Duration::from_secs(5))
            .await
            .expect("async call should succeed");
        assert_eq!(response.payload.as_ref(), b"ping");

        let err = conn
            .call_async("exec", 1, "ignore", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(conn.pending_calls(), 0);
    }
}
