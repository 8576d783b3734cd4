//! In-process fake browser for tests.
//!
//! Speaks the server side of STP over a loopback socket using the blocking
//! frame reader/writer. The scope handshake is answered automatically from
//! the configured service list; every other command goes to a responder
//! closure supplied by the test.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use stp_frame::{
    Frame, FrameConfig, FrameError, FrameReader, FrameWriter, Status, SCOPE_SERVICE,
};
use stp_transport::{ScopeListener, ScopeStream};
use tracing::debug;

use crate::handshake::{EnableRequest, EnableResponse, ENABLE, HOST_INFO};
use crate::message::ErrorInfo;
use crate::registry::{HostInfo, ServiceInfo};

/// What the fake browser does with a command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with status OK and this payload.
    Ok(Bytes),
    /// Answer with status ERROR and a JSON `description`.
    Error(String),
    /// Send nothing.
    Ignore,
    /// Write these frames verbatim (any tags, any order).
    Frames(Vec<Frame>),
    /// Write raw bytes to the socket.
    Raw(Vec<u8>),
    /// Close the socket.
    Close,
}

impl Reply {
    pub fn empty() -> Self {
        Reply::Ok(Bytes::new())
    }

    /// OK with a JSON body. Serialization failures become an error reply.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Reply::Ok(Bytes::from(body)),
            Err(err) => Reply::Error(err.to_string()),
        }
    }
}

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type Responder = Box<dyn FnMut(&Frame) -> Reply + Send>;

/// Configures a [`FakeBrowser`].
pub struct FakeBrowserBuilder {
    host: HostInfo,
    enabled_as: HashMap<String, String>,
    rejected: HashSet<String>,
    responder: Responder,
}

impl FakeBrowserBuilder {
    /// Advertise `name` at `version`.
    pub fn service(mut self, name: &str, version: &str) -> Self {
        self.host.services.push(ServiceInfo {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    /// Enable `name` at `version` regardless of what was advertised.
    pub fn enable_as(mut self, name: &str, version: &str) -> Self {
        self.enabled_as
            .insert(name.to_string(), version.to_string());
        self
    }

    /// Answer ENABLE for `name` with an error.
    pub fn reject_enable(mut self, name: &str) -> Self {
        self.rejected.insert(name.to_string());
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.host.user_agent = user_agent.to_string();
        self
    }

    pub fn core_version(mut self, version: &str) -> Self {
        self.host.core_version = version.to_string();
        self
    }

    /// Handle every non-handshake command with `responder`.
    pub fn respond<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Frame) -> Reply + Send + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    /// Listen on an ephemeral loopback port and serve the first client.
    pub fn spawn(self) -> std::io::Result<FakeBrowser> {
        let listener = ScopeListener::bind("127.0.0.1:0").map_err(std::io::Error::other)?;
        let addr = listener.local_addr();
        let shared = Arc::new(BrowserState::default());
        let state = Arc::clone(&shared);

        thread::Builder::new()
            .name("fake-browser".to_string())
            .spawn(move || match listener.accept() {
                Ok(stream) => serve(stream, &state, self),
                Err(err) => debug!(error = %err, "fake browser accept failed"),
            })?;

        Ok(FakeBrowser {
            addr,
            state: shared,
        })
    }

    /// Connect to a client that is listening at `addr`, the way a browser
    /// started with a debugging target dials back.
    pub fn dial(self, addr: SocketAddr) -> std::io::Result<FakeBrowser> {
        let shared = Arc::new(BrowserState::default());
        let state = Arc::clone(&shared);

        thread::Builder::new()
            .name("fake-browser".to_string())
            .spawn(move || match stp_transport::connect(addr) {
                Ok(stream) => serve(stream, &state, self),
                Err(err) => debug!(error = %err, "fake browser dial failed"),
            })?;

        Ok(FakeBrowser {
            addr,
            state: shared,
        })
    }
}

#[derive(Default)]
struct BrowserState {
    received: Mutex<Vec<Frame>>,
    writer: Mutex<Option<FrameWriter<ScopeStream>>>,
}

impl BrowserState {
    fn write(&self, frame: &Frame) -> Result<(), FrameError> {
        match self.writer.lock().as_mut() {
            Some(writer) => writer.write_frame(frame),
            None => Err(FrameError::ConnectionClosed),
        }
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<(), FrameError> {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Err(FrameError::ConnectionClosed);
        };
        // Reach the socket through a clone so the writer's buffer is untouched.
        let mut stream = writer
            .get_ref()
            .try_clone()
            .map_err(|err| FrameError::Io(std::io::Error::other(err.to_string())))?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn close(&self) {
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.get_ref().shutdown();
        }
    }
}

/// Handle to a running fake browser.
pub struct FakeBrowser {
    addr: SocketAddr,
    state: Arc<BrowserState>,
}

impl FakeBrowser {
    pub fn builder() -> FakeBrowserBuilder {
        FakeBrowserBuilder {
            host: HostInfo {
                stp_version: 1,
                core_version: "2.9.0".to_string(),
                platform: "test".to_string(),
                operating_system: std::env::consts::OS.to_string(),
                user_agent: "FakeBrowser/1.0".to_string(),
                services: vec![ServiceInfo {
                    name: SCOPE_SERVICE.to_string(),
                    version: "1.1".to_string(),
                }],
            },
            enabled_as: HashMap::new(),
            rejected: HashSet::new(),
            responder: Box::new(|_| Reply::empty()),
        }
    }

    /// Address the fake browser listens on (or dialed).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every frame received so far, handshake included.
    pub fn received(&self) -> Vec<Frame> {
        self.state.received.lock().clone()
    }

    /// Commands received for `service`.
    pub fn commands(&self, service: &str) -> Vec<Frame> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|f| f.status == Status::Command && f.service == service)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` commands for `service` arrived.
    pub fn wait_for_commands(&self, service: &str, count: usize, timeout: Duration) -> Vec<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.commands(service);
            if frames.len() >= count || Instant::now() >= deadline {
                return frames;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Write an arbitrary frame to the client.
    pub fn send(&self, frame: &Frame) -> Result<(), FrameError> {
        self.state.write(frame)
    }

    /// Push an event for `service`.
    pub fn push_event(
        &self,
        service: &str,
        event_id: u32,
        payload: impl Into<Bytes>,
    ) -> Result<(), FrameError> {
        self.state.write(&Frame::event(service, event_id, payload))
    }

    /// Write raw bytes to the client.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<(), FrameError> {
        self.state.write_raw(bytes)
    }

    /// Close the browser side of the socket.
    pub fn close(&self) {
        self.state.close();
    }
}

impl Drop for FakeBrowser {
    fn drop(&mut self) {
        self.state.close();
    }
}

fn serve(stream: ScopeStream, state: &BrowserState, mut builder: FakeBrowserBuilder) {
    let read_half = match stream.try_clone() {
        Ok(read_half) => read_half,
        Err(err) => {
            debug!(error = %err, "fake browser could not clone stream");
            return;
        }
    };
    // A client that stops reading must not wedge the test forever.
    let config = FrameConfig {
        write_timeout: Some(WRITE_TIMEOUT),
        ..FrameConfig::default()
    };
    let writer = match FrameWriter::with_config_stream(stream, config.clone()) {
        Ok(writer) => writer,
        Err(err) => {
            debug!(error = %err, "fake browser could not configure stream");
            return;
        }
    };
    *state.writer.lock() = Some(writer);
    let mut reader = FrameReader::with_config(read_half, config);

    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(err) if !err.is_fatal() => continue,
            Err(err) => {
                debug!(error = %err, "fake browser stopped reading");
                break;
            }
        };
        state.received.lock().push(frame.clone());

        let reply = if frame.service == SCOPE_SERVICE {
            builder.scope_reply(&frame)
        } else {
            (builder.responder)(&frame)
        };

        let outcome = match reply {
            Reply::Ok(payload) => state.write(&frame.reply(payload)),
            Reply::Error(description) => {
                let body = serde_json::to_vec(&ErrorInfo::new(description)).unwrap_or_default();
                state.write(&frame.reply_error(body))
            }
            Reply::Ignore => Ok(()),
            Reply::Frames(frames) => frames.iter().try_for_each(|f| state.write(f)),
            Reply::Raw(bytes) => state.write_raw(&bytes),
            Reply::Close => {
                state.close();
                break;
            }
        };
        if let Err(err) = outcome {
            debug!(error = %err, "fake browser write failed");
            break;
        }
    }
    state.close();
}

impl FakeBrowserBuilder {
    fn scope_reply(&self, frame: &Frame) -> Reply {
        match frame.command_id {
            HOST_INFO => Reply::json(&self.host),
            ENABLE => {
                let request: EnableRequest = match serde_json::from_slice(&frame.payload) {
                    Ok(request) => request,
                    Err(err) => return Reply::Error(format!("bad enable request: {err}")),
                };
                if self.rejected.contains(&request.name) {
                    return Reply::Error(format!("service {} refused", request.name));
                }
                let advertised = self
                    .host
                    .services
                    .iter()
                    .find(|s| s.name == request.name)
                    .map(|s| s.version.clone());
                let version = self
                    .enabled_as
                    .get(&request.name)
                    .cloned()
                    .or(advertised);
                match version {
                    Some(version) => Reply::json(&EnableResponse {
                        name: request.name,
                        version,
                    }),
                    None => Reply::Error(format!("unknown service {}", request.name)),
                }
            }
            other => Reply::Error(format!("unsupported scope command {other}")),
        }
    }
}
