use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stp_runtime::{Connection, Event, Message};
use tracing::{debug, trace};

use crate::error::Result;

pub const SERVICE: &str = "window-manager";

pub const ON_WINDOW_UPDATED: u32 = 5;
pub const ON_WINDOW_CLOSED: u32 = 6;
pub const ON_WINDOW_ACTIVATED: u32 = 7;
pub const ON_WINDOW_LOADED: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowManagerCommand {
    GetActiveWindow,
    ListWindows,
}

impl Message for WindowManagerCommand {
    fn id(&self) -> u32 {
        match self {
            WindowManagerCommand::GetActiveWindow => 1,
            WindowManagerCommand::ListWindows => 2,
        }
    }

    fn service_name(&self) -> &'static str {
        SERVICE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowId {
    pub window_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowInfo {
    pub window_id: u32,
    pub title: String,
    pub window_type: String,
    pub opener_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowList {
    #[serde(default)]
    pub window_list: Vec<WindowInfo>,
}

/// A decoded window-manager event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEvent {
    Updated(WindowInfo),
    Closed(u32),
    Activated(u32),
    Loaded(u32),
}

impl WindowEvent {
    /// Decode `event`; ids this façade does not know yield `None`.
    pub fn parse(event: &Event) -> stp_runtime::Result<Option<Self>> {
        let parsed = match event.command_id {
            ON_WINDOW_UPDATED => Some(WindowEvent::Updated(event.decode()?)),
            ON_WINDOW_CLOSED => Some(WindowEvent::Closed(event.decode::<WindowId>()?.window_id)),
            ON_WINDOW_ACTIVATED => {
                Some(WindowEvent::Activated(event.decode::<WindowId>()?.window_id))
            }
            ON_WINDOW_LOADED => Some(WindowEvent::Loaded(event.decode::<WindowId>()?.window_id)),
            _ => None,
        };
        Ok(parsed)
    }
}

#[derive(Debug, Default)]
struct WindowState {
    active: Option<u32>,
    windows: BTreeMap<u32, WindowInfo>,
}

impl WindowState {
    fn apply(&mut self, event: WindowEvent) {
        match event {
            WindowEvent::Updated(info) => {
                self.windows.insert(info.window_id, info);
            }
            WindowEvent::Closed(id) => {
                self.windows.remove(&id);
                if self.active == Some(id) {
                    self.active = None;
                }
            }
            WindowEvent::Activated(id) => self.active = Some(id),
            WindowEvent::Loaded(_) => {}
        }
    }
}

/// Façade for the window-manager service.
///
/// [`watch`](Self::watch) takes the service's single event subscription and
/// keeps the active window id current, so later lookups need no round trip.
pub struct WindowManagerService {
    conn: Connection,
    state: Arc<Mutex<WindowState>>,
}

impl WindowManagerService {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            state: Arc::new(Mutex::new(WindowState::default())),
        }
    }

    /// The active window id: cached when watching, fetched otherwise.
    pub fn active_window_id(&self) -> Result<u32> {
        if let Some(id) = self.state.lock().active {
            return Ok(id);
        }
        self.fetch_active_window_id()
    }

    fn fetch_active_window_id(&self) -> Result<u32> {
        let id: WindowId = self
            .conn
            .execute_empty(WindowManagerCommand::GetActiveWindow)?
            .decode()?;
        Ok(id.window_id)
    }

    pub fn list_windows(&self) -> Result<Vec<WindowInfo>> {
        let list: WindowList = self
            .conn
            .execute_empty(WindowManagerCommand::ListWindows)?
            .decode()?;
        Ok(list.window_list)
    }

    /// Subscribe to window events and seed the cache from the browser.
    pub fn watch(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        self.conn.subscribe(SERVICE, move |event| {
            match WindowEvent::parse(event)? {
                Some(parsed) => {
                    trace!(event = ?parsed, "window event");
                    state.lock().apply(parsed);
                }
                None => debug!(id = event.command_id, "ignoring unknown window event"),
            }
            Ok(())
        });

        let active = self.fetch_active_window_id()?;
        let windows = self.list_windows()?;
        let mut state = self.state.lock();
        // An activation event may have raced the fetch; keep the newer value.
        state.active.get_or_insert(active);
        for window in windows {
            state.windows.entry(window.window_id).or_insert(window);
        }
        Ok(())
    }

    /// Stop watching and forget cached state.
    pub fn unwatch(&self) {
        self.conn.unsubscribe(SERVICE);
        *self.state.lock() = WindowState::default();
    }

    /// Windows seen while watching, ordered by id.
    pub fn cached_windows(&self) -> Vec<WindowInfo> {
        self.state.lock().windows.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use stp_runtime::connect;
    use stp_runtime::testing::{FakeBrowser, Reply};

    use super::*;

    fn wm_browser() -> FakeBrowser {
        FakeBrowser::builder()
            .service(SERVICE, "2.0")
            .respond(|frame| match frame.command_id {
                1 => Reply::json(&WindowId { window_id: 1 }),
                2 => Reply::json(&WindowList {
                    window_list: vec![
                        WindowInfo {
                            window_id: 1,
                            title: "Start".to_string(),
                            window_type: "normal".to_string(),
                            opener_id: 0,
                        },
                        WindowInfo {
                            window_id: 2,
                            title: "Popup".to_string(),
                            window_type: "normal".to_string(),
                            opener_id: 1,
                        },
                    ],
                }),
                _ => Reply::Error("unknown".to_string()),
            })
            .spawn()
            .expect("fake browser should start")
    }

    fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn active_window_and_list() {
        let browser = wm_browser();
        let wm = WindowManagerService::new(connect(browser.addr()).expect("client should connect"));

        assert_eq!(wm.active_window_id().expect("active id"), 1);
        let windows = wm.list_windows().expect("window list");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].opener_id, 1);
    }

    #[test]
    fn watch_tracks_activation_and_close() {
        let browser = wm_browser();
        let wm = WindowManagerService::new(connect(browser.addr()).expect("client should connect"));
        wm.watch().expect("watch should succeed");
        assert_eq!(wm.cached_windows().len(), 2);

        browser
            .push_event(SERVICE, ON_WINDOW_ACTIVATED, r#"{"window_id":2}"#)
            .expect("event should be written");
        eventually(|| wm.active_window_id().ok() == Some(2));

        let before = browser.commands(SERVICE).len();
        assert_eq!(wm.active_window_id().expect("active id"), 2);
        assert_eq!(browser.commands(SERVICE).len(), before);

        browser
            .push_event(SERVICE, ON_WINDOW_CLOSED, r#"{"window_id":2}"#)
            .expect("event should be written");
        eventually(|| wm.cached_windows().len() == 1);
        // Cache cleared; falls back to asking the browser.
        assert_eq!(wm.active_window_id().expect("active id"), 1);
    }

    #[test]
    fn updated_event_adds_window_and_bad_payload_is_ignored() {
        let browser = wm_browser();
        let wm = WindowManagerService::new(connect(browser.addr()).expect("client should connect"));
        wm.watch().expect("watch should succeed");

        browser
            .push_event(SERVICE, ON_WINDOW_ACTIVATED, "not json")
            .expect("event should be written");
        browser
            .push_event(
                SERVICE,
                ON_WINDOW_UPDATED,
                r#"{"window_id":3,"title":"New","window_type":"normal","opener_id":1}"#,
            )
            .expect("event should be written");
        eventually(|| wm.cached_windows().len() == 3);
        assert_eq!(wm.cached_windows()[2].title, "New");

        wm.unwatch();
        assert!(wm.cached_windows().is_empty());
    }

    #[test]
    fn parse_ignores_unknown_ids() {
        let event = Event {
            service: SERVICE.to_string(),
            command_id: 99,
            payload: "{}".into(),
        };
        assert_eq!(WindowEvent::parse(&event).expect("parse"), None);
    }
}
