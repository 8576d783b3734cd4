//! Typed façades for the browser services reachable over STP.
//!
//! Each façade takes a [`Connection`](stp_runtime::Connection) and only
//! builds payloads, calls the runtime and decodes responses. Version
//! differences are handled through the connection's negotiated
//! capabilities.

pub mod core;
pub mod error;
pub mod exec;
pub mod prefs;
pub mod window_manager;

use stp_runtime::Connection;

pub use crate::core::{BrowserInformation, CoreService, PrivateData};
pub use error::{Result, ServiceError};
pub use exec::{ExecConfig, ExecService, MouseButtons};
pub use prefs::{Pref, PrefMode, PrefsService};
pub use window_manager::{WindowEvent, WindowInfo, WindowManagerService};

/// Façades for every negotiated service on one connection.
pub struct Services {
    pub core: Option<CoreService>,
    pub exec: Option<ExecService>,
    pub prefs: Option<PrefsService>,
    pub window_manager: Option<WindowManagerService>,
}

impl Services {
    /// Build façades for the services the connection negotiated.
    pub fn new(conn: &Connection, exec_config: ExecConfig) -> Self {
        let registry = conn.registry();
        Self {
            core: registry
                .contains(core::SERVICE)
                .then(|| CoreService::new(conn.clone())),
            exec: registry
                .contains(exec::SERVICE)
                .then(|| ExecService::with_config(conn.clone(), exec_config)),
            prefs: registry
                .contains(prefs::SERVICE)
                .then(|| PrefsService::new(conn.clone())),
            window_manager: registry
                .contains(window_manager::SERVICE)
                .then(|| WindowManagerService::new(conn.clone())),
        }
    }

    /// Load the exec action list and start tracking windows.
    pub fn init(&self) -> Result<()> {
        if let Some(exec) = &self.exec {
            exec.init()?;
        }
        if let Some(wm) = &self.window_manager {
            wm.watch()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stp_runtime::connect;
    use stp_runtime::testing::{FakeBrowser, Reply};

    use super::*;

    #[test]
    fn only_negotiated_services_get_facades() {
        let browser = FakeBrowser::builder()
            .service("exec", "2.2")
            .service("prefs", "1.0")
            .respond(|frame| match frame.command_id {
                2 => Reply::json(&serde_json::json!({"action_info_list": [{"name": "Reload"}]})),
                _ => Reply::empty(),
            })
            .spawn()
            .expect("fake browser should start");
        let conn = connect(browser.addr()).expect("client should connect");

        let services = Services::new(&conn, ExecConfig::default());
        assert!(services.exec.is_some());
        assert!(services.prefs.is_some());
        assert!(services.core.is_none());
        assert!(services.window_manager.is_none());

        services.init().expect("init should succeed");
        let exec = services.exec.as_ref().expect("exec facade");
        assert_eq!(exec.action_list(), vec!["Reload".to_string()]);
    }
}
