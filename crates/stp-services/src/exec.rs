use std::collections::BTreeMap;
use std::ops::BitOr;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stp_runtime::{Capability, Connection, Message, ServiceRegistry};
use tracing::debug;

use crate::error::{Result, ServiceError};

pub const SERVICE: &str = "exec";

/// Commands of the exec service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecCommand {
    Exec,
    GetActionList,
    SendMouseAction,
}

impl Message for ExecCommand {
    fn id(&self) -> u32 {
        match self {
            ExecCommand::Exec => 1,
            ExecCommand::GetActionList => 2,
            ExecCommand::SendMouseAction => 5,
        }
    }

    fn service_name(&self) -> &'static str {
        SERVICE
    }
}

/// Mouse button transitions, combined with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MouseButtons(u32);

impl MouseButtons {
    pub const LEFT_DOWN: Self = Self(1);
    pub const LEFT_UP: Self = Self(2);
    pub const RIGHT_DOWN: Self = Self(4);
    pub const RIGHT_UP: Self = Self(8);
    pub const MIDDLE_DOWN: Self = Self(16);
    pub const MIDDLE_UP: Self = Self(32);
    pub const LEFT_CLICK: Self = Self(1 | 2);
    pub const RIGHT_CLICK: Self = Self(4 | 8);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for MouseButtons {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Tunables for [`ExecService`].
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Pause after an emulated multi-click so the browser does not merge two
    /// consecutive double clicks into a quadruple click.
    pub multi_click_settle: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            multi_click_settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_param: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionList {
    pub action_list: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInfo {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInfoList {
    #[serde(default)]
    pub action_info_list: Vec<ActionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseAction {
    pub window_id: u32,
    pub x: i32,
    pub y: i32,
    pub button_action: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<u32>,
}

/// Whether an action is sent with the target window id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowRule {
    Never,
    WithCapability(Capability),
}

struct ActionRule {
    name: &'static str,
    window: WindowRule,
}

/// Actions that deviate from "always send the window id".
const ACTION_RULES: &[ActionRule] = &[
    ActionRule {
        name: "Select all",
        window: WindowRule::Never,
    },
    ActionRule {
        name: "Delete",
        window: WindowRule::Never,
    },
    ActionRule {
        name: "Close page",
        window: WindowRule::WithCapability(Capability::WindowScopedClosePage),
    },
];

fn carries_window_id(action: &str, registry: &ServiceRegistry) -> bool {
    match ACTION_RULES
        .iter()
        .find(|rule| rule.name.eq_ignore_ascii_case(action))
        .map(|rule| rule.window)
    {
        None => true,
        Some(WindowRule::Never) => false,
        Some(WindowRule::WithCapability(capability)) => registry.has_capability(capability),
    }
}

/// Façade for the exec service: named browser actions, keys and mouse input.
pub struct ExecService {
    conn: Connection,
    config: ExecConfig,
    // Lower-cased name → name as the browser reported it.
    actions: RwLock<BTreeMap<String, String>>,
}

impl ExecService {
    pub fn new(conn: Connection) -> Self {
        Self::with_config(conn, ExecConfig::default())
    }

    pub fn with_config(conn: Connection, config: ExecConfig) -> Self {
        Self {
            conn,
            config,
            actions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Fetch and cache the browser's action list.
    pub fn init(&self) -> Result<()> {
        let list: ActionInfoList = self
            .conn
            .execute_empty(ExecCommand::GetActionList)?
            .decode()?;

        let actions: BTreeMap<String, String> = list
            .action_info_list
            .into_iter()
            .map(|info| (info.name.to_lowercase(), info.name))
            .collect();
        debug!(actions = actions.len(), "exec action list loaded");
        *self.actions.write() = actions;
        Ok(())
    }

    /// Cached action names, as reported by the browser.
    pub fn action_list(&self) -> Vec<String> {
        self.actions.read().values().cloned().collect()
    }

    /// Whether `name` is in the cached action list (case-insensitive).
    pub fn supports(&self, name: &str) -> bool {
        self.actions.read().contains_key(&name.to_lowercase())
    }

    /// Run a named action against `window_id`. The first param, if any, is
    /// sent as the action's value.
    pub fn action(&self, name: &str, window_id: u32, params: &[&str]) -> Result<()> {
        self.ensure_supported(name)?;
        let action = Action {
            name: name.to_string(),
            value: params.first().map(|p| (*p).to_string()),
            window_id: carries_window_id(name, self.conn.registry()).then_some(window_id),
            ..Action::default()
        };
        self.exec(action)
    }

    /// Run a named action carrying extra data fields and no window id.
    pub fn action_with_data(
        &self,
        name: &str,
        data: i32,
        value: &str,
        string_param: &str,
    ) -> Result<()> {
        self.ensure_supported(name)?;
        self.exec(Action {
            name: name.to_string(),
            value: Some(value.to_string()),
            data: Some(data),
            string_param: Some(string_param.to_string()),
            ..Action::default()
        })
    }

    /// Press and release `key`.
    pub fn key(&self, key: &str, window_id: u32) -> Result<()> {
        self.key_down(key, window_id)?;
        self.key_up(key, window_id)
    }

    pub fn key_down(&self, key: &str, window_id: u32) -> Result<()> {
        self.action("_keydown", window_id, &[key])
    }

    pub fn key_up(&self, key: &str, window_id: u32) -> Result<()> {
        self.action("_keyup", window_id, &[key])
    }

    /// Send a mouse action at viewport coordinates, repeated `count` times.
    ///
    /// Browsers with exec >= 2.2 take the repeat count in one command. Older
    /// ones get `count` separate commands followed by the settle pause when
    /// `count > 1`.
    pub fn mouse_action(
        &self,
        window_id: u32,
        x: i32,
        y: i32,
        count: u32,
        buttons: MouseButtons,
    ) -> Result<()> {
        if x < 0 || y < 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "element is located outside viewport ({x},{y})"
            )));
        }
        if count == 0 {
            return Err(ServiceError::InvalidArgument(
                "click count must be at least 1".to_string(),
            ));
        }

        let mut action = MouseAction {
            window_id,
            x,
            y,
            button_action: buttons.bits(),
            repeat_count: None,
        };

        if self.conn.has_capability(Capability::MouseRepeatCount) {
            action.repeat_count = Some(count);
            self.conn.execute(ExecCommand::SendMouseAction, &action)?;
            return Ok(());
        }

        for _ in 0..count {
            self.conn.execute(ExecCommand::SendMouseAction, &action)?;
        }
        if count > 1 {
            thread::sleep(self.config.multi_click_settle);
        }
        Ok(())
    }

    fn ensure_supported(&self, name: &str) -> Result<()> {
        if self.supports(name) {
            Ok(())
        } else {
            Err(ServiceError::UnsupportedAction(name.to_string()))
        }
    }

    fn exec(&self, action: Action) -> Result<()> {
        debug!(action = %action.name, window_id = ?action.window_id, "exec action");
        let list = ActionList {
            action_list: vec![action],
        };
        self.conn.execute(ExecCommand::Exec, &list)?;
        Ok(())
    }
}
