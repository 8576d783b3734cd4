use serde::{Deserialize, Serialize};
use stp_runtime::{Connection, Message};

use crate::error::Result;

pub const SERVICE: &str = "prefs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefsCommand {
    GetPref,
    ListPrefs,
    SetPref,
}

impl Message for PrefsCommand {
    fn id(&self) -> u32 {
        match self {
            PrefsCommand::GetPref => 1,
            PrefsCommand::ListPrefs => 2,
            PrefsCommand::SetPref => 3,
        }
    }

    fn service_name(&self) -> &'static str {
        SERVICE
    }
}

/// Which value of a preference to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefMode {
    #[default]
    Current,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPrefArg {
    pub section: String,
    pub key: String,
    pub mode: PrefMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefValue {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPrefsArg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pref {
    pub section: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefList {
    #[serde(default)]
    pub pref_list: Vec<Pref>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPrefArg {
    pub section: String,
    pub key: String,
    pub value: String,
}

/// Façade for the prefs service.
pub struct PrefsService {
    conn: Connection,
}

impl PrefsService {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn get_pref(&self, section: &str, key: &str, mode: PrefMode) -> Result<String> {
        let arg = GetPrefArg {
            section: section.to_string(),
            key: key.to_string(),
            mode,
        };
        let value: PrefValue = self.conn.execute(PrefsCommand::GetPref, &arg)?.decode()?;
        Ok(value.value)
    }

    /// List preferences, optionally sorted and limited to one section. An
    /// empty section means all sections.
    pub fn list_prefs(&self, sort: Option<bool>, section: Option<&str>) -> Result<Vec<Pref>> {
        let arg = ListPrefsArg {
            sort,
            section: section.filter(|s| !s.is_empty()).map(str::to_string),
        };
        let list: PrefList = self.conn.execute(PrefsCommand::ListPrefs, &arg)?.decode()?;
        Ok(list.pref_list)
    }

    pub fn set_pref(&self, section: &str, key: &str, value: &str) -> Result<()> {
        let arg = SetPrefArg {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        };
        self.conn.execute(PrefsCommand::SetPref, &arg)?;
        Ok(())
    }
}
