use serde::{Deserialize, Serialize};
use stp_runtime::{Capability, Connection, Message};

use crate::error::Result;

pub const SERVICE: &str = "core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCommand {
    ClearPrivateData,
    GetBrowserInformation,
}

impl Message for CoreCommand {
    fn id(&self) -> u32 {
        match self {
            CoreCommand::ClearPrivateData => 3,
            CoreCommand::GetBrowserInformation => 10,
        }
    }

    fn service_name(&self) -> &'static str {
        SERVICE
    }
}

/// Facts about the running browser binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserInformation {
    pub core_version: String,
    pub operating_system: String,
    pub product: String,
    pub binary_path: String,
    pub user_agent: String,
    pub process_id: Option<u32>,
}

/// Categories of private data the browser can clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivateData {
    All,
    VisitedLinks,
    DiskCache,
    ImageCache,
    MemoryCache,
    SensitiveData,
    SessionCookies,
    AllCookies,
    GlobalHistory,
    Console,
    Thumbnails,
    WebDatabases,
    WebStorage,
    AppCache,
    GeolocationPermissions,
    SitePrefs,
}

impl PrivateData {
    /// Wire value of the clear flag.
    pub fn flag(self) -> u32 {
        match self {
            PrivateData::All => 1,
            PrivateData::VisitedLinks => 2,
            PrivateData::DiskCache => 3,
            PrivateData::ImageCache => 4,
            PrivateData::MemoryCache => 5,
            PrivateData::SensitiveData => 6,
            PrivateData::SessionCookies => 7,
            PrivateData::AllCookies => 8,
            PrivateData::GlobalHistory => 9,
            PrivateData::Console => 10,
            PrivateData::Thumbnails => 11,
            PrivateData::WebDatabases => 12,
            PrivateData::WebStorage => 13,
            PrivateData::AppCache => 14,
            PrivateData::GeolocationPermissions => 15,
            PrivateData::SitePrefs => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearPrivateDataArg {
    pub clear_list: Vec<u32>,
}

/// Façade for the core service.
pub struct CoreService {
    conn: Connection,
}

impl CoreService {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Browser information; needs core >= 1.2.
    pub fn browser_information(&self) -> Result<BrowserInformation> {
        let response = self.conn.execute_gated(
            Capability::BrowserInformation,
            CoreCommand::GetBrowserInformation,
            &(),
        )?;
        Ok(response.decode()?)
    }

    /// Clear the given categories. Duplicates are sent once.
    pub fn clear_private_data(&self, what: &[PrivateData]) -> Result<()> {
        let mut clear_list: Vec<u32> = Vec::with_capacity(what.len());
        for flag in what.iter().map(|d| d.flag()) {
            if !clear_list.contains(&flag) {
                clear_list.push(flag);
            }
        }
        self.conn.execute(
            CoreCommand::ClearPrivateData,
            &ClearPrivateDataArg { clear_list },
        )?;
        Ok(())
    }
}
