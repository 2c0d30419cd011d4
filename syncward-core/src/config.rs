use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const SHORT_DEVICE_ID_LEN: usize = 7;

/// Declarative engine configuration as served by `/rest/system/config`.
///
/// Keys the model does not name are kept in `extra` so that a full-document
/// replace never drops engine settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub version: u32,
    pub folders: Vec<Folder>,
    pub devices: Vec<Device>,
    pub gui: Gui,
    pub options: Options,
    pub remote_ignored_devices: Vec<RemoteIgnoredDevice>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineConfig {
    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|folder| folder.id == id)
    }

    pub fn folder_mut(&mut self, id: &str) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|folder| folder.id == id)
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.device_id == id)
    }

    pub fn device_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|device| device.device_id == id)
    }

    pub fn is_device_ignored(&self, id: &str) -> bool {
        self.remote_ignored_devices
            .iter()
            .any(|ignored| ignored.device_id == id)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Folder {
    pub id: String,
    pub label: String,
    pub path: String,
    #[serde(rename = "type")]
    pub folder_type: String,
    pub devices: Vec<FolderDevice>,
    pub rescan_interval_s: u32,
    pub fs_watcher_enabled: bool,
    pub ignore_perms: bool,
    pub paused: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Folder {
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }

    pub fn is_shared_with(&self, device_id: &str) -> bool {
        self.devices.iter().any(|device| device.device_id == device_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FolderDevice {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub name: String,
    pub addresses: Vec<String>,
    pub compression: String,
    pub introducer: bool,
    pub auto_accept_folders: bool,
    pub paused: bool,
    pub ignored_folders: Vec<IgnoredFolder>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    /// Name if set, otherwise the short form of the device ID.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.device_id.chars().take(SHORT_DEVICE_ID_LEN).collect()
        } else {
            self.name.clone()
        }
    }

    pub fn is_folder_ignored(&self, folder_id: &str) -> bool {
        self.ignored_folders
            .iter()
            .any(|ignored| ignored.id == folder_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IgnoredFolder {
    pub time: String,
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteIgnoredDevice {
    pub time: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    pub listen_addresses: Vec<String>,
    pub global_announce_enabled: bool,
    pub local_announce_enabled: bool,
    pub relays_enabled: bool,
    pub nat_enabled: bool,
    pub max_send_kbps: u64,
    pub max_recv_kbps: u64,
    pub ur_accepted: i32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Gui {
    pub enabled: bool,
    pub address: String,
    pub user: String,
    pub password: String,
    pub api_key: String,
    #[serde(rename = "useTLS")]
    pub use_tls: bool,
    pub theme: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
