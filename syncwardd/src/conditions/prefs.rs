use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreferencesError {
    #[error("failed to read preferences: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid preferences file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// User preferences that gate whether the engine may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPreferences {
    pub always_run_in_background: bool,
    pub respect_power_saving: bool,
    pub only_when_charging: bool,
    pub only_on_wifi: bool,
    pub wifi_ssid_whitelist: Vec<String>,
    pub run_on_mobile_data: bool,
    pub run_on_time_schedule: bool,
    pub engine: EngineTuning,
    /// Custom run conditions keyed by `folder:<id>` or `device:<id>`.
    pub objects: BTreeMap<String, ObjectConditions>,
}

impl Default for RunPreferences {
    fn default() -> Self {
        Self {
            always_run_in_background: false,
            respect_power_saving: true,
            only_when_charging: false,
            only_on_wifi: false,
            wifi_ssid_whitelist: Vec::new(),
            run_on_mobile_data: true,
            run_on_time_schedule: false,
            engine: EngineTuning::default(),
            objects: BTreeMap::new(),
        }
    }
}

impl RunPreferences {
    /// Loads the preferences file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, PreferencesError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PreferencesError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn object(&self, scope: &ObjectScope) -> Option<&ObjectConditions> {
        self.objects
            .get(&scope.key())
            .filter(|conditions| conditions.enabled)
    }
}

/// Knobs forwarded to the engine process environment on launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    pub trace_facilities: Vec<String>,
    pub use_legacy_hashing: bool,
    pub socks_proxy: Option<String>,
    pub http_proxy: Option<String>,
    pub extra_environment: BTreeMap<String, String>,
}

/// Run conditions attached to a single folder or device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectConditions {
    pub enabled: bool,
    pub respect_power_saving: bool,
    pub only_when_charging: bool,
    pub only_on_wifi: bool,
    pub wifi_ssid_whitelist: Vec<String>,
}

impl Default for ObjectConditions {
    fn default() -> Self {
        Self {
            enabled: false,
            respect_power_saving: true,
            only_when_charging: false,
            only_on_wifi: false,
            wifi_ssid_whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectScope {
    Folder(String),
    Device(String),
}

impl ObjectScope {
    pub fn key(&self) -> String {
        match self {
            ObjectScope::Folder(id) => format!("folder:{id}"),
            ObjectScope::Device(id) => format!("device:{id}"),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if let Some(id) = key.strip_prefix("folder:") {
            return Some(ObjectScope::Folder(id.to_string()));
        }
        key.strip_prefix("device:")
            .map(|id| ObjectScope::Device(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = RunPreferences::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(prefs, RunPreferences::default());
        assert!(prefs.respect_power_saving);
        assert!(!prefs.always_run_in_background);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let prefs = RunPreferences::parse(
            r#"{
                "always_run_in_background": true,
                "only_on_wifi": true,
                "wifi_ssid_whitelist": ["home"],
                "engine": {"trace_facilities": ["model", "scanner"]},
                "objects": {"folder:photos": {"enabled": true, "only_when_charging": true}}
            }"#,
        )
        .unwrap();
        assert!(prefs.always_run_in_background);
        assert!(prefs.run_on_mobile_data);
        assert_eq!(prefs.engine.trace_facilities, vec!["model", "scanner"]);

        let scope = ObjectScope::Folder("photos".into());
        let object = prefs.object(&scope).unwrap();
        assert!(object.only_when_charging);
        assert!(object.respect_power_saving);
    }

    #[test]
    fn disabled_object_conditions_are_ignored() {
        let prefs = RunPreferences::parse(
            r#"{"objects": {"device:ABC": {"enabled": false, "only_on_wifi": true}}}"#,
        )
        .unwrap();
        assert!(prefs.object(&ObjectScope::Device("ABC".into())).is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let err = RunPreferences::parse("{not json").unwrap_err();
        assert!(matches!(err, PreferencesError::Parse(_)));
    }

    #[test]
    fn scope_keys_parse_back() {
        let scope = ObjectScope::Device("XYZ".into());
        assert_eq!(ObjectScope::parse(&scope.key()), Some(scope));
        assert_eq!(ObjectScope::parse("other:1"), None);
    }
}
