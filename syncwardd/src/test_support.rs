use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::conditions::EngineTuning;
use crate::notifier::{ConsentRequest, CrashReport, NotificationId, Notifier};
use crate::process::{EngineLaunchConfig, TuningProvider};
use crate::service::LifecycleState;

pub(crate) const LOCAL_DEVICE_ID: &str = "LOCAL01-AAAAAAA-BBBBBBB-CCCCCCC";
pub(crate) const REMOTE_DEVICE_ID: &str = "REMOTE1-DDDDDDD-EEEEEEE-FFFFFFF";

pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

pub(crate) fn write_fake_engine(dir: &Path, body: &str) -> PathBuf {
    write_script(dir, "fake-engine.sh", body)
}

pub(crate) fn launch_config(binary: PathBuf, home: PathBuf) -> EngineLaunchConfig {
    EngineLaunchConfig {
        binary,
        home,
        gui_address: "127.0.0.1:8384".to_string(),
        api_key: "test-key".to_string(),
        gui_assets: None,
        check_port: false,
    }
}

pub(crate) fn default_tuning() -> TuningProvider {
    Arc::new(EngineTuning::default)
}

/// A config with the local device, one remote device and one shared folder.
pub(crate) fn sample_config() -> Value {
    json!({
        "version": 37,
        "folders": [{
            "id": "photos",
            "label": "Photos",
            "path": "/srv/photos",
            "type": "sendreceive",
            "devices": [
                {"deviceID": LOCAL_DEVICE_ID},
                {"deviceID": REMOTE_DEVICE_ID}
            ],
            "paused": false
        }],
        "devices": [
            {"deviceID": LOCAL_DEVICE_ID, "name": "laptop", "paused": false},
            {"deviceID": REMOTE_DEVICE_ID, "name": "phone", "paused": false}
        ],
        "gui": {"enabled": true, "address": "127.0.0.1:8384", "apiKey": "test-key"},
        "options": {"listenAddresses": ["default"], "urAccepted": -1},
        "remoteIgnoredDevices": []
    })
}

/// Mounts the handshake endpoints plus config, events and shutdown.
pub(crate) async fn mount_engine_api(server: &MockServer, config: Value) {
    Mock::given(method("GET"))
        .and(path("/rest/system/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ping": "pong"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/system/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "v1.27.0",
            "longVersion": "syncthing v1.27.0 \"Gold Grasshopper\"",
            "os": "linux",
            "arch": "amd64"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/system/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "myID": LOCAL_DEVICE_ID,
            "uptime": 12
        })))
        .mount(server)
        .await;
    mount_config(server, config).await;
    Mock::given(method("POST"))
        .and(path("/rest/system/config"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/system/shutdown"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

pub(crate) async fn mount_config(server: &MockServer, config: Value) {
    Mock::given(method("GET"))
        .and(path("/rest/system/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(config))
        .mount(server)
        .await;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NotifierCall {
    Persistent(LifecycleState),
    Consent(NotificationId, ConsentRequest),
    Cancel(NotificationId),
    Crash(CrashReport),
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    calls: Mutex<Vec<NotifierCall>>,
}

impl RecordingNotifier {
    pub(crate) fn calls(&self) -> Vec<NotifierCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn crashes(&self) -> Vec<CrashReport> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotifierCall::Crash(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn consents(&self) -> Vec<(NotificationId, ConsentRequest)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotifierCall::Consent(id, request) => Some((id, request)),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn update_persistent(&self, state: LifecycleState) {
        self.calls
            .lock()
            .unwrap()
            .push(NotifierCall::Persistent(state));
    }

    fn show_consent(&self, request: &ConsentRequest) {
        self.calls
            .lock()
            .unwrap()
            .push(NotifierCall::Consent(request.id(), request.clone()));
    }

    fn cancel_consent(&self, id: NotificationId) {
        self.calls.lock().unwrap().push(NotifierCall::Cancel(id));
    }

    fn show_crash(&self, report: &CrashReport) {
        self.calls
            .lock()
            .unwrap()
            .push(NotifierCall::Crash(report.clone()));
    }
}
