use super::*;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::test_support::{LOCAL_DEVICE_ID, REMOTE_DEVICE_ID, mount_engine_api, sample_config};

async fn mirror_for(server: &MockServer) -> Arc<ConfigMirror> {
    mount_engine_api(server, sample_config()).await;
    let client = EngineClient::with_base_url(&server.uri(), "test-key").unwrap();
    ConfigMirror::load_initial(client).await.unwrap()
}

fn folder(id: &str, label: &str) -> Folder {
    Folder {
        id: id.to_string(),
        label: label.to_string(),
        path: format!("/srv/{id}"),
        ..Folder::default()
    }
}

async fn posted_configs(server: &MockServer) -> Vec<EngineConfig> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| {
            request.method.as_str() == "POST"
                && request.url.path() == "/rest/system/config"
        })
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn initial_load_exposes_independent_copies() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    assert_eq!(mirror.local_device_id(), LOCAL_DEVICE_ID);
    assert_eq!(mirror.version().version, "v1.27.0");

    let mut folders = mirror.get_folders();
    assert_eq!(folders.len(), 1);
    folders[0].label = "changed".into();
    assert_eq!(mirror.get_folders()[0].label, "Photos");

    let devices = mirror.get_devices(false);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, REMOTE_DEVICE_ID);
    assert_eq!(mirror.get_devices(true).len(), 2);
    assert_eq!(mirror.get_gui().api_key, "test-key");
    assert_eq!(mirror.get_options().listen_addresses, vec!["default"]);
}

#[tokio::test]
async fn folders_are_sorted_by_label() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    mirror.add_folder(folder("zz", "alpha")).await.unwrap();
    mirror.add_folder(folder("aa", "")).await.unwrap();

    let ids: Vec<String> = mirror.get_folders().into_iter().map(|f| f.id).collect();
    assert_eq!(ids, vec!["aa", "zz", "photos"]);
}

#[tokio::test]
async fn concurrent_mutations_do_not_lose_updates() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    let (first, second) = tokio::join!(
        mirror.add_folder(folder("docs", "Docs")),
        mirror.add_folder(folder("music", "Music"))
    );
    first.unwrap();
    second.unwrap();

    let ids: Vec<String> = mirror.get_folders().into_iter().map(|f| f.id).collect();
    assert!(ids.contains(&"docs".to_string()));
    assert!(ids.contains(&"music".to_string()));

    let pushed = posted_configs(&server).await;
    assert_eq!(pushed.len(), 2);
    let last = pushed.last().unwrap();
    assert!(last.folder("docs").is_some());
    assert!(last.folder("music").is_some());
    assert!(last.folder("photos").is_some());
}

#[tokio::test]
async fn failed_push_is_reported_and_not_committed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/system/config"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .with_priority(1)
        .mount(&server)
        .await;
    let mirror = mirror_for(&server).await;

    let err = mirror.add_folder(folder("docs", "Docs")).await.unwrap_err();
    assert!(matches!(err, MirrorError::Api(ApiError::Api { .. })));
    assert!(mirror.get_config().folder("docs").is_none());
}

#[tokio::test]
async fn duplicate_ids_are_rejected_before_pushing() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    let err = mirror
        .add_folder(folder("photos", "Again"))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::DuplicateId { kind: "folder", .. }));

    let err = mirror
        .add_device(Device {
            device_id: REMOTE_DEVICE_ID.to_string(),
            ..Device::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::DuplicateId { kind: "device", .. }));
    assert!(posted_configs(&server).await.is_empty());
}

#[tokio::test]
async fn edit_after_remove_brings_the_folder_back() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    mirror.remove_folder("photos").await.unwrap();
    assert!(matches!(
        mirror.remove_folder("photos").await,
        Err(MirrorError::NotFound { .. })
    ));
    mirror.edit_folder(folder("photos", "Renamed")).await.unwrap();

    let folders = mirror.get_folders();
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].label, "Renamed");
}

#[tokio::test]
async fn closed_mirror_rejects_writes() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    mirror.shutdown();
    assert!(matches!(
        mirror.add_folder(folder("docs", "Docs")).await,
        Err(MirrorError::Closed)
    ));
    assert!(matches!(mirror.reload_config().await, Err(MirrorError::Closed)));
    assert!(!mirror.record_completion(
        REMOTE_DEVICE_ID,
        "photos",
        FolderCompletion::complete(),
        OffsetDateTime::now_utc()
    ));
}

#[tokio::test]
async fn reload_replaces_local_copy() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    let mut updated = sample_config();
    updated["folders"][0]["label"] = json!("Camera");
    Mock::given(method("GET"))
        .and(path("/rest/system/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(updated))
        .with_priority(1)
        .mount(&server)
        .await;

    mirror.reload_config().await.unwrap();
    assert_eq!(mirror.get_folders()[0].label, "Camera");
}

#[tokio::test]
async fn consent_answers_are_pushed_once() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    mirror
        .ignore_device("STRANGER", "evil", "198.51.100.1:22000")
        .await
        .unwrap();
    mirror
        .ignore_device("STRANGER", "evil", "198.51.100.1:22000")
        .await
        .unwrap();
    mirror
        .ignore_folder(REMOTE_DEVICE_ID, "cam", "Camera")
        .await
        .unwrap();

    let config = mirror.get_config();
    assert_eq!(config.remote_ignored_devices.len(), 1);
    assert!(mirror.is_device_ignored("STRANGER"));
    assert!(mirror.is_folder_ignored(REMOTE_DEVICE_ID, "cam"));
    assert!(matches!(
        mirror.ignore_folder("UNKNOWN", "cam", "").await,
        Err(MirrorError::NotFound { kind: "device", .. })
    ));
}

#[tokio::test]
async fn object_conditions_pause_only_changed_objects() {
    let server = MockServer::start().await;
    let mirror = mirror_for(&server).await;

    let check = |scope: &ObjectScope| match scope {
        ObjectScope::Folder(id) if id == "photos" => Some(false),
        ObjectScope::Device(id) if id == REMOTE_DEVICE_ID => Some(true),
        _ => None,
    };
    assert_eq!(mirror.reconcile_object_conditions(check).await.unwrap(), 1);
    assert!(mirror.get_folders()[0].paused);
    assert!(!mirror.get_devices(false)[0].paused);

    assert_eq!(mirror.reconcile_object_conditions(check).await.unwrap(), 0);
    assert_eq!(posted_configs(&server).await.len(), 1);
}

#[tokio::test]
async fn connections_are_rate_limited_and_carry_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/system/connections"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": {"inBytesTotal": 10, "outBytesTotal": 20},
            "connections": {
                REMOTE_DEVICE_ID: {"connected": true, "inBytesTotal": 10, "outBytesTotal": 20}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    let mirror = mirror_for(&server).await;
    mirror.record_completion(
        REMOTE_DEVICE_ID,
        "photos",
        FolderCompletion {
            percent: 42.0,
            ..FolderCompletion::complete()
        },
        OffsetDateTime::now_utc(),
    );

    let first = mirror.connections().await.unwrap();
    let second = mirror.connections().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.connections[REMOTE_DEVICE_ID].completion,
        Some(42.0)
    );
}

#[tokio::test]
async fn folder_status_feeds_local_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/db/status"))
        .and(query_param("folder", "photos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "globalBytes": 200,
            "inSyncBytes": 50,
            "needBytes": 150,
            "needFiles": 3,
            "state": "syncing"
        })))
        .mount(&server)
        .await;
    let mirror = mirror_for(&server).await;

    let status = mirror.folder_status("photos").await.unwrap();
    assert_eq!(status.state, "syncing");
    assert_eq!(mirror.cached_folder_status("photos"), Some(status));
    let local = mirror
        .folder_completion(LOCAL_DEVICE_ID, "photos")
        .unwrap();
    assert_eq!(local.percent, 25.0);
    assert_eq!(local.need_items, 3);
}

#[test]
fn bit_rate_handles_counter_reset() {
    assert_eq!(bit_rate(1_000, 2_000, Duration::from_secs(2)), 4_000);
    assert_eq!(bit_rate(2_000, 1_000, Duration::from_secs(2)), 0);
    assert_eq!(bit_rate(0, 1_000, Duration::ZERO), 0);
}
