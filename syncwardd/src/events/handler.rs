use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use syncward_core::Event;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::conditions::ObjectScope;
use crate::media::MediaIndexInvalidator;
use crate::mirror::{ConfigMirror, FolderCompletion};
use crate::notifier::{ConsentRequest, Notifier, short_device_id};

use super::poller::{DispatchError, EventSink};

/// Answers whether an object with its own run conditions may sync right now.
pub type ObjectCheck = Arc<dyn Fn(&ObjectScope) -> Option<bool> + Send + Sync>;

/// Event types the daemon sees but has nothing to do for.
const IGNORED_EVENT_TYPES: &[&str] = &[
    "Ping",
    "DeviceConnected",
    "DeviceDisconnected",
    "DeviceDiscovered",
    "DevicePaused",
    "DeviceResumed",
    "DownloadProgress",
    "FolderErrors",
    "FolderPaused",
    "FolderResumed",
    "FolderScanProgress",
    "FolderSummary",
    "FolderWatchStateChanged",
    "ItemStarted",
    "ListenAddressesChanged",
    "LocalChangeDetected",
    "LocalIndexUpdated",
    "LoginAttempt",
    "PendingDevicesChanged",
    "PendingFoldersChanged",
    "RemoteChangeDetected",
    "RemoteDownloadProgress",
    "RemoteIndexUpdated",
    "Starting",
    "StartupComplete",
    "StateChanged",
];

/// Turns engine events into mirror updates, consent prompts and media
/// index invalidations.
pub struct EngineEventHandler {
    mirror: Arc<ConfigMirror>,
    notifier: Arc<dyn Notifier>,
    invalidator: Arc<dyn MediaIndexInvalidator>,
    object_check: Option<ObjectCheck>,
}

impl EngineEventHandler {
    pub fn new(
        mirror: Arc<ConfigMirror>,
        notifier: Arc<dyn Notifier>,
        invalidator: Arc<dyn MediaIndexInvalidator>,
    ) -> Self {
        Self {
            mirror,
            notifier,
            invalidator,
            object_check: None,
        }
    }

    /// Re-applies per-object run conditions after every config reload.
    pub fn with_object_check(mut self, check: ObjectCheck) -> Self {
        self.object_check = Some(check);
        self
    }

    pub async fn handle(&self, event: &Event) -> Result<(), DispatchError> {
        match event.event_type.as_str() {
            "ConfigSaved" => self.on_config_saved().await,
            "DeviceRejected" => self.on_device_rejected(event),
            "FolderRejected" => self.on_folder_rejected(event),
            "FolderCompletion" => self.on_folder_completion(event),
            "ItemFinished" => self.on_item_finished(event),
            other if IGNORED_EVENT_TYPES.contains(&other) => {
                tracing::trace!(id = event.id, event_type = other, "ignored event");
                Ok(())
            }
            other => {
                tracing::debug!(id = event.id, event_type = other, "unhandled event type");
                Ok(())
            }
        }
    }

    async fn on_config_saved(&self) -> Result<(), DispatchError> {
        self.mirror.reload_config().await?;
        if let Some(check) = &self.object_check {
            let changed = self
                .mirror
                .reconcile_object_conditions(|scope| check(scope))
                .await?;
            if changed > 0 {
                tracing::info!(changed, "object run conditions re-applied after config change");
            }
        }
        Ok(())
    }

    fn on_device_rejected(&self, event: &Event) -> Result<(), DispatchError> {
        let device_id = str_field(event, "device")?;
        if self.mirror.is_device_ignored(device_id) {
            tracing::debug!(device = device_id, "rejected device is ignored");
            return Ok(());
        }
        self.notifier.show_consent(&ConsentRequest::Device {
            device_id: device_id.to_string(),
            name: optional_str(event, "name"),
            address: optional_str(event, "address"),
        });
        Ok(())
    }

    fn on_folder_rejected(&self, event: &Event) -> Result<(), DispatchError> {
        let device_id = str_field(event, "device")?;
        let folder_id = str_field(event, "folder")?;
        if self.mirror.is_folder_ignored(device_id, folder_id) {
            tracing::debug!(device = device_id, folder = folder_id, "rejected folder is ignored");
            return Ok(());
        }
        let device_name = self
            .mirror
            .device_display_name(device_id)
            .unwrap_or_else(|| short_device_id(device_id));
        self.notifier.show_consent(&ConsentRequest::Folder {
            device_id: device_id.to_string(),
            device_name,
            folder_id: folder_id.to_string(),
            folder_label: optional_str(event, "folderLabel"),
        });
        Ok(())
    }

    fn on_folder_completion(&self, event: &Event) -> Result<(), DispatchError> {
        let device_id = str_field(event, "device")?;
        let folder_id = str_field(event, "folder")?;
        let percent = event
            .data
            .get("completion")
            .and_then(Value::as_f64)
            .ok_or_else(|| missing(event, "completion"))?;
        let value = FolderCompletion {
            percent,
            need_bytes: u64_field(event, "needBytes"),
            need_items: u64_field(event, "needItems"),
            need_deletes: u64_field(event, "needDeletes"),
        };
        let at = event
            .time
            .as_deref()
            .and_then(|time| OffsetDateTime::parse(time, &Rfc3339).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);
        if !self.mirror.record_completion(device_id, folder_id, value, at) {
            tracing::debug!(
                device = device_id,
                folder = folder_id,
                "stale completion update dropped"
            );
        }
        Ok(())
    }

    fn on_item_finished(&self, event: &Event) -> Result<(), DispatchError> {
        let folder_id = str_field(event, "folder")?;
        let item = str_field(event, "item")?;
        if let Some(error) = event.data.get("error").and_then(Value::as_str)
            && !error.is_empty()
        {
            tracing::debug!(folder = folder_id, item, error, "item finished with error");
            return Ok(());
        }
        let Some(folder_path) = self.mirror.folder_path(folder_id) else {
            tracing::debug!(folder = folder_id, "item finished in unknown folder");
            return Ok(());
        };
        let path = Path::new(&folder_path).join(item);
        match optional_str(event, "action").as_str() {
            "delete" => self.invalidator.invalidate(&path, true),
            "update" | "metadata" => self.invalidator.invalidate(&path, false),
            action => {
                tracing::warn!(folder = folder_id, item, action, "unknown item action");
            }
        }
        Ok(())
    }
}

impl EventSink for EngineEventHandler {
    fn on_event<'a>(&'a self, event: &'a Event) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(self.handle(event))
    }

    fn on_batch_done(&self, last_id: u64) {
        tracing::trace!(last_id, "event batch handled");
    }
}

fn missing(event: &Event, field: &'static str) -> DispatchError {
    DispatchError::MissingField {
        event_type: event.event_type.clone(),
        field,
    }
}

fn str_field<'a>(event: &'a Event, field: &'static str) -> Result<&'a str, DispatchError> {
    event
        .data
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| missing(event, field))
}

fn optional_str(event: &Event, field: &str) -> String {
    event
        .data
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u64_field(event: &Event, field: &str) -> u64 {
    event.data.get(field).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
