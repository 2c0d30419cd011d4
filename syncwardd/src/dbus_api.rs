use std::sync::Arc;

use syncward_core::{Device, FolderDevice};
use syncward_integrations::ConsentAction;
use syncward_integrations::ids::{
    DBUS_ERROR_BUSY, DBUS_ERROR_FAILED, DBUS_ERROR_INVALID_ARGUMENT, DBUS_ERROR_NOT_FOUND,
    DBUS_ERROR_NOT_RUNNING,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zbus::{interface, object_server::SignalEmitter};

use crate::conditions::RunConditionEngine;
use crate::mirror::{ConfigMirror, MirrorError};
use crate::notifier::{ConsentRequest, NotificationCenter, NotificationId, Notifier, OutboundSignal};
use crate::service::{ServiceError, ServiceHandle};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("engine is not running")]
    NotRunning,
    #[error("operation in progress")]
    Busy,
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Failed(String),
}

impl From<MirrorError> for ControlError {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::Closed => ControlError::NotRunning,
            MirrorError::NotFound { kind, id } => ControlError::NotFound(format!("{kind} {id}")),
            MirrorError::DuplicateId { .. } => ControlError::InvalidArgument(err.to_string()),
            MirrorError::Api(err) => ControlError::Failed(err.to_string()),
        }
    }
}

impl From<ServiceError> for ControlError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Busy => ControlError::Busy,
            ServiceError::Stopped => ControlError::NotRunning,
            ServiceError::Runner(err) => ControlError::Failed(err.to_string()),
        }
    }
}

pub fn dbus_error_name(err: &ControlError) -> &'static str {
    match err {
        ControlError::NotRunning => DBUS_ERROR_NOT_RUNNING,
        ControlError::Busy => DBUS_ERROR_BUSY,
        ControlError::NotFound(_) => DBUS_ERROR_NOT_FOUND,
        ControlError::InvalidArgument(_) => DBUS_ERROR_INVALID_ARGUMENT,
        ControlError::Failed(_) => DBUS_ERROR_FAILED,
    }
}

fn map_to_fdo(err: impl Into<ControlError>) -> zbus::fdo::Error {
    let err = err.into();
    zbus::fdo::Error::Failed(format!("{}: {}", dbus_error_name(&err), err))
}

fn require(name: &str, value: &str) -> Result<(), ControlError> {
    if value.trim().is_empty() {
        Err(ControlError::InvalidArgument(format!("{name} is empty")))
    } else {
        Ok(())
    }
}

pub struct ControlDbusService {
    service: ServiceHandle,
    conditions: Option<Arc<RunConditionEngine>>,
    notifications: Arc<NotificationCenter>,
}

impl ControlDbusService {
    pub fn new(service: ServiceHandle, notifications: Arc<NotificationCenter>) -> Self {
        Self {
            service,
            conditions: None,
            notifications,
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<RunConditionEngine>) -> Self {
        self.conditions = Some(conditions);
        self
    }

    fn mirror(&self) -> Result<Arc<ConfigMirror>, ControlError> {
        self.service.mirror().ok_or(ControlError::NotRunning)
    }

    fn live_consent(&self, id: u32) -> Result<ConsentRequest, ControlError> {
        self.notifications
            .live_consents()
            .into_iter()
            .find(|(live, _)| live.0 == id)
            .map(|(_, request)| request)
            .ok_or_else(|| ControlError::NotFound(format!("consent request {id}")))
    }

    async fn ignore_device_inner(
        &self,
        device_id: &str,
        name: &str,
        address: &str,
    ) -> Result<(), ControlError> {
        require("device id", device_id)?;
        self.mirror()?
            .ignore_device(device_id, name, address)
            .await?;
        self.notifications
            .cancel_consent(NotificationId::derive(&["device", device_id]));
        Ok(())
    }

    async fn ignore_folder_inner(
        &self,
        device_id: &str,
        folder_id: &str,
        folder_label: &str,
    ) -> Result<(), ControlError> {
        require("device id", device_id)?;
        require("folder id", folder_id)?;
        self.mirror()?
            .ignore_folder(device_id, folder_id, folder_label)
            .await?;
        self.notifications
            .cancel_consent(NotificationId::derive(&["folder", device_id, folder_id]));
        Ok(())
    }

    async fn accept(&self, request: &ConsentRequest) -> Result<(), ControlError> {
        let mirror = self.mirror()?;
        match request {
            ConsentRequest::Device {
                device_id, name, ..
            } => {
                mirror
                    .add_device(Device {
                        device_id: device_id.clone(),
                        name: name.clone(),
                        addresses: vec!["dynamic".to_string()],
                        ..Device::default()
                    })
                    .await?;
            }
            ConsentRequest::Folder {
                device_id,
                folder_id,
                ..
            } => {
                // Accepting a new folder needs a local path; only folders that
                // already exist here can be shared from the notification.
                mirror
                    .mutate(|config| {
                        let folder = config.folder_mut(folder_id).ok_or_else(|| {
                            MirrorError::NotFound {
                                kind: "folder",
                                id: folder_id.clone(),
                            }
                        })?;
                        if !folder.is_shared_with(device_id) {
                            folder.devices.push(FolderDevice {
                                device_id: device_id.clone(),
                                ..FolderDevice::default()
                            });
                        }
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(())
    }

    async fn answer_consent_inner(&self, id: u32, action: &str) -> Result<(), ControlError> {
        let action = ConsentAction::parse(action)
            .ok_or_else(|| ControlError::InvalidArgument(format!("unknown action {action}")))?;
        let request = self.live_consent(id)?;
        match action {
            ConsentAction::Accept => self.accept(&request).await?,
            ConsentAction::Ignore => match &request {
                ConsentRequest::Device {
                    device_id,
                    name,
                    address,
                } => self.ignore_device_inner(device_id, name, address).await?,
                ConsentRequest::Folder {
                    device_id,
                    folder_id,
                    folder_label,
                    ..
                } => {
                    self.ignore_folder_inner(device_id, folder_id, folder_label)
                        .await?
                }
            },
            ConsentAction::Dismiss => {}
        }
        self.notifications.cancel_consent(request.id());
        Ok(())
    }
}

#[interface(name = "net.syncward.Control1")]
impl ControlDbusService {
    async fn get_state(&self) -> zbus::fdo::Result<String> {
        Ok(self.service.current_state().as_str().to_string())
    }

    async fn request_run(&self, run: bool) -> zbus::fdo::Result<()> {
        tracing::info!(run, "run requested over D-Bus");
        self.service.request_run(run);
        Ok(())
    }

    async fn request_stop(&self) -> zbus::fdo::Result<()> {
        self.service.request_stop("stop requested over D-Bus");
        Ok(())
    }

    async fn request_restart(&self) -> zbus::fdo::Result<()> {
        self.service.request_restart();
        Ok(())
    }

    async fn reset_database(&self) -> zbus::fdo::Result<()> {
        self.service
            .request_reset_database()
            .await
            .map_err(map_to_fdo)
    }

    async fn reset_deltas(&self) -> zbus::fdo::Result<()> {
        self.service
            .request_reset_deltas()
            .await
            .map_err(map_to_fdo)
    }

    async fn explain_run_decision(&self) -> zbus::fdo::Result<Vec<String>> {
        Ok(self
            .conditions
            .as_ref()
            .map(|conditions| {
                conditions
                    .explain_current_decision()
                    .into_iter()
                    .map(|reason| reason.as_str().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_folders(&self) -> zbus::fdo::Result<String> {
        let folders = self.mirror().map_err(map_to_fdo)?.get_folders();
        serde_json::to_string(&folders)
            .map_err(|err| map_to_fdo(ControlError::Failed(err.to_string())))
    }

    async fn list_devices(&self) -> zbus::fdo::Result<String> {
        let devices = self.mirror().map_err(map_to_fdo)?.get_devices(true);
        serde_json::to_string(&devices)
            .map_err(|err| map_to_fdo(ControlError::Failed(err.to_string())))
    }

    /// Lifecycle state, engine version and the probed environment as JSON.
    async fn get_status(&self) -> zbus::fdo::Result<String> {
        let version = self.service.mirror().map(|mirror| mirror.version());
        let environment = self
            .conditions
            .as_ref()
            .map(|conditions| conditions.environment());
        let status = serde_json::json!({
            "state": self.service.current_state(),
            "engineVersion": version.map(|version| version.version),
            "environment": environment,
        });
        Ok(status.to_string())
    }

    async fn get_connections(&self) -> zbus::fdo::Result<String> {
        let connections = self
            .mirror()
            .map_err(map_to_fdo)?
            .connections()
            .await
            .map_err(map_to_fdo)?;
        serde_json::to_string(&connections)
            .map_err(|err| map_to_fdo(ControlError::Failed(err.to_string())))
    }

    async fn get_folder_status(&self, folder_id: &str) -> zbus::fdo::Result<String> {
        require("folder id", folder_id).map_err(map_to_fdo)?;
        let status = self
            .mirror()
            .map_err(map_to_fdo)?
            .folder_status(folder_id)
            .await
            .map_err(map_to_fdo)?;
        serde_json::to_string(&status)
            .map_err(|err| map_to_fdo(ControlError::Failed(err.to_string())))
    }

    async fn ignore_device(
        &self,
        device_id: &str,
        name: &str,
        address: &str,
    ) -> zbus::fdo::Result<()> {
        self.ignore_device_inner(device_id, name, address)
            .await
            .map_err(map_to_fdo)
    }

    async fn ignore_folder(
        &self,
        device_id: &str,
        folder_id: &str,
        folder_label: &str,
    ) -> zbus::fdo::Result<()> {
        self.ignore_folder_inner(device_id, folder_id, folder_label)
            .await
            .map_err(map_to_fdo)
    }

    async fn answer_consent(&self, id: u32, action: &str) -> zbus::fdo::Result<()> {
        self.answer_consent_inner(id, action)
            .await
            .map_err(map_to_fdo)
    }

    async fn override_folder(&self, folder_id: &str) -> zbus::fdo::Result<()> {
        require("folder id", folder_id).map_err(map_to_fdo)?;
        self.mirror()
            .map_err(map_to_fdo)?
            .override_folder(folder_id)
            .await
            .map_err(map_to_fdo)
    }

    #[zbus(signal)]
    pub async fn state_changed(ctxt: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn consent_requested(
        ctxt: &SignalEmitter<'_>,
        id: u32,
        kind: &str,
        device_id: &str,
        folder_id: &str,
        title: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn consent_cancelled(ctxt: &SignalEmitter<'_>, id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn engine_crashed(ctxt: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;
}

/// Emits notification center output as bus signals, in order.
pub fn spawn_signal_forwarder(
    emitter: SignalEmitter<'static>,
    mut rx: mpsc::UnboundedReceiver<OutboundSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let emitted = match &signal {
                OutboundSignal::StateChanged(state) => {
                    ControlDbusService::state_changed(&emitter, state.as_str()).await
                }
                OutboundSignal::ConsentRequested(id, request) => {
                    ControlDbusService::consent_requested(
                        &emitter,
                        id.0,
                        request.kind(),
                        request.device_id(),
                        request.folder_id().unwrap_or_default(),
                        &request.title(),
                    )
                    .await
                }
                OutboundSignal::ConsentCancelled(id) => {
                    ControlDbusService::consent_cancelled(&emitter, id.0).await
                }
                OutboundSignal::EngineCrashed(report) => {
                    ControlDbusService::engine_crashed(&emitter, &report.message()).await
                }
            };
            if let Err(err) = emitted {
                tracing::warn!(?signal, %err, "failed to emit D-Bus signal");
            }
        }
    })
}
