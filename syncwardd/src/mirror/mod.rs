pub mod completion;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use syncward_core::{
    ApiError, Connection, Connections, Device, EngineClient, EngineConfig, Folder, FolderStatus,
    Gui, IgnoredFolder, Options, RemoteIgnoredDevice, SystemVersion,
};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::time::Instant;

use crate::conditions::ObjectScope;

pub use completion::{CompletionCache, FolderCompletion, TransferRate};

/// Minimum age of the cached connections snapshot before a refetch.
pub const GUI_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("config mirror has been shut down")]
    Closed,
    #[error("{kind} {id} already exists")]
    DuplicateId { kind: &'static str, id: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

struct MirrorState {
    config: EngineConfig,
    version: SystemVersion,
    local_device_id: String,
}

#[derive(Default)]
struct ConnectionsCache {
    fetched_at: Option<Instant>,
    snapshot: Connections,
}

/// Local copy of the engine configuration.
///
/// Reads hand out clones. Writes go through [`ConfigMirror::mutate`], which
/// transforms a clone under the state lock, pushes the whole document and
/// commits it only after the engine acknowledged it. Pushes are serialized
/// by a second lock so concurrent callers apply in arrival order.
///
/// Once [`ConfigMirror::shutdown`] ran, late responses are dropped instead
/// of being applied.
pub struct ConfigMirror {
    client: EngineClient,
    state: Mutex<MirrorState>,
    push_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    completion: Mutex<CompletionCache>,
    connections: tokio::sync::Mutex<ConnectionsCache>,
    folder_status: Mutex<HashMap<String, FolderStatus>>,
}

impl ConfigMirror {
    /// Fetches version, config and system status in parallel. The mirror
    /// exists only once all three answered.
    pub async fn load_initial(client: EngineClient) -> Result<Arc<Self>, MirrorError> {
        let (version, config, status) = tokio::try_join!(
            client.system_version(),
            client.get_config(),
            client.system_status()
        )?;
        tracing::info!(
            version = %version.version,
            device = %status.my_id,
            folders = config.folders.len(),
            devices = config.devices.len(),
            "config mirror loaded"
        );
        let completion = CompletionCache::from_config(&config);
        Ok(Arc::new(Self {
            client,
            state: Mutex::new(MirrorState {
                config,
                version,
                local_device_id: status.my_id,
            }),
            push_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            completion: Mutex::new(completion),
            connections: tokio::sync::Mutex::new(ConnectionsCache::default()),
            folder_status: Mutex::new(HashMap::new()),
        }))
    }

    pub fn version(&self) -> SystemVersion {
        self.lock_state().version.clone()
    }

    pub fn local_device_id(&self) -> String {
        self.lock_state().local_device_id.clone()
    }

    pub fn get_config(&self) -> EngineConfig {
        self.lock_state().config.clone()
    }

    /// Folders sorted by label, then ID.
    pub fn get_folders(&self) -> Vec<Folder> {
        let mut folders = self.lock_state().config.folders.clone();
        folders.sort_by(|a, b| {
            a.display_label()
                .to_lowercase()
                .cmp(&b.display_label().to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        folders
    }

    /// Devices sorted by display name. The local device is left out unless
    /// `include_local` is set.
    pub fn get_devices(&self, include_local: bool) -> Vec<Device> {
        let state = self.lock_state();
        let mut devices: Vec<Device> = state
            .config
            .devices
            .iter()
            .filter(|device| include_local || device.device_id != state.local_device_id)
            .cloned()
            .collect();
        drop(state);
        devices.sort_by(|a, b| {
            a.display_name()
                .to_lowercase()
                .cmp(&b.display_name().to_lowercase())
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        devices
    }

    pub fn get_options(&self) -> Options {
        self.lock_state().config.options.clone()
    }

    pub fn get_gui(&self) -> Gui {
        self.lock_state().config.gui.clone()
    }

    pub fn folder_path(&self, folder_id: &str) -> Option<String> {
        self.lock_state()
            .config
            .folder(folder_id)
            .map(|folder| folder.path.clone())
    }

    pub fn device_display_name(&self, device_id: &str) -> Option<String> {
        self.lock_state()
            .config
            .device(device_id)
            .map(Device::display_name)
    }

    pub fn is_device_ignored(&self, device_id: &str) -> bool {
        self.lock_state().config.is_device_ignored(device_id)
    }

    pub fn is_folder_ignored(&self, device_id: &str, folder_id: &str) -> bool {
        self.lock_state()
            .config
            .device(device_id)
            .is_some_and(|device| device.is_folder_ignored(folder_id))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Applies `transform` to a copy of the config and pushes the result.
    ///
    /// Returns the committed config once the engine acknowledged the push.
    /// A failed push leaves the local copy untouched.
    pub async fn mutate<F>(&self, transform: F) -> Result<EngineConfig, MirrorError>
    where
        F: FnOnce(&mut EngineConfig) -> Result<(), MirrorError>,
    {
        let _push = self.push_lock.lock().await;
        self.ensure_open()?;
        let next = {
            let state = self.lock_state();
            let mut next = state.config.clone();
            transform(&mut next)?;
            next
        };
        self.client.post_config(&next).await?;
        self.ensure_open()?;
        self.lock_state().config = next.clone();
        self.lock_completion().update_identities(&next);
        Ok(next)
    }

    pub async fn add_folder(&self, folder: Folder) -> Result<(), MirrorError> {
        self.mutate(move |config| {
            if config.folder(&folder.id).is_some() {
                return Err(MirrorError::DuplicateId {
                    kind: "folder",
                    id: folder.id,
                });
            }
            config.folders.push(folder);
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Replaces the folder with the same ID.
    ///
    /// This is a remove-then-add: racing it against `remove_folder` for the
    /// same ID can bring the folder back.
    pub async fn edit_folder(&self, folder: Folder) -> Result<(), MirrorError> {
        self.mutate(move |config| {
            config.folders.retain(|existing| existing.id != folder.id);
            config.folders.push(folder);
            Ok(())
        })
        .await
        .map(drop)
    }

    pub async fn remove_folder(&self, folder_id: &str) -> Result<(), MirrorError> {
        self.mutate(|config| {
            let before = config.folders.len();
            config.folders.retain(|folder| folder.id != folder_id);
            if config.folders.len() == before {
                return Err(not_found("folder", folder_id));
            }
            Ok(())
        })
        .await
        .map(drop)
    }

    pub async fn add_device(&self, device: Device) -> Result<(), MirrorError> {
        self.mutate(move |config| {
            if config.device(&device.device_id).is_some() {
                return Err(MirrorError::DuplicateId {
                    kind: "device",
                    id: device.device_id,
                });
            }
            config.devices.push(device);
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Same remove-then-add semantics as [`ConfigMirror::edit_folder`].
    pub async fn edit_device(&self, device: Device) -> Result<(), MirrorError> {
        self.mutate(move |config| {
            config
                .devices
                .retain(|existing| existing.device_id != device.device_id);
            config.devices.push(device);
            Ok(())
        })
        .await
        .map(drop)
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<(), MirrorError> {
        self.mutate(|config| {
            let before = config.devices.len();
            config.devices.retain(|device| device.device_id != device_id);
            if config.devices.len() == before {
                return Err(not_found("device", device_id));
            }
            Ok(())
        })
        .await
        .map(drop)
    }

    pub async fn set_options(&self, options: Options) -> Result<(), MirrorError> {
        self.mutate(move |config| {
            config.options = options;
            Ok(())
        })
        .await
        .map(drop)
    }

    pub async fn set_gui(&self, gui: Gui) -> Result<(), MirrorError> {
        self.mutate(move |config| {
            config.gui = gui;
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Adds the device to the engine's ignore list so it stops asking.
    pub async fn ignore_device(
        &self,
        device_id: &str,
        name: &str,
        address: &str,
    ) -> Result<(), MirrorError> {
        let time = now_rfc3339();
        self.mutate(|config| {
            if !config.is_device_ignored(device_id) {
                config.remote_ignored_devices.push(RemoteIgnoredDevice {
                    time,
                    device_id: device_id.to_string(),
                    name: name.to_string(),
                    address: address.to_string(),
                });
            }
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Records that the folder offered by `device_id` should not be shared.
    pub async fn ignore_folder(
        &self,
        device_id: &str,
        folder_id: &str,
        folder_label: &str,
    ) -> Result<(), MirrorError> {
        let time = now_rfc3339();
        self.mutate(|config| {
            let device = config
                .device_mut(device_id)
                .ok_or_else(|| not_found("device", device_id))?;
            if !device.is_folder_ignored(folder_id) {
                device.ignored_folders.push(IgnoredFolder {
                    time,
                    id: folder_id.to_string(),
                    label: folder_label.to_string(),
                });
            }
            Ok(())
        })
        .await
        .map(drop)
    }

    /// Pauses or resumes folders and devices whose own run conditions
    /// changed. `check` answers `Some(allowed)` for objects that carry
    /// custom conditions. Only objects whose paused flag actually changes
    /// are pushed; returns how many changed.
    pub async fn reconcile_object_conditions<C>(&self, check: C) -> Result<usize, MirrorError>
    where
        C: Fn(&ObjectScope) -> Option<bool>,
    {
        let objects: Vec<(ObjectScope, bool)> = {
            let state = self.lock_state();
            let folders = state
                .config
                .folders
                .iter()
                .map(|folder| (ObjectScope::Folder(folder.id.clone()), folder.paused));
            let devices = state
                .config
                .devices
                .iter()
                .filter(|device| device.device_id != state.local_device_id)
                .map(|device| (ObjectScope::Device(device.device_id.clone()), device.paused));
            folders.chain(devices).collect()
        };
        let changes: Vec<(ObjectScope, bool)> = objects
            .into_iter()
            .filter_map(|(scope, paused)| {
                let allowed = check(&scope)?;
                (paused == allowed).then_some((scope, !allowed))
            })
            .collect();
        if changes.is_empty() {
            return Ok(0);
        }
        for (scope, pause) in &changes {
            tracing::info!(object = %scope.key(), pause, "applying object run conditions");
        }
        let count = changes.len();
        self.mutate(move |config| {
            for (scope, pause) in changes {
                match scope {
                    ObjectScope::Folder(id) => {
                        if let Some(folder) = config.folder_mut(&id) {
                            folder.paused = pause;
                        }
                    }
                    ObjectScope::Device(id) => {
                        if let Some(device) = config.device_mut(&id) {
                            device.paused = pause;
                        }
                    }
                }
            }
            Ok(())
        })
        .await?;
        Ok(count)
    }

    /// Replaces the local copy with the engine's current config.
    pub async fn reload_config(&self) -> Result<(), MirrorError> {
        let _push = self.push_lock.lock().await;
        self.ensure_open()?;
        let config = self.client.get_config().await?;
        self.ensure_open()?;
        tracing::debug!(
            folders = config.folders.len(),
            devices = config.devices.len(),
            "config reloaded"
        );
        self.lock_completion().update_identities(&config);
        self.lock_state().config = config;
        Ok(())
    }

    /// Connection snapshot with bit rates and completion filled in. Served
    /// from cache when the last fetch is younger than
    /// [`GUI_UPDATE_INTERVAL`].
    pub async fn connections(&self) -> Result<Connections, MirrorError> {
        let mut cache = self.connections.lock().await;
        if let Some(fetched_at) = cache.fetched_at {
            if fetched_at.elapsed() < GUI_UPDATE_INTERVAL {
                return Ok(cache.snapshot.clone());
            }
        }
        let mut fresh = self.client.connections().await?;
        self.ensure_open()?;
        let now = Instant::now();
        let elapsed = cache
            .fetched_at
            .map(|fetched_at| now.duration_since(fetched_at));
        let stamp = OffsetDateTime::now_utc();
        {
            let mut completion = self.lock_completion();
            for (device_id, connection) in fresh.connections.iter_mut() {
                apply_rates(connection, cache.snapshot.connections.get(device_id), elapsed);
                completion.record_rate(
                    device_id,
                    TransferRate {
                        in_bits: connection.in_bits,
                        out_bits: connection.out_bits,
                    },
                    stamp,
                );
                connection.completion = Some(completion.device_completion(device_id));
            }
        }
        let previous_total = cache.snapshot.total.clone();
        apply_rates(&mut fresh.total, cache.fetched_at.map(|_| &previous_total), elapsed);
        cache.snapshot = fresh.clone();
        cache.fetched_at = Some(now);
        Ok(fresh)
    }

    /// Pulls the folder status and feeds the local device's completion.
    pub async fn folder_status(&self, folder_id: &str) -> Result<FolderStatus, MirrorError> {
        let status = self.client.db_status(folder_id).await?;
        self.ensure_open()?;
        let local_device_id = self.local_device_id();
        self.lock_completion().record_folder(
            &local_device_id,
            folder_id,
            FolderCompletion {
                percent: status.completion_percent(),
                need_bytes: status.need_bytes,
                need_items: status.need_files,
                need_deletes: status.need_deletes,
            },
            OffsetDateTime::now_utc(),
        );
        self.lock_folder_status()
            .insert(folder_id.to_string(), status.clone());
        Ok(status)
    }

    pub fn cached_folder_status(&self, folder_id: &str) -> Option<FolderStatus> {
        self.lock_folder_status().get(folder_id).cloned()
    }

    pub async fn override_folder(&self, folder_id: &str) -> Result<(), MirrorError> {
        self.ensure_open()?;
        self.client.override_folder(folder_id).await?;
        Ok(())
    }

    /// Returns false when the update is older than what is stored or the
    /// mirror is closed.
    pub fn record_completion(
        &self,
        device_id: &str,
        folder_id: &str,
        value: FolderCompletion,
        at: OffsetDateTime,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        self.lock_completion()
            .record_folder(device_id, folder_id, value, at)
    }

    pub fn device_completion(&self, device_id: &str) -> f64 {
        self.lock_completion().device_completion(device_id)
    }

    pub fn folder_completion(&self, device_id: &str, folder_id: &str) -> Option<FolderCompletion> {
        self.lock_completion()
            .folder_completion(device_id, folder_id)
    }

    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("config mirror closed");
        }
    }

    fn ensure_open(&self) -> Result<(), MirrorError> {
        if self.is_closed() {
            Err(MirrorError::Closed)
        } else {
            Ok(())
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MirrorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_completion(&self) -> MutexGuard<'_, CompletionCache> {
        self.completion
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_folder_status(&self) -> MutexGuard<'_, HashMap<String, FolderStatus>> {
        self.folder_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(kind: &'static str, id: &str) -> MirrorError {
    MirrorError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn apply_rates(
    connection: &mut Connection,
    previous: Option<&Connection>,
    elapsed: Option<Duration>,
) {
    let (Some(previous), Some(elapsed)) = (previous, elapsed) else {
        return;
    };
    connection.in_bits = bit_rate(previous.in_bytes_total, connection.in_bytes_total, elapsed);
    connection.out_bits = bit_rate(previous.out_bytes_total, connection.out_bytes_total, elapsed);
}

/// Bits per second between two byte counters. A counter that went
/// backwards (engine restart) yields zero.
pub fn bit_rate(previous_bytes: u64, current_bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (current_bytes.saturating_sub(previous_bytes) as f64 * 8.0 / secs) as u64
}

#[cfg(test)]
#[path = "mirror_tests.rs"]
mod tests;
