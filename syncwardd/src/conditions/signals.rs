use std::any::Any;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::{ConnectionKind, Environment};
use super::prefs::RunPreferences;

pub const TRIGGERED_SYNC_DURATION: Duration = Duration::from_secs(5 * 60);
pub const WAIT_FOR_NEXT_SYNC: Duration = Duration::from_secs(60 * 60);
const PREFERENCES_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum Signal {
    Environment(Environment),
    Preferences(Box<RunPreferences>),
    TimeWindow(bool),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("file watch failed: {0}")]
    Watch(#[from] notify::Error),
}

/// A producer of run-condition signals.
///
/// Each subscription is owned by the caller and stops delivering once its
/// handle is released or dropped.
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn subscribe(
        &self,
        tx: mpsc::UnboundedSender<Signal>,
    ) -> Result<SubscriptionHandle, SignalError>;
}

pub struct SubscriptionHandle {
    source: &'static str,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl SubscriptionHandle {
    pub fn new(source: &'static str, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            source,
            cancel,
            task: Some(task),
            _guard: None,
        }
    }

    /// Keeps `guard` alive for as long as the subscription.
    pub fn with_guard(mut self, guard: impl Any + Send) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub async fn release(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::debug!(source = self.source, "run-condition subscription released");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reloads the preferences file whenever it changes on disk.
pub struct PreferencesFileSource {
    path: PathBuf,
}

impl PreferencesFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SignalSource for PreferencesFileSource {
    fn name(&self) -> &'static str {
        "preferences"
    }

    fn subscribe(
        &self,
        tx: mpsc::UnboundedSender<Signal>,
    ) -> Result<SubscriptionHandle, SignalError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let file_name = self.path.file_name().map(ToOwned::to_owned);
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                if let Ok(event) = res
                    && touches_file(&event, file_name.as_ref())
                {
                    let _ = raw_tx.send(());
                }
            })?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            let mut last: Option<RunPreferences> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = raw_rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        tokio::time::sleep(PREFERENCES_DEBOUNCE).await;
                        while raw_rx.try_recv().is_ok() {}
                        match RunPreferences::load(&path) {
                            Ok(prefs) if last.as_ref() != Some(&prefs) => {
                                last = Some(prefs.clone());
                                if tx.send(Signal::Preferences(Box::new(prefs))).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(
                                    path = %path.display(),
                                    %err,
                                    "ignoring unreadable preferences"
                                );
                            }
                        }
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(self.name(), cancel, task).with_guard(watcher))
    }
}

fn touches_file(event: &Event, file_name: Option<&OsString>) -> bool {
    let Some(file_name) = file_name else {
        return false;
    };
    event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

/// Polls sysfs for power, charging and network state.
pub struct EnvironmentProbeSource {
    sysfs_root: PathBuf,
    interval: Duration,
    ssid_override: Option<String>,
    ssid_command: Vec<String>,
}

impl EnvironmentProbeSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            interval,
            ssid_override: None,
            ssid_command: vec!["iwgetid".to_string(), "-r".to_string()],
        }
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn with_ssid_override(mut self, ssid: Option<String>) -> Self {
        self.ssid_override = ssid;
        self
    }

    pub fn with_ssid_command(mut self, command: Vec<String>) -> Self {
        self.ssid_command = command;
        self
    }

    pub async fn probe(&self) -> Environment {
        let mut env = read_sysfs_environment(&self.sysfs_root);
        if env.connection == ConnectionKind::Wifi {
            env.ssid = match &self.ssid_override {
                Some(ssid) => Some(ssid.clone()),
                None => query_ssid(&self.ssid_command).await,
            };
        }
        env
    }
}

impl SignalSource for EnvironmentProbeSource {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn subscribe(
        &self,
        tx: mpsc::UnboundedSender<Signal>,
    ) -> Result<SubscriptionHandle, SignalError> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let probe = EnvironmentProbeSource {
            sysfs_root: self.sysfs_root.clone(),
            interval: self.interval,
            ssid_override: self.ssid_override.clone(),
            ssid_command: self.ssid_command.clone(),
        };
        let task = tokio::spawn(async move {
            let mut last: Option<Environment> = None;
            loop {
                let env = probe.probe().await;
                if last.as_ref() != Some(&env) {
                    last = Some(env.clone());
                    if tx.send(Signal::Environment(env)).is_err() {
                        break;
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(probe.interval) => {}
                }
            }
        });
        Ok(SubscriptionHandle::new(self.name(), cancel, task))
    }
}

/// Reads charging, power-saving and connection state below a sysfs root.
pub fn read_sysfs_environment(root: &Path) -> Environment {
    Environment {
        connection: read_connection(root),
        ssid: None,
        charging: read_charging(root),
        power_saving: read_trimmed(&root.join("firmware/acpi/platform_profile"))
            .is_some_and(|profile| profile == "low-power"),
    }
}

fn read_charging(root: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(root.join("class/power_supply")) else {
        return true;
    };
    let mut has_battery = false;
    let mut charging = false;
    for entry in entries.flatten() {
        let supply = entry.path();
        match read_trimmed(&supply.join("type")).as_deref() {
            Some("Mains") | Some("USB") => {
                if read_trimmed(&supply.join("online")).as_deref() == Some("1") {
                    charging = true;
                }
            }
            Some("Battery") => {
                has_battery = true;
                if matches!(
                    read_trimmed(&supply.join("status")).as_deref(),
                    Some("Charging") | Some("Full")
                ) {
                    charging = true;
                }
            }
            _ => {}
        }
    }
    charging || !has_battery
}

fn read_connection(root: &Path) -> ConnectionKind {
    let Ok(entries) = std::fs::read_dir(root.join("class/net")) else {
        return ConnectionKind::None;
    };
    let mut best = ConnectionKind::None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let iface = entry.path();
        if read_trimmed(&iface.join("operstate")).as_deref() != Some("up") {
            continue;
        }
        let kind = if iface.join("wireless").exists() || iface.join("phy80211").exists() {
            ConnectionKind::Wifi
        } else if name.starts_with("ww") {
            ConnectionKind::Cellular
        } else {
            ConnectionKind::Ethernet
        };
        if connection_rank(kind) > connection_rank(best) {
            best = kind;
        }
    }
    best
}

fn connection_rank(kind: ConnectionKind) -> u8 {
    match kind {
        ConnectionKind::None => 0,
        ConnectionKind::Cellular => 1,
        ConnectionKind::Ethernet => 2,
        ConnectionKind::Wifi => 3,
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
}

async fn query_ssid(command: &[String]) -> Option<String> {
    let (program, args) = command.split_first()?;
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let ssid = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!ssid.is_empty()).then_some(ssid)
}

/// Opens a sync window for `run_for`, then closes it for `wait_for`, forever.
pub struct TimeScheduleSource {
    run_for: Duration,
    wait_for: Duration,
}

impl TimeScheduleSource {
    pub fn new(run_for: Duration, wait_for: Duration) -> Self {
        Self { run_for, wait_for }
    }
}

impl Default for TimeScheduleSource {
    fn default() -> Self {
        Self::new(TRIGGERED_SYNC_DURATION, WAIT_FOR_NEXT_SYNC)
    }
}

impl SignalSource for TimeScheduleSource {
    fn name(&self) -> &'static str {
        "time-schedule"
    }

    fn subscribe(
        &self,
        tx: mpsc::UnboundedSender<Signal>,
    ) -> Result<SubscriptionHandle, SignalError> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (run_for, wait_for) = (self.run_for, self.wait_for);
        let task = tokio::spawn(async move {
            let mut open = true;
            loop {
                if tx.send(Signal::TimeWindow(open)).is_err() {
                    break;
                }
                let delay = if open { run_for } else { wait_for };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                open = !open;
            }
        });
        Ok(SubscriptionHandle::new(self.name(), cancel, task))
    }
}
