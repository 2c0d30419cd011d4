use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use syncward_core::EngineClient;
use syncward_integrations::ids::{DBUS_NAME_CONTROL, DBUS_OBJECT_PATH_CONTROL};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zbus::connection::Builder as ConnectionBuilder;
use zbus::object_server::SignalEmitter;

use crate::conditions::{
    EnvironmentProbeSource, ObjectScope, PreferencesFileSource, RunConditionEngine,
    RunPreferences, SignalSource, TimeScheduleSource,
};
use crate::dbus_api::{ControlDbusService, spawn_signal_forwarder};
use crate::events::{EventPollerConfig, MIN_POLL_INTERVAL, ObjectCheck};
use crate::media::{HookInvalidator, LoggingInvalidator, MediaIndexInvalidator};
use crate::notifier::{NotificationCenter, Notifier, OutboundSignal};
use crate::process::{EngineCommand, EngineLaunchConfig, ProcessRunner, TuningProvider};
use crate::service::{ServiceDeps, ServiceHandle, ServiceSettings, ServiceStateMachine};
use crate::store::StateStore;

const DEFAULT_ENGINE_BINARY: &str = "syncthing";
const DEFAULT_GUI_ADDRESS: &str = "127.0.0.1:8384";
const DEFAULT_PROBE_SECS: u64 = 5;
const APP_DIR_NAME: &str = "syncward";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub engine_binary: PathBuf,
    pub engine_home: PathBuf,
    pub gui_address: String,
    pub gui_assets: Option<PathBuf>,
    pub api_key: Option<String>,
    pub preferences_path: PathBuf,
    pub event_poll_interval: Duration,
    pub probe_interval: Duration,
    /// `None` keeps the state database in the XDG data directory.
    pub state_db: Option<PathBuf>,
    pub media_hook: Option<PathBuf>,
    pub wifi_ssid: Option<String>,
    pub enable_dbus: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let path_env = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|value| expand_with_home(&value, &home))
        };

        let engine_binary = path_env("SYNCWARD_ENGINE_BINARY")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_BINARY));
        let engine_home = path_env("SYNCWARD_ENGINE_HOME")
            .unwrap_or_else(|| default_data_dir(&home).join("engine"));
        let gui_address = read_string_env("SYNCWARD_GUI_ADDRESS")
            .unwrap_or_else(|| DEFAULT_GUI_ADDRESS.to_string());
        let preferences_path = path_env("SYNCWARD_PREFERENCES")
            .unwrap_or_else(|| default_config_dir(&home).join("preferences.json"));
        let event_poll_interval = Duration::from_secs(
            read_u64_env("SYNCWARD_EVENT_POLL_SECS", MIN_POLL_INTERVAL.as_secs())
                .max(MIN_POLL_INTERVAL.as_secs()),
        );
        let probe_interval =
            Duration::from_secs(read_u64_env("SYNCWARD_PROBE_SECS", DEFAULT_PROBE_SECS));

        Ok(Self {
            engine_binary,
            engine_home,
            gui_address,
            gui_assets: path_env("SYNCWARD_GUI_ASSETS"),
            api_key: read_string_env("SYNCWARD_API_KEY"),
            preferences_path,
            event_poll_interval,
            probe_interval,
            state_db: path_env("SYNCWARD_STATE_DB"),
            media_hook: path_env("SYNCWARD_MEDIA_HOOK"),
            wifi_ssid: read_string_env("SYNCWARD_WIFI_SSID"),
            enable_dbus: read_bool_env("SYNCWARD_ENABLE_DBUS", true),
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    service: ServiceHandle,
    conditions: Arc<RunConditionEngine>,
    notifications: Arc<NotificationCenter>,
    decisions: mpsc::UnboundedReceiver<bool>,
    outbound: mpsc::UnboundedReceiver<OutboundSignal>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.engine_home)
            .await
            .with_context(|| format!("failed to create engine home at {:?}", config.engine_home))?;
        let store = open_store(&config).await?;
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => store
                .ensure_api_key()
                .await
                .context("failed to generate control API key")?,
        };
        let base_url = format!("http://{}", config.gui_address);
        let client = EngineClient::with_base_url(&base_url, &api_key)
            .context("invalid engine control address")?;

        let prefs = RunPreferences::load(&config.preferences_path).with_context(|| {
            format!(
                "failed to load preferences from {}",
                config.preferences_path.display()
            )
        })?;
        let (decision_tx, decisions) = mpsc::unbounded_channel();
        let conditions = Arc::new(RunConditionEngine::new(
            prefs,
            Default::default(),
            move |allowed| {
                let _ = decision_tx.send(allowed);
            },
        ));

        let tuning_source = Arc::clone(&conditions);
        let tuning: TuningProvider = Arc::new(move || tuning_source.preferences().engine);
        let runner = ProcessRunner::new(launch_config(&config, api_key), tuning);

        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let notifications = Arc::new(NotificationCenter::with_outbound(outbound_tx));
        let invalidator: Arc<dyn MediaIndexInvalidator> = match &config.media_hook {
            Some(hook) => Arc::new(HookInvalidator::new(hook)),
            None => Arc::new(LoggingInvalidator),
        };
        let check_source = Arc::clone(&conditions);
        let object_check: ObjectCheck =
            Arc::new(move |scope: &ObjectScope| check_source.object_run_state(scope));

        let deps = ServiceDeps {
            notifier: Arc::clone(&notifications) as Arc<dyn Notifier>,
            invalidator,
            store: Some(store),
            object_check: Some(object_check),
            poller: EventPollerConfig {
                interval: config.event_poll_interval,
                fetch_timeout: Some(config.event_poll_interval),
                ..EventPollerConfig::default()
            },
        };
        let service =
            ServiceStateMachine::spawn(runner, client, deps, ServiceSettings::default());

        Ok(Self {
            config,
            service,
            conditions,
            notifications,
            decisions,
            outbound,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let DaemonRuntime {
            config,
            service,
            conditions,
            notifications,
            mut decisions,
            outbound,
        } = self;
        tracing::info!(
            engine = %config.engine_binary.display(),
            home = %config.engine_home.display(),
            gui_address = %config.gui_address,
            dbus = config.enable_dbus,
            "syncwardd started"
        );

        let (_dbus_connection, forwarder) = if config.enable_dbus {
            let control = ControlDbusService::new(service.clone(), Arc::clone(&notifications))
                .with_conditions(Arc::clone(&conditions));
            let connection = ConnectionBuilder::session()?
                .name(DBUS_NAME_CONTROL)?
                .serve_at(DBUS_OBJECT_PATH_CONTROL, control)?
                .build()
                .await
                .context("failed to start D-Bus object server")?;
            let emitter = SignalEmitter::new(&connection, DBUS_OBJECT_PATH_CONTROL)
                .context("failed to create D-Bus signal emitter")?
                .into_owned();
            let forwarder = spawn_signal_forwarder(emitter, outbound);
            (Some(connection), forwarder)
        } else {
            (None, spawn_signal_logger(outbound))
        };

        let decision_service = service.clone();
        let decision_handle = tokio::spawn(async move {
            while let Some(allowed) = decisions.recv().await {
                decision_service.request_run(allowed);
            }
        });

        let shutdown = CancellationToken::new();
        let sources = signal_sources(&config);
        let monitor_handle = tokio::spawn(
            Arc::clone(&conditions).monitor(sources, shutdown.clone()),
        );

        let stopped = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        shutdown.cancel();
        if let Err(err) = monitor_handle.await {
            tracing::warn!(%err, "run-condition monitor failed");
        }
        service.shutdown().await;
        decision_handle.abort();
        forwarder.abort();
        stopped.context("failed waiting for shutdown signal")
    }
}

/// Runs one engine verb outside the state machine and exits.
pub async fn run_verb(config: &DaemonConfig, command: EngineCommand) -> anyhow::Result<()> {
    let prefs = RunPreferences::load(&config.preferences_path).with_context(|| {
        format!(
            "failed to load preferences from {}",
            config.preferences_path.display()
        )
    })?;
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None => open_store(config)
            .await?
            .ensure_api_key()
            .await
            .context("failed to generate control API key")?,
    };
    let tuning = prefs.engine;
    let runner = ProcessRunner::new(
        launch_config(config, api_key),
        Arc::new(move || tuning.clone()),
    );
    tokio::fs::create_dir_all(&config.engine_home)
        .await
        .with_context(|| format!("failed to create engine home at {:?}", config.engine_home))?;
    runner
        .run_to_completion(command)
        .await
        .with_context(|| format!("engine {} failed", command.as_str()))
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
