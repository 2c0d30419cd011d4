fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_data_dir(home: &Path) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| home.join(".local/share"))
        .join(APP_DIR_NAME)
}

fn default_config_dir(home: &Path) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home.join(".config"))
        .join(APP_DIR_NAME)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    match &config.state_db {
        Some(path) => StateStore::open(path)
            .await
            .with_context(|| format!("failed to open state store at {}", path.display())),
        None => StateStore::new_default()
            .await
            .context("failed to initialize state store"),
    }
}

fn launch_config(config: &DaemonConfig, api_key: String) -> EngineLaunchConfig {
    EngineLaunchConfig {
        binary: config.engine_binary.clone(),
        home: config.engine_home.clone(),
        gui_address: config.gui_address.clone(),
        api_key,
        gui_assets: config.gui_assets.clone(),
        check_port: true,
    }
}

fn signal_sources(config: &DaemonConfig) -> Vec<Box<dyn SignalSource>> {
    let probe = EnvironmentProbeSource::new(config.probe_interval)
        .with_ssid_override(config.wifi_ssid.clone());
    vec![
        Box::new(PreferencesFileSource::new(config.preferences_path.clone())),
        Box::new(probe),
        // The window only gates the decision when the schedule preference is on.
        Box::new(TimeScheduleSource::default()),
    ]
}

/// Without a bus, notification output still ends up in the log.
fn spawn_signal_logger(
    mut outbound: mpsc::UnboundedReceiver<OutboundSignal>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = outbound.recv().await {
            tracing::debug!(?signal, "notification output");
        }
    })
}
