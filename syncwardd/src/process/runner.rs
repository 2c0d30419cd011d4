use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conditions::EngineTuning;

/// Exit code the engine uses to ask for a restart.
pub const RESTART_EXIT_CODE: i32 = 3;
pub const CONFIG_FILE_NAME: &str = "config.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Generate,
    Main,
    ResetDatabase,
    ResetDeltas,
}

impl EngineCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineCommand::Generate => "generate",
            EngineCommand::Main => "main",
            EngineCommand::ResetDatabase => "reset-database",
            EngineCommand::ResetDeltas => "reset-deltas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Normal,
    RestartRequested,
    Crashed(i32),
}

/// Interprets an engine exit. A kill we requested is a normal exit; a death
/// by foreign signal (no exit code) counts as a crash.
pub fn classify_exit(code: Option<i32>, killed_by_us: bool) -> ExitKind {
    if killed_by_us {
        return ExitKind::Normal;
    }
    match code {
        Some(0) => ExitKind::Normal,
        Some(RESTART_EXIT_CODE) => ExitKind::RestartRequested,
        Some(code) => ExitKind::Crashed(code),
        None => ExitKind::Crashed(-1),
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("engine process is already running")]
    AlreadyRunning,
    #[error("engine config {path} is unreadable: {source}")]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("control address {0} is already in use")]
    PortInUse(String),
    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine {} exited with {code:?}", .command.as_str())]
    CommandFailed {
        command: EngineCommand,
        code: Option<i32>,
    },
}

impl RunnerError {
    /// Failures that need user intervention before another start attempt.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            RunnerError::ConfigUnreadable { .. } | RunnerError::PortInUse(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct EngineLaunchConfig {
    pub binary: PathBuf,
    pub home: PathBuf,
    pub gui_address: String,
    pub api_key: String,
    pub gui_assets: Option<PathBuf>,
    pub check_port: bool,
}

impl EngineLaunchConfig {
    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE_NAME)
    }
}

pub fn build_args(command: EngineCommand, home: &std::path::Path) -> Vec<String> {
    let home = home.display().to_string();
    let mut args = match command {
        EngineCommand::Generate => vec!["-generate".to_string(), home],
        EngineCommand::Main => vec!["-home".to_string(), home, "-no-browser".to_string()],
        EngineCommand::ResetDatabase => {
            vec!["-home".to_string(), home, "-reset-database".to_string()]
        }
        EngineCommand::ResetDeltas => {
            vec!["-home".to_string(), home, "-reset-deltas".to_string()]
        }
    };
    args.push("-logflags=0".to_string());
    args
}

pub fn build_environment(
    config: &EngineLaunchConfig,
    tuning: &EngineTuning,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("HOME".to_string(), config.home.display().to_string()),
        ("STNORESTART".to_string(), "1".to_string()),
        ("STNOUPGRADE".to_string(), "1".to_string()),
        (
            "STHASHING".to_string(),
            if tuning.use_legacy_hashing {
                "standard"
            } else {
                "minio"
            }
            .to_string(),
        ),
        ("STGUIADDRESS".to_string(), config.gui_address.clone()),
        ("STGUIAPIKEY".to_string(), config.api_key.clone()),
    ];
    if !tuning.trace_facilities.is_empty() {
        env.push(("STTRACE".to_string(), tuning.trace_facilities.join(",")));
    }
    if let Some(assets) = &config.gui_assets {
        env.push(("STGUIASSETS".to_string(), assets.display().to_string()));
    }
    if let Some(proxy) = tuning.socks_proxy.as_deref().filter(|p| !p.is_empty()) {
        env.push(("all_proxy".to_string(), proxy.to_string()));
    }
    if let Some(proxy) = tuning.http_proxy.as_deref().filter(|p| !p.is_empty()) {
        env.push(("http_proxy".to_string(), proxy.to_string()));
        env.push(("https_proxy".to_string(), proxy.to_string()));
    }
    for (key, value) in &tuning.extra_environment {
        env.push((key.clone(), value.clone()));
    }
    env
}

pub type TuningProvider = Arc<dyn Fn() -> EngineTuning + Send + Sync>;

struct RunningEngine {
    pid: Option<u32>,
    cancel: CancellationToken,
    monitor: JoinHandle<ExitKind>,
}

/// Owns the engine OS process: launch, exit monitoring and kill.
pub struct ProcessRunner {
    config: EngineLaunchConfig,
    tuning: TuningProvider,
    running: Option<RunningEngine>,
}

impl ProcessRunner {
    pub fn new(config: EngineLaunchConfig, tuning: TuningProvider) -> Self {
        Self {
            config,
            tuning,
            running: None,
        }
    }

    pub fn config(&self) -> &EngineLaunchConfig {
        &self.config
    }

    /// True while a process handle is held, including an exited process that
    /// has not been reaped through [`ProcessRunner::shutdown`] yet.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().and_then(|running| running.pid)
    }

    /// Generates a config on first start, then checks the conditions that
    /// would make a launch fail for good.
    pub async fn preflight(&self) -> Result<(), RunnerError> {
        let config_path = self.config.config_path();
        if !tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            tracing::info!(path = %config_path.display(), "engine config missing, generating");
            self.run_to_completion(EngineCommand::Generate).await?;
        }
        if let Err(source) = tokio::fs::read(&config_path).await {
            return Err(RunnerError::ConfigUnreadable {
                path: config_path,
                source,
            });
        }
        if self.config.check_port {
            ensure_address_free(&self.config.gui_address)?;
        }
        Ok(())
    }

    /// Starts the engine and a monitor task that waits for it to exit.
    ///
    /// `on_exit` runs only for exits we did not request.
    pub fn launch(
        &mut self,
        on_exit: impl FnOnce(ExitKind) + Send + 'static,
    ) -> Result<(), RunnerError> {
        if self.running.is_some() {
            return Err(RunnerError::AlreadyRunning);
        }
        let mut child = self
            .command(EngineCommand::Main)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunnerError::Spawn)?;
        forward_output(child.stdout.take(), "stdout");
        forward_output(child.stderr.take(), "stderr");
        let pid = child.id();
        tracing::info!(?pid, binary = %self.config.binary.display(), "engine launched");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let monitor = tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let (status, killed_by_us) = match waited {
                Some(status) => (status, false),
                None => {
                    let _ = child.start_kill();
                    (child.wait().await, true)
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::warn!(%err, "failed to wait for engine process");
                    None
                }
            };
            let kind = classify_exit(code, killed_by_us);
            tracing::info!(?code, ?kind, killed_by_us, "engine process exited");
            if !killed_by_us {
                on_exit(kind);
            }
            kind
        });

        self.running = Some(RunningEngine {
            pid,
            cancel,
            monitor,
        });
        Ok(())
    }

    /// Kills the engine if it is still alive and joins the monitor task.
    pub async fn shutdown(&mut self) -> Option<ExitKind> {
        self.shutdown_within(Duration::ZERO).await
    }

    /// Gives the engine `grace` to exit on its own before killing it. The
    /// monitor task is always joined before this returns.
    pub async fn shutdown_within(&mut self, grace: Duration) -> Option<ExitKind> {
        let mut running = self.running.take()?;
        let waited = tokio::time::timeout(grace, &mut running.monitor).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) => {
                running.cancel.cancel();
                running.monitor.await
            }
        };
        match joined {
            Ok(kind) => Some(kind),
            Err(err) => {
                tracing::warn!(%err, "engine monitor task failed");
                None
            }
        }
    }

    /// Runs a one-shot engine verb and waits for it to finish.
    pub async fn run_to_completion(&self, command: EngineCommand) -> Result<(), RunnerError> {
        tracing::info!(command = command.as_str(), "running engine command");
        let output = self
            .command(command)
            .output()
            .await
            .map_err(RunnerError::Spawn)?;
        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            tracing::info!(target: "engine", command = command.as_str(), "{line}");
        }
        if output.status.success() {
            Ok(())
        } else {
            Err(RunnerError::CommandFailed {
                command,
                code: output.status.code(),
            })
        }
    }

    fn command(&self, command: EngineCommand) -> Command {
        let tuning = (self.tuning)();
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(build_args(command, &self.config.home))
            .envs(build_environment(&self.config, &tuning))
            .stdin(Stdio::null());
        cmd
    }
}

fn ensure_address_free(address: &str) -> Result<(), RunnerError> {
    match std::net::TcpListener::bind(address) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            Err(RunnerError::PortInUse(address.to_string()))
        }
        Err(err) => {
            tracing::warn!(address, %err, "could not probe control address");
            Ok(())
        }
    }
}

fn forward_output<R>(stream: Option<R>, stream_name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(stream) = stream else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "engine", stream = stream_name, "{line}");
        }
    });
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
