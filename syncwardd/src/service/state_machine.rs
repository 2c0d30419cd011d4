use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use syncward_core::EngineClient;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEventHandler, EventPoller, EventPollerConfig, ObjectCheck};
use crate::media::MediaIndexInvalidator;
use crate::mirror::{ConfigMirror, MirrorError};
use crate::notifier::{CrashReport, Notifier};
use crate::process::{EngineCommand, ExitKind, ProcessRunner, RunnerError};
use crate::store::StateStore;

use super::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Init,
    Starting,
    Active,
    Disabled,
    Error,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Init => "init",
            LifecycleState::Starting => "starting",
            LifecycleState::Active => "active",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Budget for launch plus handshake plus the initial config read.
    pub startup_timeout: Duration,
    pub ping_backoff: Backoff,
    /// How often a stop deferred during startup is retried.
    pub stop_retry_interval: Duration,
    pub shutdown_request_timeout: Duration,
    /// How long an engine that accepted the shutdown request gets to exit
    /// before it is killed.
    pub graceful_exit_wait: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            ping_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(2), true),
            stop_retry_interval: Duration::from_secs(1),
            shutdown_request_timeout: Duration::from_secs(2),
            graceful_exit_wait: Duration::from_secs(5),
        }
    }
}

/// Collaborators the state machine wires into every engine generation.
#[derive(Clone)]
pub struct ServiceDeps {
    pub notifier: Arc<dyn Notifier>,
    pub invalidator: Arc<dyn MediaIndexInvalidator>,
    pub store: Option<StateStore>,
    pub object_check: Option<ObjectCheck>,
    pub poller: EventPollerConfig,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("engine control endpoint did not answer within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

impl StartupError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StartupError::Runner(err) if err.is_fatal_startup())
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service state machine is not running")]
    Stopped,
    #[error("engine is starting")]
    Busy,
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub type StateCallback = Box<dyn Fn(LifecycleState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

enum Listener {
    Channel(mpsc::UnboundedSender<LifecycleState>),
    Callback(StateCallback),
}

impl Listener {
    /// Returns false once the receiving side is gone.
    fn deliver(&self, state: LifecycleState) -> bool {
        match self {
            Listener::Channel(tx) => tx.send(state).is_ok(),
            Listener::Callback(callback) => {
                callback(state);
                true
            }
        }
    }
}

enum Command {
    RequestRun(bool),
    RequestRestart,
    RequestStop(String),
    Reset(EngineCommand, oneshot::Sender<Result<(), ServiceError>>),
    Register(ListenerId, Listener),
    Unregister(ListenerId),
    StartupFinished {
        generation: u64,
        result: Result<Arc<ConfigMirror>, StartupError>,
    },
    EngineExited {
        generation: u64,
        kind: ExitKind,
    },
    RetryDeferredStop,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Snapshot {
    state: LifecycleState,
    mirror: Option<Arc<ConfigMirror>>,
}

struct StartupTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct DeferredStop {
    reason: String,
    ticker: JoinHandle<()>,
}

/// Owns the lifecycle state and sequences the engine process, config mirror
/// and event poller through it.
///
/// Runs as a single task fed by a command channel; every transition and
/// every listener callback happens on that task, in order. Work that may
/// block (launch, handshake, initial config read) runs in a helper task
/// tagged with a generation number, and its completion comes back as a
/// command. Results from an older generation are dropped.
pub struct ServiceStateMachine {
    state: LifecycleState,
    generation: u64,
    runner: Arc<Mutex<ProcessRunner>>,
    client: EngineClient,
    deps: ServiceDeps,
    settings: ServiceSettings,
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<Snapshot>,
    listeners: BTreeMap<ListenerId, Listener>,
    startup: Option<StartupTask>,
    deferred_stop: Option<DeferredStop>,
    mirror: Option<Arc<ConfigMirror>>,
    poller: Option<EventPoller>,
    reconcile: Option<JoinHandle<()>>,
}

impl ServiceStateMachine {
    /// Starts the machine in `Init`. It runs until [`ServiceHandle::shutdown`]
    /// or until every handle is dropped.
    pub fn spawn(
        runner: ProcessRunner,
        client: EngineClient,
        deps: ServiceDeps,
        settings: ServiceSettings,
    ) -> ServiceHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(Snapshot {
            state: LifecycleState::Init,
            mirror: None,
        });
        let machine = ServiceStateMachine {
            state: LifecycleState::Init,
            generation: 0,
            runner: Arc::new(Mutex::new(runner)),
            client,
            deps,
            settings,
            commands: tx.downgrade(),
            snapshot,
            listeners: BTreeMap::new(),
            startup: None,
            deferred_stop: None,
            mirror: None,
            poller: None,
            reconcile: None,
        };
        tokio::spawn(machine.run(rx));
        ServiceHandle {
            commands: tx,
            snapshot: snapshot_rx,
            next_listener: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut reply = None;
        while let Some(command) = rx.recv().await {
            if let ControlFlow::Break(done) = self.handle(command).await {
                reply = Some(done);
                break;
            }
        }
        self.teardown().await;
        if let Some(stop) = self.deferred_stop.take() {
            stop.ticker.abort();
        }
        self.transition(LifecycleState::Disabled);
        tracing::info!("service state machine stopped");
        if let Some(done) = reply {
            let _ = done.send(());
        }
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::RequestRun(true) => self.on_run_requested().await,
            Command::RequestRun(false) => {
                self.on_stop_requested("run conditions not met".to_string())
                    .await
            }
            Command::RequestStop(reason) => self.on_stop_requested(reason).await,
            Command::RequestRestart => self.on_restart_requested().await,
            Command::Reset(verb, reply) => {
                let result = self.on_reset(verb).await;
                let _ = reply.send(result);
            }
            Command::Register(id, listener) => {
                if listener.deliver(self.state) {
                    self.listeners.insert(id, listener);
                }
            }
            Command::Unregister(id) => {
                self.listeners.remove(&id);
            }
            Command::StartupFinished { generation, result } => {
                if generation == self.generation {
                    self.on_startup_finished(result).await;
                } else {
                    tracing::debug!(
                        generation,
                        current = self.generation,
                        "stale startup result dropped"
                    );
                }
            }
            Command::EngineExited { generation, kind } => {
                if generation == self.generation {
                    self.on_engine_exited(kind).await;
                } else {
                    tracing::debug!(generation, ?kind, "exit of a torn down engine ignored");
                }
            }
            Command::RetryDeferredStop => self.retry_deferred_stop().await,
            Command::Shutdown(done) => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    async fn on_run_requested(&mut self) {
        match self.state {
            LifecycleState::Starting => {
                if let Some(stop) = self.deferred_stop.take() {
                    stop.ticker.abort();
                    tracing::info!(reason = %stop.reason, "pending stop withdrawn");
                }
            }
            LifecycleState::Active => tracing::debug!("engine already running"),
            LifecycleState::Error => {
                self.transition(LifecycleState::Init);
                self.begin_startup().await;
            }
            LifecycleState::Init | LifecycleState::Disabled => self.begin_startup().await,
        }
    }

    async fn on_stop_requested(&mut self, reason: String) {
        match self.state {
            LifecycleState::Starting => match &mut self.deferred_stop {
                Some(stop) => stop.reason = reason,
                None => {
                    tracing::info!(%reason, "stop deferred until startup settles");
                    let ticker = self.spawn_stop_ticker();
                    self.deferred_stop = Some(DeferredStop { reason, ticker });
                }
            },
            LifecycleState::Disabled => tracing::debug!(%reason, "engine already stopped"),
            LifecycleState::Init | LifecycleState::Active | LifecycleState::Error => {
                self.stop_now(&reason).await;
            }
        }
    }

    async fn on_restart_requested(&mut self) {
        // Only a running engine restarts; elsewhere the run decision owns startup.
        if self.state != LifecycleState::Active {
            tracing::debug!(state = self.state.as_str(), "restart ignored, engine not active");
            return;
        }
        tracing::info!("restarting engine");
        self.teardown().await;
        self.transition(LifecycleState::Init);
        self.begin_startup().await;
    }

    async fn on_reset(&mut self, verb: EngineCommand) -> Result<(), ServiceError> {
        if self.state == LifecycleState::Starting {
            return Err(ServiceError::Busy);
        }
        let resume = self.state == LifecycleState::Active;
        self.teardown().await;
        self.transition(LifecycleState::Init);
        let result = self.runner.lock().await.run_to_completion(verb).await;
        match result {
            Ok(()) if resume => {
                self.begin_startup().await;
                Ok(())
            }
            Ok(()) => {
                self.transition(LifecycleState::Disabled);
                Ok(())
            }
            Err(err) => {
                tracing::error!(command = verb.as_str(), %err, "engine reset failed");
                self.deps
                    .notifier
                    .show_crash(&CrashReport::StartupFailed(err.to_string()));
                self.transition(LifecycleState::Error);
                Err(ServiceError::Runner(err))
            }
        }
    }

    async fn begin_startup(&mut self) {
        if self.runner.lock().await.is_running() {
            tracing::warn!("engine process handle still held, not starting another");
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        self.transition(LifecycleState::Starting);

        let cancel = CancellationToken::new();
        let ctx = StartupContext {
            runner: Arc::clone(&self.runner),
            client: self.client.clone(),
            settings: self.settings.clone(),
            commands: self.commands.clone(),
        };
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = ctx.start_engine(generation) => result,
            };
            if let Some(commands) = ctx.commands.upgrade() {
                let _ = commands.send(Command::StartupFinished { generation, result });
            }
        });
        self.startup = Some(StartupTask { cancel, task });
    }

    async fn on_startup_finished(&mut self, result: Result<Arc<ConfigMirror>, StartupError>) {
        self.startup = None;
        match result {
            Ok(mirror) => {
                self.mirror = Some(Arc::clone(&mirror));
                self.start_poller(Arc::clone(&mirror)).await;
                if let Some(check) = self.deps.object_check.clone() {
                    self.reconcile = Some(tokio::spawn(async move {
                        let applied = mirror
                            .reconcile_object_conditions(|scope| check(scope))
                            .await;
                        if let Err(err) = applied {
                            tracing::warn!(%err, "failed to apply object run conditions");
                        }
                    }));
                }
                self.transition(LifecycleState::Active);
                if let Some(stop) = self.deferred_stop.take() {
                    stop.ticker.abort();
                    self.stop_now(&stop.reason).await;
                }
            }
            Err(err) => {
                tracing::error!(%err, fatal = err.is_fatal(), "engine startup failed");
                self.deps
                    .notifier
                    .show_crash(&CrashReport::StartupFailed(err.to_string()));
                self.teardown().await;
                match self.deferred_stop.take() {
                    Some(stop) => {
                        stop.ticker.abort();
                        self.transition(LifecycleState::Disabled);
                    }
                    None => self.transition(LifecycleState::Error),
                }
            }
        }
    }

    async fn on_engine_exited(&mut self, kind: ExitKind) {
        match kind {
            ExitKind::RestartRequested => {
                tracing::info!("engine asked for a restart");
                self.teardown().await;
                if let Some(stop) = self.deferred_stop.take() {
                    stop.ticker.abort();
                    self.transition(LifecycleState::Disabled);
                    return;
                }
                self.transition(LifecycleState::Init);
                self.begin_startup().await;
            }
            ExitKind::Normal => {
                tracing::info!("engine exited on its own");
                self.stop_after_exit().await;
            }
            ExitKind::Crashed(code) => {
                tracing::warn!(code, "engine crashed");
                self.deps.notifier.show_crash(&CrashReport::ExitCode(code));
                self.stop_after_exit().await;
            }
        }
    }

    async fn stop_after_exit(&mut self) {
        self.teardown().await;
        if let Some(stop) = self.deferred_stop.take() {
            stop.ticker.abort();
        }
        self.transition(LifecycleState::Disabled);
    }

    async fn retry_deferred_stop(&mut self) {
        if self.state == LifecycleState::Starting {
            tracing::trace!("engine still starting, stop stays deferred");
            return;
        }
        if let Some(stop) = self.deferred_stop.take() {
            stop.ticker.abort();
            self.stop_now(&stop.reason).await;
        }
    }

    async fn stop_now(&mut self, reason: &str) {
        tracing::info!(reason, from = self.state.as_str(), "stopping engine");
        self.teardown().await;
        self.transition(LifecycleState::Disabled);
    }

    async fn start_poller(&mut self, mirror: Arc<ConfigMirror>) {
        let mut handler = EngineEventHandler::new(
            mirror,
            Arc::clone(&self.deps.notifier),
            Arc::clone(&self.deps.invalidator),
        );
        if let Some(check) = &self.deps.object_check {
            handler = handler.with_object_check(Arc::clone(check));
        }
        let cursor = match &self.deps.store {
            Some(store) => store.last_event_id().await.unwrap_or_else(|err| {
                tracing::warn!(%err, "failed to read event cursor, starting from zero");
                0
            }),
            None => 0,
        };
        let poller = EventPoller::new(
            self.client.clone(),
            Arc::new(handler),
            self.deps.store.clone(),
            self.deps.poller.clone(),
        );
        poller.start(cursor);
        self.poller = Some(poller);
    }

    /// Discards everything tied to the current engine generation and stops
    /// the process. Safe to call when nothing is running.
    async fn teardown(&mut self) {
        self.generation += 1;
        if let Some(startup) = self.startup.take() {
            startup.cancel.cancel();
            if let Err(err) = startup.task.await
                && !err.is_cancelled()
            {
                tracing::warn!(%err, "startup task failed");
            }
        }
        if let Some(reconcile) = self.reconcile.take() {
            reconcile.abort();
        }
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        if let Some(mirror) = self.mirror.take() {
            mirror.shutdown();
        }
        self.snapshot.send_modify(|snapshot| snapshot.mirror = None);

        let mut runner = self.runner.lock().await;
        if !runner.is_running() {
            return;
        }
        let requested = tokio::time::timeout(
            self.settings.shutdown_request_timeout,
            self.client.shutdown(),
        )
        .await;
        let grace = match requested {
            Ok(Ok(())) => self.settings.graceful_exit_wait,
            Ok(Err(err)) => {
                tracing::debug!(%err, "engine did not accept shutdown request");
                Duration::ZERO
            }
            Err(_) => {
                tracing::debug!("engine shutdown request timed out");
                Duration::ZERO
            }
        };
        if let Some(kind) = runner.shutdown_within(grace).await {
            tracing::info!(?kind, "engine process stopped");
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state == next {
            return;
        }
        tracing::info!(from = self.state.as_str(), to = next.as_str(), "lifecycle transition");
        self.state = next;
        let mirror = match next {
            LifecycleState::Active => self.mirror.clone(),
            _ => None,
        };
        self.snapshot.send_replace(Snapshot { state: next, mirror });
        self.deps.notifier.update_persistent(next);
        self.listeners.retain(|_, listener| listener.deliver(next));
    }

    fn spawn_stop_ticker(&self) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let interval = self.settings.stop_retry_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands.send(Command::RetryDeferredStop).is_err() {
                    break;
                }
            }
        })
    }
}

struct StartupContext {
    runner: Arc<Mutex<ProcessRunner>>,
    client: EngineClient,
    settings: ServiceSettings,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl StartupContext {
    async fn start_engine(&self, generation: u64) -> Result<Arc<ConfigMirror>, StartupError> {
        {
            let mut runner = self.runner.lock().await;
            runner.preflight().await?;
            let commands = self.commands.clone();
            runner.launch(move |kind| {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::EngineExited { generation, kind });
                }
            })?;
            tracing::info!(generation, pid = ?runner.pid(), "engine launched");
        }
        let budget = self.settings.startup_timeout;
        tokio::time::timeout(budget, async {
            self.await_handshake().await;
            ConfigMirror::load_initial(self.client.clone()).await
        })
        .await
        .map_err(|_| StartupError::HandshakeTimeout(budget))?
        .map_err(StartupError::from)
    }

    async fn await_handshake(&self) {
        let mut attempt = 0u32;
        loop {
            match self.client.ping().await {
                Ok(()) => {
                    tracing::info!(attempt, "engine control endpoint is up");
                    return;
                }
                Err(err) => tracing::debug!(attempt, %err, "engine not answering yet"),
            }
            tokio::time::sleep(self.settings.ping_backoff.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

/// Cloneable front of the state machine. Requests are queued and applied in
/// the order they were made.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    next_listener: Arc<AtomicU64>,
}

impl ServiceHandle {
    pub fn request_run(&self, should_run: bool) {
        self.send(Command::RequestRun(should_run));
    }

    pub fn request_restart(&self) {
        self.send(Command::RequestRestart);
    }

    pub fn request_stop(&self, reason: impl Into<String>) {
        self.send(Command::RequestStop(reason.into()));
    }

    pub async fn request_reset_database(&self) -> Result<(), ServiceError> {
        self.reset(EngineCommand::ResetDatabase).await
    }

    pub async fn request_reset_deltas(&self) -> Result<(), ServiceError> {
        self.reset(EngineCommand::ResetDeltas).await
    }

    /// The first item is the state at registration time, then one item per
    /// transition.
    pub fn register_state_listener(&self) -> StateSubscription {
        let id = self.listener_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Register(id, Listener::Channel(tx)));
        StateSubscription {
            id,
            rx,
            commands: self.commands.clone(),
        }
    }

    /// Like [`ServiceHandle::register_state_listener`], but the callback runs
    /// on the state machine task and must not block.
    pub fn register_state_callback(
        &self,
        callback: impl Fn(LifecycleState) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.listener_id();
        self.send(Command::Register(id, Listener::Callback(Box::new(callback))));
        id
    }

    pub fn unregister(&self, id: ListenerId) {
        self.send(Command::Unregister(id));
    }

    pub fn current_state(&self) -> LifecycleState {
        self.snapshot.borrow().state
    }

    /// The live config mirror, only while the engine is active.
    pub fn mirror(&self) -> Option<Arc<ConfigMirror>> {
        let snapshot = self.snapshot.borrow();
        match snapshot.state {
            LifecycleState::Active => snapshot.mirror.clone(),
            _ => None,
        }
    }

    /// Stops the engine and ends the state machine task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn reset(&self, verb: EngineCommand) -> Result<(), ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Reset(verb, tx))
            .map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)?
    }

    fn listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("service state machine is gone, request dropped");
        }
    }
}

/// State changes for one listener. Unregisters itself when dropped.
pub struct StateSubscription {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<LifecycleState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl StateSubscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub async fn next(&mut self) -> Option<LifecycleState> {
        self.rx.recv().await
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unregister(self.id));
    }
}

#[cfg(test)]
#[path = "state_machine_tests.rs"]
mod tests;
