use super::*;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::media::LoggingInvalidator;
use crate::process::CONFIG_FILE_NAME;
use crate::test_support::{
    RecordingNotifier, default_tuning, launch_config, mount_engine_api, sample_config,
    write_fake_engine,
};

use LifecycleState::{Active, Disabled, Error, Init, Starting};

const LONG_RUNNING_ENGINE: &str = "exec sleep 30";

struct Fixture {
    _dir: tempfile::TempDir,
    home: PathBuf,
    server: MockServer,
    notifier: Arc<RecordingNotifier>,
    handle: ServiceHandle,
}

impl Fixture {
    async fn new(engine_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join(CONFIG_FILE_NAME), "<configuration/>").unwrap();
        Self::with_home(dir, home, engine_body).await
    }

    async fn with_home(dir: tempfile::TempDir, home: PathBuf, engine_body: &str) -> Self {
        let server = MockServer::start().await;
        mount_engine_api(&server, sample_config()).await;
        let binary = write_fake_engine(dir.path(), engine_body);
        let runner = ProcessRunner::new(launch_config(binary, home.clone()), default_tuning());
        let client = EngineClient::with_base_url(&server.uri(), "test-key").unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let deps = ServiceDeps {
            notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
            invalidator: Arc::new(LoggingInvalidator),
            store: None,
            object_check: None,
            poller: EventPollerConfig::default(),
        };
        let handle = ServiceStateMachine::spawn(runner, client, deps, fast_settings());
        Self {
            _dir: dir,
            home,
            server,
            notifier,
            handle,
        }
    }

    fn home(&self) -> &Path {
        &self.home
    }
}

fn fast_settings() -> ServiceSettings {
    ServiceSettings {
        startup_timeout: Duration::from_secs(5),
        ping_backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(200), false),
        stop_retry_interval: Duration::from_millis(50),
        shutdown_request_timeout: Duration::from_millis(500),
        graceful_exit_wait: Duration::from_millis(100),
    }
}

async fn expect_states(subscription: &mut StateSubscription, expected: &[LifecycleState]) {
    for want in expected {
        let got = tokio::time::timeout(Duration::from_secs(10), subscription.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
        assert_eq!(got, Some(*want));
    }
}

async fn expect_quiet(subscription: &mut StateSubscription, window: Duration) {
    if let Ok(state) = tokio::time::timeout(window, subscription.next()).await {
        panic!("unexpected transition to {state:?}");
    }
}

async fn delay_initial_config(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .and(path("/rest/system/config"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(sample_config())
                .set_delay(delay),
        )
        .with_priority(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn listener_receives_current_state_on_registration() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(false);
    expect_states(&mut states, &[Disabled]).await;

    let mut late = fx.handle.register_state_listener();
    expect_states(&mut late, &[Disabled]).await;
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn run_request_starts_engine_and_publishes_mirror() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(false);
    expect_states(&mut states, &[Disabled]).await;
    assert!(fx.handle.mirror().is_none());

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active]).await;
    let mirror = fx.handle.mirror().expect("mirror published when active");
    assert_eq!(mirror.get_folders()[0].id, "photos");

    fx.handle.request_stop("user");
    expect_states(&mut states, &[Disabled]).await;
    assert!(fx.handle.mirror().is_none());
    assert!(mirror.is_closed());

    let persistent: Vec<_> = fx
        .notifier
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            crate::test_support::NotifierCall::Persistent(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(persistent, vec![Disabled, Starting, Active, Disabled]);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn duplicate_run_request_does_not_start_twice() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active]).await;
    fx.handle.request_run(true);
    expect_quiet(&mut states, Duration::from_millis(300)).await;
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn stop_during_startup_waits_for_active() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    delay_initial_config(&fx.server, Duration::from_millis(500)).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting]).await;
    fx.handle.request_stop("user");
    expect_states(&mut states, &[Active, Disabled]).await;
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn run_request_during_startup_withdraws_pending_stop() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    delay_initial_config(&fx.server, Duration::from_millis(500)).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting]).await;
    fx.handle.request_stop("conditions");
    fx.handle.request_run(true);
    expect_states(&mut states, &[Active]).await;
    expect_quiet(&mut states, Duration::from_millis(300)).await;
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn crash_disables_without_respawn() {
    let fx = Fixture::new("sleep 1; exit 2").await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active, Disabled]).await;
    expect_quiet(&mut states, Duration::from_millis(300)).await;
    assert_eq!(fx.notifier.crashes(), vec![CrashReport::ExitCode(2)]);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn restart_exit_code_restarts_engine() {
    let fx = Fixture::new(
        "if [ -f \"$HOME/restarted\" ]; then exec sleep 30; fi\ntouch \"$HOME/restarted\"\nsleep 1\nexit 3",
    )
    .await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active, Init, Starting, Active]).await;
    assert!(fx.home().join("restarted").exists());
    assert!(fx.notifier.crashes().is_empty());
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn unreadable_config_is_fatal_until_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("home");
    std::fs::create_dir_all(home.join(CONFIG_FILE_NAME)).unwrap();
    let fx = Fixture::with_home(dir, home, LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Error]).await;
    expect_quiet(&mut states, Duration::from_millis(300)).await;
    assert!(matches!(
        fx.notifier.crashes().as_slice(),
        [CrashReport::StartupFailed(_)]
    ));

    fx.handle.request_run(true);
    expect_states(&mut states, &[Init, Starting, Error]).await;
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn restart_request_is_shutdown_then_startup() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active]).await;
    let first = fx.handle.mirror().unwrap();

    fx.handle.request_restart();
    expect_states(&mut states, &[Init, Starting, Active]).await;
    assert!(first.is_closed());
    let second = fx.handle.mirror().unwrap();
    assert!(!second.is_closed());

    let shutdowns = fx
        .server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|request| request.url.path() == "/rest/system/shutdown")
        .count();
    assert_eq!(shutdowns, 1);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn restart_request_is_ignored_unless_active() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_restart();
    expect_quiet(&mut states, Duration::from_millis(300)).await;

    fx.handle.request_run(false);
    expect_states(&mut states, &[Disabled]).await;
    fx.handle.request_restart();
    expect_quiet(&mut states, Duration::from_millis(300)).await;
    assert!(fx.handle.mirror().is_none());
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn reset_database_runs_verb_and_resumes() {
    let fx = Fixture::new(
        "case \"$3\" in -reset-database) touch \"$HOME/reset-done\"; exit 0;; esac\nexec sleep 30",
    )
    .await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;
    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active]).await;

    fx.handle.request_reset_database().await.unwrap();
    expect_states(&mut states, &[Init, Starting, Active]).await;
    assert!(fx.home().join("reset-done").exists());
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn reset_is_refused_while_starting() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    delay_initial_config(&fx.server, Duration::from_millis(500)).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting]).await;
    assert!(matches!(
        fx.handle.request_reset_deltas().await,
        Err(ServiceError::Busy)
    ));
    expect_states(&mut states, &[Active]).await;
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn callbacks_run_in_transition_order() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = fx
        .handle
        .register_state_callback(move |state| sink.lock().unwrap().push(state));
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;

    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active]).await;
    fx.handle.unregister(id);
    fx.handle.request_stop("user");
    expect_states(&mut states, &[Disabled]).await;

    assert_eq!(*seen.lock().unwrap(), vec![Init, Starting, Active]);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_a_running_engine() {
    let fx = Fixture::new(LONG_RUNNING_ENGINE).await;
    let mut states = fx.handle.register_state_listener();
    expect_states(&mut states, &[Init]).await;
    fx.handle.request_run(true);
    expect_states(&mut states, &[Starting, Active]).await;

    fx.handle.shutdown().await;
    assert_eq!(fx.handle.current_state(), Disabled);
    assert!(matches!(
        fx.handle.request_reset_database().await,
        Err(ServiceError::Stopped)
    ));
}
