use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::prefs::{ObjectConditions, ObjectScope, RunPreferences};
use super::signals::{Signal, SignalSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    #[default]
    None,
    Wifi,
    Ethernet,
    Cellular,
}

impl ConnectionKind {
    pub fn is_wifi_or_ethernet(self) -> bool {
        matches!(self, ConnectionKind::Wifi | ConnectionKind::Ethernet)
    }
}

/// Snapshot of the host signals the decision depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub connection: ConnectionKind,
    pub ssid: Option<String>,
    pub charging: bool,
    pub power_saving: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            connection: ConnectionKind::None,
            ssid: None,
            charging: true,
            power_saving: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    PowerSaving,
    NotWithinTimeframe,
    NotCharging,
    WifiRequired,
    WifiNotWhitelisted,
    MobileDataDisallowed,
    CustomConditionUnmet,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::PowerSaving => "power_saving",
            BlockReason::NotWithinTimeframe => "not_within_timeframe",
            BlockReason::NotCharging => "not_charging",
            BlockReason::WifiRequired => "wifi_required",
            BlockReason::WifiNotWhitelisted => "wifi_not_whitelisted",
            BlockReason::MobileDataDisallowed => "mobile_data_disallowed",
            BlockReason::CustomConditionUnmet => "custom_condition_unmet",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            BlockReason::PowerSaving => "power saving mode is active",
            BlockReason::NotWithinTimeframe => "outside of the scheduled sync window",
            BlockReason::NotCharging => "device is not charging",
            BlockReason::WifiRequired => "not connected to Wi-Fi or Ethernet",
            BlockReason::WifiNotWhitelisted => "current Wi-Fi network is not whitelisted",
            BlockReason::MobileDataDisallowed => "running on mobile data is disabled",
            BlockReason::CustomConditionUnmet => "custom run conditions are not met",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDecision {
    pub allowed: bool,
    pub reasons: Vec<BlockReason>,
}

impl RunDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reasons: Vec::new(),
        }
    }

    pub fn block(reason: BlockReason) -> Self {
        Self {
            allowed: false,
            reasons: vec![reason],
        }
    }
}

/// The rule inputs shared by the global and per-object evaluations.
struct Rules<'a> {
    respect_power_saving: bool,
    always_run_in_background: bool,
    outside_time_window: bool,
    only_when_charging: bool,
    only_on_wifi: bool,
    wifi_ssid_whitelist: &'a [String],
    run_on_mobile_data: bool,
}

impl<'a> Rules<'a> {
    fn global(prefs: &'a RunPreferences, window_open: bool) -> Self {
        Self {
            respect_power_saving: prefs.respect_power_saving,
            always_run_in_background: prefs.always_run_in_background,
            outside_time_window: prefs.run_on_time_schedule && !window_open,
            only_when_charging: prefs.only_when_charging,
            only_on_wifi: prefs.only_on_wifi,
            wifi_ssid_whitelist: &prefs.wifi_ssid_whitelist,
            run_on_mobile_data: prefs.run_on_mobile_data,
        }
    }

    fn object(prefs: &'a RunPreferences, object: &'a ObjectConditions) -> Self {
        Self {
            respect_power_saving: object.respect_power_saving,
            always_run_in_background: prefs.always_run_in_background,
            outside_time_window: false,
            only_when_charging: object.only_when_charging,
            only_on_wifi: object.only_on_wifi,
            wifi_ssid_whitelist: &object.wifi_ssid_whitelist,
            run_on_mobile_data: prefs.run_on_mobile_data,
        }
    }

    fn evaluate(&self, env: &Environment) -> Option<BlockReason> {
        if env.power_saving && self.respect_power_saving {
            return Some(BlockReason::PowerSaving);
        }
        if !self.always_run_in_background {
            return None;
        }
        if self.outside_time_window {
            return Some(BlockReason::NotWithinTimeframe);
        }
        if self.only_when_charging && !env.charging {
            return Some(BlockReason::NotCharging);
        }
        if self.only_on_wifi {
            if !env.connection.is_wifi_or_ethernet() {
                return Some(BlockReason::WifiRequired);
            }
            if !self.wifi_ssid_whitelist.is_empty() {
                let whitelisted = env
                    .ssid
                    .as_deref()
                    .is_some_and(|ssid| self.wifi_ssid_whitelist.iter().any(|w| w == ssid));
                if !whitelisted {
                    return Some(BlockReason::WifiNotWhitelisted);
                }
            }
        } else if env.connection == ConnectionKind::Cellular && !self.run_on_mobile_data {
            return Some(BlockReason::MobileDataDisallowed);
        }
        None
    }
}

/// Evaluates the global run conditions in their fixed order.
pub fn decide(prefs: &RunPreferences, env: &Environment, window_open: bool) -> RunDecision {
    match Rules::global(prefs, window_open).evaluate(env) {
        Some(reason) => RunDecision::block(reason),
        None => RunDecision::allow(),
    }
}

/// Evaluates one folder's or device's custom conditions.
pub fn decide_for_object(
    prefs: &RunPreferences,
    object: &ObjectConditions,
    env: &Environment,
) -> RunDecision {
    match Rules::object(prefs, object).evaluate(env) {
        Some(reason) => RunDecision {
            allowed: false,
            reasons: vec![BlockReason::CustomConditionUnmet, reason],
        },
        None => RunDecision::allow(),
    }
}

pub type DecisionCallback = Box<dyn Fn(bool) + Send + Sync>;

struct Inputs {
    prefs: RunPreferences,
    env: Environment,
    window_open: bool,
    last_notified: Option<bool>,
}

/// Holds the latest signal values and reports run/stop decision changes.
///
/// The callback runs while the input lock is held, so it must not block and
/// must not call back into the engine.
pub struct RunConditionEngine {
    inputs: Mutex<Inputs>,
    on_change: DecisionCallback,
}

impl RunConditionEngine {
    pub fn new(
        prefs: RunPreferences,
        env: Environment,
        on_change: impl Fn(bool) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inputs: Mutex::new(Inputs {
                prefs,
                env,
                window_open: false,
                last_notified: None,
            }),
            on_change: Box::new(on_change),
        }
    }

    pub fn apply(&self, signal: Signal) -> RunDecision {
        {
            let mut inputs = self.lock_inputs();
            match signal {
                Signal::Environment(env) => inputs.env = env,
                Signal::Preferences(prefs) => inputs.prefs = *prefs,
                Signal::TimeWindow(open) => inputs.window_open = open,
            }
        }
        self.recompute()
    }

    pub fn recompute(&self) -> RunDecision {
        let mut inputs = self.lock_inputs();
        let decision = decide(&inputs.prefs, &inputs.env, inputs.window_open);
        if inputs.last_notified != Some(decision.allowed) {
            inputs.last_notified = Some(decision.allowed);
            tracing::info!(
                allowed = decision.allowed,
                reasons = ?decision.reasons,
                "run decision changed"
            );
            (self.on_change)(decision.allowed);
        }
        decision
    }

    pub fn explain_current_decision(&self) -> Vec<BlockReason> {
        let inputs = self.lock_inputs();
        decide(&inputs.prefs, &inputs.env, inputs.window_open).reasons
    }

    /// Per-object decision. Objects without enabled custom conditions inherit
    /// the global decision.
    pub fn check_object_conditions(&self, scope: &ObjectScope) -> RunDecision {
        let inputs = self.lock_inputs();
        match inputs.prefs.object(scope) {
            Some(object) => decide_for_object(&inputs.prefs, object, &inputs.env),
            None => decide(&inputs.prefs, &inputs.env, inputs.window_open),
        }
    }

    /// `Some(allowed)` only for objects that carry enabled custom conditions.
    pub fn object_run_state(&self, scope: &ObjectScope) -> Option<bool> {
        let inputs = self.lock_inputs();
        inputs
            .prefs
            .object(scope)
            .map(|object| decide_for_object(&inputs.prefs, object, &inputs.env).allowed)
    }

    pub fn preferences(&self) -> RunPreferences {
        self.lock_inputs().prefs.clone()
    }

    pub fn environment(&self) -> Environment {
        self.lock_inputs().env.clone()
    }

    /// Subscribes to every source and applies their signals until `shutdown`
    /// fires. Subscriptions are released before returning.
    pub async fn monitor(
        self: Arc<Self>,
        sources: Vec<Box<dyn SignalSource>>,
        shutdown: CancellationToken,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::with_capacity(sources.len());
        for source in &sources {
            match source.subscribe(tx.clone()) {
                Ok(handle) => {
                    tracing::debug!(source = handle.source(), "run-condition source subscribed");
                    subscriptions.push(handle);
                }
                Err(err) => {
                    tracing::warn!(
                        source = source.name(),
                        %err,
                        "run-condition source unavailable"
                    );
                }
            }
        }
        drop(tx);
        self.recompute();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = rx.recv() => match signal {
                    Some(signal) => {
                        tracing::debug!(?signal, "run-condition signal");
                        self.apply(signal);
                    }
                    None => {
                        shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }

        for subscription in subscriptions {
            subscription.release().await;
        }
    }

    fn lock_inputs(&self) -> MutexGuard<'_, Inputs> {
        self.inputs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
