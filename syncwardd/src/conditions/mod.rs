pub mod engine;
pub mod prefs;
pub mod signals;

pub use engine::{
    BlockReason, ConnectionKind, Environment, RunConditionEngine, RunDecision, decide,
    decide_for_object,
};
pub use prefs::{EngineTuning, ObjectConditions, ObjectScope, RunPreferences};
pub use signals::{
    EnvironmentProbeSource, PreferencesFileSource, Signal, SignalSource, SubscriptionHandle,
    TimeScheduleSource,
};
