pub mod backoff;
pub mod state_machine;

pub use backoff::Backoff;
pub use state_machine::{
    LifecycleState, ListenerId, ServiceDeps, ServiceError, ServiceHandle, ServiceSettings,
    ServiceStateMachine, StartupError, StateCallback, StateSubscription,
};
