pub mod handler;
pub mod poller;

pub use handler::{EngineEventHandler, ObjectCheck};
pub use poller::{
    DispatchError, EventPoller, EventPollerConfig, EventSink, MIN_POLL_INTERVAL,
};
