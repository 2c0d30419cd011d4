mod client;
mod config;

pub use client::{
    ApiError, ApiErrorClass, Connection, Connections, EngineClient, Event, EventBatch,
    FolderStatus, SystemStatus, SystemVersion,
};
pub use config::{
    Device, EngineConfig, Folder, FolderDevice, Gui, IgnoredFolder, Options, RemoteIgnoredDevice,
};
