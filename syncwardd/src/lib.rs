pub mod conditions;
pub mod daemon;
pub mod dbus_api;
pub mod events;
pub mod media;
pub mod mirror;
pub mod notifier;
pub mod process;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
