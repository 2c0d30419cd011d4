pub mod ids;

use serde::{Deserialize, Serialize};

/// Coarse service status shown by tray icons and status notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceUiState {
    Starting,
    Running,
    Stopped,
    Error,
}

/// Maps the daemon's lifecycle wire names (`init`, `starting`, `active`,
/// `disabled`, `error`) onto the UI status.
pub fn ui_state_for_lifecycle(state: &str) -> ServiceUiState {
    match state {
        "init" | "starting" => ServiceUiState::Starting,
        "active" => ServiceUiState::Running,
        "disabled" => ServiceUiState::Stopped,
        _ => ServiceUiState::Error,
    }
}

pub fn adwaita_symbolic_icon(state: ServiceUiState) -> &'static str {
    match state {
        ServiceUiState::Starting => "content-loading-symbolic",
        ServiceUiState::Running => "emblem-synchronizing-symbolic",
        ServiceUiState::Stopped => "media-playback-pause-symbolic",
        ServiceUiState::Error => "dialog-error-symbolic",
    }
}

pub fn status_label(state: ServiceUiState) -> &'static str {
    match state {
        ServiceUiState::Starting => "Sync engine is starting",
        ServiceUiState::Running => "Sync engine is running",
        ServiceUiState::Stopped => "Sync engine is stopped",
        ServiceUiState::Error => "Sync engine failed to start",
    }
}

/// Actions offered on a device or folder consent notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentAction {
    Accept,
    Ignore,
    Dismiss,
}

impl ConsentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentAction::Accept => "accept",
            ConsentAction::Ignore => "ignore",
            ConsentAction::Dismiss => "dismiss",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accept" => Some(ConsentAction::Accept),
            "ignore" => Some(ConsentAction::Ignore),
            "dismiss" => Some(ConsentAction::Dismiss),
            _ => None,
        }
    }

    pub fn all() -> [ConsentAction; 3] {
        [
            ConsentAction::Accept,
            ConsentAction::Ignore,
            ConsentAction::Dismiss,
        ]
    }
}
