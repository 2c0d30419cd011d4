use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use syncward_integrations::{adwaita_symbolic_icon, status_label, ui_state_for_lifecycle};
use tokio::sync::mpsc;

use crate::service::LifecycleState;

const SHORT_DEVICE_ID_LEN: usize = 7;
/// Derived IDs start here so they never collide with the fixed ones below.
const DERIVED_ID_BASE: u32 = 1000;

pub const PERSISTENT_NOTIFICATION_ID: NotificationId = NotificationId(1);
pub const CRASH_NOTIFICATION_ID: NotificationId = NotificationId(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub u32);

impl NotificationId {
    /// Same parts always give the same ID.
    pub fn derive(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        NotificationId(DERIVED_ID_BASE + raw % (u32::MAX - DERIVED_ID_BASE))
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote peer asking for something the user has to accept or ignore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentRequest {
    Device {
        device_id: String,
        name: String,
        address: String,
    },
    Folder {
        device_id: String,
        device_name: String,
        folder_id: String,
        folder_label: String,
    },
}

impl ConsentRequest {
    pub fn id(&self) -> NotificationId {
        match self {
            ConsentRequest::Device { device_id, .. } => {
                NotificationId::derive(&["device", device_id])
            }
            ConsentRequest::Folder {
                device_id,
                folder_id,
                ..
            } => NotificationId::derive(&["folder", device_id, folder_id]),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConsentRequest::Device { .. } => "device",
            ConsentRequest::Folder { .. } => "folder",
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            ConsentRequest::Device { device_id, .. } | ConsentRequest::Folder { device_id, .. } => {
                device_id
            }
        }
    }

    pub fn folder_id(&self) -> Option<&str> {
        match self {
            ConsentRequest::Device { .. } => None,
            ConsentRequest::Folder { folder_id, .. } => Some(folder_id),
        }
    }

    pub fn title(&self) -> String {
        match self {
            ConsentRequest::Device {
                device_id, name, ..
            } => {
                let shown = if name.is_empty() {
                    short_device_id(device_id)
                } else {
                    name.clone()
                };
                format!("Device {shown} wants to connect")
            }
            ConsentRequest::Folder {
                device_name,
                folder_id,
                folder_label,
                ..
            } => {
                let folder = if folder_label.is_empty() {
                    folder_id.clone()
                } else {
                    format!("{folder_label} ({folder_id})")
                };
                format!("{device_name} wants to share folder {folder}")
            }
        }
    }
}

pub fn short_device_id(device_id: &str) -> String {
    device_id.chars().take(SHORT_DEVICE_ID_LEN).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashReport {
    StartupFailed(String),
    ExitCode(i32),
}

impl CrashReport {
    pub fn message(&self) -> String {
        match self {
            CrashReport::StartupFailed(reason) => format!("sync engine failed to start: {reason}"),
            CrashReport::ExitCode(code) => format!("sync engine crashed with exit code {code}"),
        }
    }
}

/// Receives the user-visible side effects of lifecycle transitions and
/// engine events. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn update_persistent(&self, state: LifecycleState);
    fn show_consent(&self, request: &ConsentRequest);
    fn cancel_consent(&self, id: NotificationId);
    fn show_crash(&self, report: &CrashReport);
}

/// What the notification center forwards to the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    StateChanged(LifecycleState),
    ConsentRequested(NotificationId, ConsentRequest),
    ConsentCancelled(NotificationId),
    EngineCrashed(CrashReport),
}

#[derive(Default)]
struct Board {
    consents: BTreeMap<NotificationId, ConsentRequest>,
    crash: Option<CrashReport>,
}

/// The daemon's notifier: keeps the live notification set, coalesces
/// repeats and forwards changes as [`OutboundSignal`]s in order.
#[derive(Default)]
pub struct NotificationCenter {
    board: Mutex<Board>,
    outbound: Option<mpsc::UnboundedSender<OutboundSignal>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbound(outbound: mpsc::UnboundedSender<OutboundSignal>) -> Self {
        Self {
            board: Mutex::new(Board::default()),
            outbound: Some(outbound),
        }
    }

    pub fn live_consents(&self) -> Vec<(NotificationId, ConsentRequest)> {
        self.lock_board()
            .consents
            .iter()
            .map(|(id, request)| (*id, request.clone()))
            .collect()
    }

    pub fn visible_crash(&self) -> Option<CrashReport> {
        self.lock_board().crash.clone()
    }

    fn emit(&self, signal: OutboundSignal) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(signal);
        }
    }

    fn lock_board(&self) -> MutexGuard<'_, Board> {
        self.board
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Notifier for NotificationCenter {
    fn update_persistent(&self, state: LifecycleState) {
        let ui = ui_state_for_lifecycle(state.as_str());
        tracing::info!(
            id = %PERSISTENT_NOTIFICATION_ID,
            state = state.as_str(),
            label = status_label(ui),
            icon = adwaita_symbolic_icon(ui),
            "status notification updated"
        );
        if state == LifecycleState::Active {
            self.lock_board().crash = None;
        }
        self.emit(OutboundSignal::StateChanged(state));
    }

    fn show_consent(&self, request: &ConsentRequest) {
        let id = request.id();
        if self
            .lock_board()
            .consents
            .insert(id, request.clone())
            .is_some()
        {
            tracing::debug!(%id, "consent notification already visible");
            return;
        }
        tracing::info!(%id, kind = request.kind(), title = %request.title(), "consent requested");
        self.emit(OutboundSignal::ConsentRequested(id, request.clone()));
    }

    fn cancel_consent(&self, id: NotificationId) {
        if self.lock_board().consents.remove(&id).is_some() {
            tracing::info!(%id, "consent notification cancelled");
            self.emit(OutboundSignal::ConsentCancelled(id));
        }
    }

    fn show_crash(&self, report: &CrashReport) {
        {
            let mut board = self.lock_board();
            if board.crash.is_some() {
                tracing::debug!(report = %report.message(), "crash notification already visible");
                board.crash = Some(report.clone());
                return;
            }
            board.crash = Some(report.clone());
        }
        tracing::warn!(id = %CRASH_NOTIFICATION_ID, "{}", report.message());
        self.emit(OutboundSignal::EngineCrashed(report.clone()));
    }
}
