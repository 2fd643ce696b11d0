//! Events published by kernel sessions and kernel handles.

use jupyter_protocol::{ExecutionState, JupyterMessage};
use serde::Serialize;

/// Kernel lifecycle status, as reported on IOPub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    #[default]
    Unknown,
    Starting,
    Idle,
    Busy,
    Terminating,
    Restarting,
    Autorestarting,
    Dead,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Terminating => write!(f, "terminating"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Autorestarting => write!(f, "autorestarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

impl From<&ExecutionState> for KernelStatus {
    fn from(state: &ExecutionState) -> Self {
        match state {
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Restarting => KernelStatus::Restarting,
            ExecutionState::Terminating => KernelStatus::Terminating,
            ExecutionState::Dead => KernelStatus::Dead,
            #[allow(unreachable_patterns)]
            _ => KernelStatus::Unknown,
        }
    }
}

/// Connection status of a kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// Whether a message was sent to or received from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Send,
    Recv,
}

/// A message observed in either direction on any channel.
#[derive(Debug, Clone)]
pub struct AnyMessage {
    pub direction: MessageDirection,
    pub message: JupyterMessage,
}

/// Everything a kernel (or its session) publishes to subscribers.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    StatusChanged(KernelStatus),
    ConnectionStatusChanged(ConnectionStatus),
    /// An IOPub broadcast that no message hook suppressed.
    IopubMessage(JupyterMessage),
    /// A shell/control reply nobody was waiting for.
    UnhandledMessage(JupyterMessage),
    AnyMessage(AnyMessage),
    /// An IOPub message belonging to an execution the kernel was asked to
    /// resume, tagged with the cell it belongs to.
    CellMessage {
        cell_uri: String,
        message: JupyterMessage,
    },
    Disposed,
}
