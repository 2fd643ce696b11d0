/// Errors returned by [`KernelConnection`](crate::KernelConnection).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// `info` was requested before a successful `kernel_info_reply` arrived.
    /// Retry once the kernel reports a ready status.
    #[error("Kernel not ready")]
    NotReady,

    /// The kernel has no protocol session (not connected yet, or disposed).
    #[error("No active kernel session")]
    NoActiveSession,

    /// The operation is not supported by this connection. Not a runtime
    /// fault; retrying will not help.
    #[error("Method not implemented: {0}")]
    NotImplemented(&'static str),

    /// The underlying session failed.
    #[error("Session error: {0}")]
    Session(#[from] anyhow::Error),
}
