//! kernel-bridge - Jupyter protocol surface over notebook-bound kernels.
//!
//! A notebook document is bound to exactly one kernel handle ([`Kernel`]).
//! The handle owns the protocol-level [`KernelSession`] (when connected), the
//! lifecycle status and the event source that everything else subscribes to.
//!
//! [`KernelConnection`] presents such a handle as a full kernel connection:
//! identity, status, shell/control messaging, comm targets, message hooks and
//! event streams. It never speaks the protocol itself; every operation is
//! delegated to the session owned by the kernel.

pub mod bridge;
pub mod error;
pub mod events;
pub mod kernel;
pub mod metadata;
pub mod notebook;
pub mod provider;
pub mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use bridge::{KernelConnection, KernelSpecModel};
pub use error::BridgeError;
pub use events::{AnyMessage, ConnectionStatus, KernelEvent, KernelStatus, MessageDirection};
pub use kernel::{Kernel, NotebookKernel};
pub use metadata::{ConnectionKind, KernelConnectionMetadata, KernelSpec, LiveKernelModel};
pub use notebook::{NotebookCell, NotebookDocument};
pub use provider::{KernelProvider, KernelRegistry};
pub use session::{
    CommTargetHandler, ConnectionOptions, KernelModel, KernelSession, MessageHook,
    RuntimeSession, ShellFuture,
};

/// Capacity of the broadcast channels carrying [`KernelEvent`]s.
///
/// IOPub can be chatty (streams, display updates); subscribers that fall this
/// far behind observe a `Lagged` error and skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
