//! Lookup of the kernel bound to each notebook.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::info;
use tokio::sync::broadcast;

use crate::bridge::KernelConnection;
use crate::kernel::Kernel;
use crate::session::ConnectionOptions;

/// Source of kernels: which kernel is bound to a document, and when new ones
/// start.
pub trait KernelProvider: Send + Sync {
    /// The kernel bound to the notebook at `notebook_uri`.
    fn get(&self, notebook_uri: &str) -> Option<Arc<dyn Kernel>>;

    /// Subscribe to kernels as they are started (or attached).
    fn subscribe_started(&self) -> broadcast::Receiver<Arc<dyn Kernel>>;
}

/// In-process [`KernelProvider`] keyed by notebook URI. One kernel per
/// document; registering a second one replaces the first.
pub struct KernelRegistry {
    kernels: RwLock<HashMap<String, Arc<dyn Kernel>>>,
    started: broadcast::Sender<Arc<dyn Kernel>>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        let (started, _) = broadcast::channel(64);
        Self {
            kernels: RwLock::new(HashMap::new()),
            started,
        }
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `kernel` to its notebook and announce it. Returns the kernel it
    /// replaced, if any; the caller decides whether to dispose it.
    pub fn register(&self, kernel: Arc<dyn Kernel>) -> Option<Arc<dyn Kernel>> {
        let uri = kernel.notebook().uri().to_string();
        let previous = self
            .kernels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.clone(), kernel.clone());
        info!(
            "[registry] Kernel {} bound to {}",
            kernel.connection_metadata().kind(),
            uri
        );
        let _ = self.started.send(kernel);
        previous
    }

    pub fn remove(&self, notebook_uri: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(notebook_uri)
    }

    pub fn len(&self) -> usize {
        self.kernels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kernel bound to `notebook_uri`, presented as a kernel connection.
    pub fn connection_for(&self, notebook_uri: &str) -> Option<KernelConnection> {
        let kernel = self.get(notebook_uri)?;
        let options = ConnectionOptions::for_kernel(kernel.as_ref());
        Some(KernelConnection::new(kernel, options))
    }
}

impl KernelProvider for KernelRegistry {
    fn get(&self, notebook_uri: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(notebook_uri)
            .cloned()
    }

    fn subscribe_started(&self) -> broadcast::Receiver<Arc<dyn Kernel>> {
        self.started.subscribe()
    }
}
