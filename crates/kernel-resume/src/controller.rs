//! Notebook controllers: the kernel choices offered for a notebook, and which
//! one the user selected.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use kernel_bridge::{KernelConnectionMetadata, NotebookDocument};
use log::{debug, warn};
use tokio::sync::broadcast;

/// A selectable kernel connection for notebooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookController {
    pub id: String,
    pub label: String,
    pub connection: KernelConnectionMetadata,
}

impl NotebookController {
    pub fn new(connection: KernelConnectionMetadata) -> Self {
        Self {
            id: connection.id().to_string(),
            label: connection.display_name().to_string(),
            connection,
        }
    }
}

/// A controller was selected for a notebook.
#[derive(Debug, Clone)]
pub struct ControllerSelected {
    pub notebook: Arc<NotebookDocument>,
    pub controller: Arc<NotebookController>,
}

pub trait ControllerManager: Send + Sync {
    /// Subscribe to controller selections.
    fn subscribe_selected(&self) -> broadcast::Receiver<ControllerSelected>;

    fn registered_controllers(&self) -> Vec<Arc<NotebookController>>;

    fn selected_controller(&self, notebook_uri: &str) -> Option<Arc<NotebookController>>;
}

/// In-process [`ControllerManager`].
pub struct ControllerRegistry {
    controllers: RwLock<Vec<Arc<NotebookController>>>,
    /// notebook uri -> selected controller
    selected: RwLock<HashMap<String, Arc<NotebookController>>>,
    events: broadcast::Sender<ControllerSelected>,
}

impl Default for ControllerRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            controllers: RwLock::new(Vec::new()),
            selected: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller, replacing one with the same id.
    pub fn register(&self, controller: NotebookController) -> Arc<NotebookController> {
        let controller = Arc::new(controller);
        let mut controllers = self
            .controllers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        controllers.retain(|c| c.id != controller.id);
        controllers.push(controller.clone());
        debug!(
            "[controllers] Registered {} ({})",
            controller.id,
            controller.connection.kind()
        );
        controller
    }

    /// Select controller `controller_id` for `notebook` and announce it.
    /// Re-selecting the current controller announces it again.
    pub fn select(
        &self,
        notebook: Arc<NotebookDocument>,
        controller_id: &str,
    ) -> Option<Arc<NotebookController>> {
        let controller = self
            .controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id == controller_id)
            .cloned();
        let Some(controller) = controller else {
            warn!("[controllers] Unknown controller {}", controller_id);
            return None;
        };

        self.selected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(notebook.uri().to_string(), controller.clone());
        let _ = self.events.send(ControllerSelected {
            notebook,
            controller: controller.clone(),
        });
        Some(controller)
    }
}

impl ControllerManager for ControllerRegistry {
    fn subscribe_selected(&self) -> broadcast::Receiver<ControllerSelected> {
        self.events.subscribe()
    }

    fn registered_controllers(&self) -> Vec<Arc<NotebookController>> {
        self.controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn selected_controller(&self, notebook_uri: &str) -> Option<Arc<NotebookController>> {
        self.selected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(notebook_uri)
            .cloned()
    }
}
