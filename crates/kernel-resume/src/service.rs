//! Wires the tracker and the coordinator to kernel and controller events.

use std::sync::Arc;

use kernel_bridge::KernelProvider;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::controller::ControllerManager;
use crate::coordinator::{ResumeOutcome, ResumptionCoordinator};
use crate::memento::Memento;
use crate::tracker::ExecutionTracker;

pub struct ExecutionResumeService {
    tracker: Arc<ExecutionTracker>,
    coordinator: Arc<ResumptionCoordinator>,
    kernels: Arc<dyn KernelProvider>,
    controllers: Arc<dyn ControllerManager>,
}

impl ExecutionResumeService {
    pub fn new(
        memento: Arc<dyn Memento>,
        kernels: Arc<dyn KernelProvider>,
        controllers: Arc<dyn ControllerManager>,
    ) -> Self {
        Self {
            tracker: Arc::new(ExecutionTracker::new(memento.clone())),
            coordinator: Arc::new(ResumptionCoordinator::new(memento, kernels.clone())),
            kernels,
            controllers,
        }
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn coordinator(&self) -> &Arc<ResumptionCoordinator> {
        &self.coordinator
    }

    /// Start monitoring kernels as they start and resuming executions as
    /// controllers are selected. Both subscriptions are taken before this
    /// returns. Must be called from within a tokio runtime.
    pub fn activate(&self) -> ActivationHandle {
        let mut started = self.kernels.subscribe_started();
        let mut selected = self.controllers.subscribe_selected();

        let tracker = self.tracker.clone();
        let kernels_task = tokio::spawn(async move {
            loop {
                match started.recv().await {
                    Ok(kernel) => {
                        tracker.start_monitoring(kernel);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[resume] Missed {} kernel start events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let coordinator = self.coordinator.clone();
        let controllers_task = tokio::spawn(async move {
            loop {
                match selected.recv().await {
                    Ok(event) => match coordinator.on_controller_selected(&event) {
                        ResumeOutcome::Resumed { .. } => {}
                        outcome => debug!(
                            "[resume] Nothing to resume for {}: {:?}",
                            event.notebook.uri(),
                            outcome
                        ),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[resume] Missed {} controller selections", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!("[resume] Execution resume service active");
        ActivationHandle {
            tasks: vec![kernels_task, controllers_task],
        }
    }
}

/// Keeps the service's event loops alive. Dropping it stops them.
pub struct ActivationHandle {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ActivationHandle {
    pub fn shutdown(self) {
        drop(self);
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for ActivationHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
