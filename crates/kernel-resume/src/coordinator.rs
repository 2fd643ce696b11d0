//! Resumes tracking of an execution when a notebook is re-attached to the
//! live kernel that was running it.

use std::sync::Arc;

use kernel_bridge::{ConnectionKind, KernelProvider};
use log::{debug, info};

use crate::controller::ControllerSelected;
use crate::memento::Memento;
use crate::tracker::load_record;

/// What [`ResumptionCoordinator::on_controller_selected`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The controller does not connect to a live kernel.
    NotLiveKernel,
    /// No (well-formed) execution record for the notebook.
    NoRecord,
    /// No kernel is bound to the notebook.
    NoKernel,
    /// The record belongs to a different kernel.
    KernelMismatch { recorded: String, live: String },
    /// The recorded cell no longer exists.
    CellOutOfRange { cell_index: usize, cell_count: usize },
    Resumed {
        cell_index: usize,
        execution_id: String,
    },
}

pub struct ResumptionCoordinator {
    memento: Arc<dyn Memento>,
    kernels: Arc<dyn KernelProvider>,
}

impl ResumptionCoordinator {
    pub fn new(memento: Arc<dyn Memento>, kernels: Arc<dyn KernelProvider>) -> Self {
        Self { memento, kernels }
    }

    /// Ask the notebook's kernel to resume the recorded execution if the
    /// selected controller attaches to the kernel that was running it.
    pub fn on_controller_selected(&self, event: &ControllerSelected) -> ResumeOutcome {
        let notebook = &event.notebook;
        let connection = &event.controller.connection;
        if connection.kind() != ConnectionKind::ConnectToLiveKernel {
            return ResumeOutcome::NotLiveKernel;
        }
        let Some(live_kernel) = connection.live_kernel() else {
            return ResumeOutcome::NotLiveKernel;
        };

        // The persisted record is authoritative; it outlives this process
        let Some(record) = load_record(self.memento.as_ref(), notebook.uri()) else {
            return ResumeOutcome::NoRecord;
        };
        let Some(kernel) = self.kernels.get(notebook.uri()) else {
            debug!("[resume] No kernel for {}", notebook.uri());
            return ResumeOutcome::NoKernel;
        };
        if record.kernel_id != live_kernel.id {
            return mismatch(notebook.uri(), record.kernel_id, live_kernel.id.clone());
        }
        // The kernel bound to the document is the one asked to resume
        let bound_kernel = kernel.kernel_id().unwrap_or_default();
        if record.kernel_id != bound_kernel {
            return mismatch(notebook.uri(), record.kernel_id, bound_kernel);
        }

        let cell_count = notebook.cell_count();
        let Some(cell) = notebook
            .cell_at(record.cell_index)
            .filter(|_| record.cell_index < cell_count)
        else {
            return ResumeOutcome::CellOutOfRange {
                cell_index: record.cell_index,
                cell_count,
            };
        };

        info!(
            "[resume] Resuming execution {} in cell {} of {}",
            record.execution_id,
            cell.index,
            notebook.uri()
        );
        kernel.resume_execution(&cell, &record.execution_id);
        ResumeOutcome::Resumed {
            cell_index: cell.index,
            execution_id: record.execution_id,
        }
    }
}

fn mismatch(notebook_uri: &str, recorded: String, live: String) -> ResumeOutcome {
    debug!(
        "[resume] Record for {} belongs to kernel {}, not {}",
        notebook_uri, recorded, live
    );
    ResumeOutcome::KernelMismatch { recorded, live }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NotebookController;
    use crate::memento::InMemoryMemento;
    use crate::tracker::{record_key, ExecutionRecord};
    use jupyter_protocol::KernelInfoReply;
    use kernel_bridge::testing::RecordingSession;
    use kernel_bridge::{
        Kernel, KernelConnectionMetadata, KernelEvent, KernelRegistry, KernelSession, KernelSpec,
        KernelStatus, LiveKernelModel, NotebookCell, NotebookDocument, NotebookKernel,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    const URI: &str = "file:///work/train.ipynb";

    fn live(kernel_id: &str) -> KernelConnectionMetadata {
        KernelConnectionMetadata::ConnectToLiveKernel {
            id: format!("live-{kernel_id}"),
            kernel_model: LiveKernelModel {
                id: kernel_id.to_string(),
                name: "python3".to_string(),
                display_name: None,
                language: None,
                last_activity: None,
                execution_state: None,
                connections: None,
            },
            base_url: "http://localhost:8888/".to_string(),
        }
    }

    /// Kernel that counts `resume_execution` calls.
    struct CountingKernel {
        inner: Arc<NotebookKernel>,
        resumes: AtomicUsize,
    }

    impl CountingKernel {
        fn new(notebook: Arc<NotebookDocument>, metadata: KernelConnectionMetadata) -> Arc<Self> {
            Arc::new(Self {
                inner: NotebookKernel::new(notebook, metadata),
                resumes: AtomicUsize::new(0),
            })
        }

        fn resume_count(&self) -> usize {
            self.resumes.load(Ordering::SeqCst)
        }

        fn cell_for_message(&self, msg_id: &str) -> Option<String> {
            self.inner.cell_for_message(msg_id)
        }
    }

    impl Kernel for CountingKernel {
        fn session(&self) -> Option<Arc<dyn KernelSession>> {
            self.inner.session()
        }

        fn status(&self) -> KernelStatus {
            self.inner.status()
        }

        fn info(&self) -> Option<KernelInfoReply> {
            self.inner.info()
        }

        fn notebook(&self) -> &Arc<NotebookDocument> {
            self.inner.notebook()
        }

        fn connection_metadata(&self) -> &KernelConnectionMetadata {
            self.inner.connection_metadata()
        }

        fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
            self.inner.subscribe()
        }

        fn resume_execution(&self, cell: &NotebookCell, execution_id: &str) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            self.inner.resume_execution(cell, execution_id);
        }

        fn is_disposed(&self) -> bool {
            self.inner.is_disposed()
        }

        fn dispose(&self) {
            self.inner.dispose();
        }
    }

    struct Fixture {
        memento: Arc<InMemoryMemento>,
        kernels: Arc<KernelRegistry>,
        notebook: Arc<NotebookDocument>,
        kernel: Arc<CountingKernel>,
        coordinator: ResumptionCoordinator,
    }

    fn fixture(cells: usize) -> Fixture {
        fixture_bound_to(cells, live("K1"))
    }

    fn fixture_bound_to(cells: usize, bound: KernelConnectionMetadata) -> Fixture {
        let memento = Arc::new(InMemoryMemento::new());
        let kernels = Arc::new(KernelRegistry::new());
        let notebook = Arc::new(NotebookDocument::with_cells(
            URI,
            (0..cells).map(|i| format!("step({i})")),
        ));
        let kernel = CountingKernel::new(notebook.clone(), bound);
        kernels.register(kernel.clone());
        let coordinator = ResumptionCoordinator::new(memento.clone(), kernels.clone());
        Fixture {
            memento,
            kernels,
            notebook,
            kernel,
            coordinator,
        }
    }

    async fn store(memento: &InMemoryMemento, cell_index: usize, kernel_id: &str) {
        let record = ExecutionRecord {
            cell_index,
            execution_id: "msg-42".to_string(),
            kernel_id: kernel_id.to_string(),
        };
        memento
            .update(&record_key(URI), serde_json::to_value(record).unwrap())
            .await
            .unwrap();
    }

    fn selected(notebook: &Arc<NotebookDocument>, connection: KernelConnectionMetadata) -> ControllerSelected {
        ControllerSelected {
            notebook: notebook.clone(),
            controller: Arc::new(NotebookController::new(connection)),
        }
    }

    #[tokio::test]
    async fn test_resumes_matching_kernel() {
        let f = fixture(3);
        store(&f.memento, 1, "K1").await;

        let outcome = f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1")));

        assert_eq!(
            outcome,
            ResumeOutcome::Resumed {
                cell_index: 1,
                execution_id: "msg-42".to_string()
            }
        );
        let cell = f.notebook.cell_at(1).unwrap();
        assert_eq!(
            f.kernel.cell_for_message("msg-42").as_deref(),
            Some(cell.document_uri.as_str())
        );
        assert_eq!(f.kernel.resume_count(), 1);
    }

    #[tokio::test]
    async fn test_other_kernel_is_not_resumed() {
        let f = fixture(3);
        store(&f.memento, 1, "K1").await;

        let outcome = f.coordinator.on_controller_selected(&selected(&f.notebook, live("K2")));

        assert_eq!(
            outcome,
            ResumeOutcome::KernelMismatch {
                recorded: "K1".to_string(),
                live: "K2".to_string()
            }
        );
        assert!(f.kernel.cell_for_message("msg-42").is_none());
        assert_eq!(f.kernel.resume_count(), 0);
    }

    #[tokio::test]
    async fn test_bound_kernel_must_match_record() {
        // The document is bound to K2 while the user picks the K1 controller
        let f = fixture_bound_to(3, live("K2"));
        store(&f.memento, 1, "K1").await;

        let outcome = f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1")));

        assert_eq!(
            outcome,
            ResumeOutcome::KernelMismatch {
                recorded: "K1".to_string(),
                live: "K2".to_string()
            }
        );
        assert_eq!(f.kernel.resume_count(), 0);
    }

    #[tokio::test]
    async fn test_bound_kernel_identity_prefers_session() {
        // Metadata says K1 but the attached session is on K2
        let f = fixture(3);
        f.kernel.inner.attach_session(RecordingSession::new("K2"));
        store(&f.memento, 1, "K1").await;

        assert!(matches!(
            f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1"))),
            ResumeOutcome::KernelMismatch { .. }
        ));
        assert_eq!(f.kernel.resume_count(), 0);

        f.kernel.inner.attach_session(RecordingSession::new("K1"));
        assert!(matches!(
            f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1"))),
            ResumeOutcome::Resumed { .. }
        ));
        assert_eq!(f.kernel.resume_count(), 1);
    }

    #[tokio::test]
    async fn test_cell_index_out_of_range() {
        let f = fixture(3);
        store(&f.memento, 5, "K1").await;

        let outcome = f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1")));

        assert_eq!(
            outcome,
            ResumeOutcome::CellOutOfRange {
                cell_index: 5,
                cell_count: 3
            }
        );
        assert!(f.kernel.cell_for_message("msg-42").is_none());

        // Exactly at the boundary is also out of range
        store(&f.memento, 3, "K1").await;
        assert!(matches!(
            f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1"))),
            ResumeOutcome::CellOutOfRange { .. }
        ));
        assert_eq!(f.kernel.resume_count(), 0);
    }

    #[tokio::test]
    async fn test_non_live_controller_is_ignored() {
        let f = fixture(3);
        store(&f.memento, 1, "K1").await;

        let remote = KernelConnectionMetadata::StartUsingRemoteKernelSpec {
            id: "remote-python3".to_string(),
            kernel_spec: KernelSpec {
                name: "python3".to_string(),
                display_name: "Python 3".to_string(),
                language: None,
                argv: Vec::new(),
                resources: Default::default(),
                metadata: None,
            },
            base_url: "http://localhost:8888/".to_string(),
        };

        let outcome = f.coordinator.on_controller_selected(&selected(&f.notebook, remote));
        assert_eq!(outcome, ResumeOutcome::NotLiveKernel);
        assert!(f.kernel.cell_for_message("msg-42").is_none());
    }

    #[tokio::test]
    async fn test_missing_or_malformed_record() {
        let f = fixture(3);
        assert_eq!(
            f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1"))),
            ResumeOutcome::NoRecord
        );

        f.memento
            .update(&record_key(URI), serde_json::json!({"cellIndex": "one"}))
            .await
            .unwrap();
        assert_eq!(
            f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1"))),
            ResumeOutcome::NoRecord
        );
    }

    #[tokio::test]
    async fn test_no_kernel_bound() {
        let f = fixture(3);
        store(&f.memento, 1, "K1").await;
        f.kernels.remove(URI);

        assert_eq!(
            f.coordinator.on_controller_selected(&selected(&f.notebook, live("K1"))),
            ResumeOutcome::NoKernel
        );
        assert!(!f.kernel.is_disposed());
    }
}
