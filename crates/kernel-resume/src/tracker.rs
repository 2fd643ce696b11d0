//! Correlates outgoing execute requests with the cells that sent them.
//!
//! For each notebook the tracker keeps the latest execution that went to a
//! kernel on a server: which cell (by index), which request (`msg_id`) and
//! which kernel. The record is kept in memory and persisted under
//! `LONG:<notebook uri>` so a later process can pick the execution back up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use jupyter_protocol::{Channel, JupyterMessage, JupyterMessageContent};
use kernel_bridge::{ConnectionKind, Kernel, KernelEvent, MessageDirection};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::memento::{get_typed, Memento};

/// Prefix of the memento keys holding execution records.
pub const RECORD_KEY_PREFIX: &str = "LONG:";

/// The last execution a notebook sent to its kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub cell_index: usize,
    /// `msg_id` of the `execute_request`
    pub execution_id: String,
    /// Server-side id of the kernel the request went to
    pub kernel_id: String,
}

/// An execution record plus what this process has observed about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedExecution {
    pub record: ExecutionRecord,
    /// The kernel echoed `execute_input` for this request
    pub started: bool,
}

pub fn record_key(notebook_uri: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{notebook_uri}")
}

/// The persisted record for a notebook, if present and well-formed.
pub fn load_record(memento: &dyn Memento, notebook_uri: &str) -> Option<ExecutionRecord> {
    get_typed(memento, &record_key(notebook_uri))
}

/// Whether executions on this kind of connection outlive the front-end.
fn is_long_running(kind: ConnectionKind) -> bool {
    matches!(
        kind,
        ConnectionKind::ConnectToLiveKernel | ConnectionKind::StartUsingRemoteKernelSpec
    )
}

struct TrackerState {
    memento: Arc<dyn Memento>,
    /// notebook uri -> latest execution
    executions: StdMutex<HashMap<String, TrackedExecution>>,
}

impl TrackerState {
    async fn observe(&self, kernel: &dyn Kernel, event: &KernelEvent) {
        match event {
            KernelEvent::AnyMessage(any) if any.direction == MessageDirection::Send => {
                self.on_sent(kernel, &any.message).await;
            }
            KernelEvent::IopubMessage(message) => self.on_iopub(kernel, message),
            _ => {}
        }
    }

    async fn on_sent(&self, kernel: &dyn Kernel, message: &JupyterMessage) {
        if !matches!(message.channel, Some(Channel::Shell))
            || message.header.msg_type != "execute_request"
        {
            return;
        }
        let Some(cell_id) = message.metadata.get("cellId").and_then(|v| v.as_str()) else {
            return;
        };
        let notebook = kernel.notebook();
        let Some(cell) = notebook.find_cell(cell_id) else {
            return;
        };
        let Some(kernel_id) = kernel
            .session()
            .map(|session| session.options().model.id.clone())
            .filter(|id| !id.is_empty())
        else {
            return;
        };

        let record = ExecutionRecord {
            cell_index: cell.index,
            execution_id: message.header.msg_id.clone(),
            kernel_id,
        };
        debug!(
            "[tracker] {} cell {} -> execution {} on kernel {}",
            notebook.uri(),
            record.cell_index,
            record.execution_id,
            record.kernel_id
        );

        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                notebook.uri().to_string(),
                TrackedExecution {
                    record: record.clone(),
                    started: false,
                },
            );

        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!("[tracker] Failed to serialize execution record: {}", e);
                return;
            }
        };
        if let Err(e) = self.memento.update(&record_key(notebook.uri()), value).await {
            warn!(
                "[tracker] Failed to persist execution record for {}: {}",
                notebook.uri(),
                e
            );
        }
    }

    fn on_iopub(&self, kernel: &dyn Kernel, message: &JupyterMessage) {
        if !matches!(message.content, JupyterMessageContent::ExecuteInput(_)) {
            return;
        }
        let Some(parent) = message.parent_header.as_ref() else {
            return;
        };
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tracked) = executions.get_mut(kernel.notebook().uri()) {
            if tracked.record.execution_id == parent.msg_id && !tracked.started {
                tracked.started = true;
                debug!(
                    "[tracker] Execution {} started on kernel {}",
                    parent.msg_id, tracked.record.kernel_id
                );
            }
        }
    }
}

/// Watches kernels and records the executions they are asked to run.
pub struct ExecutionTracker {
    state: Arc<TrackerState>,
    /// notebook uri -> monitoring task
    monitors: StdMutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl ExecutionTracker {
    pub fn new(memento: Arc<dyn Memento>) -> Self {
        Self {
            state: Arc::new(TrackerState {
                memento,
                executions: StdMutex::new(HashMap::new()),
            }),
            monitors: StdMutex::new(HashMap::new()),
        }
    }

    /// Start watching `kernel` if its executions can outlive this process
    /// (it runs on a server) and it has a session. Returns whether monitoring
    /// started. Must be called from within a tokio runtime.
    pub fn start_monitoring(&self, kernel: Arc<dyn Kernel>) -> bool {
        let kind = kernel.connection_metadata().kind();
        if kernel.session().is_none() || !is_long_running(kind) {
            debug!(
                "[tracker] Not monitoring {} ({})",
                kernel.notebook().uri(),
                kind
            );
            return false;
        }

        let uri = kernel.notebook().uri().to_string();
        let mut events = kernel.subscribe();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(KernelEvent::Disposed) => break,
                    Ok(event) => state.observe(kernel.as_ref(), &event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[tracker] Missed {} kernel events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("[tracker] Stopped monitoring {}", kernel.notebook().uri());
        });

        info!("[tracker] Monitoring {} ({})", uri, kind);
        if let Some(previous) = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri, task)
        {
            previous.abort();
        }
        true
    }

    /// Whether a monitoring task is live for the notebook.
    pub fn is_monitoring(&self, notebook_uri: &str) -> bool {
        self.monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(notebook_uri)
            .is_some_and(|task| !task.is_finished())
    }

    /// Process one kernel event.
    pub async fn observe(&self, kernel: &dyn Kernel, event: &KernelEvent) {
        self.state.observe(kernel, event).await;
    }

    /// The latest execution seen in this process for the notebook.
    pub fn last_execution(&self, notebook_uri: &str) -> Option<TrackedExecution> {
        self.state
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(notebook_uri)
            .cloned()
    }
}

impl Drop for ExecutionTracker {
    fn drop(&mut self) {
        for (_, task) in self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::{InMemoryMemento, MementoError};
    use async_trait::async_trait;
    use kernel_bridge::testing::{execute_input_for, execute_request, RecordingSession};
    use kernel_bridge::{
        AnyMessage, KernelConnectionMetadata, KernelSession, KernelSpec, LiveKernelModel,
        NotebookDocument, NotebookKernel,
    };
    use serde_json::Value;
    use std::time::Duration;

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

    fn local() -> KernelConnectionMetadata {
        KernelConnectionMetadata::StartUsingLocalKernelSpec {
            id: "local-python3".to_string(),
            kernel_spec: KernelSpec {
                name: "python3".to_string(),
                display_name: "Python 3".to_string(),
                language: None,
                argv: Vec::new(),
                resources: Default::default(),
                metadata: None,
            },
        }
    }

    fn kernel(metadata: KernelConnectionMetadata, session_id: Option<&str>) -> Arc<NotebookKernel> {
        let notebook = Arc::new(NotebookDocument::with_cells(
            URI,
            ["import torch", "train()", "plot()"],
        ));
        let kernel = NotebookKernel::new(notebook, metadata);
        if let Some(id) = session_id {
            kernel.attach_session(RecordingSession::new(id));
        }
        kernel
    }

    fn sent(message: JupyterMessage) -> KernelEvent {
        KernelEvent::AnyMessage(AnyMessage {
            direction: MessageDirection::Send,
            message,
        })
    }

    fn cell_uri(kernel: &NotebookKernel, index: usize) -> String {
        kernel.notebook().cell_at(index).unwrap().document_uri
    }

    #[tokio::test]
    async fn test_execute_request_is_recorded_and_persisted() {
        let memento = Arc::new(InMemoryMemento::new());
        let tracker = ExecutionTracker::new(memento.clone());
        let kernel = kernel(live("K1"), Some("K1"));

        let request = execute_request("train()", &cell_uri(&kernel, 1));
        let msg_id = request.header.msg_id.clone();
        tracker.observe(kernel.as_ref(), &sent(request)).await;

        let expected = ExecutionRecord {
            cell_index: 1,
            execution_id: msg_id,
            kernel_id: "K1".to_string(),
        };
        let tracked = tracker.last_execution(URI).unwrap();
        assert_eq!(tracked.record, expected);
        assert!(!tracked.started);
        assert_eq!(load_record(memento.as_ref(), URI), Some(expected));

        let raw = memento.get(&format!("LONG:{URI}")).unwrap();
        assert_eq!(raw["cellIndex"], 1);
        assert_eq!(raw["kernelId"], "K1");
    }

    #[tokio::test]
    async fn test_later_request_overwrites() {
        let memento = Arc::new(InMemoryMemento::new());
        let tracker = ExecutionTracker::new(memento.clone());
        let kernel = kernel(live("K1"), Some("K1"));

        let first = execute_request("train()", &cell_uri(&kernel, 1));
        let second = execute_request("plot()", &cell_uri(&kernel, 2));
        let second_id = second.header.msg_id.clone();
        tracker.observe(kernel.as_ref(), &sent(first)).await;
        tracker.observe(kernel.as_ref(), &sent(second)).await;

        let record = load_record(memento.as_ref(), URI).unwrap();
        assert_eq!(record.cell_index, 2);
        assert_eq!(record.execution_id, second_id);
        assert_eq!(tracker.last_execution(URI).unwrap().record, record);
        assert_eq!(memento.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_non_qualifying_messages_are_ignored() {
        let memento = Arc::new(InMemoryMemento::new());
        let tracker = ExecutionTracker::new(memento.clone());
        let kernel = kernel(live("K1"), Some("K1"));
        let cell = cell_uri(&kernel, 0);

        // Received, not sent
        tracker
            .observe(
                kernel.as_ref(),
                &KernelEvent::AnyMessage(AnyMessage {
                    direction: MessageDirection::Recv,
                    message: execute_request("x", &cell),
                }),
            )
            .await;

        // Control channel
        let mut control = execute_request("x", &cell);
        control.channel = Some(Channel::Control);
        tracker.observe(kernel.as_ref(), &sent(control)).await;

        // Not an execute_request
        let mut other = execute_request("x", &cell);
        other.header.msg_type = "inspect_request".to_string();
        tracker.observe(kernel.as_ref(), &sent(other)).await;

        // cellId missing or not a string
        let mut no_cell = execute_request("x", &cell);
        no_cell.metadata = serde_json::json!({});
        tracker.observe(kernel.as_ref(), &sent(no_cell)).await;
        let mut numeric_cell = execute_request("x", &cell);
        numeric_cell.metadata = serde_json::json!({"cellId": 3});
        tracker.observe(kernel.as_ref(), &sent(numeric_cell)).await;

        // Cell from another notebook
        tracker
            .observe(
                kernel.as_ref(),
                &sent(execute_request("x", "file:///other.ipynb#cell-1")),
            )
            .await;

        assert!(memento.keys().is_empty());
        assert!(tracker.last_execution(URI).is_none());
    }

    #[tokio::test]
    async fn test_requires_session_with_kernel_id() {
        let memento = Arc::new(InMemoryMemento::new());
        let tracker = ExecutionTracker::new(memento.clone());

        let detached = kernel(live("K1"), None);
        let request = execute_request("x", &cell_uri(&detached, 0));
        tracker.observe(detached.as_ref(), &sent(request)).await;

        let anonymous = kernel(live("K1"), Some(""));
        let request = execute_request("x", &cell_uri(&anonymous, 0));
        tracker.observe(anonymous.as_ref(), &sent(request)).await;

        assert!(memento.keys().is_empty());
    }

    #[tokio::test]
    async fn test_execute_input_marks_started_without_touching_record() {
        let memento = Arc::new(InMemoryMemento::new());
        let tracker = ExecutionTracker::new(memento.clone());
        let kernel = kernel(live("K1"), Some("K1"));

        let request = execute_request("train()", &cell_uri(&kernel, 1));
        tracker.observe(kernel.as_ref(), &sent(request.clone())).await;
        let persisted = memento.get(&record_key(URI)).unwrap();

        // Echo for some other request is ignored
        let unrelated = execute_request("plot()", &cell_uri(&kernel, 2));
        tracker
            .observe(
                kernel.as_ref(),
                &KernelEvent::IopubMessage(execute_input_for(&unrelated, 1)),
            )
            .await;
        assert!(!tracker.last_execution(URI).unwrap().started);

        tracker
            .observe(
                kernel.as_ref(),
                &KernelEvent::IopubMessage(execute_input_for(&request, 7)),
            )
            .await;
        assert!(tracker.last_execution(URI).unwrap().started);
        assert_eq!(memento.get(&record_key(URI)).unwrap(), persisted);
    }

    struct FailingMemento;

    #[async_trait]
    impl Memento for FailingMemento {
        fn get(&self, _key: &str) -> Option<Value> {
            None
        }

        fn keys(&self) -> Vec<String> {
            Vec::new()
        }

        async fn update(&self, _key: &str, _value: Value) -> Result<(), MementoError> {
            Err(MementoError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let tracker = ExecutionTracker::new(Arc::new(FailingMemento));
        let kernel = kernel(live("K1"), Some("K1"));

        let request = execute_request("train()", &cell_uri(&kernel, 0));
        tracker.observe(kernel.as_ref(), &sent(request)).await;

        assert_eq!(tracker.last_execution(URI).unwrap().record.cell_index, 0);
    }

    #[tokio::test]
    async fn test_monitoring_only_for_server_kernels_with_session() {
        let tracker = ExecutionTracker::new(Arc::new(InMemoryMemento::new()));

        assert!(!tracker.start_monitoring(kernel(local(), Some("K1"))));
        assert!(!tracker.start_monitoring(kernel(live("K1"), None)));
        assert!(!tracker.is_monitoring(URI));

        assert!(tracker.start_monitoring(kernel(live("K1"), Some("K1"))));
        assert!(tracker.is_monitoring(URI));
    }

    #[tokio::test]
    async fn test_monitoring_records_sent_executions() {
        let memento = Arc::new(InMemoryMemento::new());
        let tracker = ExecutionTracker::new(memento.clone());
        let kernel = kernel(live("K1"), Some("K1"));
        assert!(tracker.start_monitoring(kernel.clone()));

        let session = kernel.session().unwrap();
        let request = execute_request("train()", &cell_uri(&kernel, 1));
        session.send_shell_message(request, true).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while load_record(memento.as_ref(), URI).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("execution was not recorded");
        assert_eq!(load_record(memento.as_ref(), URI).unwrap().cell_index, 1);

        kernel.dispose();
        tokio::time::timeout(Duration::from_secs(2), async {
            while tracker.is_monitoring(URI) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("monitoring did not stop on dispose");
    }
}
