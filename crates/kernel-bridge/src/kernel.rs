//! The kernel handle bound to a notebook document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::Result;
use jupyter_protocol::{ExecutionState, JupyterMessage, JupyterMessageContent, KernelInfoReply};
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::events::{KernelEvent, KernelStatus, MessageDirection};
use crate::metadata::KernelConnectionMetadata;
use crate::notebook::{NotebookCell, NotebookDocument};
use crate::session::KernelSession;
use crate::EVENT_CHANNEL_CAPACITY;

/// A kernel bound to one notebook document.
///
/// Shared as `Arc<dyn Kernel>` between the connection bridge and the
/// execution tracker.
pub trait Kernel: Send + Sync {
    /// The protocol session, absent before the first connect and after
    /// disposal.
    fn session(&self) -> Option<Arc<dyn KernelSession>>;

    fn status(&self) -> KernelStatus;

    /// The last `kernel_info_reply` received from the kernel.
    fn info(&self) -> Option<KernelInfoReply>;

    fn notebook(&self) -> &Arc<NotebookDocument>;

    fn connection_metadata(&self) -> &KernelConnectionMetadata;

    /// Server-side id of the running kernel: the attached session's model
    /// id, else the live kernel named by the connection metadata.
    fn kernel_id(&self) -> Option<String> {
        self.session()
            .map(|session| session.options().model.id.clone())
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.connection_metadata()
                    .live_kernel()
                    .map(|live| live.id.clone())
            })
    }

    /// Subscribe to the kernel's event source.
    fn subscribe(&self) -> broadcast::Receiver<KernelEvent>;

    /// Resume tracking of an execution that was started by a previous
    /// front-end process. Messages produced by `execution_id` from now on are
    /// attributed to `cell`.
    fn resume_execution(&self, cell: &NotebookCell, execution_id: &str);

    fn is_disposed(&self) -> bool;

    /// Detach the session and mark the kernel dead. Idempotent.
    fn dispose(&self);
}

/// Shared mapping from msg_id → cell document URI.
type CellIdMap = Arc<StdMutex<HashMap<String, String>>>;

#[derive(Default)]
struct KernelState {
    status: KernelStatus,
    info: Option<KernelInfoReply>,
}

/// The concrete kernel handle.
///
/// Owns the attached session (if any) and re-publishes everything the session
/// observes on its own broadcast channel, so subscribers survive reconnects.
pub struct NotebookKernel {
    notebook: Arc<NotebookDocument>,
    metadata: KernelConnectionMetadata,
    session: StdMutex<Option<Arc<dyn KernelSession>>>,
    state: Arc<StdMutex<KernelState>>,
    cell_id_map: CellIdMap,
    events: broadcast::Sender<KernelEvent>,
    forward_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl NotebookKernel {
    pub fn new(notebook: Arc<NotebookDocument>, metadata: KernelConnectionMetadata) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            notebook,
            metadata,
            session: StdMutex::new(None),
            state: Arc::new(StdMutex::new(KernelState::default())),
            cell_id_map: Arc::new(StdMutex::new(HashMap::new())),
            events,
            forward_task: StdMutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Attach a connected session, replacing any previous one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach_session(&self, session: Arc<dyn KernelSession>) {
        // Subscribe before storing so nothing the session emits is missed
        let mut session_events = session.subscribe();
        let events = self.events.clone();
        let state = self.state.clone();
        let cell_id_map = self.cell_id_map.clone();

        let task = tokio::spawn(async move {
            loop {
                match session_events.recv().await {
                    Ok(event) => forward_event(event, &events, &state, &cell_id_map),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[kernel] Dropped {} session events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self
            .forward_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
        let model = session.options().model.clone();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        info!(
            "[kernel] Attached session for kernel {} to {}",
            model.id,
            self.notebook.uri()
        );
    }

    /// Detach the current session without disposing the kernel.
    pub fn detach_session(&self) -> Option<Arc<dyn KernelSession>> {
        if let Some(task) = self
            .forward_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Ask the kernel for its info and store the reply.
    pub async fn request_info(&self) -> Result<Option<KernelInfoReply>> {
        let session = self
            .session()
            .ok_or_else(|| anyhow::anyhow!("No kernel running"))?;
        let reply = session.request_kernel_info().await?;
        let info = reply.as_ref().and_then(info_reply);
        if let Some(info) = &info {
            self.set_info(info.clone());
        }
        Ok(info)
    }

    pub fn set_status(&self, status: KernelStatus) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status = status;
        let _ = self.events.send(KernelEvent::StatusChanged(status));
    }

    pub fn set_info(&self, info: KernelInfoReply) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).info = Some(info);
    }

    /// Cell document URI that messages of `msg_id` are attributed to.
    pub fn cell_for_message(&self, msg_id: &str) -> Option<String> {
        self.cell_id_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg_id)
            .cloned()
    }
}

impl Kernel for NotebookKernel {
    fn session(&self) -> Option<Arc<dyn KernelSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> KernelStatus {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).status
    }

    fn info(&self) -> Option<KernelInfoReply> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .info
            .clone()
    }

    fn notebook(&self) -> &Arc<NotebookDocument> {
        &self.notebook
    }

    fn connection_metadata(&self) -> &KernelConnectionMetadata {
        &self.metadata
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    fn resume_execution(&self, cell: &NotebookCell, execution_id: &str) {
        info!(
            "[kernel] Resuming execution {} for cell {} of {}",
            execution_id,
            cell.index,
            self.notebook.uri()
        );
        self.cell_id_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.to_string(), cell.document_uri.clone());
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.detach_session() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { session.close().await });
                }
                Err(_) => warn!("[kernel] Disposed outside a runtime; session not closed"),
            }
        }
        self.cell_id_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_status(KernelStatus::Dead);
        let _ = self.events.send(KernelEvent::Disposed);
        info!("[kernel] Disposed kernel for {}", self.notebook.uri());
    }
}

impl Drop for NotebookKernel {
    fn drop(&mut self) {
        if let Some(task) = self
            .forward_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

fn info_reply(message: &JupyterMessage) -> Option<KernelInfoReply> {
    match &message.content {
        JupyterMessageContent::KernelInfoReply(reply) => {
            let reply: &KernelInfoReply = reply;
            Some(reply.clone())
        }
        _ => None,
    }
}

fn is_idle_status(message: &JupyterMessage) -> bool {
    matches!(
        &message.content,
        JupyterMessageContent::Status(status) if status.execution_state == ExecutionState::Idle
    )
}

fn execute_request_cell(message: &JupyterMessage) -> Option<&str> {
    if message.header.msg_type != "execute_request" {
        return None;
    }
    message.metadata.get("cellId").and_then(|v| v.as_str())
}

/// Update kernel state from a session event and re-publish it.
fn forward_event(
    event: KernelEvent,
    events: &broadcast::Sender<KernelEvent>,
    state: &StdMutex<KernelState>,
    cell_id_map: &CellIdMap,
) {
    let mut cell_message = None;
    match &event {
        KernelEvent::StatusChanged(status) => {
            state.lock().unwrap_or_else(PoisonError::into_inner).status = *status;
        }
        KernelEvent::AnyMessage(any) => match any.direction {
            MessageDirection::Recv => {
                if let Some(info) = info_reply(&any.message) {
                    debug!("[kernel] Received kernel_info_reply");
                    state.lock().unwrap_or_else(PoisonError::into_inner).info = Some(info);
                }
            }
            MessageDirection::Send => {
                if let Some(cell_uri) = execute_request_cell(&any.message) {
                    cell_id_map
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(any.message.header.msg_id.clone(), cell_uri.to_string());
                }
            }
        },
        KernelEvent::IopubMessage(message) => {
            let cell_uri = message.parent_header.as_ref().and_then(|parent| {
                let mut cell_id_map = cell_id_map.lock().unwrap_or_else(PoisonError::into_inner);
                // Idle is the last message of a request; nothing follows it
                if is_idle_status(message) {
                    cell_id_map.remove(&parent.msg_id)
                } else {
                    cell_id_map.get(&parent.msg_id).cloned()
                }
            });
            if let Some(cell_uri) = cell_uri {
                cell_message = Some(KernelEvent::CellMessage {
                    cell_uri,
                    message: message.clone(),
                });
            }
        }
        _ => {}
    }

    let _ = events.send(event);
    if let Some(cell_message) = cell_message {
        let _ = events.send(cell_message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AnyMessage;
    use crate::metadata::LiveKernelModel;
    use crate::testing::{
        execute_request, kernel_info_reply_content, message_of_type, reply_to, RecordingSession,
    };
    use std::time::Duration;

    fn live_metadata(kernel_id: &str) -> KernelConnectionMetadata {
        KernelConnectionMetadata::ConnectToLiveKernel {
            id: format!("live-{kernel_id}"),
            kernel_model: LiveKernelModel {
                id: kernel_id.to_string(),
                name: "python3".to_string(),
                display_name: Some("Python 3".to_string()),
                language: Some("python".to_string()),
                last_activity: None,
                execution_state: None,
                connections: None,
            },
            base_url: "http://localhost:8888/".to_string(),
        }
    }

    fn kernel_with_session() -> (Arc<NotebookKernel>, Arc<RecordingSession>) {
        let notebook = Arc::new(NotebookDocument::with_cells(
            "file:///work/a.ipynb",
            ["import time", "time.sleep(60)"],
        ));
        let kernel = NotebookKernel::new(notebook, live_metadata("K1"));
        let session = RecordingSession::new("K1");
        kernel.attach_session(session.clone());
        (kernel, session)
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<KernelEvent>, f: F) -> KernelEvent
    where
        F: Fn(&KernelEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if f(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_status_follows_session() {
        let (kernel, session) = kernel_with_session();
        let mut rx = kernel.subscribe();
        assert_eq!(kernel.status(), KernelStatus::Unknown);

        session.emit(KernelEvent::StatusChanged(KernelStatus::Busy));
        next_matching(&mut rx, |e| matches!(e, KernelEvent::StatusChanged(_))).await;

        assert_eq!(kernel.status(), KernelStatus::Busy);
    }

    #[tokio::test]
    async fn test_kernel_info_reply_is_stored() {
        let (kernel, session) = kernel_with_session();
        let mut rx = kernel.subscribe();
        assert!(kernel.info().is_none());

        let request = message_of_type("kernel_info_request", serde_json::json!({}));
        session.emit(KernelEvent::AnyMessage(AnyMessage {
            direction: MessageDirection::Recv,
            message: reply_to(&request, "kernel_info_reply", kernel_info_reply_content()),
        }));
        next_matching(&mut rx, |e| matches!(e, KernelEvent::AnyMessage(_))).await;

        let info = kernel.info().unwrap();
        assert_eq!(info.language_info.name, "python");
    }

    #[tokio::test]
    async fn test_request_info_uses_session() {
        let (kernel, session) = kernel_with_session();
        session.reply_with(
            "kernel_info_request",
            "kernel_info_reply",
            kernel_info_reply_content(),
        );

        let info = kernel.request_info().await.unwrap().unwrap();
        assert_eq!(info.implementation, "ipython");
        assert!(kernel.info().is_some());
        assert_eq!(session.sent()[0].header.msg_type, "kernel_info_request");
    }

    #[tokio::test]
    async fn test_resumed_execution_output_is_tagged_with_cell() {
        let (kernel, session) = kernel_with_session();
        let mut rx = kernel.subscribe();
        let cell = kernel.notebook().cell_at(1).unwrap();

        // The execute_request was sent by a previous process
        let original = execute_request("time.sleep(60)", &cell.document_uri);
        kernel.resume_execution(&cell, &original.header.msg_id);
        assert_eq!(
            kernel.cell_for_message(&original.header.msg_id).as_deref(),
            Some(cell.document_uri.as_str())
        );

        let output = reply_to(
            &original,
            "stream",
            serde_json::json!({"name": "stdout", "text": "done\n"}),
        );
        session.emit(KernelEvent::IopubMessage(output));

        match next_matching(&mut rx, |e| matches!(e, KernelEvent::CellMessage { .. })).await {
            KernelEvent::CellMessage { cell_uri, message } => {
                assert_eq!(cell_uri, cell.document_uri);
                assert_eq!(message.header.msg_type, "stream");
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_outgoing_execute_request_registers_cell() {
        let (kernel, session) = kernel_with_session();
        let mut rx = kernel.subscribe();
        let cell = kernel.notebook().cell_at(0).unwrap();

        let request = execute_request("import time", &cell.document_uri);
        let msg_id = request.header.msg_id.clone();
        session.send_shell_message(request, false).await.unwrap();
        next_matching(&mut rx, |e| matches!(e, KernelEvent::AnyMessage(_))).await;

        assert_eq!(
            kernel.cell_for_message(&msg_id).as_deref(),
            Some(cell.document_uri.as_str())
        );
    }

    #[tokio::test]
    async fn test_idle_status_releases_cell_mapping() {
        let (kernel, session) = kernel_with_session();
        let mut rx = kernel.subscribe();
        let cell = kernel.notebook().cell_at(1).unwrap();

        let request = execute_request("time.sleep(60)", &cell.document_uri);
        let msg_id = request.header.msg_id.clone();
        session.send_shell_message(request.clone(), false).await.unwrap();
        next_matching(&mut rx, |e| matches!(e, KernelEvent::AnyMessage(_))).await;

        session.emit(KernelEvent::IopubMessage(reply_to(
            &request,
            "status",
            serde_json::json!({"execution_state": "busy"}),
        )));
        next_matching(&mut rx, |e| matches!(e, KernelEvent::CellMessage { .. })).await;
        assert!(kernel.cell_for_message(&msg_id).is_some());

        session.emit(KernelEvent::IopubMessage(reply_to(
            &request,
            "status",
            serde_json::json!({"execution_state": "idle"}),
        )));
        // The idle status itself is still attributed to the cell
        match next_matching(&mut rx, |e| matches!(e, KernelEvent::CellMessage { .. })).await {
            KernelEvent::CellMessage { cell_uri, .. } => assert_eq!(cell_uri, cell.document_uri),
            _ => unreachable!(),
        }
        assert!(kernel.cell_for_message(&msg_id).is_none());
    }

    #[tokio::test]
    async fn test_dispose_closes_session_and_emits() {
        let (kernel, session) = kernel_with_session();
        let mut rx = kernel.subscribe();

        kernel.dispose();
        kernel.dispose();

        assert!(kernel.is_disposed());
        assert!(kernel.session().is_none());
        assert_eq!(kernel.status(), KernelStatus::Dead);
        next_matching(&mut rx, |e| matches!(e, KernelEvent::Disposed)).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not closed");
    }

    #[tokio::test]
    async fn test_detach_keeps_kernel_alive() {
        let (kernel, _session) = kernel_with_session();
        assert!(kernel.detach_session().is_some());
        assert!(kernel.session().is_none());
        assert!(!kernel.is_disposed());
    }
}
