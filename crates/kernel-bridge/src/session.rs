//! Protocol-level sessions with a running kernel.
//!
//! [`KernelSession`] is the seam between the kernel handle and the wire. The
//! production implementation, [`RuntimeSession`], attaches to an
//! already-running kernel over ZeroMQ using the kernel's connection info; it
//! never spawns kernel processes.
//!
//! Every message the session writes is published as an
//! [`AnyMessage`] with [`MessageDirection::Send`] once the socket accepted it,
//! and every message it reads as [`MessageDirection::Recv`]. A failed write
//! publishes nothing, so observers such as the execution tracker never record
//! a request the kernel did not receive.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jupyter_protocol::{
    Channel, CompleteRequest, ConnectionInfo, DebugRequest, ExecuteRequest, InspectRequest,
    JupyterMessage, JupyterMessageContent, KernelInfoRequest,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex};
use uuid::Uuid;

use crate::events::{AnyMessage, ConnectionStatus, KernelEvent, KernelStatus, MessageDirection};
use crate::EVENT_CHANNEL_CAPACITY;

/// Hook run for IOPub messages whose parent is a given request.
///
/// Returning `false` stops processing: the message is not published as
/// [`KernelEvent::IopubMessage`].
pub type MessageHook = Arc<dyn Fn(&JupyterMessage) -> bool + Send + Sync>;

/// Handler invoked when the kernel opens a comm for a registered target.
pub type CommTargetHandler = Arc<dyn Fn(&JupyterMessage) + Send + Sync>;

/// Server-side model of the kernel a session is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
}

/// Identity of a kernel connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub id: String,
    pub model: KernelModel,
    pub username: String,
    pub client_id: String,
}

/// Pending request whose reply is routed back by parent `msg_id`.
pub struct ShellFuture {
    msg_id: String,
    reply: Option<oneshot::Receiver<JupyterMessage>>,
}

impl ShellFuture {
    pub fn new(msg_id: String, reply: Option<oneshot::Receiver<JupyterMessage>>) -> Self {
        Self { msg_id, reply }
    }

    /// `msg_id` of the request.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Wait for the reply. Resolves to `None` for requests sent without
    /// expecting one. Dropping the future abandons the wait.
    pub async fn reply(self) -> Result<Option<JupyterMessage>> {
        let ShellFuture { msg_id, reply } = self;
        match reply {
            Some(rx) => rx
                .await
                .map(Some)
                .map_err(|_| anyhow!("Reply channel closed for {}", msg_id)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ShellFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellFuture")
            .field("msg_id", &self.msg_id)
            .field("expects_reply", &self.expects_reply())
            .finish()
    }
}

/// An active protocol-level connection to a kernel.
#[async_trait]
pub trait KernelSession: Send + Sync {
    fn options(&self) -> &ConnectionOptions;

    /// Subscribe to everything this session observes.
    fn subscribe(&self) -> broadcast::Receiver<KernelEvent>;

    async fn send_shell_message(
        &self,
        message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture>;

    async fn send_control_message(
        &self,
        message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture>;

    fn register_comm_target(&self, target_name: &str, handler: CommTargetHandler);

    fn remove_comm_target(&self, target_name: &str);

    fn register_message_hook(&self, msg_id: &str, hook: MessageHook);

    /// Remove a hook previously registered for `msg_id` (compared by identity).
    fn remove_message_hook(&self, msg_id: &str, hook: &MessageHook);

    /// Tear down sockets and background tasks.
    async fn close(&self);

    async fn request_kernel_info(&self) -> Result<Option<JupyterMessage>> {
        let request: JupyterMessage = KernelInfoRequest::default().into();
        self.send_shell_message(request, true).await?.reply().await
    }

    async fn request_complete(&self, request: CompleteRequest) -> Result<JupyterMessage> {
        self.send_shell_message(request.into(), true)
            .await?
            .reply()
            .await?
            .ok_or_else(|| anyhow!("No complete_reply received"))
    }

    async fn request_inspect(&self, request: InspectRequest) -> Result<JupyterMessage> {
        self.send_shell_message(request.into(), true)
            .await?
            .reply()
            .await?
            .ok_or_else(|| anyhow!("No inspect_reply received"))
    }

    /// Send an `execute_request` with the given message metadata (this is
    /// where front-ends put the originating `cellId`).
    async fn request_execute(
        &self,
        request: ExecuteRequest,
        metadata: serde_json::Value,
    ) -> Result<ShellFuture> {
        let mut message: JupyterMessage = request.into();
        message.metadata = metadata;
        self.send_shell_message(message, true).await
    }

    async fn request_debug(&self, request: DebugRequest) -> Result<ShellFuture> {
        self.send_control_message(request.into(), true).await
    }
}

/// Pending replies: request msg_id -> sender for the reply.
type PendingReplies = Arc<StdMutex<HashMap<String, oneshot::Sender<JupyterMessage>>>>;
/// Message hooks: request msg_id -> hooks in registration order.
type MessageHooks = Arc<StdMutex<HashMap<String, Vec<MessageHook>>>>;
/// Comm targets: target_name -> handler.
type CommTargets = Arc<StdMutex<HashMap<String, CommTargetHandler>>>;

/// Session attached to a running kernel over ZeroMQ (via `runtimelib`).
pub struct RuntimeSession {
    options: ConnectionOptions,
    connection_info: ConnectionInfo,
    /// Session ID for Jupyter protocol
    session_id: String,
    events: broadcast::Sender<KernelEvent>,
    /// Shell writer; `None` once closed
    shell_writer: Mutex<Option<runtimelib::DealerSendConnection>>,
    pending: PendingReplies,
    hooks: MessageHooks,
    comm_targets: CommTargets,
    iopub_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    shell_reader_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RuntimeSession {
    /// Attach to the kernel described by a connection file.
    pub async fn from_connection_file(
        path: &Path,
        model: KernelModel,
        username: &str,
    ) -> Result<Arc<Self>> {
        let contents = tokio::fs::read_to_string(path).await?;
        let connection_info: ConnectionInfo = serde_json::from_str(&contents)?;
        Self::connect(connection_info, model, username).await
    }

    /// Attach to a running kernel: subscribe to IOPub, open the shell channel
    /// and spawn the reader tasks.
    pub async fn connect(
        connection_info: ConnectionInfo,
        model: KernelModel,
        username: &str,
    ) -> Result<Arc<Self>> {
        let session_id = Uuid::new_v4().to_string();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pending: PendingReplies = Arc::new(StdMutex::new(HashMap::new()));
        let hooks: MessageHooks = Arc::new(StdMutex::new(HashMap::new()));
        let comm_targets: CommTargets = Arc::new(StdMutex::new(HashMap::new()));

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id).await?;

        let identity = runtimelib::peer_identity_for_session(&session_id)?;
        let shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await?;
        let (shell_writer, mut shell_reader) = shell.split();

        let iopub_events = events.clone();
        let iopub_hooks = hooks.clone();
        let iopub_comm_targets = comm_targets.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        debug!(
                            "[session] iopub: type={} parent_msg_id={:?}",
                            message.header.msg_type,
                            message.parent_header.as_ref().map(|h| &h.msg_id)
                        );
                        dispatch_iopub(message, &iopub_events, &iopub_hooks, &iopub_comm_targets);
                    }
                    Err(e) => {
                        error!("[session] iopub read error: {}", e);
                        let _ = iopub_events.send(KernelEvent::ConnectionStatusChanged(
                            ConnectionStatus::Disconnected,
                        ));
                        break;
                    }
                }
            }
        });

        let shell_events = events.clone();
        let shell_pending = pending.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => dispatch_reply(message, &shell_events, &shell_pending),
                    Err(e) => {
                        error!("[session] shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        let session = Arc::new(Self {
            options: ConnectionOptions {
                id: model.id.clone(),
                model,
                username: username.to_string(),
                client_id: session_id.clone(),
            },
            connection_info,
            session_id,
            events,
            shell_writer: Mutex::new(Some(shell_writer)),
            pending,
            hooks,
            comm_targets,
            iopub_task: StdMutex::new(Some(iopub_task)),
            shell_reader_task: StdMutex::new(Some(shell_reader_task)),
        });

        let _ = session.events.send(KernelEvent::ConnectionStatusChanged(
            ConnectionStatus::Connected,
        ));
        info!(
            "[session] Attached to kernel {} ({})",
            session.options.model.id, session.options.model.name
        );
        Ok(session)
    }

    /// Register a pending reply for `msg_id` if one is expected.
    fn expect_reply(&self, msg_id: &str, expect_reply: bool) -> ShellFuture {
        if !expect_reply {
            return ShellFuture::new(msg_id.to_string(), None);
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id.to_string(), tx);
        ShellFuture::new(msg_id.to_string(), Some(rx))
    }

    fn forget_reply(&self, msg_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(msg_id);
    }

}

/// Publish `message` as sent if the write succeeded; pass the write result on.
pub(crate) fn publish_if_written<E>(
    events: &broadcast::Sender<KernelEvent>,
    message: JupyterMessage,
    written: std::result::Result<(), E>,
) -> std::result::Result<(), E> {
    match written {
        Ok(()) => {
            let _ = events.send(KernelEvent::AnyMessage(AnyMessage {
                direction: MessageDirection::Send,
                message,
            }));
            Ok(())
        }
        Err(e) => {
            warn!(
                "[session] Failed to send {} {}",
                message.header.msg_type, message.header.msg_id
            );
            Err(e)
        }
    }
}

#[async_trait]
impl KernelSession for RuntimeSession {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn send_shell_message(
        &self,
        mut message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture> {
        message.channel = Some(Channel::Shell);
        let msg_id = message.header.msg_id.clone();

        let mut writer = self.shell_writer.lock().await;
        let shell = writer
            .as_mut()
            .ok_or_else(|| anyhow!("Session is closed"))?;

        // Register before sending so a fast reply can't race the registration
        let future = self.expect_reply(&msg_id, expect_reply);

        debug!(
            "[session] shell send: type={} msg_id={}",
            message.header.msg_type, msg_id
        );
        let sent = message.clone();
        let written = shell.send(message).await;
        if written.is_err() {
            self.forget_reply(&msg_id);
        }
        publish_if_written(&self.events, sent, written)?;
        Ok(future)
    }

    async fn send_control_message(
        &self,
        mut message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture> {
        message.channel = Some(Channel::Control);
        let msg_id = message.header.msg_id.clone();

        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;

        debug!(
            "[session] control send: type={} msg_id={}",
            message.header.msg_type, msg_id
        );
        let sent = message.clone();
        let written = control.send(message).await;
        publish_if_written(&self.events, sent, written)?;

        if !expect_reply {
            return Ok(ShellFuture::new(msg_id, None));
        }

        let (tx, rx) = oneshot::channel();
        let events = self.events.clone();
        tokio::spawn(async move {
            match control.read().await {
                Ok(reply) => {
                    let _ = events.send(KernelEvent::AnyMessage(AnyMessage {
                        direction: MessageDirection::Recv,
                        message: reply.clone(),
                    }));
                    let _ = tx.send(reply);
                }
                Err(e) => warn!("[session] control read error: {}", e),
            }
        });
        Ok(ShellFuture::new(msg_id, Some(rx)))
    }

    fn register_comm_target(&self, target_name: &str, handler: CommTargetHandler) {
        self.comm_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_name.to_string(), handler);
    }

    fn remove_comm_target(&self, target_name: &str) {
        self.comm_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target_name);
    }

    fn register_message_hook(&self, msg_id: &str, hook: MessageHook) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(msg_id.to_string())
            .or_default()
            .push(hook);
    }

    fn remove_message_hook(&self, msg_id: &str, hook: &MessageHook) {
        remove_hook(&self.hooks, msg_id, hook);
    }

    async fn close(&self) {
        if let Some(task) = self
            .iopub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(task) = self
            .shell_reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shell_writer.lock().await.take();
        // Dropping the senders fails any outstanding ShellFuture
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let _ = self.events.send(KernelEvent::ConnectionStatusChanged(
            ConnectionStatus::Disconnected,
        ));
        info!("[session] Closed session for kernel {}", self.options.model.id);
    }
}

impl Drop for RuntimeSession {
    fn drop(&mut self) {
        for slot in [&self.iopub_task, &self.shell_reader_task] {
            if let Some(task) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }
}

/// Publish an IOPub message: status changes, comm opens for registered
/// targets, message hooks, then the message itself unless a hook vetoed it.
pub(crate) fn dispatch_iopub(
    message: JupyterMessage,
    events: &broadcast::Sender<KernelEvent>,
    hooks: &MessageHooks,
    comm_targets: &CommTargets,
) {
    let _ = events.send(KernelEvent::AnyMessage(AnyMessage {
        direction: MessageDirection::Recv,
        message: message.clone(),
    }));

    match &message.content {
        JupyterMessageContent::Status(status) => {
            let _ = events.send(KernelEvent::StatusChanged(KernelStatus::from(
                &status.execution_state,
            )));
        }
        JupyterMessageContent::CommOpen(open) => {
            let handler = comm_targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&open.target_name)
                .cloned();
            match handler {
                Some(handler) => handler(&message),
                None => debug!(
                    "[session] comm_open for unregistered target {}",
                    open.target_name
                ),
            }
        }
        _ => {}
    }

    let parent_hooks = message.parent_header.as_ref().and_then(|parent| {
        hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&parent.msg_id)
            .cloned()
    });
    if let Some(parent_hooks) = parent_hooks {
        // Run hooks outside the lock; a hook may remove itself
        if !parent_hooks.iter().all(|hook| hook(&message)) {
            return;
        }
    }

    let _ = events.send(KernelEvent::IopubMessage(message));
}

/// Route a shell/control reply to whoever is waiting on its parent `msg_id`.
pub(crate) fn dispatch_reply(
    message: JupyterMessage,
    events: &broadcast::Sender<KernelEvent>,
    pending: &PendingReplies,
) {
    let _ = events.send(KernelEvent::AnyMessage(AnyMessage {
        direction: MessageDirection::Recv,
        message: message.clone(),
    }));

    let waiter = message.parent_header.as_ref().and_then(|parent| {
        pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&parent.msg_id)
    });

    match waiter {
        Some(tx) => {
            if let Err(message) = tx.send(message) {
                debug!(
                    "[session] reply for abandoned request: type={}",
                    message.header.msg_type
                );
            }
        }
        None => {
            debug!(
                "[session] unhandled reply: type={}",
                message.header.msg_type
            );
            let _ = events.send(KernelEvent::UnhandledMessage(message));
        }
    }
}

pub(crate) fn remove_hook(hooks: &MessageHooks, msg_id: &str, hook: &MessageHook) {
    let mut hooks = hooks.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(registered) = hooks.get_mut(msg_id) {
        registered.retain(|h| !Arc::ptr_eq(h, hook));
        if registered.is_empty() {
            hooks.remove(msg_id);
        }
    }
}
