//! [`KernelConnection`]: a kernel handle presented as a full kernel
//! connection.
//!
//! The bridge owns no protocol state of its own. Identity comes from the
//! [`ConnectionOptions`] it was built with, status and events are read live
//! from the kernel, and every messaging operation is forwarded to the session
//! the kernel currently owns. Operations the wrapped kernel cannot perform
//! through this surface fail with [`BridgeError::NotImplemented`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use jupyter_protocol::{
    CommInfoRequest, CompleteRequest, DebugRequest, ExecuteRequest, HistoryRequest, InputReply,
    InspectRequest, IsCompleteRequest, JupyterMessage, KernelInfoReply, ReplyStatus,
};
use log::debug;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::events::{AnyMessage, ConnectionStatus, KernelEvent, KernelStatus};
use crate::kernel::Kernel;
use crate::metadata::KernelConnectionMetadata;
use crate::session::{
    CommTargetHandler, ConnectionOptions, KernelModel, KernelSession, MessageHook, ShellFuture,
};

/// Kernelspec as reported through a kernel connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSpecModel {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub argv: Vec<String>,
    pub resources: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl From<&KernelConnectionMetadata> for KernelSpecModel {
    fn from(metadata: &KernelConnectionMetadata) -> Self {
        match metadata {
            KernelConnectionMetadata::ConnectToLiveKernel { kernel_model, .. } => KernelSpecModel {
                name: kernel_model.name.clone(),
                display_name: metadata.display_name().to_string(),
                language: kernel_model.language.clone(),
                argv: Vec::new(),
                resources: HashMap::new(),
                metadata: None,
            },
            KernelConnectionMetadata::StartUsingLocalKernelSpec { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingPythonInterpreter { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { kernel_spec, .. } => {
                KernelSpecModel {
                    name: kernel_spec.name.clone(),
                    display_name: kernel_spec.display_name.clone(),
                    language: kernel_spec.language.clone(),
                    argv: kernel_spec.argv.clone(),
                    resources: HashMap::new(),
                    metadata: kernel_spec.metadata.clone(),
                }
            }
        }
    }
}

impl ConnectionOptions {
    /// Options for a kernel: the session's own when one is attached,
    /// otherwise derived from the connection metadata.
    pub fn for_kernel(kernel: &dyn Kernel) -> Self {
        if let Some(session) = kernel.session() {
            return session.options().clone();
        }
        let metadata = kernel.connection_metadata();
        let model_id = metadata
            .live_kernel()
            .map(|live| live.id.clone())
            .unwrap_or_else(|| metadata.id().to_string());
        ConnectionOptions {
            id: model_id.clone(),
            model: KernelModel {
                id: model_id,
                name: metadata.kernel_name().to_string(),
            },
            username: String::new(),
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

/// A kernel handle adapted to the kernel connection surface.
pub struct KernelConnection {
    kernel: Arc<dyn Kernel>,
    options: ConnectionOptions,
    handle_comms: bool,
}

impl KernelConnection {
    pub fn new(kernel: Arc<dyn Kernel>, options: ConnectionOptions) -> Self {
        Self {
            kernel,
            options,
            handle_comms: true,
        }
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn id(&self) -> &str {
        &self.options.id
    }

    pub fn name(&self) -> &str {
        &self.options.model.name
    }

    pub fn model(&self) -> &KernelModel {
        &self.options.model
    }

    pub fn username(&self) -> &str {
        &self.options.username
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    pub fn status(&self) -> KernelStatus {
        self.kernel.status()
    }

    /// Always `Connected`: the kernel handle owns reconnection.
    pub fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    /// Whether comm targets registered through this connection are honored.
    pub fn handle_comms(&self) -> bool {
        self.handle_comms
    }

    pub fn set_handle_comms(&mut self, handle_comms: bool) {
        self.handle_comms = handle_comms;
    }

    /// The kernel's last `kernel_info_reply`, once it reported success.
    pub async fn info(&self) -> Result<KernelInfoReply, BridgeError> {
        match self.kernel.info() {
            Some(info) if matches!(info.status, ReplyStatus::Ok) => Ok(info),
            _ => Err(BridgeError::NotReady),
        }
    }

    /// The kernelspec the kernel was started from (or is running).
    pub fn spec(&self) -> KernelSpecModel {
        KernelSpecModel::from(self.kernel.connection_metadata())
    }

    fn session(&self) -> Result<Arc<dyn KernelSession>, BridgeError> {
        self.kernel.session().ok_or(BridgeError::NoActiveSession)
    }

    pub async fn send_shell_message(
        &self,
        message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture, BridgeError> {
        Ok(self
            .session()?
            .send_shell_message(message, expect_reply)
            .await?)
    }

    pub async fn send_control_message(
        &self,
        message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture, BridgeError> {
        Ok(self
            .session()?
            .send_control_message(message, expect_reply)
            .await?)
    }

    pub async fn request_kernel_info(&self) -> Result<Option<JupyterMessage>, BridgeError> {
        Ok(self.session()?.request_kernel_info().await?)
    }

    pub async fn request_complete(
        &self,
        request: CompleteRequest,
    ) -> Result<JupyterMessage, BridgeError> {
        Ok(self.session()?.request_complete(request).await?)
    }

    pub async fn request_inspect(
        &self,
        request: InspectRequest,
    ) -> Result<JupyterMessage, BridgeError> {
        Ok(self.session()?.request_inspect(request).await?)
    }

    pub async fn request_execute(
        &self,
        request: ExecuteRequest,
        metadata: serde_json::Value,
    ) -> Result<ShellFuture, BridgeError> {
        Ok(self.session()?.request_execute(request, metadata).await?)
    }

    pub async fn request_debug(&self, request: DebugRequest) -> Result<ShellFuture, BridgeError> {
        Ok(self.session()?.request_debug(request).await?)
    }

    pub fn register_comm_target(
        &self,
        target_name: &str,
        handler: CommTargetHandler,
    ) -> Result<(), BridgeError> {
        let session = self.session()?;
        if !self.handle_comms {
            debug!("[bridge] Ignoring comm target {}: comms disabled", target_name);
            return Ok(());
        }
        session.register_comm_target(target_name, handler);
        Ok(())
    }

    pub fn remove_comm_target(&self, target_name: &str) -> Result<(), BridgeError> {
        self.session()?.remove_comm_target(target_name);
        Ok(())
    }

    pub fn register_message_hook(&self, msg_id: &str, hook: MessageHook) -> Result<(), BridgeError> {
        self.session()?.register_message_hook(msg_id, hook);
        Ok(())
    }

    pub fn remove_message_hook(&self, msg_id: &str, hook: &MessageHook) -> Result<(), BridgeError> {
        self.session()?.remove_message_hook(msg_id, hook);
        Ok(())
    }

    fn events<T, F>(&self, select: F) -> BoxStream<'static, T>
    where
        T: Send + 'static,
        F: Fn(KernelEvent) -> Option<T> + Send + 'static,
    {
        BroadcastStream::new(self.kernel.subscribe())
            .filter_map(move |res| futures::future::ready(res.ok().and_then(&select)))
            .boxed()
    }

    pub fn status_changed(&self) -> BoxStream<'static, KernelStatus> {
        self.events(|event| match event {
            KernelEvent::StatusChanged(status) => Some(status),
            _ => None,
        })
    }

    pub fn connection_status_changed(&self) -> BoxStream<'static, ConnectionStatus> {
        self.events(|event| match event {
            KernelEvent::ConnectionStatusChanged(status) => Some(status),
            _ => None,
        })
    }

    pub fn iopub_message(&self) -> BoxStream<'static, JupyterMessage> {
        self.events(|event| match event {
            KernelEvent::IopubMessage(message) => Some(message),
            _ => None,
        })
    }

    pub fn unhandled_message(&self) -> BoxStream<'static, JupyterMessage> {
        self.events(|event| match event {
            KernelEvent::UnhandledMessage(message) => Some(message),
            _ => None,
        })
    }

    pub fn any_message(&self) -> BoxStream<'static, AnyMessage> {
        self.events(|event| match event {
            KernelEvent::AnyMessage(any) => Some(any),
            _ => None,
        })
    }

    pub fn disposed(&self) -> BoxStream<'static, ()> {
        self.events(|event| match event {
            KernelEvent::Disposed => Some(()),
            _ => None,
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.kernel.is_disposed()
    }

    /// Dispose the underlying kernel. Does not wait for the session to close.
    pub fn dispose(&self) {
        self.kernel.dispose();
    }

    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("reconnect"))
    }

    pub async fn interrupt(&self) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("interrupt"))
    }

    pub async fn restart(&self) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("restart"))
    }

    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("shutdown"))
    }

    pub async fn request_history(
        &self,
        _request: HistoryRequest,
    ) -> Result<JupyterMessage, BridgeError> {
        Err(BridgeError::NotImplemented("request_history"))
    }

    pub async fn request_is_complete(
        &self,
        _request: IsCompleteRequest,
    ) -> Result<JupyterMessage, BridgeError> {
        Err(BridgeError::NotImplemented("request_is_complete"))
    }

    pub async fn request_comm_info(
        &self,
        _request: CommInfoRequest,
    ) -> Result<JupyterMessage, BridgeError> {
        Err(BridgeError::NotImplemented("request_comm_info"))
    }

    pub fn send_input_reply(&self, _reply: InputReply) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("send_input_reply"))
    }

    pub fn create_comm(&self, _target_name: &str, _comm_id: Option<&str>) -> Result<(), BridgeError> {
        Err(BridgeError::NotImplemented("create_comm"))
    }

    pub fn has_comm(&self, _comm_id: &str) -> Result<bool, BridgeError> {
        Err(BridgeError::NotImplemented("has_comm"))
    }

    pub fn clone_connection(&self) -> Result<KernelConnection, BridgeError> {
        Err(BridgeError::NotImplemented("clone_connection"))
    }
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnection")
            .field("options", &self.options)
            .field("status", &self.status())
            .field("handle_comms", &self.handle_comms)
            .finish()
    }
}
