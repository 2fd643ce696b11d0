//! Test doubles for code built on top of kernel sessions.
//!
//! [`RecordingSession`] implements [`KernelSession`] without sockets: it
//! records what was sent, publishes the same `AnyMessage` events a real
//! session would, and answers requests from canned replies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use jupyter_protocol::{
    Channel, ExecuteRequest, Header, JupyterMessage, JupyterMessageContent, KernelInfoReply,
};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::events::{AnyMessage, KernelEvent, MessageDirection};
use crate::session::{
    remove_hook, CommTargetHandler, ConnectionOptions, KernelModel, KernelSession, MessageHook,
    ShellFuture,
};
use crate::EVENT_CHANNEL_CAPACITY;

fn header(msg_type: &str) -> Header {
    serde_json::from_value(serde_json::json!({
        "msg_id": Uuid::new_v4().to_string(),
        "username": "test",
        "session": "test-session",
        "date": "2026-01-01T00:00:00Z",
        "msg_type": msg_type,
        "version": "5.3",
    }))
    .expect("valid header")
}

/// Build a message of `msg_type` from raw JSON content.
pub fn message_of_type(msg_type: &str, content: serde_json::Value) -> JupyterMessage {
    let content = JupyterMessageContent::from_type_and_content(msg_type, content)
        .expect("valid content for message type");
    JupyterMessage {
        zmq_identities: Vec::new(),
        header: header(msg_type),
        parent_header: None,
        metadata: serde_json::json!({}),
        content,
        buffers: Vec::new(),
        channel: None,
    }
}

/// Build a message of `msg_type` whose parent is `request`.
pub fn reply_to(
    request: &JupyterMessage,
    msg_type: &str,
    content: serde_json::Value,
) -> JupyterMessage {
    let mut message = message_of_type(msg_type, content);
    message.parent_header = Some(request.header.clone());
    message
}

/// An `execute_request` tagged with the cell it came from, as front-ends
/// send it.
pub fn execute_request(code: &str, cell_uri: &str) -> JupyterMessage {
    let mut message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
    message.metadata = serde_json::json!({ "cellId": cell_uri });
    message.channel = Some(Channel::Shell);
    message
}

/// An `execute_input` echo for `request`.
pub fn execute_input_for(request: &JupyterMessage, execution_count: usize) -> JupyterMessage {
    reply_to(
        request,
        "execute_input",
        serde_json::json!({ "code": "", "execution_count": execution_count }),
    )
}

pub fn complete_reply_content() -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "matches": ["print"],
        "cursor_start": 0,
        "cursor_end": 2,
        "metadata": {},
    })
}

pub fn kernel_info_reply_content() -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "protocol_version": "5.3",
        "implementation": "ipython",
        "implementation_version": "8.0.0",
        "language_info": {
            "name": "python",
            "version": "3.12.0",
            "mimetype": "text/x-python",
            "file_extension": ".py",
        },
        "banner": "Python 3.12",
        "help_links": [],
        "debugger": false,
    })
}

/// A successful `kernel_info_reply`.
pub fn kernel_info_reply() -> KernelInfoReply {
    serde_json::from_value(kernel_info_reply_content()).expect("valid kernel_info_reply")
}

/// A session double that records traffic and replies from canned content.
pub struct RecordingSession {
    options: ConnectionOptions,
    events: broadcast::Sender<KernelEvent>,
    sent: Mutex<Vec<JupyterMessage>>,
    /// request msg_type -> (reply msg_type, reply content)
    replies: Mutex<HashMap<String, (String, serde_json::Value)>>,
    hooks: Arc<Mutex<HashMap<String, Vec<MessageHook>>>>,
    comm_targets: Mutex<HashMap<String, CommTargetHandler>>,
    closed: Mutex<bool>,
}

impl RecordingSession {
    /// A session attached to kernel `kernel_id`.
    pub fn new(kernel_id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            options: ConnectionOptions {
                id: kernel_id.to_string(),
                model: KernelModel {
                    id: kernel_id.to_string(),
                    name: "python3".to_string(),
                },
                username: "test".to_string(),
                client_id: Uuid::new_v4().to_string(),
            },
            events,
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            hooks: Arc::new(Mutex::new(HashMap::new())),
            comm_targets: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        })
    }

    /// Answer every future `request_type` message with a `reply_type`
    /// message carrying `content`.
    pub fn reply_with(&self, request_type: &str, reply_type: &str, content: serde_json::Value) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_type.to_string(), (reply_type.to_string(), content));
    }

    /// Publish an event as if it came off the wire.
    pub fn emit(&self, event: KernelEvent) {
        let _ = self.events.send(event);
    }

    /// Messages sent so far, in order.
    pub fn sent(&self) -> Vec<JupyterMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn hook_count(&self, msg_id: &str) -> usize {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(msg_id)
            .map_or(0, Vec::len)
    }

    pub fn has_comm_target(&self, target_name: &str) -> bool {
        self.comm_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(target_name)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, mut message: JupyterMessage, channel: Channel, expect_reply: bool) -> ShellFuture {
        message.channel = Some(channel);
        let msg_id = message.header.msg_id.clone();
        let _ = self.events.send(KernelEvent::AnyMessage(AnyMessage {
            direction: MessageDirection::Send,
            message: message.clone(),
        }));

        let canned = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.header.msg_type)
            .cloned();
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());

        if !expect_reply {
            return ShellFuture::new(msg_id, None);
        }
        let (tx, rx) = oneshot::channel();
        if let Some((reply_type, content)) = canned {
            let reply = reply_to(&message, &reply_type, content);
            let _ = self.events.send(KernelEvent::AnyMessage(AnyMessage {
                direction: MessageDirection::Recv,
                message: reply.clone(),
            }));
            let _ = tx.send(reply);
        }
        // Without a canned reply the sender is dropped and the future errors
        ShellFuture::new(msg_id, Some(rx))
    }
}

#[async_trait]
impl KernelSession for RecordingSession {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    async fn send_shell_message(
        &self,
        message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture> {
        Ok(self.record(message, Channel::Shell, expect_reply))
    }

    async fn send_control_message(
        &self,
        message: JupyterMessage,
        expect_reply: bool,
    ) -> Result<ShellFuture> {
        Ok(self.record(message, Channel::Control, expect_reply))
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
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}
