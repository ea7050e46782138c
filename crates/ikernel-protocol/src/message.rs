//! Protocol message model.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde_json::{Value, json};
use uuid::Uuid;

/// An opaque key/value payload document.
pub type Payload = serde_json::Map<String, Value>;

/// Logical message path a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Bidirectional control channel.
    Control,
    /// Bidirectional shell channel.
    Shell,
    /// One-way broadcast channel.
    Output,
}

/// A decoded protocol message.
///
/// Immutable once decoded, apart from the channel association which is
/// assigned when the message is read from (or routed to) a socket.
#[derive(Debug, Clone)]
pub struct Message {
    /// Client routing token, retained from the first identity frame.
    pub identity: Option<Bytes>,
    /// Message header; carries `msg_id` and `msg_type`.
    pub header: Payload,
    /// Header of the request this message responds to, if any.
    pub parent_header: Payload,
    /// Opaque metadata document.
    pub metadata: Payload,
    /// Opaque content document.
    pub content: Payload,
    channel: Option<Channel>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn new_header(msg_type: &str) -> Payload {
    let mut header = Payload::new();
    header.insert("msg_id".into(), json!(Uuid::new_v4().to_string()));
    header.insert("msg_type".into(), json!(msg_type));
    header.insert("date".into(), json!(now()));
    header
}

impl Message {
    /// Create a message from its decoded parts.
    #[must_use]
    pub fn from_parts(
        identity: Option<Bytes>,
        header: Payload,
        parent_header: Payload,
        metadata: Payload,
        content: Payload,
    ) -> Self {
        Self {
            identity,
            header,
            parent_header,
            metadata,
            content,
            channel: None,
        }
    }

    /// The message type, read from the header.
    #[must_use]
    pub fn msg_type(&self) -> &str {
        self.header
            .get("msg_type")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// The channel this message is associated with.
    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    /// Associate the message with a channel.
    #[must_use]
    pub fn associate_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    fn reply(parent: &Message, msg_type: &str, content: Payload) -> Self {
        Self {
            identity: parent.identity.clone(),
            header: new_header(msg_type),
            parent_header: parent.header.clone(),
            metadata: Payload::new(),
            content,
            channel: None,
        }
    }

    /// Kernel status message (busy or idle), bound to the output channel.
    #[must_use]
    pub fn kernel_status(busy: bool) -> Self {
        let mut content = Payload::new();
        content.insert(
            "execution_state".into(),
            json!(if busy { "busy" } else { "idle" }),
        );
        Self {
            identity: None,
            header: new_header("status"),
            parent_header: Payload::new(),
            metadata: Payload::new(),
            content,
            channel: Some(Channel::Output),
        }
    }

    /// Stream output (stdout or stderr) tied to the originating request.
    #[must_use]
    pub fn stream(parent: &Message, name: &str, text: &str) -> Self {
        let mut content = Payload::new();
        content.insert("name".into(), json!(name));
        content.insert("text".into(), json!(text));
        Self::reply(parent, "stream", content).associate_channel(Channel::Output)
    }

    /// Successful execute reply carrying the execution counter.
    #[must_use]
    pub fn execute_success(parent: &Message, execution_count: u64) -> Self {
        let mut content = Payload::new();
        content.insert("status".into(), json!("ok"));
        content.insert("execution_count".into(), json!(execution_count));
        let mut message = Self::reply(parent, "execute_reply", content);
        message.metadata = parent.metadata.clone();
        message
    }

    /// Failed execute reply carrying diagnostic text.
    #[must_use]
    pub fn execute_error(parent: &Message, execution_count: u64, error: &str) -> Self {
        let mut content = Payload::new();
        content.insert("status".into(), json!("error"));
        content.insert("execution_count".into(), json!(execution_count));
        content.insert("ename".into(), json!("EvaluationError"));
        content.insert("evalue".into(), json!(error));
        content.insert(
            "traceback".into(),
            json!(error.lines().collect::<Vec<_>>()),
        );
        Self::reply(parent, "execute_reply", content)
    }

    /// Display data carrying a mime-type keyed rendering of a result.
    #[must_use]
    pub fn display_data(parent: &Message, data: &BTreeMap<String, String>) -> Self {
        let mut content = Payload::new();
        content.insert("data".into(), json!(data));
        content.insert("metadata".into(), json!({}));
        Self::reply(parent, "display_data", content).associate_channel(Channel::Output)
    }

    /// Reply to a kernel-info request.
    #[must_use]
    pub fn kernel_info_reply(parent: &Message) -> Self {
        let mut content = Payload::new();
        content.insert("protocol_version".into(), json!("5.0"));
        content.insert("implementation".into(), json!("ikernel"));
        content.insert(
            "implementation_version".into(),
            json!(env!("CARGO_PKG_VERSION")),
        );
        Self::reply(parent, "kernel_info_reply", content)
    }

    /// Reply to a shutdown request.
    #[must_use]
    pub fn shutdown_reply(parent: &Message, restart: bool) -> Self {
        let mut content = Payload::new();
        content.insert("restart".into(), json!(restart));
        Self::reply(parent, "shutdown_reply", content)
    }
}
