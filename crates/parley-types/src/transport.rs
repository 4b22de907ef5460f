//! Wire envelopes exchanged on the broker (and, conceptually, between the
//! in-process dispatcher's equivalent call sites).
//!
//! Each envelope carries `msg_type` as its serde tag, per the wire
//! format in the specification. An unknown `msg_type` fails to
//! deserialize, which the gateway that receives it treats as a fatal
//! parse error for that message (the message is rejected, not retried).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialog::Dialog;
use crate::ids::{DialogId, TaskId};

/// A task dispatched from the agent to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceTask {
    /// Name of the agent that dispatched this task, used for reply
    /// routing back to the correct agent queue.
    pub agent_name: String,
    /// Globally unique task identifier.
    pub task_uuid: TaskId,
    /// The dialog id this task belongs to.
    pub dialog_id: DialogId,
    /// The payload produced by the service's `workflow_formatter` /
    /// `dialog_formatter` pair.
    pub dialog_state: Value,
}

/// A service's response to a previously dispatched [`ServiceTask`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// Name of the agent to route this response back to.
    pub agent_name: String,
    /// The `task_uuid` this response answers.
    pub task_uuid: TaskId,
    /// Name of the service that produced this response.
    pub service_name: String,
    /// Informational identifier of the specific service instance that
    /// handled the task (useful for diagnosing batching behavior).
    pub service_instance_id: String,
    /// The raw response payload, or an error payload -- the agent
    /// distinguishes the two via [`ServiceResponse::is_error`].
    pub partial_dialog_state: Value,
    /// Set when the service call failed; `partial_dialog_state` then
    /// carries a diagnostic payload instead of a usable response.
    #[serde(default)]
    pub error: bool,
}

impl ServiceResponse {
    /// `true` if this response represents a service-call error.
    pub fn is_error(&self) -> bool {
        self.error
    }
}

/// A bot reply flowing from the agent out to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToChannel {
    /// Name of the agent that produced this reply.
    pub agent_name: String,
    /// Target channel identifier.
    pub channel_id: String,
    /// Target user identifier within that channel.
    pub user_id: String,
    /// The bot's reply text.
    pub response: String,
}

/// A human utterance flowing from a channel in to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromChannel {
    /// Name of the agent this message is destined for.
    pub agent_name: String,
    /// Source channel identifier.
    pub channel_id: String,
    /// Source user identifier within that channel.
    pub user_id: String,
    /// Raw utterance text.
    pub utterance: String,
    /// Whether to close any existing active dialog before processing
    /// this utterance.
    #[serde(default)]
    pub reset_dialog: bool,
}

/// Discriminated union of every envelope exchanged on the broker.
///
/// Tagged by `msg_type`; each payload's fields are flattened alongside
/// the tag, matching the wire format described in the specification
/// (`{"msg_type": "service_task", "agent_name": ..., ...}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum Envelope {
    /// Agent -> service.
    ServiceTask(ServiceTask),
    /// Service -> agent.
    ServiceResponse(ServiceResponse),
    /// Agent -> channel.
    ToChannel(ToChannel),
    /// Channel -> agent.
    FromChannel(FromChannel),
}

impl Envelope {
    /// Parse a wire payload, returning a descriptive error (rather than
    /// panicking) on an unknown `msg_type` or malformed body -- the
    /// caller is responsible for treating this as a fatal parse error on
    /// the receiving gateway.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Serialize to the wire format.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// A payload glued from several others for batched-HTTP dispatch: the
/// per-key list concatenation of several `dialog_state` values, per the
/// batched-HTTP connector semantics. Exposed here (rather than buried in
/// `parley-core`) because both the core connector and any out-of-process
/// service implementation need the same gluing convention.
pub fn glue_payloads(payloads: &[Value]) -> Value {
    use serde_json::Map;

    let mut glued: Map<String, Value> = Map::new();
    for payload in payloads {
        let Value::Object(obj) = payload else {
            continue;
        };
        for (k, v) in obj {
            glued
                .entry(k.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(Value::Array(arr)) = glued.get_mut(k) {
                arr.push(v.clone());
            }
        }
    }
    Value::Object(glued)
}
