//! Broker-backed [`Connector`]: ships a `service_task` envelope and
//! resolves once the matching `service_response` arrives over the
//! broker, or the per-call timeout elapses.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use parley_core::connector::{Connector, ServiceOutcome};
use parley_types::transport::{Envelope, ServiceResponse, ServiceTask};
use parley_types::{DialogId, TaskId};

/// `service_task.dialog_id` is informational context for the remote
/// service only -- reply routing uses `agent_name` + `task_uuid`, not
/// `dialog_id` -- so it is recovered best-effort from whatever the
/// service's `dialog_formatter` put in the payload (e.g. `whole_dialog`
/// serializes the full `Dialog`, which carries its own id) rather than
/// threaded through [`Connector::call`], whose signature is shared with
/// every other connector kind.
fn dialog_id_from_payload(payload: &Value) -> DialogId {
    payload
        .get("dialog_id")
        .and_then(Value::as_str)
        .map(DialogId::from)
        .unwrap_or_else(DialogId::new)
}

use crate::topology::{exchange_out, routing_key_service_any};

/// Registry of in-flight broker calls awaiting a `service_response`,
/// keyed by `task_uuid`. The agent gateway's ingress loop resolves
/// these as `ServiceResponse` envelopes arrive; see
/// [`crate::gateway::agent::AgentGateway`].
#[derive(Default)]
pub struct PendingResponses {
    waiters: StdMutex<HashMap<TaskId, oneshot::Sender<ServiceResponse>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `task_id`, returning the receiving half.
    fn register(&self, task_id: TaskId) -> oneshot::Receiver<ServiceResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("pending-responses registry poisoned")
            .insert(task_id, tx);
        rx
    }

    /// Resolve the waiter for `resp.task_uuid`, if any is still
    /// outstanding (a late response after timeout is a silent no-op).
    pub fn resolve(&self, resp: ServiceResponse) {
        let waiter = self
            .waiters
            .lock()
            .expect("pending-responses registry poisoned")
            .remove(&resp.task_uuid);
        if let Some(tx) = waiter {
            let _ = tx.send(resp);
        } else {
            warn!(task_uuid = %resp.task_uuid.0, "service_response for unknown or expired task");
        }
    }

    /// Drop the waiter for `task_id` without resolving it (used when a
    /// call times out, so a late response is recognized as unknown
    /// rather than silently dropped on a no-longer-awaited sender).
    fn forget(&self, task_id: &TaskId) {
        self.waiters
            .lock()
            .expect("pending-responses registry poisoned")
            .remove(task_id);
    }
}

/// Ships `service_task` envelopes to `service_name` over the broker and
/// awaits the matching `service_response`.
pub struct BrokerConnector {
    namespace: String,
    agent_name: String,
    service_name: String,
    out_channel: Channel,
    pending: std::sync::Arc<PendingResponses>,
    timeout: Duration,
}

impl BrokerConnector {
    pub fn new(
        namespace: impl Into<String>,
        agent_name: impl Into<String>,
        service_name: impl Into<String>,
        out_channel: Channel,
        pending: std::sync::Arc<PendingResponses>,
        timeout: Duration,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            agent_name: agent_name.into(),
            service_name: service_name.into(),
            out_channel,
            pending,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for BrokerConnector {
    async fn call(&self, payload: Value) -> ServiceOutcome {
        let task_uuid = TaskId::new();
        let task = ServiceTask {
            agent_name: self.agent_name.clone(),
            task_uuid: task_uuid.clone(),
            dialog_id: dialog_id_from_payload(&payload),
            dialog_state: payload,
        };
        let envelope = Envelope::ServiceTask(task);
        let body = match envelope.to_json() {
            Ok(b) => b,
            Err(e) => return ServiceOutcome::Err(format!("failed to encode service_task: {e}")),
        };

        let rx = self.pending.register(task_uuid.clone());

        let exchange = exchange_out(&self.namespace);
        let routing_key = routing_key_service_any(&self.service_name);
        let props = BasicProperties::default().with_expiration(
            format!("{}", self.timeout.as_millis()).into(),
        );

        if let Err(e) = self
            .out_channel
            .basic_publish(&exchange, &routing_key, BasicPublishOptions::default(), &body, props)
            .await
        {
            self.pending.forget(&task_uuid);
            return ServiceOutcome::Err(format!("failed to publish service_task: {e}"));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) if resp.is_error() => ServiceOutcome::Err(format!(
                "service {} returned an error response",
                self.service_name
            )),
            Ok(Ok(resp)) => ServiceOutcome::Ok(resp.partial_dialog_state),
            Ok(Err(_)) => ServiceOutcome::Err("pending-response sender dropped".into()),
            Err(_) => {
                self.pending.forget(&task_uuid);
                ServiceOutcome::Err(format!("service {} timed out", self.service_name))
            }
        }
    }
}
