//! The `service` process role's broker gateway: batches inbound
//! `service_task` envelopes and drives a local [`ServiceCaller`], per
//! the two-mutex batching algorithm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use parley_types::transport::{Envelope, ServiceResponse, ServiceTask};
use parley_types::OrchestratorError;

use crate::topology::{
    declare_and_bind, declare_exchanges, exchange_in, exchange_out, queue_service,
    routing_key_agent, routing_key_service_any, routing_key_service_instance,
};

/// A local inference implementation registered by the `service` process
/// role. `infer` receives the snapshot-and-cleared batch and must return
/// exactly one output per input, aligned by index.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn infer(&self, inputs: Vec<Value>) -> Result<Vec<Value>, String>;
}

struct PendingItem {
    task: ServiceTask,
    delivery: Delivery,
}

/// Consumes `ns_q_service_<service_name>`, accumulating `service_task`
/// envelopes into batches of `batch_size` and handing each full batch to
/// a [`ServiceCaller`].
///
/// `add_to_buffer_lock` is the buffer's own mutex: ordinarily released
/// immediately after an append, but held across the snapshot-and-clear
/// by whichever append happens to fill the batch, so no further message
/// can join a batch that has already been triggered. `infer_lock` is
/// held only for the duration of the inference call itself, guaranteeing
/// at most one batch in flight per instance.
pub struct ServiceGateway<C: ServiceCaller> {
    namespace: String,
    service_name: String,
    instance_id: String,
    batch_size: usize,
    timeout: Duration,
    in_channel: Channel,
    out_channel: Channel,
    caller: Arc<C>,
    buffer: AsyncMutex<Vec<PendingItem>>,
    infer_lock: AsyncMutex<()>,
}

impl<C: ServiceCaller + 'static> ServiceGateway<C> {
    pub fn new(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        batch_size: usize,
        timeout: Duration,
        in_channel: Channel,
        out_channel: Channel,
        caller: Arc<C>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            batch_size: batch_size.max(1),
            timeout,
            in_channel,
            out_channel,
            caller,
            buffer: AsyncMutex::new(Vec::new()),
            infer_lock: AsyncMutex::new(()),
        }
    }

    /// Declare this service's queue, set prefetch to `2 * batch_size`,
    /// and consume until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        declare_exchanges(&self.in_channel, &self.namespace).await?;

        let queue_name = queue_service(&self.namespace, &self.service_name);
        let exchange = exchange_out(&self.namespace);

        declare_and_bind(&self.in_channel, &queue_name, &exchange, &routing_key_service_any(&self.service_name))
            .await?;
        declare_and_bind(
            &self.in_channel,
            &queue_name,
            &exchange,
            &routing_key_service_instance(&self.service_name, &self.instance_id),
        )
        .await?;

        let prefetch = u16::try_from(2 * self.batch_size).unwrap_or(u16::MAX);
        self.in_channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        let consumer_tag = format!("{queue_name}-consumer");
        let mut consumer = self
            .in_channel
            .basic_consume(&queue_name, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { return Ok(()) };
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(e) => {
                            error!(error = %e, "error receiving service-queue delivery");
                            continue;
                        }
                    };

                    let task = match Envelope::from_json(&delivery.data) {
                        Ok(Envelope::ServiceTask(task)) => task,
                        Ok(_) => {
                            warn!("unexpected envelope variant on service queue, rejecting");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable envelope on service queue, rejecting");
                            let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                            continue;
                        }
                    };

                    self.clone().on_task(task, delivery).await;
                }
            }
        }
    }

    async fn on_task(self: Arc<Self>, task: ServiceTask, delivery: Delivery) {
        let mut buffer_guard = self.buffer.lock().await;
        buffer_guard.push(PendingItem { task, delivery });
        if buffer_guard.len() < self.batch_size {
            return;
        }

        let infer_guard = self.infer_lock.lock().await;
        let batch: Vec<PendingItem> = buffer_guard.drain(..).collect();
        drop(buffer_guard);

        self.run_batch(batch).await;
        drop(infer_guard);
    }

    async fn run_batch(&self, batch: Vec<PendingItem>) {
        if batch.is_empty() {
            return;
        }

        let inputs: Vec<Value> = batch.iter().map(|item| item.task.dialog_state.clone()).collect();
        let outcome = tokio::time::timeout(self.timeout, self.caller.infer(inputs)).await;

        match outcome {
            Err(_) => {
                warn!(service = %self.service_name, batch_len = batch.len(), "inference timed out, nacking batch for redelivery");
                for item in batch {
                    let _ = item
                        .delivery
                        .nack(BasicNackOptions { requeue: true, ..Default::default() })
                        .await;
                }
            }
            Ok(Err(message)) => {
                error!(service = %self.service_name, %message, "inference failed");
                for item in &batch {
                    self.publish_response(item, Value::Null, true).await;
                }
                for item in batch {
                    let _ = item.delivery.ack(BasicAckOptions::default()).await;
                }
            }
            Ok(Ok(outputs)) if outputs.len() == batch.len() => {
                for (item, output) in batch.iter().zip(outputs) {
                    self.publish_response(item, output, false).await;
                }
                for item in batch {
                    let _ = item.delivery.ack(BasicAckOptions::default()).await;
                }
            }
            Ok(Ok(outputs)) => {
                error!(
                    service = %self.service_name,
                    expected = batch.len(),
                    got = outputs.len(),
                    "inference returned a mismatched output count"
                );
                for item in &batch {
                    self.publish_response(item, Value::Null, true).await;
                }
                for item in batch {
                    let _ = item.delivery.ack(BasicAckOptions::default()).await;
                }
            }
        }
    }

    async fn publish_response(&self, item: &PendingItem, output: Value, error: bool) {
        let resp = ServiceResponse {
            agent_name: item.task.agent_name.clone(),
            task_uuid: item.task.task_uuid.clone(),
            service_name: self.service_name.clone(),
            service_instance_id: self.instance_id.clone(),
            partial_dialog_state: output,
            error,
        };
        let envelope = Envelope::ServiceResponse(resp);
        let body = match envelope.to_json() {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode service_response");
                return;
            }
        };

        let exchange = exchange_in(&self.namespace);
        let routing_key = routing_key_agent(&item.task.agent_name);
        if let Err(e) = self
            .out_channel
            .basic_publish(&exchange, &routing_key, BasicPublishOptions::default(), &body, Default::default())
            .await
        {
            error!(error = %e, "failed to publish service_response");
        }
    }
}
