//! A batching queue in front of one or more HTTP workers.
//!
//! [`Connector::call`] enqueues its payload and awaits a one-shot reply;
//! a pool of workers continuously drains up to `batch_size` queued
//! payloads, glues them into one request body (per-key list
//! concatenation, see [`parley_types::transport::glue_payloads`]), POSTs
//! to one of the configured worker URLs, and fans the JSON array
//! response back out element-wise. When the queue is empty a worker
//! polls again after 100 ms, matching the batching cadence described in
//! the specification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use parley_types::transport::glue_payloads;

use super::{Connector, ServiceOutcome};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct QueueItem {
    payload: Value,
    respond_to: oneshot::Sender<ServiceOutcome>,
}

/// Connector backed by an unbounded in-memory queue and a pool of
/// workers that batch-POST to one or more URLs, round-robined via the
/// shared queue.
pub struct BatchedHttpConnector {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl BatchedHttpConnector {
    /// Spawn `urls.len()` workers sharing one queue, each draining up to
    /// `batch_size` payloads per batch with a per-request `timeout`.
    pub fn new(urls: Vec<String>, batch_size: usize, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        for url in urls {
            let rx = rx.clone();
            tokio::spawn(worker_loop(url, batch_size, timeout, rx));
        }
        Self { tx }
    }
}

#[async_trait]
impl Connector for BatchedHttpConnector {
    async fn call(&self, payload: Value) -> ServiceOutcome {
        let (respond_to, response) = oneshot::channel();
        if self.tx.send(QueueItem { payload, respond_to }).is_err() {
            return ServiceOutcome::Err("batched http queue is closed".into());
        }
        match response.await {
            Ok(outcome) => outcome,
            Err(_) => ServiceOutcome::Err("batched http worker dropped before replying".into()),
        }
    }
}

async fn worker_loop(
    url: String,
    batch_size: usize,
    timeout: Duration,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>,
) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "batched http worker failed to build client, exiting");
            return;
        }
    };

    loop {
        let mut batch = Vec::with_capacity(batch_size);
        let mut disconnected = false;
        {
            let mut rx = rx.lock().await;
            while batch.len() < batch_size {
                match rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }

        if batch.is_empty() {
            if disconnected {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        let payloads: Vec<Value> = batch.iter().map(|item| item.payload.clone()).collect();
        let glued = glue_payloads(&payloads);

        match client.post(&url).json(&glued).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Vec<Value>>().await {
                Ok(results) if results.len() == batch.len() => {
                    for (item, result) in batch.into_iter().zip(results) {
                        let _ = item.respond_to.send(ServiceOutcome::Ok(result));
                    }
                }
                Ok(results) => {
                    warn!(
                        expected = batch.len(),
                        got = results.len(),
                        "batched http response length mismatch"
                    );
                    for item in batch {
                        let _ = item
                            .respond_to
                            .send(ServiceOutcome::Err("batch response length mismatch".into()));
                    }
                }
                Err(e) => {
                    for item in batch {
                        let _ = item.respond_to.send(ServiceOutcome::Err(e.to_string()));
                    }
                }
            },
            Ok(resp) => {
                let status = resp.status();
                for item in batch {
                    let _ = item
                        .respond_to
                        .send(ServiceOutcome::Err(format!("http {status}")));
                }
            }
            Err(e) => {
                for item in batch {
                    let _ = item.respond_to.send(ServiceOutcome::Err(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_closed_before_worker_starts_returns_err() {
        let (tx, rx) = mpsc::unbounded_channel::<QueueItem>();
        drop(rx);
        let connector = BatchedHttpConnector { tx };
        let outcome = connector.call(Value::Null).await;
        assert!(outcome.is_err());
    }
}
