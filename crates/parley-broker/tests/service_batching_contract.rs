//! Scenario 5 (broker batching) coverage that does not require a live
//! RabbitMQ broker.
//!
//! [`ServiceGateway`](parley_broker::ServiceGateway) hard-wires its
//! batching loop to a real `lapin::Channel` for consuming, acking, and
//! publishing -- there is no trait seam to substitute a stub transport,
//! so the full publish -> batch -> infer -> ack -> publish round trip
//! can only be driven against an actual broker. What IS exercised here,
//! against the crate's public API alone, is the contract the batching
//! algorithm depends on: a [`ServiceCaller`] must return exactly one
//! output per input, aligned by index, and the routing-key scheme the
//! service gateway and the agent-side [`BrokerConnector`] must agree on
//! to find each other.

use async_trait::async_trait;
use serde_json::{json, Value};

use parley_broker::topology::{exchange_out, routing_key_service_any, routing_key_service_instance};
use parley_broker::ServiceCaller;

/// Echoes each input back tagged with its position, the way a batching
/// inference backend would align outputs to a snapshot-and-cleared
/// buffer.
struct EchoBatchCaller;

#[async_trait]
impl ServiceCaller for EchoBatchCaller {
    async fn infer(&self, inputs: Vec<Value>) -> Result<Vec<Value>, String> {
        Ok(inputs
            .into_iter()
            .enumerate()
            .map(|(i, v)| json!({ "ind": i, "echo": v }))
            .collect())
    }
}

/// Always fails, as an inference backend would on an unrecoverable
/// batch-wide error.
struct FailingBatchCaller;

#[async_trait]
impl ServiceCaller for FailingBatchCaller {
    async fn infer(&self, _inputs: Vec<Value>) -> Result<Vec<Value>, String> {
        Err("backend unavailable".into())
    }
}

/// A batch of three near-simultaneous tasks must come back as three
/// outputs, aligned by the order they were submitted in -- the
/// invariant `ServiceGateway::run_batch` relies on before it zips
/// `batch.iter().zip(outputs)` to publish one `service_response` per
/// input task.
#[tokio::test]
async fn batch_caller_returns_one_aligned_output_per_input() {
    let caller = EchoBatchCaller;
    let batch = vec![json!({"text": "first"}), json!({"text": "second"}), json!({"text": "third"})];

    let outputs = caller.infer(batch.clone()).await.unwrap();

    assert_eq!(outputs.len(), batch.len());
    for (ind, output) in outputs.iter().enumerate() {
        assert_eq!(output["ind"], json!(ind));
        assert_eq!(output["echo"], batch[ind]);
    }
}

/// A backend-wide failure surfaces as a single `Err`, not a partial or
/// mismatched-length `Ok` -- `ServiceGateway::run_batch` treats this
/// case as "every item in the batch gets an error response", which only
/// makes sense if failures are reported for the whole batch at once.
#[tokio::test]
async fn failing_batch_caller_reports_a_single_whole_batch_error() {
    let caller = FailingBatchCaller;
    let batch = vec![json!({"text": "first"}), json!({"text": "second"})];

    let result = caller.infer(batch).await;
    assert_eq!(result.unwrap_err(), "backend unavailable");
}

/// The service gateway binds its queue to both the "any instance" and
/// "this instance" routing keys; `BrokerConnector::call` always
/// publishes to the "any instance" key, so for a task to ever reach a
/// running service instance, that instance's queue binding and the
/// connector's publish routing key must derive from the same topology
/// function for the same service name.
#[test]
fn connector_publish_key_matches_a_bound_service_instance_key() {
    let service_name = "skill_x";
    let publish_key = routing_key_service_any(service_name);
    let instance_binding = routing_key_service_instance(service_name, "instance-1");

    assert_eq!(publish_key, "service.skill_x.any");
    assert_eq!(instance_binding, "service.skill_x.instance.instance-1");
    assert_ne!(publish_key, instance_binding);

    let _ = exchange_out("ns");
}
