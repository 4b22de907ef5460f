//! Outbound call strategies for reaching a processing service.
//!
//! A [`Connector`] ships one payload to a service and resolves to a
//! [`ServiceOutcome`] -- never an `Err` that propagates across the
//! scheduler boundary. Per the failure semantics, every transport-level
//! problem (timeout, non-2xx, connection refused) is captured and
//! delivered as [`ServiceOutcome::Err`] instead.

pub mod batched_http;
pub mod direct_http;
pub mod in_process;

use async_trait::async_trait;
use serde_json::Value;

/// The result of one service call, delivered as a value rather than
/// raised as an error.
#[derive(Debug, Clone)]
pub enum ServiceOutcome {
    /// The service answered successfully.
    Ok(Value),
    /// The call failed; `message` is surfaced for diagnostics and the
    /// service's dependents are skipped by the agent loop.
    Err(String),
}

impl ServiceOutcome {
    /// `true` if this outcome represents a failure.
    pub fn is_err(&self) -> bool {
        matches!(self, ServiceOutcome::Err(_))
    }

    /// Borrow the success value, if this outcome is [`ServiceOutcome::Ok`].
    pub fn ok_value(&self) -> Option<&Value> {
        match self {
            ServiceOutcome::Ok(v) => Some(v),
            ServiceOutcome::Err(_) => None,
        }
    }
}

/// Ships a payload to a processing service and resolves to its
/// response.
///
/// Implementations must never let a network, timeout, or protocol error
/// escape as an `Err` from [`Connector::call`] -- convert it to
/// [`ServiceOutcome::Err`] instead, so the agent loop's task-join point
/// is infallible and errors are ordinary data.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Send `payload` to the service and await its response.
    async fn call(&self, payload: Value) -> ServiceOutcome;
}
