//! The three broker-facing gateways, one per process role described in
//! the specification's process model: `agent`, `service`, `channel`.

pub mod agent;
pub mod channel;
pub mod service;

pub use agent::AgentGateway;
pub use channel::ChannelGateway;
pub use service::{ServiceCaller, ServiceGateway};
