//! AMQP-style message broker transport for the parley dialog
//! orchestrator.
//!
//! Implements the broker topology, the three process-role gateways
//! (`agent`, `service`, `channel`), and a broker-backed [`Connector`](parley_core::connector::Connector)
//! that plugs into `parley-core`'s ordinary dispatch path. See
//! [`gateway`] for the per-role entry points and [`topology`] for the
//! exchange/queue/routing-key naming this crate and any compatible
//! out-of-process service implementation must agree on.

pub mod connection;
pub mod connector;
pub mod gateway;
pub mod topology;

pub use connector::{BrokerConnector, PendingResponses};
pub use gateway::{AgentGateway, ChannelGateway, ServiceCaller, ServiceGateway};
