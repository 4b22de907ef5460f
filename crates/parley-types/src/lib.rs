//! Core data model for the parley dialog orchestrator.
//!
//! Defines the [`dialog`] value types (dialog, utterances, hypotheses), the
//! [`transport`] envelopes exchanged between the agent, services, and
//! channels, the declarative [`config`] schema, and the shared [`error`]
//! types used across every other `parley-*` crate.

pub mod config;
pub mod dialog;
pub mod error;
pub mod ids;
pub mod transport;

pub use dialog::{BotUtterance, Dialog, HumanUtterance, Hypothesis, Utterance};
pub use error::{ChannelError, OrchestratorError, Result};
pub use ids::{DialogId, TaskId};
