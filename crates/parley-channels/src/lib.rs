//! Channel plugin system for the parley dialog orchestrator.
//!
//! Each channel (stdio, webhook, and any future platform integration)
//! implements the [`Channel`] trait and is registered via a
//! [`ChannelFactory`]. The [`PluginHost`] manages channel lifecycle
//! (registration, start, stop) and routes outbound pushes to the
//! appropriate channel.
//!
//! # Architecture
//!
//! ```text
//! ChannelFactory ──build()──> Arc<dyn Channel>
//!                                 │
//!                     PluginHost.init_channel()
//!                                 │
//!                     PluginHost.start_channel()
//!                           │           │
//!                   CancellationToken   Arc<dyn ChannelHost>
//!                           │           │
//!                     Channel::start(host, cancel)
//! ```
//!
//! This crate depends only on `parley-types`, not `parley-core`: the
//! concrete [`ChannelHost`] implementation that wires channels to an
//! `AgentLoop` lives in the `parley-cli` binary crate.
//!
//! # Error handling
//!
//! Channel operations return [`ChannelError`](parley_types::error::ChannelError)
//! from `parley-types`. This crate re-exports it for convenience.

pub mod host;
pub mod stdio;
pub mod traits;
pub mod webhook;

pub use host::PluginHost;
pub use traits::*;

pub use parley_types::error::ChannelError;
