//! Declarative configuration schema.
//!
//! Mirrors the shape described in the specification: a broker endpoint,
//! a set of named connectors, and a set of named pipeline services that
//! reference those connectors plus symbolic state-hook and formatter
//! names. All structs accept both `snake_case` and `camelCase` field
//! names via `#[serde(alias = ...)]`, and unknown fields are ignored for
//! forward compatibility, matching the conventions the rest of the
//! ecosystem uses for its own config schemas.
//!
//! This module only describes the *shape* of the document; resolving
//! symbolic names against the startup registry and rejecting an invalid
//! pipeline DAG is `parley_core::pipeline::registry`'s job.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dialog::AnnotationTarget;

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker connection settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Named, reusable connector definitions.
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,

    /// Pipeline services, keyed by service name.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,

    /// Default per-workflow response deadline.
    #[serde(default = "default_response_timeout_sec", alias = "responseTimeoutSec")]
    pub response_timeout_sec: f64,

    /// When `true`, a later-firing `last_chance` overwrites an
    /// already-produced bot utterance instead of being ignored.
    #[serde(default, alias = "overwriteLastChance")]
    pub overwrite_last_chance: bool,

    /// When `true`, a `timeout` firing overwrites an already-produced
    /// bot utterance instead of being ignored.
    #[serde(default, alias = "overwriteTimeout")]
    pub overwrite_timeout: bool,

    /// Logical name of this agent, used for broker reply routing
    /// (`agent.<name>` routing keys).
    #[serde(default = "default_agent_name", alias = "agentName")]
    pub agent_name: String,
}

fn default_response_timeout_sec() -> f64 {
    5.0
}

fn default_agent_name() -> String {
    "agent".into()
}

/// Broker connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// AMQP host.
    #[serde(default = "default_broker_host")]
    pub host: String,
    /// AMQP port.
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// AMQP login.
    #[serde(default = "default_broker_login")]
    pub login: String,
    /// AMQP password.
    #[serde(default = "default_broker_password")]
    pub password: String,
    /// AMQP virtual host.
    #[serde(default = "default_broker_vhost", alias = "virtualhost")]
    pub virtual_host: String,
    /// Connection-level timeout in seconds.
    #[serde(default = "default_broker_timeout", alias = "timeoutSec")]
    pub timeout_sec: f64,
}

fn default_broker_host() -> String {
    "localhost".into()
}
fn default_broker_port() -> u16 {
    5672
}
fn default_broker_login() -> String {
    "guest".into()
}
fn default_broker_password() -> String {
    "guest".into()
}
fn default_broker_vhost() -> String {
    "/".into()
}
fn default_broker_timeout() -> f64 {
    30.0
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            login: default_broker_login(),
            password: default_broker_password(),
            virtual_host: default_broker_vhost(),
            timeout_sec: default_broker_timeout(),
        }
    }
}

/// One of the connector strategies described in the specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorConfig {
    /// One HTTP POST per payload.
    DirectHttp {
        /// Target URL.
        url: String,
        /// Total request timeout, in seconds.
        #[serde(default = "default_http_timeout", alias = "timeoutSec")]
        timeout_sec: f64,
    },
    /// A batching queue in front of one or more HTTP workers.
    BatchedHttp {
        /// Worker URLs, load-balanced round-robin.
        urls: Vec<String>,
        /// Maximum batch size before a worker drains the queue early.
        #[serde(default = "default_batch_size", alias = "batchSize")]
        batch_size: usize,
        /// Total request timeout, in seconds.
        #[serde(default = "default_http_timeout", alias = "timeoutSec")]
        timeout_sec: f64,
    },
    /// Dispatch via the message broker.
    Broker {
        /// Number of service instances expected to compete for tasks
        /// (informational; used to size batching prefetch on the
        /// service side).
        #[serde(default = "default_instances")]
        instances: usize,
    },
    /// One of the fixed in-process closures (`confidence_response_selector`,
    /// `predefined_text`, `event_set_output`), by symbolic name.
    InProcess {
        /// Symbolic name resolved against the startup registry.
        name: String,
    },
}

fn default_http_timeout() -> f64 {
    2.0
}
fn default_batch_size() -> usize {
    8
}
fn default_instances() -> usize {
    1
}

/// Tag applied to a pipeline service, controlling its role in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTag {
    /// The sole ingress node; receives the raw human utterance.
    Input,
    /// The sole terminal node; firing it completes the workflow.
    Responder,
    /// A service whose response prunes the set of downstream services.
    Selector,
    /// Fires when the pipeline dead-ends without a bot utterance.
    LastChance,
    /// Fires when the workflow's deadline elapses.
    Timeout,
}

/// One node in the pipeline DAG, as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Human-readable label used for skill-selection matching and
    /// annotation keys; defaults to the service's map key if omitted.
    #[serde(default)]
    pub label: Option<String>,

    /// Connector used to reach this service: either an inline
    /// definition or a reference into the top-level `connectors` map
    /// (resolved by the registry, not by this schema).
    pub connector: ConnectorRef,

    /// Symbolic name of the state-mutation hook to invoke with this
    /// service's response, resolved against the fixed hook catalog.
    #[serde(default, alias = "stateHook")]
    pub state_hook: Option<String>,

    /// Symbolic name of the dialog formatter (dialog -> request payload
    /// list).
    #[serde(default, alias = "dialogFormatter")]
    pub dialog_formatter: Option<String>,

    /// Symbolic name of the response formatter (raw response -> typed
    /// response).
    #[serde(default, alias = "responseFormatter")]
    pub response_formatter: Option<String>,

    /// Symbolic name of the workflow formatter (workflow context ->
    /// request payload list, applied before `dialog_formatter`).
    #[serde(default, alias = "workflowFormatter")]
    pub workflow_formatter: Option<String>,

    /// Where an `add_annotation`-family state hook should write its
    /// result; resolves the port's annotation-target open question.
    /// Defaults to [`AnnotationTarget::LastUtterance`] when omitted.
    #[serde(default, alias = "annotationTarget")]
    pub annotation_target: Option<AnnotationTarget>,

    /// DAG role tags.
    #[serde(default)]
    pub tags: Vec<ServiceTag>,

    /// Soft predecessors: must be `done` or `skipped` before this
    /// service is runnable.
    #[serde(default)]
    pub previous: Vec<String>,

    /// Hard predecessors: must be `done` before this service is
    /// runnable (skipping them also skips this service).
    #[serde(default, alias = "requiredPrevious")]
    pub required_previous: Vec<String>,

    /// Whether this service participates in the pipeline at all.
    #[serde(default = "default_true", alias = "isEnabled")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A connector reference: either a name into the top-level `connectors`
/// map, or an inline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectorRef {
    /// Reference by name.
    Named(String),
    /// Inline connector definition.
    Inline(ConnectorConfig),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.response_timeout_sec, 5.0);
        assert!(!cfg.overwrite_last_chance);
        assert_eq!(cfg.agent_name, "agent");
    }

    #[test]
    fn service_config_accepts_camel_case_aliases() {
        let json = serde_json::json!({
            "connector": "http_a",
            "stateHook": "add_annotation",
            "requiredPrevious": ["input"],
            "tags": ["selector"]
        });
        let cfg: ServiceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.state_hook.as_deref(), Some("add_annotation"));
        assert_eq!(cfg.required_previous, vec!["input".to_string()]);
        assert_eq!(cfg.tags, vec![ServiceTag::Selector]);
    }

    #[test]
    fn connector_ref_accepts_named_or_inline() {
        let named: ConnectorRef = serde_json::from_value(serde_json::json!("shared")).unwrap();
        assert!(matches!(named, ConnectorRef::Named(n) if n == "shared"));

        let inline: ConnectorRef = serde_json::from_value(serde_json::json!({
            "kind": "direct_http",
            "url": "http://svc/infer"
        }))
        .unwrap();
        assert!(matches!(inline, ConnectorRef::Inline(ConnectorConfig::DirectHttp { .. })));
    }

    #[test]
    fn full_config_roundtrip() {
        let json = serde_json::json!({
            "broker": {"host": "rabbit", "port": 5672},
            "connectors": {
                "http_a": {"kind": "direct_http", "url": "http://a/infer"}
            },
            "services": {
                "input": {"connector": {"kind": "in_process", "name": "identity"}, "tags": ["input"]},
                "responder": {"connector": {"kind": "in_process", "name": "event_set_output"}, "tags": ["responder"], "previous": ["input"]}
            },
            "response_timeout_sec": 3.5
        });
        let cfg: Config = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.broker.host, "rabbit");
        assert_eq!(cfg.services.len(), 2);
        assert_eq!(cfg.response_timeout_sec, 3.5);
    }
}
