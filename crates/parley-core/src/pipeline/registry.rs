//! Resolves the symbolic names in a [`Config`] against a fixed,
//! in-process registry built once at startup, mirroring the teacher
//! codebase's pattern of constructing plugin/tool tables once at
//! bootstrap rather than doing dynamic attribute lookup per call.
//!
//! Connector names resolve to live [`Connector`] instances; state-hook,
//! dialog-formatter, and response-formatter names resolve to the fixed
//! catalog this module owns. Anything that fails to resolve is a
//! startup error (`OrchestratorError::UnresolvedName` /
//! `ConfigInvalid`), never a runtime one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use parley_types::config::{Config, ConnectorConfig, ConnectorRef, ServiceConfig, ServiceTag};
use parley_types::dialog::AnnotationTarget;
use parley_types::{Hypothesis, OrchestratorError, Result};

use crate::connector::batched_http::BatchedHttpConnector;
use crate::connector::direct_http::DirectHttpConnector;
use crate::connector::in_process::{ConfidenceResponseSelector, EventSetOutput, PredefinedText};
use crate::connector::Connector;
use crate::hooks::{resolve_state_hook, FormattedResponse, StateHookKind};

use super::descriptor::{DialogFormatter, ResponseFormatter, ServiceDescriptor, WorkflowFormatter};
use super::Pipeline;

/// Build the fully resolved [`Pipeline`] described by `config`.
///
/// Broker-backed connectors cannot be resolved here (see
/// [`resolve_connector`]); use
/// [`build_pipeline_with_broker`] from the `agent`/`service` process
/// roles, which supply the live broker connectors by service name.
pub fn build_pipeline(config: &Config) -> Result<Pipeline> {
    build_pipeline_with_broker(config, &HashMap::new())
}

/// Like [`build_pipeline`], but resolves any service tagged with a
/// `ConnectorConfig::Broker` connector against `broker_connectors`
/// (keyed by service name) instead of failing. `parley-broker` builds
/// this map from the same configuration document and passes it in.
pub fn build_pipeline_with_broker(
    config: &Config,
    broker_connectors: &HashMap<String, Arc<dyn Connector>>,
) -> Result<Pipeline> {
    let mut descriptors = Vec::with_capacity(config.services.len());

    for (name, service_cfg) in &config.services {
        if !service_cfg.is_enabled {
            continue;
        }
        descriptors.push(build_descriptor(name, service_cfg, config, broker_connectors)?);
    }

    Pipeline::new(descriptors)
}

fn build_descriptor(
    name: &str,
    cfg: &ServiceConfig,
    config: &Config,
    broker_connectors: &HashMap<String, Arc<dyn Connector>>,
) -> Result<ServiceDescriptor> {
    let connector = resolve_connector(name, &cfg.connector, config, broker_connectors)?;

    let annotation_target = cfg.annotation_target.unwrap_or(AnnotationTarget::LastUtterance);
    let mut state_hook = match &cfg.state_hook {
        Some(hook_name) => Some(
            resolve_state_hook(hook_name, annotation_target)
                .ok_or_else(|| OrchestratorError::UnresolvedName {
                    kind: "state_hook",
                    name: hook_name.clone(),
                })?,
        ),
        None => None,
    };

    // `overwrite_last_chance` / `overwrite_timeout` let an operator opt a
    // `last_chance` or `timeout` node into the overwriting mutator without
    // having to rename its `state_hook` in every pipeline definition.
    let wants_overwrite = (cfg.tags.contains(&ServiceTag::LastChance) && config.overwrite_last_chance)
        || (cfg.tags.contains(&ServiceTag::Timeout) && config.overwrite_timeout);
    if wants_overwrite && matches!(state_hook, Some(StateHookKind::AddBotUtteranceLastChance)) {
        state_hook = Some(StateHookKind::AddBotUtteranceLastChanceOverwrite);
    }

    let dialog_formatter = match &cfg.dialog_formatter {
        Some(formatter_name) => Some(resolve_dialog_formatter(formatter_name)?),
        None => None,
    };

    let response_formatter = match &cfg.response_formatter {
        Some(formatter_name) => Some(resolve_response_formatter(formatter_name)?),
        None => None,
    };

    let workflow_formatter = match &cfg.workflow_formatter {
        Some(formatter_name) => Some(resolve_workflow_formatter(formatter_name)?),
        None => None,
    };

    Ok(ServiceDescriptor {
        name: name.to_string(),
        label: cfg.label.clone().unwrap_or_else(|| name.to_string()),
        tags: cfg.tags.iter().cloned().collect(),
        connector,
        state_hook,
        dialog_formatter,
        response_formatter,
        workflow_formatter,
        previous: cfg.previous.iter().cloned().collect(),
        required_previous: cfg.required_previous.iter().cloned().collect(),
    })
}

fn resolve_connector(
    service_name: &str,
    connector_ref: &ConnectorRef,
    config: &Config,
    broker_connectors: &HashMap<String, Arc<dyn Connector>>,
) -> Result<Arc<dyn Connector>> {
    let resolved = match connector_ref {
        ConnectorRef::Inline(c) => c.clone(),
        ConnectorRef::Named(name) => config
            .connectors
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnresolvedName {
                kind: "connector",
                name: name.clone(),
            })?,
    };

    Ok(match resolved {
        ConnectorConfig::DirectHttp { url, timeout_sec } => {
            Arc::new(DirectHttpConnector::new(url, Duration::from_secs_f64(timeout_sec)))
        }
        ConnectorConfig::BatchedHttp {
            urls,
            batch_size,
            timeout_sec,
        } => Arc::new(BatchedHttpConnector::new(
            urls,
            batch_size,
            Duration::from_secs_f64(timeout_sec),
        )),
        ConnectorConfig::Broker { .. } => broker_connectors
            .get(service_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::ConfigInvalid {
                reason: format!(
                    "service {service_name:?} uses a broker connector but no live broker \
                     connector was supplied for it (parley-core alone cannot resolve \
                     broker-backed connectors -- build the pipeline via parley-broker)"
                ),
            })?,
        ConnectorConfig::InProcess { name } => resolve_in_process_connector(&name)?,
    })
}

fn resolve_in_process_connector(name: &str) -> Result<Arc<dyn Connector>> {
    match name {
        "confidence_response_selector" => Ok(Arc::new(ConfidenceResponseSelector)),
        "event_set_output" | "identity" => Ok(Arc::new(EventSetOutput)),
        other => {
            if let Some(text) = other.strip_prefix("predefined_text:") {
                return Ok(Arc::new(PredefinedText::new("fallback", text.to_string())));
            }
            Err(OrchestratorError::UnresolvedName {
                kind: "in_process_connector",
                name: other.to_string(),
            })
        }
    }
}

fn resolve_dialog_formatter(name: &str) -> Result<DialogFormatter> {
    match name {
        "whole_dialog" => Ok(Arc::new(|dialog: &parley_types::Dialog| {
            vec![serde_json::to_value(dialog).unwrap_or(Value::Null)]
        })),
        "last_utterance_text" => Ok(Arc::new(|dialog: &parley_types::Dialog| {
            let text = match dialog.last_utterance() {
                Some(parley_types::Utterance::Human(h)) => h.text.clone(),
                Some(parley_types::Utterance::Bot(b)) => b.text.clone(),
                None => String::new(),
            };
            vec![serde_json::json!({ "text": text })]
        })),
        "hypotheses" => Ok(Arc::new(|dialog: &parley_types::Dialog| {
            let hyps = match dialog.last_utterance() {
                Some(parley_types::Utterance::Human(h)) => h.hypotheses.clone(),
                _ => Vec::new(),
            };
            vec![serde_json::json!({ "hypotheses": hyps })]
        })),
        other => Err(OrchestratorError::UnresolvedName {
            kind: "dialog_formatter",
            name: other.to_string(),
        }),
    }
}

/// Workflow-scheduling context merged into every `dialog_formatter`
/// payload, per the dispatch step's `workflow_formatter` then
/// `dialog_formatter` chain.
fn resolve_workflow_formatter(name: &str) -> Result<WorkflowFormatter> {
    match name {
        "dialog_id" => Ok(Arc::new(|dialog: &parley_types::Dialog| {
            serde_json::json!({ "dialog_id": dialog.dialog_id.0 })
        })),
        "dialog_context" => Ok(Arc::new(|dialog: &parley_types::Dialog| {
            serde_json::json!({
                "dialog_id": dialog.dialog_id.0,
                "external_user_id": dialog.external_user_id,
            })
        })),
        other => Err(OrchestratorError::UnresolvedName {
            kind: "workflow_formatter",
            name: other.to_string(),
        }),
    }
}

fn resolve_response_formatter(name: &str) -> Result<ResponseFormatter> {
    match name {
        "to_hypothesis" => Ok(Arc::new(|raw: &Value| {
            match serde_json::from_value::<Hypothesis>(raw.clone()) {
                Ok(h) => FormattedResponse::Hypothesis(h),
                Err(_) => FormattedResponse::Raw(raw.clone()),
            }
        })),
        "to_bot_reply" => Ok(Arc::new(|raw: &Value| {
            let hyp = raw
                .get("hypotheses")
                .and_then(Value::as_array)
                .and_then(|arr| arr.first())
                .cloned()
                .unwrap_or_else(|| raw.clone());
            match serde_json::from_value::<Hypothesis>(hyp) {
                Ok(h) => FormattedResponse::BotReply(h),
                Err(_) => FormattedResponse::Raw(raw.clone()),
            }
        })),
        "to_selection" => Ok(Arc::new(|raw: &Value| {
            let names = raw
                .get("hypotheses")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(|h| h.get("skill_name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            FormattedResponse::Selection(names)
        })),
        "to_annotation" => Ok(Arc::new(|raw: &Value| FormattedResponse::Annotation(raw.clone()))),
        "raw" => Ok(Arc::new(|raw: &Value| FormattedResponse::Raw(raw.clone()))),
        other => Err(OrchestratorError::UnresolvedName {
            kind: "response_formatter",
            name: other.to_string(),
        }),
    }
}

/// Every connector/hook/formatter name this registry accepts, used by
/// configuration validation and `--dump-registry`-style tooling.
pub fn known_names() -> HashMap<&'static str, Vec<&'static str>> {
    let mut m = HashMap::new();
    m.insert(
        "state_hook",
        vec![
            "add_hypothesis",
            "add_annotation",
            "add_hypothesis_annotation_batch",
            "add_bot_utterance",
            "add_bot_utterance_last_chance",
            "add_bot_utterance_last_chance_overwrite",
            "save_dialog",
        ],
    );
    m.insert(
        "dialog_formatter",
        vec!["whole_dialog", "last_utterance_text", "hypotheses"],
    );
    m.insert(
        "response_formatter",
        vec!["to_hypothesis", "to_bot_reply", "to_selection", "to_annotation", "raw"],
    );
    m.insert("workflow_formatter", vec!["dialog_id", "dialog_context"]);
    m.insert(
        "in_process_connector",
        vec!["confidence_response_selector", "event_set_output", "identity"],
    );
    m
}
