//! A single pipeline node, fully resolved from configuration: its
//! connector, state hook, formatters, tags, and dependency edges.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use parley_types::config::ServiceTag;
use parley_types::Dialog;

use crate::connector::Connector;
use crate::hooks::{FormattedResponse, StateHookKind};

/// Produces the payload list for a service's dispatch from the current
/// dialog state (`dialog_formatter`, possibly chained after a
/// `workflow_formatter`).
pub type DialogFormatter = Arc<dyn Fn(&Dialog) -> Vec<Value> + Send + Sync>;

/// Turns a raw service response into a [`FormattedResponse`] the
/// matching state hook knows how to apply.
pub type ResponseFormatter = Arc<dyn Fn(&Value) -> FormattedResponse + Send + Sync>;

/// Produces workflow-scheduling context (e.g. the dialog id) as a JSON
/// object, merged into every payload `dialog_formatter` emits. Runs
/// first in the `workflow_formatter` then `dialog_formatter` chain
/// described in the specification's dispatch step.
pub type WorkflowFormatter = Arc<dyn Fn(&Dialog) -> Value + Send + Sync>;

/// A fully resolved pipeline node.
pub struct ServiceDescriptor {
    /// The service's name, unique within the pipeline -- also its map
    /// key in configuration.
    pub name: String,
    /// Human-readable label used for skill-selection matching and
    /// annotation keys.
    pub label: String,
    /// DAG role tags.
    pub tags: HashSet<ServiceTag>,
    /// How to reach this service.
    pub connector: Arc<dyn Connector>,
    /// State-mutation hook to run on this service's response, if any.
    pub state_hook: Option<StateHookKind>,
    /// Turns the dialog into this service's request payload list.
    pub dialog_formatter: Option<DialogFormatter>,
    /// Turns this service's raw response into its state hook's
    /// expected shape.
    pub response_formatter: Option<ResponseFormatter>,
    /// Produces workflow-scheduling context merged into every
    /// `dialog_formatter` payload, applied first in the dispatch chain.
    pub workflow_formatter: Option<WorkflowFormatter>,
    /// Soft predecessors (`done` or `skipped` suffices).
    pub previous: HashSet<String>,
    /// Hard predecessors (`done` is required).
    pub required_previous: HashSet<String>,
}

impl ServiceDescriptor {
    pub fn is_input(&self) -> bool {
        self.tags.contains(&ServiceTag::Input)
    }

    pub fn is_responder(&self) -> bool {
        self.tags.contains(&ServiceTag::Responder)
    }

    pub fn is_selector(&self) -> bool {
        self.tags.contains(&ServiceTag::Selector)
    }

    pub fn is_last_chance(&self) -> bool {
        self.tags.contains(&ServiceTag::LastChance)
    }

    pub fn is_timeout(&self) -> bool {
        self.tags.contains(&ServiceTag::Timeout)
    }

    /// Format a raw response, falling back to [`FormattedResponse::Raw`]
    /// when no formatter was configured (a diagnostic-only service).
    pub fn format_response(&self, raw: &Value) -> FormattedResponse {
        match &self.response_formatter {
            Some(f) => f(raw),
            None => FormattedResponse::Raw(raw.clone()),
        }
    }

    /// Produce this service's dispatch payloads from the dialog: apply
    /// `workflow_formatter` (if configured) to obtain a context object,
    /// then `dialog_formatter` (falling back to a single
    /// whole-dialog-as-JSON payload when unconfigured), merging the
    /// workflow context into every resulting object payload without
    /// clobbering keys the dialog formatter already set.
    pub fn format_dialog(&self, dialog: &Dialog) -> Vec<Value> {
        let payloads = match &self.dialog_formatter {
            Some(f) => f(dialog),
            None => vec![serde_json::to_value(dialog).unwrap_or(Value::Null)],
        };

        let Some(workflow_formatter) = &self.workflow_formatter else {
            return payloads;
        };
        let Value::Object(context) = workflow_formatter(dialog) else {
            return payloads;
        };

        payloads
            .into_iter()
            .map(|payload| match payload {
                Value::Object(mut obj) => {
                    for (k, v) in &context {
                        obj.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                    Value::Object(obj)
                }
                other => other,
            })
            .collect()
    }
}
