//! The fixed state-hook catalog.
//!
//! Every hook is async and dialog-mutating, resolved from a symbolic
//! name in configuration against [`StateHookKind`] at startup (see
//! `pipeline::registry`) rather than looked up dynamically per call --
//! the same "build the registry once, fail fast on unknown names"
//! posture the teacher codebase uses for its own plugin/tool tables.
//!
//! `add_human_utterance` is deliberately absent from this catalog: it is
//! applied directly at ingress by the agent loop, not dispatched through
//! a service response.

use chrono::{DateTime, Utc};
use serde_json::Value;

use parley_types::dialog::AnnotationTarget;
use parley_types::{Dialog, Hypothesis, Result};

use crate::storage::DialogRepository;

/// A service's response, shaped by its `response_formatter` into
/// whichever variant its state hook expects.
#[derive(Debug, Clone)]
pub enum FormattedResponse {
    /// A skill proposed one candidate response.
    Hypothesis(Hypothesis),
    /// A single annotation payload for `add_annotation`.
    Annotation(Value),
    /// Per-hypothesis annotation payloads, aligned by index, for
    /// `add_hypothesis_annotation_batch`.
    AnnotationBatch(Vec<Value>),
    /// The skill-selector's decision: which skill labels survive.
    Selection(Vec<String>),
    /// A finished hypothesis ready to become the bot's reply.
    BotReply(Hypothesis),
    /// No hook interpretation; carried through for diagnostics only.
    Raw(Value),
}

impl FormattedResponse {
    /// Skill labels kept by a selector response, if this is one.
    pub fn skill_names(&self) -> Option<&[String]> {
        match self {
            FormattedResponse::Selection(names) => Some(names),
            _ => None,
        }
    }
}

/// Symbolic identity of one entry in the state-hook catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateHookKind {
    /// Append a hypothesis to the last human utterance's candidate list.
    AddHypothesis,
    /// Set a single annotation, targeted per the service's declared
    /// [`AnnotationTarget`].
    AddAnnotation(AnnotationTarget),
    /// Set a batch of per-hypothesis annotations, aligned by index.
    AddHypothesisAnnotationBatch,
    /// Promote a hypothesis to the dialog's bot reply.
    AddBotUtterance,
    /// As [`StateHookKind::AddBotUtterance`], but only ever fires while
    /// the tail is still a human utterance (the `last_chance` path).
    AddBotUtteranceLastChance,
    /// As [`StateHookKind::AddBotUtteranceLastChance`], but overwrites
    /// an existing bot utterance instead of no-op'ing.
    AddBotUtteranceLastChanceOverwrite,
    /// Persist the dialog through the storage collaborator.
    SaveDialog,
}

/// Resolve a symbolic hook name from configuration against the fixed
/// catalog above. Unknown names are a startup error, not a runtime one.
pub fn resolve_state_hook(name: &str, target: AnnotationTarget) -> Option<StateHookKind> {
    match name {
        "add_hypothesis" => Some(StateHookKind::AddHypothesis),
        "add_annotation" => Some(StateHookKind::AddAnnotation(target)),
        "add_hypothesis_annotation_batch" => Some(StateHookKind::AddHypothesisAnnotationBatch),
        "add_bot_utterance" => Some(StateHookKind::AddBotUtterance),
        "add_bot_utterance_last_chance" => Some(StateHookKind::AddBotUtteranceLastChance),
        "add_bot_utterance_last_chance_overwrite" => {
            Some(StateHookKind::AddBotUtteranceLastChanceOverwrite)
        }
        "save_dialog" => Some(StateHookKind::SaveDialog),
        _ => None,
    }
}

/// Apply `hook` to `dialog` given the service's `formatted` response.
///
/// `label` names the annotation key (the service's configured label);
/// `ind` selects a hypothesis for hypothesis-targeted annotations.
/// Variant mismatches between `hook` and `formatted` (a misconfigured
/// pipeline pairing a hook with the wrong formatter) are silently
/// ignored rather than panicking -- the dialog is simply left
/// unmodified for that call, matching the "operational errors become
/// values, never panics" propagation policy.
pub async fn apply_state_hook(
    hook: StateHookKind,
    dialog: &mut Dialog,
    formatted: &FormattedResponse,
    label: &str,
    ind: Option<usize>,
    now: DateTime<Utc>,
    repository: &dyn DialogRepository,
) -> Result<()> {
    match hook {
        StateHookKind::AddHypothesis => {
            if let FormattedResponse::Hypothesis(h) = formatted {
                dialog.add_hypothesis(h.clone());
            }
        }
        StateHookKind::AddAnnotation(target) => {
            if let FormattedResponse::Annotation(payload) = formatted {
                dialog.add_annotation(label, payload.clone(), target, ind);
            }
        }
        StateHookKind::AddHypothesisAnnotationBatch => {
            if let FormattedResponse::AnnotationBatch(payloads) = formatted {
                dialog.add_hypothesis_annotation_batch(label, payloads.clone());
            }
        }
        StateHookKind::AddBotUtterance => {
            if let FormattedResponse::BotReply(h) = formatted {
                dialog.add_bot_utterance(h.clone(), now);
            }
        }
        StateHookKind::AddBotUtteranceLastChance => {
            if let FormattedResponse::BotReply(h) = formatted {
                dialog.add_bot_utterance_last_chance(h.clone(), now);
            }
        }
        StateHookKind::AddBotUtteranceLastChanceOverwrite => {
            if let FormattedResponse::BotReply(h) = formatted {
                dialog.add_bot_utterance_last_chance_overwrite(h.clone(), now);
            }
        }
        StateHookKind::SaveDialog => {
            repository.save_dialog(dialog).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::storage::InMemoryDialogRepository;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    #[tokio::test]
    async fn add_hypothesis_hook_appends_to_tail() {
        let repo = InMemoryDialogRepository::new();
        let mut dialog = Dialog::new("u1", "cmd");
        dialog.add_human_utterance("hi", now(), HashMap::new());
        let formatted = FormattedResponse::Hypothesis(Hypothesis::new("skill_x", "hello", 0.7));
        apply_state_hook(
            StateHookKind::AddHypothesis,
            &mut dialog,
            &formatted,
            "skill_x",
            None,
            now(),
            &repo,
        )
        .await
        .unwrap();
        match dialog.last_utterance().unwrap() {
            parley_types::Utterance::Human(h) => assert_eq!(h.hypotheses.len(), 1),
            _ => panic!("expected human utterance"),
        }
    }

    #[tokio::test]
    async fn add_bot_utterance_hook_promotes_reply() {
        let repo = InMemoryDialogRepository::new();
        let mut dialog = Dialog::new("u1", "cmd");
        dialog.add_human_utterance("hi", now(), HashMap::new());
        let formatted = FormattedResponse::BotReply(Hypothesis::new("skill_x", "hello", 0.9));
        apply_state_hook(
            StateHookKind::AddBotUtterance,
            &mut dialog,
            &formatted,
            "responder",
            None,
            now(),
            &repo,
        )
        .await
        .unwrap();
        assert!(!dialog.awaiting_reply());
    }

    #[tokio::test]
    async fn mismatched_variant_is_a_silent_noop() {
        let repo = InMemoryDialogRepository::new();
        let mut dialog = Dialog::new("u1", "cmd");
        dialog.add_human_utterance("hi", now(), HashMap::new());
        let formatted = FormattedResponse::Raw(Value::Null);
        apply_state_hook(
            StateHookKind::AddHypothesis,
            &mut dialog,
            &formatted,
            "skill_x",
            None,
            now(),
            &repo,
        )
        .await
        .unwrap();
        match dialog.last_utterance().unwrap() {
            parley_types::Utterance::Human(h) => assert!(h.hypotheses.is_empty()),
            _ => panic!("expected human utterance"),
        }
    }

    #[test]
    fn resolve_state_hook_rejects_unknown_name() {
        assert!(resolve_state_hook("not_a_hook", AnnotationTarget::LastUtterance).is_none());
    }
}
