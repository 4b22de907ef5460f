//! The dialog value type and its mutators.
//!
//! A faithful port of the conversation model the orchestrator core
//! operates on. The source this was ported from models dialogs,
//! utterances, and hypotheses as an ORM object graph with cyclic back
//! references; here a [`Dialog`] is a plain value with an append-only
//! utterance log, and every mutation goes through an explicit method on
//! `Dialog` rather than through attribute assignment on a persisted
//! object graph.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::DialogId;

/// One candidate bot response proposed by a skill for the current human
/// utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Name of the skill that proposed this hypothesis.
    pub skill_name: String,
    /// Candidate response text.
    pub text: String,
    /// Skill-reported confidence, used by `ConfidenceResponseSelector`.
    pub confidence: f32,
    /// Annotations attached to this hypothesis specifically (as opposed
    /// to the owning utterance), e.g. per-hypothesis classifier output.
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
}

impl Hypothesis {
    /// Create a new hypothesis with no annotations.
    pub fn new(skill_name: impl Into<String>, text: impl Into<String>, confidence: f32) -> Self {
        Self {
            skill_name: skill_name.into(),
            text: text.into(),
            confidence,
            annotations: HashMap::new(),
        }
    }
}

/// A human-authored turn awaiting a bot reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanUtterance {
    /// Stable utterance identifier, unique within the dialog.
    pub utt_id: u64,
    /// Raw utterance text.
    pub text: String,
    /// When the utterance was received.
    pub date_time: DateTime<Utc>,
    /// Service-label -> annotation value, populated by annotator services.
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
    /// Transient map of raw service responses, cleared as each is
    /// consumed by its state hook.
    #[serde(default)]
    pub service_responses: HashMap<String, Value>,
    /// Free-form per-utterance attributes supplied by the channel.
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
    /// Candidate bot responses proposed by skills, in dispatch order.
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
}

/// A bot-authored turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotUtterance {
    /// Stable utterance identifier, unique within the dialog.
    pub utt_id: u64,
    /// The hypothesis text before any response-formatter rewriting.
    pub orig_text: String,
    /// The final text sent to the channel.
    pub text: String,
    /// Name of the skill whose hypothesis was selected, if any.
    pub active_skill: Option<String>,
    /// Confidence carried over from the selected hypothesis.
    pub confidence: f32,
    /// When the utterance was produced.
    pub date_time: DateTime<Utc>,
    /// Service-label -> annotation value.
    #[serde(default)]
    pub annotations: HashMap<String, Value>,
    /// Transient map of raw service responses.
    #[serde(default)]
    pub service_responses: HashMap<String, Value>,
    /// Free-form per-utterance attributes.
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

/// One turn in a dialog: either awaiting a reply, or already replied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Utterance {
    /// A human turn.
    Human(HumanUtterance),
    /// A bot turn.
    Bot(BotUtterance),
}

impl Utterance {
    /// `true` if this is a [`Utterance::Human`] turn.
    pub fn is_human(&self) -> bool {
        matches!(self, Utterance::Human(_))
    }

    /// The utterance id, regardless of variant.
    pub fn utt_id(&self) -> u64 {
        match self {
            Utterance::Human(h) => h.utt_id,
            Utterance::Bot(b) => b.utt_id,
        }
    }

    fn annotations_mut(&mut self) -> &mut HashMap<String, Value> {
        match self {
            Utterance::Human(h) => &mut h.annotations,
            Utterance::Bot(b) => &mut b.annotations,
        }
    }

    fn service_responses_mut(&mut self) -> &mut HashMap<String, Value> {
        match self {
            Utterance::Human(h) => &mut h.service_responses,
            Utterance::Bot(b) => &mut b.service_responses,
        }
    }
}

/// Which part of the dialog an annotator's response is meant to land on.
///
/// Resolves the open question in the source about `add_service_responses`
/// merging into "the last received utterance of arbitrary type": instead
/// of inferring the target from the polarity of the last utterance, every
/// service descriptor declares its target explicitly via its tags, and
/// the state hook uses that declaration rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationTarget {
    /// Annotate the last utterance directly (annotators over the whole
    /// turn, e.g. a tokenizer).
    LastUtterance,
    /// Annotate a specific hypothesis of the last human utterance, by
    /// index (skill-scoped annotators, e.g. a per-hypothesis toxicity
    /// classifier).
    Hypothesis,
}

/// An append-only conversation log.
///
/// Invariants upheld by every mutator on this type:
/// - utterances are totally ordered by `utt_id` (monotonically
///   increasing, assigned by `Dialog` itself);
/// - the last utterance is either a [`Utterance::Human`] awaiting a bot
///   reply, or a [`Utterance::Bot`] reply to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    /// Stable dialog identifier.
    pub dialog_id: DialogId,
    /// Identifier of the user this dialog belongs to, scoped to a
    /// channel by the storage collaborator.
    pub external_user_id: String,
    /// Channel type this dialog is active on (e.g. `"telegram"`).
    pub channel_type: String,
    /// Ordered utterance log.
    pub utterances: Vec<Utterance>,
    next_utt_id: u64,
}

impl Dialog {
    /// Start a brand-new, empty dialog.
    pub fn new(external_user_id: impl Into<String>, channel_type: impl Into<String>) -> Self {
        Self {
            dialog_id: DialogId::new(),
            external_user_id: external_user_id.into(),
            channel_type: channel_type.into(),
            utterances: Vec::new(),
            next_utt_id: 0,
        }
    }

    /// The last utterance, if any.
    pub fn last_utterance(&self) -> Option<&Utterance> {
        self.utterances.last()
    }

    /// Mutable access to the last utterance, if any.
    pub fn last_utterance_mut(&mut self) -> Option<&mut Utterance> {
        self.utterances.last_mut()
    }

    /// `true` iff the dialog's tail is a human utterance awaiting a reply.
    pub fn awaiting_reply(&self) -> bool {
        matches!(self.last_utterance(), Some(Utterance::Human(_)))
    }

    fn alloc_utt_id(&mut self) -> u64 {
        let id = self.next_utt_id;
        self.next_utt_id += 1;
        id
    }

    /// Append a new human utterance (the `add_human_utterance` state
    /// hook). Returns the id assigned to it.
    pub fn add_human_utterance(
        &mut self,
        text: impl Into<String>,
        date_time: DateTime<Utc>,
        attributes: HashMap<String, Value>,
    ) -> u64 {
        let utt_id = self.alloc_utt_id();
        self.utterances.push(Utterance::Human(HumanUtterance {
            utt_id,
            text: text.into(),
            date_time,
            annotations: HashMap::new(),
            service_responses: HashMap::new(),
            attributes,
            hypotheses: Vec::new(),
        }));
        utt_id
    }

    /// Append hypotheses (one per parallel sub-task of a skill) to the
    /// last human utterance (the `add_hypothesis` state hook).
    ///
    /// No-op if the tail is not a human utterance (the skill's
    /// dependents were presumably already skipped, or the dialog moved
    /// on).
    pub fn add_hypothesis(&mut self, hypothesis: Hypothesis) {
        if let Some(Utterance::Human(h)) = self.last_utterance_mut() {
            h.hypotheses.push(hypothesis);
        }
    }

    /// Set `annotations[label] = payload` according to `target` (the
    /// `add_annotation` / `add_hypothesis_annotation` state hooks).
    ///
    /// `ind` selects the hypothesis when `target` is
    /// [`AnnotationTarget::Hypothesis`]; ignored otherwise.
    pub fn add_annotation(
        &mut self,
        label: &str,
        payload: Value,
        target: AnnotationTarget,
        ind: Option<usize>,
    ) {
        match target {
            AnnotationTarget::LastUtterance => {
                if let Some(u) = self.last_utterance_mut() {
                    u.annotations_mut().insert(label.to_owned(), payload);
                }
            }
            AnnotationTarget::Hypothesis => {
                if let Some(Utterance::Human(h)) = self.last_utterance_mut() {
                    if let Some(i) = ind {
                        if let Some(hyp) = h.hypotheses.get_mut(i) {
                            hyp.annotations.insert(label.to_owned(), payload);
                        }
                    }
                }
            }
        }
    }

    /// Annotate a batch of hypotheses aligned by index (the
    /// `add_hypothesis_annotation_batch` state hook).
    pub fn add_hypothesis_annotation_batch(&mut self, label: &str, payloads: Vec<Value>) {
        if let Some(Utterance::Human(h)) = self.last_utterance_mut() {
            for (hyp, payload) in h.hypotheses.iter_mut().zip(payloads) {
                hyp.annotations.insert(label.to_owned(), payload);
            }
        }
    }

    /// Record the raw response of `label` into the transient
    /// `service_responses` map of the last utterance.
    pub fn add_service_response(&mut self, label: &str, payload: Value) {
        if let Some(u) = self.last_utterance_mut() {
            u.service_responses_mut().insert(label.to_owned(), payload);
        }
    }

    /// Promote a hypothesis to a bot utterance (the `add_bot_utterance`
    /// state hook). Consumes the selected hypothesis from the last human
    /// utterance's hypothesis list.
    ///
    /// Returns `None` (and leaves the dialog untouched) if the tail is
    /// not a human utterance -- i.e. a bot reply was already produced
    /// for this turn.
    pub fn add_bot_utterance(
        &mut self,
        hypothesis: Hypothesis,
        date_time: DateTime<Utc>,
    ) -> Option<u64> {
        if !self.awaiting_reply() {
            return None;
        }
        let utt_id = self.alloc_utt_id();
        self.utterances.push(Utterance::Bot(BotUtterance {
            utt_id,
            orig_text: hypothesis.text.clone(),
            text: hypothesis.text,
            active_skill: Some(hypothesis.skill_name),
            confidence: hypothesis.confidence,
            date_time,
            annotations: hypothesis.annotations,
            service_responses: HashMap::new(),
            attributes: HashMap::new(),
        }));
        Some(utt_id)
    }

    /// Promote a hypothesis to a bot utterance only via the `last_chance`
    /// path: idempotent, and a no-op if the tail is already a bot
    /// utterance (i.e. the responder, or an earlier last-chance firing,
    /// already produced a reply).
    pub fn add_bot_utterance_last_chance(
        &mut self,
        hypothesis: Hypothesis,
        date_time: DateTime<Utc>,
    ) -> Option<u64> {
        self.add_bot_utterance(hypothesis, date_time)
    }

    /// As [`Self::add_bot_utterance_last_chance`], but overwrites an
    /// existing bot utterance at the tail instead of skipping.
    pub fn add_bot_utterance_last_chance_overwrite(
        &mut self,
        hypothesis: Hypothesis,
        date_time: DateTime<Utc>,
    ) -> u64 {
        if let Some(Utterance::Bot(b)) = self.last_utterance_mut() {
            b.orig_text = hypothesis.text.clone();
            b.text = hypothesis.text;
            b.active_skill = Some(hypothesis.skill_name);
            b.confidence = hypothesis.confidence;
            b.date_time = date_time;
            return b.utt_id;
        }
        let utt_id = self.alloc_utt_id();
        self.utterances.push(Utterance::Bot(BotUtterance {
            utt_id,
            orig_text: hypothesis.text.clone(),
            text: hypothesis.text,
            active_skill: Some(hypothesis.skill_name),
            confidence: hypothesis.confidence,
            date_time,
            annotations: hypothesis.annotations,
            service_responses: HashMap::new(),
            attributes: HashMap::new(),
        }));
        utt_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    #[test]
    fn fresh_dialog_has_no_utterances() {
        let d = Dialog::new("user1", "telegram");
        assert!(d.last_utterance().is_none());
        assert!(!d.awaiting_reply());
    }

    #[test]
    fn human_utterance_awaits_reply() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        assert!(d.awaiting_reply());
    }

    #[test]
    fn hypotheses_accumulate_on_human_tail() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        d.add_hypothesis(Hypothesis::new("skill_x", "hi", 0.8));
        d.add_hypothesis(Hypothesis::new("skill_y", "hey", 0.3));
        match d.last_utterance().unwrap() {
            Utterance::Human(h) => assert_eq!(h.hypotheses.len(), 2),
            _ => panic!("expected human utterance"),
        }
    }

    #[test]
    fn bot_utterance_promotion_consumes_turn() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        let hyp = Hypothesis::new("skill_x", "hi", 0.8);
        let id = d.add_bot_utterance(hyp, now());
        assert!(id.is_some());
        assert!(!d.awaiting_reply());
        match d.last_utterance().unwrap() {
            Utterance::Bot(b) => {
                assert_eq!(b.text, "hi");
                assert_eq!(b.active_skill.as_deref(), Some("skill_x"));
            }
            _ => panic!("expected bot utterance"),
        }
    }

    #[test]
    fn bot_utterance_promotion_is_noop_when_already_replied() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        d.add_bot_utterance(Hypothesis::new("skill_x", "hi", 0.8), now());
        let second = d.add_bot_utterance(Hypothesis::new("skill_y", "hey", 0.9), now());
        assert!(second.is_none());
        match d.last_utterance().unwrap() {
            Utterance::Bot(b) => assert_eq!(b.text, "hi"),
            _ => panic!("expected bot utterance"),
        }
    }

    #[test]
    fn last_chance_overwrite_replaces_existing_bot_utterance() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        d.add_bot_utterance(Hypothesis::new("skill_x", "hi", 0.8), now());
        d.add_bot_utterance_last_chance_overwrite(Hypothesis::new("fallback", "sorry", 0.0), now());
        match d.last_utterance().unwrap() {
            Utterance::Bot(b) => assert_eq!(b.text, "sorry"),
            _ => panic!("expected bot utterance"),
        }
    }

    #[test]
    fn annotation_targets_last_utterance() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        d.add_annotation(
            "tokenizer",
            serde_json::json!({"tokens": ["hello"]}),
            AnnotationTarget::LastUtterance,
            None,
        );
        match d.last_utterance().unwrap() {
            Utterance::Human(h) => assert!(h.annotations.contains_key("tokenizer")),
            _ => panic!("expected human utterance"),
        }
    }

    #[test]
    fn annotation_targets_hypothesis_by_index() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hello", now(), HashMap::new());
        d.add_hypothesis(Hypothesis::new("skill_x", "hi", 0.8));
        d.add_annotation(
            "toxicity",
            serde_json::json!(0.01),
            AnnotationTarget::Hypothesis,
            Some(0),
        );
        match d.last_utterance().unwrap() {
            Utterance::Human(h) => {
                assert!(h.hypotheses[0].annotations.contains_key("toxicity"));
            }
            _ => panic!("expected human utterance"),
        }
    }

    #[test]
    fn utt_ids_are_monotonic() {
        let mut d = Dialog::new("user1", "telegram");
        let a = d.add_human_utterance("hi", now(), HashMap::new());
        d.add_bot_utterance(Hypothesis::new("s", "r", 1.0), now());
        let b = d.add_human_utterance("again", now(), HashMap::new());
        assert!(b > a);
    }

    #[test]
    fn dialog_serde_roundtrip() {
        let mut d = Dialog::new("user1", "telegram");
        d.add_human_utterance("hi", now(), HashMap::new());
        let json = serde_json::to_string(&d).unwrap();
        let restored: Dialog = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.external_user_id, "user1");
        assert_eq!(restored.utterances.len(), 1);
    }
}
