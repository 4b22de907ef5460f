//! End-to-end integration tests against stub connectors and the
//! in-memory dialog repository, one per scenario: happy path, selector
//! pruning, service failure, deadline, and dialog reset. Each test
//! drives the whole stack through [`AgentLoop::register_msg`] the way a
//! channel front-end would, never reaching into workflow/pipeline
//! internals.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use parley_core::agent::AgentLoop;
use parley_core::connector::in_process::{ConfidenceResponseSelector, EventSetOutput, PredefinedText};
use parley_core::connector::{Connector, ServiceOutcome};
use parley_core::hooks::{resolve_state_hook, FormattedResponse};
use parley_core::pipeline::descriptor::{DialogFormatter, ResponseFormatter};
use parley_core::pipeline::{Pipeline, ServiceDescriptor};
use parley_core::storage::{DialogRepository, InMemoryDialogRepository};
use parley_types::config::ServiceTag;
use parley_types::dialog::AnnotationTarget;
use parley_types::{Dialog, Hypothesis, Utterance};

/// Answers with a fixed hypothesis, counting how many times it was
/// called.
struct StubSkill {
    skill_name: &'static str,
    text: &'static str,
    confidence: f32,
    calls: Arc<AtomicUsize>,
}

impl StubSkill {
    fn new(skill_name: &'static str, text: &'static str, confidence: f32) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                skill_name,
                text,
                confidence,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Connector for StubSkill {
    async fn call(&self, _payload: Value) -> ServiceOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ServiceOutcome::Ok(json!({
            "skill_name": self.skill_name,
            "text": self.text,
            "confidence": self.confidence,
        }))
    }
}

/// Always answers with a service failure, never reaching the network.
struct FailingSkill {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for FailingSkill {
    async fn call(&self, _payload: Value) -> ServiceOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ServiceOutcome::Err("upstream unavailable".into())
    }
}

/// Never answers -- used to exercise the deadline path, where the
/// in-flight call is aborted rather than awaited to completion.
struct HangingSkill;

#[async_trait]
impl Connector for HangingSkill {
    async fn call(&self, _payload: Value) -> ServiceOutcome {
        std::future::pending::<()>().await;
        unreachable!("deadline must abort this call before it resolves")
    }
}

fn skill_response_formatter() -> ResponseFormatter {
    Arc::new(|raw: &Value| match serde_json::from_value::<Hypothesis>(raw.clone()) {
        Ok(h) => FormattedResponse::Hypothesis(h),
        Err(_) => FormattedResponse::Raw(raw.clone()),
    })
}

fn responder_dialog_formatter() -> DialogFormatter {
    Arc::new(|dialog: &Dialog| {
        let hyps: Vec<Hypothesis> = match dialog.last_utterance() {
            Some(Utterance::Human(h)) => h.hypotheses.clone(),
            _ => Vec::new(),
        };
        vec![json!({ "hypotheses": hyps })]
    })
}

fn responder_response_formatter() -> ResponseFormatter {
    Arc::new(|raw: &Value| {
        let hyp = raw
            .get("hypotheses")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null);
        match serde_json::from_value::<Hypothesis>(hyp) {
            Ok(h) => FormattedResponse::BotReply(h),
            Err(_) => FormattedResponse::Raw(raw.clone()),
        }
    })
}

fn input_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        name: "input".into(),
        label: "input".into(),
        tags: [ServiceTag::Input].into_iter().collect(),
        connector: Arc::new(EventSetOutput),
        state_hook: None,
        dialog_formatter: None,
        response_formatter: None,
        workflow_formatter: None,
        previous: HashSet::new(),
        required_previous: HashSet::new(),
    }
}

fn skill_descriptor(name: &str, connector: Arc<dyn Connector>, previous: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.into(),
        label: name.into(),
        tags: HashSet::new(),
        connector,
        state_hook: resolve_state_hook("add_hypothesis", AnnotationTarget::LastUtterance),
        dialog_formatter: None,
        response_formatter: Some(skill_response_formatter()),
        workflow_formatter: None,
        previous: previous.iter().map(|s| s.to_string()).collect(),
        required_previous: HashSet::new(),
    }
}

fn responder_descriptor(previous: &[&str]) -> ServiceDescriptor {
    ServiceDescriptor {
        name: "responder".into(),
        label: "responder".into(),
        tags: [ServiceTag::Responder].into_iter().collect(),
        connector: Arc::new(EventSetOutput),
        state_hook: resolve_state_hook("add_bot_utterance", AnnotationTarget::LastUtterance),
        dialog_formatter: Some(responder_dialog_formatter()),
        response_formatter: Some(responder_response_formatter()),
        workflow_formatter: None,
        previous: previous.iter().map(|s| s.to_string()).collect(),
        required_previous: HashSet::new(),
    }
}

/// The `timeout` service is only ever reached through the agent loop's
/// synthetic completion at `fire_deadline`, which calls `process` with
/// a bare `ServiceOutcome::Ok(Value::Null)` rather than invoking a
/// connector -- so its `response_formatter` must produce the fallback
/// reply from nothing, and its `required_previous` must name a service
/// that can never complete on its own (here, the hanging skill), so the
/// ordinary `dispatch_next` resolution never schedules it through its
/// (unused) connector before a deadline actually fires.
fn timeout_descriptor(gated_on: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        name: "timeout".into(),
        label: "timeout".into(),
        tags: [ServiceTag::Timeout].into_iter().collect(),
        connector: Arc::new(PredefinedText::new("timeout", "sorry, that took too long")),
        state_hook: resolve_state_hook("add_bot_utterance_last_chance", AnnotationTarget::LastUtterance),
        dialog_formatter: None,
        response_formatter: Some(Arc::new(|_raw: &Value| {
            FormattedResponse::BotReply(Hypothesis::new("timeout", "sorry, that took too long", 0.0))
        })),
        workflow_formatter: None,
        previous: HashSet::new(),
        required_previous: [gated_on.to_string()].into_iter().collect(),
    }
}

/// Scenario 1: happy path -- a single skill answers, the responder
/// promotes its hypothesis to a bot reply, and `register_msg` returns
/// the finished dialog.
#[tokio::test]
async fn happy_path_returns_bot_reply_and_flushes_workflow() {
    let (skill, calls) = StubSkill::new("chitchat", "hi there", 0.9);
    let pipeline = Pipeline::new(vec![
        input_descriptor(),
        skill_descriptor("skill_x", Arc::new(skill), &["input"]),
        responder_descriptor(&["skill_x"]),
    ])
    .unwrap();

    let repo: Arc<dyn DialogRepository> = Arc::new(InMemoryDialogRepository::new());
    let agent = AgentLoop::new(pipeline, repo, Duration::from_secs(2));

    let result = agent
        .register_msg(
            "hello".into(),
            "user1".into(),
            "cmd".into(),
            "chan1".into(),
            true,
            None,
            HashMap::new(),
            false,
        )
        .await
        .unwrap();

    let dialog = result.expect("require_response=true must return a dialog snapshot");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!dialog.awaiting_reply());
    match dialog.last_utterance().unwrap() {
        Utterance::Bot(b) => assert_eq!(b.text, "hi there"),
        _ => panic!("expected a bot utterance"),
    }
}

/// Scenario 2: selector pruning -- a selector runs between input and
/// two competing skills and keeps only one of them by name; the pruned
/// skill never gets dispatched, and the kept skill's hypothesis reaches
/// the responder.
#[tokio::test]
async fn selector_prunes_the_unselected_skill_before_it_runs() {
    let (kept_skill, kept_calls) = StubSkill::new("weather", "it's sunny", 0.4);
    let (pruned_skill, pruned_calls) = StubSkill::new("chitchat", "hi", 0.9);

    let selector = ServiceDescriptor {
        name: "selector".into(),
        label: "selector".into(),
        tags: [ServiceTag::Selector].into_iter().collect(),
        connector: Arc::new(ConfidenceResponseSelector),
        state_hook: None,
        dialog_formatter: Some(Arc::new(|_: &Dialog| {
            vec![json!({
                "hypotheses": [
                    {"skill_name": "weather", "text": "placeholder", "confidence": 1.0},
                ]
            })]
        })),
        response_formatter: Some(Arc::new(|raw: &Value| {
            let names: Vec<String> = raw
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
        workflow_formatter: None,
        previous: ["input".to_string()].into_iter().collect(),
        required_previous: HashSet::new(),
    };

    let pipeline = Pipeline::new(vec![
        input_descriptor(),
        selector,
        skill_descriptor("weather", Arc::new(kept_skill), &["selector"]),
        skill_descriptor("chitchat", Arc::new(pruned_skill), &["selector"]),
        responder_descriptor(&["weather", "chitchat"]),
    ])
    .unwrap();

    let repo: Arc<dyn DialogRepository> = Arc::new(InMemoryDialogRepository::new());
    let agent = AgentLoop::new(pipeline, repo, Duration::from_secs(2));

    let result = agent
        .register_msg(
            "what's the weather".into(),
            "user1".into(),
            "cmd".into(),
            "chan1".into(),
            true,
            None,
            HashMap::new(),
            false,
        )
        .await
        .unwrap();

    let dialog = result.expect("expected a flushed dialog");
    assert_eq!(kept_calls.load(Ordering::SeqCst), 1, "selector-kept skill must run");
    assert_eq!(pruned_calls.load(Ordering::SeqCst), 0, "pruned skill must never be dispatched");
    match dialog.last_utterance().unwrap() {
        Utterance::Bot(b) => assert_eq!(b.text, "it's sunny"),
        _ => panic!("expected a bot utterance"),
    }
}

/// Scenario 3: service failure -- a failing skill's error skips its own
/// dependent (a downstream node that only that skill feeds), while a
/// sibling branch the failure never touches still reaches the
/// responder with its hypothesis.
#[tokio::test]
async fn failing_skill_skips_its_dependent_while_sibling_branch_still_wins() {
    let failing_calls = Arc::new(AtomicUsize::new(0));
    let failing = FailingSkill {
        calls: failing_calls.clone(),
    };
    let (downstream_of_failure, downstream_calls) = StubSkill::new("never_reached", "n/a", 1.0);
    let (surviving, surviving_calls) = StubSkill::new("backup", "here's a fallback answer", 0.5);

    let pipeline = Pipeline::new(vec![
        input_descriptor(),
        skill_descriptor("skill_fails", Arc::new(failing), &["input"]),
        skill_descriptor("downstream_of_failure", Arc::new(downstream_of_failure), &["skill_fails"]),
        skill_descriptor("skill_backup", Arc::new(surviving), &["input"]),
        responder_descriptor(&["skill_backup"]),
    ])
    .unwrap();

    let repo: Arc<dyn DialogRepository> = Arc::new(InMemoryDialogRepository::new());
    let agent = AgentLoop::new(pipeline, repo, Duration::from_secs(2));

    let result = agent
        .register_msg(
            "hello".into(),
            "user1".into(),
            "cmd".into(),
            "chan1".into(),
            true,
            None,
            HashMap::new(),
            false,
        )
        .await
        .unwrap();

    let dialog = result.expect("expected a flushed dialog despite one skill failing");
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        downstream_calls.load(Ordering::SeqCst),
        0,
        "the failed skill's dependent must be skipped, never dispatched"
    );
    assert_eq!(surviving_calls.load(Ordering::SeqCst), 1);
    match dialog.last_utterance().unwrap() {
        Utterance::Bot(b) => assert_eq!(b.text, "here's a fallback answer"),
        _ => panic!("expected a bot utterance"),
    }
}

/// Scenario 4: deadline -- a skill that never answers is aborted once
/// the deadline elapses, the synthetic `timeout` service's fallback
/// becomes the bot reply, and `register_msg` returns instead of hanging
/// forever. This is the regression test for the deadline/`expired`
/// deadlock: before the fix, `add_task` rejected the synthetic timeout
/// task once `expired` was set, and this test would never complete.
#[tokio::test]
async fn deadline_unblocks_the_responder_instead_of_hanging() {
    let pipeline = Pipeline::new(vec![
        input_descriptor(),
        skill_descriptor("skill_hangs", Arc::new(HangingSkill), &["input"]),
        timeout_descriptor("skill_hangs"),
        responder_descriptor(&["skill_hangs", "timeout"]),
    ])
    .unwrap();

    let repo: Arc<dyn DialogRepository> = Arc::new(InMemoryDialogRepository::new());
    let agent = AgentLoop::new(pipeline, repo, Duration::from_secs(2));

    let deadline = chrono::Utc::now() + chrono::Duration::milliseconds(50);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        agent.register_msg(
            "hello".into(),
            "user1".into(),
            "cmd".into(),
            "chan1".into(),
            true,
            Some(deadline),
            HashMap::new(),
            false,
        ),
    )
    .await
    .expect("register_msg must return once the deadline fires, not hang forever")
    .unwrap();

    let dialog = result.expect("expected a flushed dialog after the deadline");
    assert!(!dialog.awaiting_reply());
    match dialog.last_utterance().unwrap() {
        Utterance::Bot(b) => assert_eq!(b.text, "sorry, that took too long"),
        _ => panic!("expected the timeout fallback as the bot reply"),
    }
}

/// Scenario 6: dialog reset -- a second utterance with `reset_dialog`
/// closes out the first dialog in the repository before opening a
/// fresh one, so the two turns land in distinct dialogs.
#[tokio::test]
async fn reset_dialog_starts_a_fresh_dialog_instead_of_continuing_the_old_one() {
    let (skill_one, _) = StubSkill::new("chitchat", "first reply", 0.9);
    let pipeline_one = Pipeline::new(vec![
        input_descriptor(),
        skill_descriptor("skill_x", Arc::new(skill_one), &["input"]),
        responder_descriptor(&["skill_x"]),
    ])
    .unwrap();

    let repo: Arc<dyn DialogRepository> = Arc::new(InMemoryDialogRepository::new());
    let agent = AgentLoop::new(pipeline_one, repo.clone(), Duration::from_secs(2));

    let first = agent
        .register_msg(
            "hello".into(),
            "user1".into(),
            "cmd".into(),
            "chan1".into(),
            true,
            None,
            HashMap::new(),
            false,
        )
        .await
        .unwrap()
        .expect("first turn must flush");
    let first_dialog_id = first.dialog_id.clone();

    let (skill_two, _) = StubSkill::new("chitchat", "second reply", 0.9);
    let pipeline_two = Pipeline::new(vec![
        input_descriptor(),
        skill_descriptor("skill_x", Arc::new(skill_two), &["input"]),
        responder_descriptor(&["skill_x"]),
    ])
    .unwrap();
    let agent_two = AgentLoop::new(pipeline_two, repo.clone(), Duration::from_secs(2));

    let second = agent_two
        .register_msg(
            "again".into(),
            "user1".into(),
            "cmd".into(),
            "chan1".into(),
            true,
            None,
            HashMap::new(),
            true,
        )
        .await
        .unwrap()
        .expect("second turn must flush");

    assert_ne!(first_dialog_id, second.dialog_id, "reset_dialog must open a fresh dialog id");
    assert_eq!(second.utterances.len(), 2, "fresh dialog should only contain its own turn");

    let ids = repo.list_dialog_ids(0, 10, true).await.unwrap();
    assert!(
        !ids.contains(&first_dialog_id.0),
        "the original dialog must no longer be active after reset_dialog"
    );
}
