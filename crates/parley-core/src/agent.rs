//! The agent loop: message ingress, task dispatch, response aggregation,
//! and deadline handling.
//!
//! This is the component that ties the [`crate::pipeline::Pipeline`],
//! [`crate::workflow::WorkflowManager`], and [`crate::storage::DialogRepository`]
//! collaborators together. It never lets a connector or state-hook
//! failure escape a task boundary -- per the propagation policy,
//! everything operational is captured and converted into workflow state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use parley_types::{Dialog, DialogId, Result, TaskId};

use crate::connector::ServiceOutcome;
use crate::hooks::apply_state_hook;
use crate::pipeline::Pipeline;
use crate::storage::DialogRepository;
use crate::workflow::{CompletedTask, WorkflowManager};

/// Registry of lazily-created, per-`(channel_id, user_id)` async
/// mutexes used to serialize successive utterances from the same user.
///
/// A key's mutex is dropped once uncontended (its only remaining owner
/// is this registry's own map entry), keeping the map bounded by the
/// number of currently-or-recently-active conversations rather than
/// every user ever seen.
struct DialogMutexRegistry {
    locks: StdMutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl DialogMutexRegistry {
    fn new() -> Self {
        Self {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, key: (String, String)) -> (tokio::sync::OwnedMutexGuard<()>, Arc<AsyncMutex<()>>) {
        let arc = {
            let mut locks = self.locks.lock().expect("dialog mutex registry poisoned");
            locks.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let guard = arc.clone().lock_owned().await;
        (guard, arc)
    }

    fn release_and_gc(&self, key: &(String, String), guard: tokio::sync::OwnedMutexGuard<()>, arc: Arc<AsyncMutex<()>>) {
        drop(guard);
        drop(arc);
        let mut locks = self.locks.lock().expect("dialog mutex registry poisoned");
        if let Some(existing) = locks.get(key) {
            if Arc::strong_count(existing) == 1 {
                locks.remove(key);
            }
        }
    }
}

/// Ties the pipeline, workflow manager, and dialog repository together
/// into the running agent.
pub struct AgentLoop {
    pipeline: Pipeline,
    workflow: WorkflowManager,
    repository: Arc<dyn DialogRepository>,
    dialog_locks: DialogMutexRegistry,
    default_timeout: Duration,
}

impl AgentLoop {
    /// Build a fresh agent loop over an already-validated pipeline.
    pub fn new(pipeline: Pipeline, repository: Arc<dyn DialogRepository>, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            workflow: WorkflowManager::new(),
            repository,
            dialog_locks: DialogMutexRegistry::new(),
            default_timeout,
        })
    }

    /// Channel ingress: append the human utterance, open a workflow
    /// record, dispatch the initial task, and (if `require_response`)
    /// wait for the bot's reply.
    ///
    /// Per `(channel_id, external_user_id)`, a second call while an
    /// earlier one is still in flight blocks here until the earlier
    /// workflow has been fully flushed -- this holds regardless of
    /// `require_response`, since a background task keeps the per-key
    /// lock until the flush, not just until this call returns.
    pub async fn register_msg(
        self: &Arc<Self>,
        utterance: String,
        external_user_id: String,
        channel_type: String,
        channel_id: String,
        require_response: bool,
        deadline: Option<DateTime<Utc>>,
        message_attrs: HashMap<String, Value>,
        reset_dialog: bool,
    ) -> Result<Option<Dialog>> {
        let key = (channel_id, external_user_id.clone());
        let (guard, arc) = self.dialog_locks.acquire(key.clone()).await;

        if reset_dialog {
            self.repository.drop_active_dialog(&external_user_id).await?;
        }

        let mut dialog = self
            .repository
            .get_or_create_dialog(&external_user_id, &channel_type)
            .await?;
        dialog.add_human_utterance(utterance.clone(), Utc::now(), message_attrs);
        let dialog_id = dialog.dialog_id.clone();

        let response_event = self.workflow.add_workflow(dialog, require_response).await?;

        self.dispatch_input(dialog_id.clone(), serde_json::json!({ "text": utterance }));

        let deadline = deadline.unwrap_or_else(|| Utc::now() + self.default_timeout_chrono());
        self.spawn_timeout_watcher(dialog_id.clone(), deadline).await;

        // `Notify::notify_one` wakes at most one waiter, so only one task
        // may ever call `.notified()` on `response_event` for a given
        // workflow. The per-key lock is held for the entire
        // request/response cycle regardless of `require_response` -- in
        // the fire-and-forget path a background task, not this caller,
        // is that one waiter.
        if require_response {
            response_event.notified().await;
            let flushed = self.workflow.flush_record(&dialog_id).await;
            self.dialog_locks.release_and_gc(&key, guard, arc);
            Ok(flushed.map(|f| f.dialog))
        } else {
            let this = self.clone();
            let bg_dialog_id = dialog_id.clone();
            tokio::spawn(async move {
                response_event.notified().await;
                this.workflow.flush_record(&bg_dialog_id).await;
                this.dialog_locks.release_and_gc(&key, guard, arc);
            });
            Ok(None)
        }
    }

    fn default_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.default_timeout).unwrap_or_else(|_| chrono::Duration::seconds(5))
    }

    fn dispatch_input(self: &Arc<Self>, dialog_id: DialogId, utterance_payload: Value) {
        let this = self.clone();
        tokio::spawn(async move {
            let input_name = this.pipeline.input_service().to_string();
            if let Ok(task_id) = this.workflow.add_task(&dialog_id, &input_name, 0).await {
                this.process(dialog_id, task_id, ServiceOutcome::Ok(utterance_payload)).await;
            }
        });
    }

    /// Dispatch one more round of tasks for `service_name`: format the
    /// current dialog into a payload list and spawn one connector call
    /// per payload, recording each call's abort handle.
    async fn dispatch(self: &Arc<Self>, dialog_id: DialogId, service_name: String) {
        let Some(descriptor) = self.pipeline.service(&service_name) else {
            return;
        };
        let Some(dialog) = self.workflow.dialog_snapshot(&dialog_id).await else {
            return;
        };
        let payloads = descriptor.format_dialog(&dialog);

        for (ind, payload) in payloads.into_iter().enumerate() {
            let task_id = match self.workflow.add_task(&dialog_id, &service_name, ind).await {
                Ok(id) => id,
                Err(_) => continue,
            };
            let this = self.clone();
            let spawned_dialog_id = dialog_id.clone();
            let spawned_task_id = task_id.clone();
            let connector = descriptor.connector.clone();
            let handle = tokio::spawn(async move {
                let outcome = connector.call(payload).await;
                this.process(spawned_dialog_id, spawned_task_id, outcome).await;
            });
            self.workflow
                .set_task_object(&dialog_id, &task_id, handle.abort_handle())
                .await;
        }
    }

    /// Handle one task's completion: update workflow state, apply the
    /// owning service's formatter and state hook, prune skipped branches
    /// on error or selector pruning, flush on responder, and dispatch
    /// whatever is newly runnable.
    async fn process(self: Arc<Self>, dialog_id: DialogId, task_id: TaskId, outcome: ServiceOutcome) {
        let Some(completed) = self.workflow.complete_task(&task_id, outcome).await else {
            return;
        };
        let CompletedTask { dialog_id, service, ind, outcome } = completed;

        let Some(descriptor) = self.pipeline.service(&service) else {
            return;
        };

        match outcome {
            ServiceOutcome::Err(message) => {
                warn!(%service, %message, "service call failed; skipping its dependents");
                for dep in self.pipeline.dependents_of(&service) {
                    self.workflow.skip_service(&dialog_id, &dep).await;
                }
            }
            ServiceOutcome::Ok(raw) => {
                let formatted = descriptor.format_response(&raw);

                if let Some(hook) = descriptor.state_hook {
                    if let Some(mut dialog) = self.workflow.dialog_snapshot(&dialog_id).await {
                        if let Err(e) = apply_state_hook(
                            hook,
                            &mut dialog,
                            &formatted,
                            &descriptor.label,
                            Some(ind),
                            Utc::now(),
                            self.repository.as_ref(),
                        )
                        .await
                        {
                            warn!(%service, error = %e, "state hook failed");
                        }
                        self.workflow.set_dialog(&dialog_id, dialog).await;
                    }
                }

                if descriptor.is_selector() {
                    if let Some(kept) = formatted.skill_names() {
                        let kept: std::collections::HashSet<&str> =
                            kept.iter().map(String::as_str).collect();
                        for next_name in self.pipeline.next_of(&service) {
                            if let Some(next_descriptor) = self.pipeline.service(next_name) {
                                if !kept.contains(next_descriptor.label.as_str()) {
                                    self.workflow.skip_service(&dialog_id, next_name).await;
                                }
                            }
                        }
                    }
                } else if descriptor.is_responder() {
                    self.workflow.notify_response(&dialog_id).await;
                    if !self.workflow.hold_flush(&dialog_id).await.unwrap_or(true) {
                        self.workflow.flush_record(&dialog_id).await;
                    }
                    return;
                }
            }
        }

        self.dispatch_next(dialog_id).await;
    }

    async fn dispatch_next(self: &Arc<Self>, dialog_id: DialogId) {
        let (done, waiting, skipped) = self.workflow.get_services_status(&dialog_id).await;
        for next in self.pipeline.next_services(&done, &waiting, &skipped) {
            self.dispatch(dialog_id.clone(), next).await;
        }
    }

    async fn spawn_timeout_watcher(self: &Arc<Self>, dialog_id: DialogId, deadline: DateTime<Utc>) {
        let this = self.clone();
        let watcher_dialog_id = dialog_id.clone();
        let handle = tokio::spawn(async move {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
            this.fire_deadline(watcher_dialog_id).await;
        });
        self.workflow.set_timeout_handle(&dialog_id, handle).await;
    }

    async fn fire_deadline(self: Arc<Self>, dialog_id: DialogId) {
        let Some(handles) = self.workflow.expire_and_collect_handles(&dialog_id).await else {
            return;
        };
        for handle in handles {
            handle.abort();
        }

        info!(dialog_id = %dialog_id.0, "workflow deadline elapsed");

        if let Some(timeout_name) = self.pipeline.timeout_service_name() {
            if let Ok(task_id) = self.workflow.add_task(&dialog_id, &timeout_name, 0).await {
                self.clone()
                    .process(dialog_id.clone(), task_id, ServiceOutcome::Ok(Value::Null))
                    .await;
            }
        }

        self.workflow.skip_all_pending(&dialog_id).await;
        self.dispatch_next(dialog_id).await;
    }
}
