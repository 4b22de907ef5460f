//! Per-dialog workflow bookkeeping: one in-flight scheduling record per
//! dialog, keyed by [`DialogId`], tracking outstanding tasks and
//! per-service completion state.
//!
//! All operations lock the records map only for the duration of a
//! synchronous critical section -- never across an `.await` -- so that
//! concurrent dialogs never block each other on this map, per the
//! concurrency model.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::{AbortHandle, JoinHandle};

use parley_types::{Dialog, DialogId, OrchestratorError, Result, TaskId};

use crate::connector::ServiceOutcome;

/// Bookkeeping for one task dispatched to a service.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    /// Name of the service this task was dispatched to.
    pub service: String,
    /// Index of this task among its service's parallel sub-tasks.
    pub ind: usize,
    /// When the task was dispatched.
    pub agent_send_time: DateTime<Utc>,
    /// When the task completed, if it has.
    pub agent_done_time: Option<DateTime<Utc>>,
}

struct ServiceStatus {
    pending_tasks: HashSet<TaskId>,
    done: bool,
    skipped: bool,
    error: bool,
}

impl ServiceStatus {
    fn new() -> Self {
        Self {
            pending_tasks: HashSet::new(),
            done: false,
            skipped: false,
            error: false,
        }
    }
}

struct WorkflowRecord {
    dialog: Dialog,
    hold_flush: bool,
    services: HashMap<String, ServiceStatus>,
    tasks: HashMap<TaskId, TaskMeta>,
    task_handles: HashMap<TaskId, AbortHandle>,
    response_event: Arc<Notify>,
    timeout_handle: Option<JoinHandle<()>>,
}

/// The outcome of a completed task, ready for the agent loop to apply a
/// formatter and state hook against.
pub struct CompletedTask {
    pub dialog_id: DialogId,
    pub service: String,
    pub ind: usize,
    pub outcome: ServiceOutcome,
}

/// The final dialog state handed back when a workflow record is
/// flushed.
pub struct FlushedWorkflow {
    pub dialog: Dialog,
}

/// Tracks every in-flight workflow, one per active dialog.
///
/// At most one record exists per `dialog_id` at a time: [`Self::add_workflow`]
/// fails with [`OrchestratorError::WorkflowInFlight`] if one is already
/// present, and every other operation on an unknown `dialog_id` is a
/// silent no-op (a late response after flush), per the failure
/// semantics.
pub struct WorkflowManager {
    records: Mutex<HashMap<DialogId, WorkflowRecord>>,
    task_index: Mutex<HashMap<TaskId, DialogId>>,
}

impl WorkflowManager {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            task_index: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new workflow record for `dialog`. Fails if one already
    /// exists for this `dialog_id`.
    pub async fn add_workflow(&self, dialog: Dialog, hold_flush: bool) -> Result<Arc<Notify>> {
        let mut records = self.records.lock().await;
        if records.contains_key(&dialog.dialog_id) {
            return Err(OrchestratorError::WorkflowInFlight {
                dialog_id: dialog.dialog_id.0.clone(),
            });
        }
        let response_event = Arc::new(Notify::new());
        records.insert(
            dialog.dialog_id.clone(),
            WorkflowRecord {
                dialog,
                hold_flush,
                services: HashMap::new(),
                tasks: HashMap::new(),
                task_handles: HashMap::new(),
                response_event: response_event.clone(),
                timeout_handle: None,
            },
        );
        Ok(response_event)
    }

    /// Register a new task against `service`. Rejected if the service is
    /// already `done` or `skipped`. Not rejected once a deadline has
    /// fired -- the synthetic `timeout` task and the responder it
    /// unblocks must still be dispatchable after `expire_and_collect_handles`
    /// runs, so convergence relies on `skip_all_pending` plus the
    /// double-completion rule to discard anything genuinely late, not on
    /// a blanket "expired" rejection here.
    pub async fn add_task(&self, dialog_id: &DialogId, service: &str, ind: usize) -> Result<TaskId> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(dialog_id)
            .ok_or_else(|| OrchestratorError::UnknownDialog {
                dialog_id: dialog_id.0.clone(),
            })?;

        let status = record
            .services
            .entry(service.to_string())
            .or_insert_with(ServiceStatus::new);
        if status.done || status.skipped {
            return Err(OrchestratorError::ServiceCall {
                message: format!("service `{service}` is already done or skipped"),
            });
        }

        let task_id = TaskId::new();
        status.pending_tasks.insert(task_id.clone());
        record.tasks.insert(
            task_id.clone(),
            TaskMeta {
                service: service.to_string(),
                ind,
                agent_send_time: Utc::now(),
                agent_done_time: None,
            },
        );
        drop(records);

        self.task_index.lock().await.insert(task_id.clone(), dialog_id.clone());
        Ok(task_id)
    }

    /// Store the abort handle used to cancel `task_id` on deadline.
    pub async fn set_task_object(&self, dialog_id: &DialogId, task_id: &TaskId, handle: AbortHandle) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(dialog_id) {
            record.task_handles.insert(task_id.clone(), handle);
        }
    }

    /// Mark `service` skipped. Idempotent; a no-op if `dialog_id` is
    /// unknown. Safe to call even while the service still has
    /// outstanding tasks -- their eventual completions are ignored (the
    /// [`WorkflowManager::complete_task`] double-completion / unknown-task
    /// rules already make a late response to a skipped service a no-op).
    pub async fn skip_service(&self, dialog_id: &DialogId, service: &str) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(dialog_id) {
            let status = record
                .services
                .entry(service.to_string())
                .or_insert_with(ServiceStatus::new);
            status.skipped = true;
        }
    }

    /// Complete `task_id`. Returns `None` if the task is unknown (already
    /// completed, or its dialog was flushed) -- the double-completion
    /// no-op rule.
    pub async fn complete_task(&self, task_id: &TaskId, outcome: ServiceOutcome) -> Option<CompletedTask> {
        let dialog_id = {
            let mut task_index = self.task_index.lock().await;
            task_index.remove(task_id)?
        };

        let mut records = self.records.lock().await;
        let record = records.get_mut(&dialog_id)?;
        let task_meta = record.tasks.get_mut(task_id)?;
        task_meta.agent_done_time = Some(Utc::now());
        let service = task_meta.service.clone();
        let ind = task_meta.ind;

        record.task_handles.remove(task_id);
        let is_err = outcome.is_err();
        let status = record
            .services
            .entry(service.clone())
            .or_insert_with(ServiceStatus::new);
        status.pending_tasks.remove(task_id);
        if is_err {
            status.error = true;
        }
        if status.pending_tasks.is_empty() {
            status.done = true;
        }

        Some(CompletedTask {
            dialog_id,
            service,
            ind,
            outcome,
        })
    }

    /// The current `(done, waiting, skipped)` partition of services for
    /// `dialog_id`.
    pub async fn get_services_status(
        &self,
        dialog_id: &DialogId,
    ) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        let records = self.records.lock().await;
        let mut done = HashSet::new();
        let mut waiting = HashSet::new();
        let mut skipped = HashSet::new();
        if let Some(record) = records.get(dialog_id) {
            for (name, status) in &record.services {
                if status.done {
                    done.insert(name.clone());
                } else if status.skipped {
                    skipped.insert(name.clone());
                } else {
                    waiting.insert(name.clone());
                }
            }
        }
        (done, waiting, skipped)
    }

    /// `true` if `service` failed (at least one of its tasks errored).
    pub async fn service_errored(&self, dialog_id: &DialogId, service: &str) -> bool {
        let records = self.records.lock().await;
        records
            .get(dialog_id)
            .and_then(|r| r.services.get(service))
            .map(|s| s.error)
            .unwrap_or(false)
    }

    /// Snapshot the current dialog value for `dialog_id`.
    pub async fn dialog_snapshot(&self, dialog_id: &DialogId) -> Option<Dialog> {
        let records = self.records.lock().await;
        records.get(dialog_id).map(|r| r.dialog.clone())
    }

    /// Replace the dialog value for `dialog_id`. A no-op if the workflow
    /// was already flushed.
    pub async fn set_dialog(&self, dialog_id: &DialogId, dialog: Dialog) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(dialog_id) {
            record.dialog = dialog;
        }
    }

    /// `true` if flushing this workflow must be left to the ingress
    /// caller (it is awaiting `response_event`) rather than happening
    /// immediately when the responder fires.
    pub async fn hold_flush(&self, dialog_id: &DialogId) -> Option<bool> {
        let records = self.records.lock().await;
        records.get(dialog_id).map(|r| r.hold_flush)
    }

    /// Wake whoever is awaiting this workflow's response event.
    pub async fn notify_response(&self, dialog_id: &DialogId) {
        let records = self.records.lock().await;
        if let Some(record) = records.get(dialog_id) {
            record.response_event.notify_one();
        }
    }

    /// Store the deadline watcher's own join handle, so it can be
    /// aborted if the workflow flushes before the deadline fires.
    pub async fn set_timeout_handle(&self, dialog_id: &DialogId, handle: JoinHandle<()>) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(dialog_id) {
            record.timeout_handle = Some(handle);
        }
    }

    /// Cancel every in-flight task's abort handle, clearing them from
    /// the record, and return them. Called once by the deadline watcher,
    /// before it dispatches the synthetic `timeout` task -- this does
    /// not itself block further tasks from being added, so the
    /// `timeout` service and whatever it unblocks downstream (ultimately
    /// the responder) can still be dispatched after this returns.
    pub async fn expire_and_collect_handles(&self, dialog_id: &DialogId) -> Option<Vec<AbortHandle>> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(dialog_id)?;
        let handles = record.task_handles.drain().map(|(_, h)| h).collect();
        Some(handles)
    }

    /// Mark every service that is neither `done` nor `skipped` as
    /// `skipped`, regardless of whether it still has outstanding tasks --
    /// the convergence step a deadline needs so `next_services` can reach
    /// the responder even though some branches never finished. Returns
    /// the set of service names newly skipped by this call.
    pub async fn skip_all_pending(&self, dialog_id: &DialogId) -> HashSet<String> {
        let mut records = self.records.lock().await;
        let mut newly_skipped = HashSet::new();
        if let Some(record) = records.get_mut(dialog_id) {
            for (name, status) in record.services.iter_mut() {
                if !status.done && !status.skipped {
                    status.skipped = true;
                    newly_skipped.insert(name.clone());
                }
            }
        }
        newly_skipped
    }

    /// Detach and return the final dialog state for `dialog_id`,
    /// aborting its deadline watcher if still running. Returns `None` if
    /// already flushed (a double-flush no-op).
    pub async fn flush_record(&self, dialog_id: &DialogId) -> Option<FlushedWorkflow> {
        let mut records = self.records.lock().await;
        let record = records.remove(dialog_id)?;
        if let Some(handle) = record.timeout_handle {
            handle.abort();
        }
        Some(FlushedWorkflow { dialog: record.dialog })
    }
}

impl Default for WorkflowManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog() -> Dialog {
        Dialog::new("user1", "cmd")
    }

    #[tokio::test]
    async fn add_workflow_rejects_duplicate() {
        let wm = WorkflowManager::new();
        let d = dialog();
        wm.add_workflow(d.clone(), false).await.unwrap();
        assert!(wm.add_workflow(d, false).await.is_err());
    }

    #[tokio::test]
    async fn complete_task_is_noop_on_second_call() {
        let wm = WorkflowManager::new();
        let d = dialog();
        let dialog_id = d.dialog_id.clone();
        wm.add_workflow(d, false).await.unwrap();
        let task_id = wm.add_task(&dialog_id, "skill_x", 0).await.unwrap();

        let first = wm.complete_task(&task_id, ServiceOutcome::Ok(serde_json::Value::Null)).await;
        assert!(first.is_some());
        let second = wm.complete_task(&task_id, ServiceOutcome::Ok(serde_json::Value::Null)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn service_becomes_done_once_pending_empties() {
        let wm = WorkflowManager::new();
        let d = dialog();
        let dialog_id = d.dialog_id.clone();
        wm.add_workflow(d, false).await.unwrap();
        let t1 = wm.add_task(&dialog_id, "skill_x", 0).await.unwrap();
        let t2 = wm.add_task(&dialog_id, "skill_x", 1).await.unwrap();

        wm.complete_task(&t1, ServiceOutcome::Ok(serde_json::Value::Null)).await;
        let (done, waiting, _) = wm.get_services_status(&dialog_id).await;
        assert!(waiting.contains("skill_x"));
        assert!(!done.contains("skill_x"));

        wm.complete_task(&t2, ServiceOutcome::Ok(serde_json::Value::Null)).await;
        let (done, _, _) = wm.get_services_status(&dialog_id).await;
        assert!(done.contains("skill_x"));
    }

    #[tokio::test]
    async fn add_task_rejected_for_skipped_service() {
        let wm = WorkflowManager::new();
        let d = dialog();
        let dialog_id = d.dialog_id.clone();
        wm.add_workflow(d, false).await.unwrap();
        wm.skip_service(&dialog_id, "skill_x").await;
        assert!(wm.add_task(&dialog_id, "skill_x", 0).await.is_err());
    }

    #[tokio::test]
    async fn flush_then_flush_again_is_a_noop() {
        let wm = WorkflowManager::new();
        let d = dialog();
        let dialog_id = d.dialog_id.clone();
        wm.add_workflow(d, false).await.unwrap();
        assert!(wm.flush_record(&dialog_id).await.is_some());
        assert!(wm.flush_record(&dialog_id).await.is_none());
    }

    #[tokio::test]
    async fn skip_all_pending_converges_regardless_of_outstanding_tasks() {
        let wm = WorkflowManager::new();
        let d = dialog();
        let dialog_id = d.dialog_id.clone();
        wm.add_workflow(d, false).await.unwrap();
        let _t1 = wm.add_task(&dialog_id, "skill_x", 0).await.unwrap();
        let newly = wm.skip_all_pending(&dialog_id).await;
        assert!(newly.contains("skill_x"));
        let (_, waiting, skipped) = wm.get_services_status(&dialog_id).await;
        assert!(skipped.contains("skill_x"));
        assert!(!waiting.contains("skill_x"));
    }

    #[tokio::test]
    async fn add_task_still_succeeds_after_deadline_collects_handles() {
        let wm = WorkflowManager::new();
        let d = dialog();
        let dialog_id = d.dialog_id.clone();
        wm.add_workflow(d, false).await.unwrap();
        wm.expire_and_collect_handles(&dialog_id).await.unwrap();

        let task_id = wm.add_task(&dialog_id, "timeout", 0).await;
        assert!(task_id.is_ok(), "the synthetic timeout task must still be dispatchable after a deadline fires");
    }

    #[tokio::test]
    async fn operations_on_unknown_dialog_are_noops() {
        let wm = WorkflowManager::new();
        let ghost = DialogId::new();
        wm.skip_service(&ghost, "skill_x").await;
        assert!(wm.add_task(&ghost, "skill_x", 0).await.is_err());
        assert!(wm.dialog_snapshot(&ghost).await.is_none());
    }
}
