//! Dialog repository collaborator.
//!
//! The core never hard-codes a persistence mechanism; it depends on this
//! trait and is handed a concrete implementation at bootstrap, mirroring
//! how the teacher codebase injects its storage/host collaborators
//! rather than reaching for a global.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use parley_types::{Dialog, DialogId, Result};

/// Collaborator responsible for durable dialog state. The agent loop
/// calls into this for dialog lookup/creation at ingress and for
/// persistence via the `save_dialog` state hook; it never inspects how
/// dialogs are stored.
#[async_trait]
pub trait DialogRepository: Send + Sync {
    /// Return the active dialog for `external_user_id` on `channel_type`,
    /// creating a fresh one if none is active (or if one was just
    /// dropped by `reset_dialog`).
    async fn get_or_create_dialog(
        &self,
        external_user_id: &str,
        channel_type: &str,
    ) -> Result<Dialog>;

    /// Close out the active dialog for `external_user_id`, returning its
    /// id. A later `get_or_create_dialog` call starts a fresh one.
    async fn drop_active_dialog(&self, external_user_id: &str) -> Result<Option<DialogId>>;

    /// Persist `dialog` as the current state for its id.
    async fn save_dialog(&self, dialog: &Dialog) -> Result<()>;

    /// Attach a rating to a whole dialog.
    async fn set_rating_dialog(
        &self,
        external_user_id: &str,
        dialog_id: &DialogId,
        rating: i32,
    ) -> Result<()>;

    /// Attach a rating to a single utterance within a dialog.
    async fn set_rating_utterance(
        &self,
        external_user_id: &str,
        utt_id: u64,
        rating: i32,
    ) -> Result<()>;

    /// Page through known dialog ids, most-recent first.
    async fn list_dialog_ids(&self, offset: usize, limit: usize, active_only: bool) -> Result<Vec<String>>;
}

#[derive(Default)]
struct StoredDialog {
    dialog: Dialog,
    active: bool,
}

/// Reference, in-memory implementation of [`DialogRepository`].
///
/// Used by integration tests and `--config` dry-runs; it keeps no
/// history beyond the latest saved snapshot per dialog and is not a
/// substitute for a production-grade store.
pub struct InMemoryDialogRepository {
    dialogs: Mutex<HashMap<String, StoredDialog>>,
    active_by_user: Mutex<HashMap<String, DialogId>>,
}

impl InMemoryDialogRepository {
    pub fn new() -> Self {
        Self {
            dialogs: Mutex::new(HashMap::new()),
            active_by_user: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDialogRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DialogRepository for InMemoryDialogRepository {
    async fn get_or_create_dialog(
        &self,
        external_user_id: &str,
        channel_type: &str,
    ) -> Result<Dialog> {
        let mut active_by_user = self.active_by_user.lock().await;
        if let Some(dialog_id) = active_by_user.get(external_user_id) {
            let dialogs = self.dialogs.lock().await;
            if let Some(stored) = dialogs.get(&dialog_id.0) {
                if stored.active {
                    return Ok(stored.dialog.clone());
                }
            }
        }

        let dialog = Dialog::new(external_user_id, channel_type);
        active_by_user.insert(external_user_id.to_string(), dialog.dialog_id.clone());
        let mut dialogs = self.dialogs.lock().await;
        dialogs.insert(
            dialog.dialog_id.0.clone(),
            StoredDialog {
                dialog: dialog.clone(),
                active: true,
            },
        );
        Ok(dialog)
    }

    async fn drop_active_dialog(&self, external_user_id: &str) -> Result<Option<DialogId>> {
        let mut active_by_user = self.active_by_user.lock().await;
        let Some(dialog_id) = active_by_user.remove(external_user_id) else {
            return Ok(None);
        };
        let mut dialogs = self.dialogs.lock().await;
        if let Some(stored) = dialogs.get_mut(&dialog_id.0) {
            stored.active = false;
        }
        Ok(Some(dialog_id))
    }

    async fn save_dialog(&self, dialog: &Dialog) -> Result<()> {
        let mut dialogs = self.dialogs.lock().await;
        let entry = dialogs
            .entry(dialog.dialog_id.0.clone())
            .or_insert_with(|| StoredDialog {
                dialog: dialog.clone(),
                active: true,
            });
        entry.dialog = dialog.clone();
        Ok(())
    }

    async fn set_rating_dialog(
        &self,
        _external_user_id: &str,
        dialog_id: &DialogId,
        rating: i32,
    ) -> Result<()> {
        let mut dialogs = self.dialogs.lock().await;
        if let Some(stored) = dialogs.get_mut(&dialog_id.0) {
            stored.dialog.add_annotation(
                "rating",
                serde_json::json!(rating),
                parley_types::dialog::AnnotationTarget::LastUtterance,
                None,
            );
        }
        Ok(())
    }

    async fn set_rating_utterance(
        &self,
        _external_user_id: &str,
        utt_id: u64,
        rating: i32,
    ) -> Result<()> {
        let mut dialogs = self.dialogs.lock().await;
        for stored in dialogs.values_mut() {
            if let Some(utt) = stored.dialog.utterances.iter_mut().find(|u| u.utt_id() == utt_id) {
                match utt {
                    parley_types::Utterance::Human(h) => {
                        h.attributes.insert("rating".to_string(), serde_json::json!(rating));
                    }
                    parley_types::Utterance::Bot(b) => {
                        b.attributes.insert("rating".to_string(), serde_json::json!(rating));
                    }
                }
            }
        }
        Ok(())
    }

    async fn list_dialog_ids(&self, offset: usize, limit: usize, active_only: bool) -> Result<Vec<String>> {
        let dialogs = self.dialogs.lock().await;
        let mut ids: Vec<&String> = dialogs
            .iter()
            .filter(|(_, stored)| !active_only || stored.active)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_stable_for_same_user() {
        let repo = InMemoryDialogRepository::new();
        let first = repo.get_or_create_dialog("u1", "cmd").await.unwrap();
        let second = repo.get_or_create_dialog("u1", "cmd").await.unwrap();
        assert_eq!(first.dialog_id, second.dialog_id);
    }

    #[tokio::test]
    async fn drop_active_dialog_starts_a_fresh_one() {
        let repo = InMemoryDialogRepository::new();
        let first = repo.get_or_create_dialog("u1", "cmd").await.unwrap();
        let dropped = repo.drop_active_dialog("u1").await.unwrap();
        assert_eq!(dropped, Some(first.dialog_id.clone()));
        let second = repo.get_or_create_dialog("u1", "cmd").await.unwrap();
        assert_ne!(first.dialog_id, second.dialog_id);
    }

    #[tokio::test]
    async fn save_dialog_persists_latest_snapshot() {
        let repo = InMemoryDialogRepository::new();
        let mut dialog = repo.get_or_create_dialog("u1", "cmd").await.unwrap();
        dialog.add_human_utterance("hello", chrono::Utc::now(), HashMap::new());
        repo.save_dialog(&dialog).await.unwrap();
        let reloaded = repo.get_or_create_dialog("u1", "cmd").await.unwrap();
        assert_eq!(reloaded.utterances.len(), 1);
    }

    #[tokio::test]
    async fn list_dialog_ids_paginates_in_sorted_order() {
        let repo = InMemoryDialogRepository::new();
        repo.get_or_create_dialog("a", "cmd").await.unwrap();
        repo.get_or_create_dialog("b", "cmd").await.unwrap();
        let ids = repo.list_dialog_ids(0, 1, false).await.unwrap();
        assert_eq!(ids.len(), 1);
    }
}
