//! Identifier newtypes.
//!
//! The source this system was ported from names the dialog identifier
//! inconsistently (`id` in the storage layer, `dialog_id` in the agent,
//! `uuid` in the broker layer). The port picks exactly one name and one
//! type everywhere: [`DialogId`]. A wire payload that uses `id` or `uuid`
//! for this concept fails to deserialize rather than being silently
//! accepted under an alias.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a [`crate::Dialog`].
///
/// Deliberately has no `#[serde(alias = ...)]` -- accepting `id` or `uuid`
/// here would reintroduce the naming ambiguity the port is meant to close.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialogId(pub String);

impl DialogId {
    /// Generate a fresh, random dialog id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for DialogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DialogId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DialogId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Globally unique identifier for one dispatched task (`task_uuid` on the
/// wire). Distinct from [`DialogId`] so the two can never be confused at a
/// type level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh, random task id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialog_id_roundtrip() {
        let id = DialogId::new();
        let json = serde_json::to_string(&id).unwrap();
        let restored: DialogId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn dialog_id_rejects_alternate_field_name() {
        // `dialog_id` is a transparent newtype, so at the call site the
        // *container* is responsible for naming the field `dialog_id`;
        // this test documents that the newtype itself carries no alias.
        let err = serde_json::from_str::<DialogId>(r#"{"id": "x"}"#);
        assert!(err.is_err());
    }
}
