//! Session identity and ownership labels

use container_reaper::Filter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

/// Marks every resource created by this crate
pub const LABEL_MANAGED: &str = "ephemeral.managed";
/// Session that owns the resource
pub const LABEL_SESSION_ID: &str = "ephemeral.session-id";
/// Eligible for removal by the session reaper
pub const LABEL_REAP: &str = "ephemeral.reap";
/// Marks the reaper sidecar itself
pub const LABEL_REAPER: &str = "ephemeral.reaper";

static PROCESS_SESSION: LazyLock<SessionId> = LazyLock::new(SessionId::new);

/// Identifier of one test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// A fresh random session
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The session shared by everything in this process
    pub fn process() -> Self {
        *PROCESS_SESSION
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Labels that tie a resource to `session`.
///
/// Guarded resources also get the reap marker, which is what the session's
/// reaper filter selects on.
pub fn labels_for(session: SessionId, guarded: bool) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_SESSION_ID.to_string(), session.to_string()),
    ]);
    if guarded {
        labels.insert(LABEL_REAP.to_string(), "true".to_string());
    }
    labels
}

/// Add `ours` to `labels` without overwriting any key the caller already set
pub fn merge_labels(labels: &mut BTreeMap<String, String>, ours: BTreeMap<String, String>) {
    for (key, value) in ours {
        labels.entry(key).or_insert(value);
    }
}

/// Well-known name of the reaper sidecar of `session`
pub fn reaper_container_name(session: SessionId) -> String {
    format!("ephemeral-reaper-{}", session)
}

/// The filter a session registers with its reaper
pub fn reaper_filter(session: SessionId) -> Filter {
    Filter::new()
        .label(LABEL_SESSION_ID, &session.to_string())
        .label(LABEL_REAP, "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_session_is_stable() {
        assert_eq!(SessionId::process(), SessionId::process());
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_labels_for_guarded_and_unguarded() {
        let session = SessionId::new();

        let guarded = labels_for(session, true);
        assert_eq!(guarded[LABEL_MANAGED], "true");
        assert_eq!(guarded[LABEL_SESSION_ID], session.to_string());
        assert_eq!(guarded[LABEL_REAP], "true");

        let unguarded = labels_for(session, false);
        assert!(!unguarded.contains_key(LABEL_REAP));
        assert_eq!(unguarded[LABEL_SESSION_ID], session.to_string());
    }

    #[test]
    fn test_merge_keeps_caller_values() {
        let mut labels = BTreeMap::from([
            ("app".to_string(), "db".to_string()),
            (LABEL_MANAGED.to_string(), "custom".to_string()),
        ]);
        merge_labels(&mut labels, labels_for(SessionId::new(), true));

        assert_eq!(labels["app"], "db");
        assert_eq!(labels[LABEL_MANAGED], "custom");
        assert_eq!(labels[LABEL_REAP], "true");
        assert_eq!(labels.len(), 4);
    }

    #[test]
    fn test_reaper_filter_selects_guarded_session_resources() {
        let session: SessionId = "4f7c1d36-2a3b-4c5d-8e9f-0a1b2c3d4e5f".parse().unwrap();
        assert_eq!(
            reaper_filter(session).encode().unwrap(),
            "label=ephemeral.reap=true&label=ephemeral.session-id=4f7c1d36-2a3b-4c5d-8e9f-0a1b2c3d4e5f\n"
        );
        assert_eq!(
            reaper_container_name(session),
            "ephemeral-reaper-4f7c1d36-2a3b-4c5d-8e9f-0a1b2c3d4e5f"
        );
    }
}
