//! Recovery snapshot: captures just enough of the controller's live
//! session state to survive a short restart (a few seconds of grace),
//! generalized from a single-backend snapshot to one entry per
//! server id.
//!
//! It is not a 1:1 state dump — active clients that are no longer
//! connected by the time a snapshot is loaded are fine to drop; the
//! point is operator continuity across a quick redeploy, not exact
//! replay.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Snapshot of one server id's live sessions at the moment it was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSessionSnapshot {
    pub server_id: String,
    pub sessions: Vec<SessionSnapshotRecord>,
}

/// Enough of a [`crate::registry::SessionSnapshot`] to log/report on
/// recovery; sessions themselves cannot be reattached to their UDP
/// sockets across a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshotRecord {
    pub client_addr: String,
    pub display_name: Option<String>,
    pub uuid: Option<String>,
    pub xuid: Option<String>,
}

/// Whole-controller snapshot taken on a graceful ("recover-able")
/// shutdown and inspected on the next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub taken_at: SystemTime,
    pub proxy_bind: String,
    pub servers: Vec<ServerSessionSnapshot>,
}

impl ControllerSnapshot {
    /// Snapshots older than this are assumed stale: clients have
    /// already timed out and reconnected or given up.
    pub fn has_expired(&self) -> bool {
        self.taken_at
            .elapsed()
            .map(|elapsed| elapsed >= Duration::from_secs(10))
            .unwrap_or(true)
    }

    pub fn total_sessions(&self) -> usize {
        self.servers.iter().map(|s| s.sessions.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_snapshot_has_not_expired() {
        let snapshot = ControllerSnapshot {
            taken_at: SystemTime::now(),
            proxy_bind: "0.0.0.0:0".to_owned(),
            servers: vec![],
        };
        assert!(!snapshot.has_expired());
    }

    #[test]
    fn stale_snapshot_has_expired() {
        let snapshot = ControllerSnapshot {
            taken_at: SystemTime::now() - Duration::from_secs(30),
            proxy_bind: "0.0.0.0:0".to_owned(),
            servers: vec![],
        };
        assert!(snapshot.has_expired());
    }
}
