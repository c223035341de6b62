//! Access control decision engine (C2): a pure function from player
//! name, server-id and the four relevant lists to an allow/deny
//! decision, plus an online variant that loads those lists from a
//! [`crate::persistence`] collaborator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::persistence::{AclRepository, StorageResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Empty string means a global entry.
    #[serde(default)]
    pub server_id: String,
    pub added_at: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl BlacklistEntry {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now_unix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ACLSettings {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub whitelist_enabled: bool,
    #[serde(default)]
    pub default_message: Option<String>,
    #[serde(default)]
    pub whitelist_message: Option<String>,
}

impl Default for ACLSettings {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            whitelist_enabled: false,
            default_message: None,
            whitelist_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclDecisionKind {
    None,
    Blacklist,
    Whitelist,
}

#[derive(Debug, Clone)]
pub struct AclDecision {
    pub allowed: bool,
    pub kind: AclDecisionKind,
    pub reason: String,
    pub detail: Option<String>,
}

/// Pure precedence function, see spec §4.2. No I/O, no locks.
pub fn check_access(
    player_name: &str,
    global_blacklist: &[BlacklistEntry],
    server_blacklist: &[BlacklistEntry],
    global_whitelist: &[WhitelistEntry],
    server_whitelist: &[WhitelistEntry],
    settings: &ACLSettings,
) -> (bool, String) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    for entry in global_blacklist.iter().chain(server_blacklist.iter()) {
        if !entry.is_expired(now) && entry.display_name.eq_ignore_ascii_case(player_name) {
            let reason = entry
                .reason
                .clone()
                .or_else(|| settings.default_message.clone())
                .unwrap_or_else(|| "you are banned".to_owned());
            return (false, reason);
        }
    }

    if !settings.whitelist_enabled {
        return (true, String::new());
    }

    for entry in global_whitelist.iter().chain(server_whitelist.iter()) {
        if entry.display_name.eq_ignore_ascii_case(player_name) {
            return (true, String::new());
        }
    }

    let reason = settings
        .whitelist_message
        .clone()
        .unwrap_or_else(|| "you are not whitelisted".to_owned());
    (false, reason)
}

/// Online variant: loads the four lists (plus settings) from the
/// persistence collaborator and applies [`check_access`].
///
/// Fails open: any storage error, or a panic inside the repository
/// implementation, results in `allowed = true` with the fault surfaced
/// through the returned `Err` side of the outer `Result` for logging —
/// callers must still treat the *decision* as allow.
pub async fn check_access_full(
    repo: &Arc<dyn AclRepository>,
    player_name: &str,
    server_id: &str,
) -> (AclDecision, Option<anyhow::Error>) {
    let outcome = AssertUnwindSafe(load_and_decide(repo, player_name, server_id))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(decision)) => (decision, None),
        Ok(Err(err)) => (fail_open(), Some(anyhow::anyhow!(err))),
        Err(_) => (fail_open(), Some(anyhow::anyhow!("acl storage panicked"))),
    }
}

fn fail_open() -> AclDecision {
    AclDecision {
        allowed: true,
        kind: AclDecisionKind::None,
        reason: String::new(),
        detail: Some("storage fault, failing open".to_owned()),
    }
}

async fn load_and_decide(
    repo: &Arc<dyn AclRepository>,
    player_name: &str,
    server_id: &str,
) -> StorageResult<AclDecision> {
    let global_blacklist = repo.list_blacklist("").await?;
    let server_blacklist = if server_id.is_empty() {
        Vec::new()
    } else {
        repo.list_blacklist(server_id).await?
    };
    let global_whitelist = repo.list_whitelist("").await?;
    let server_whitelist = if server_id.is_empty() {
        Vec::new()
    } else {
        repo.list_whitelist(server_id).await?
    };
    let settings = repo.acl_settings(server_id).await?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    for entry in global_blacklist.iter().chain(server_blacklist.iter()) {
        if !entry.is_expired(now) && entry.display_name.eq_ignore_ascii_case(player_name) {
            let reason = entry
                .reason
                .clone()
                .or_else(|| settings.default_message.clone())
                .unwrap_or_else(|| "you are banned".to_owned());
            return Ok(AclDecision {
                allowed: false,
                kind: AclDecisionKind::Blacklist,
                reason,
                detail: Some(entry.id.clone()),
            });
        }
    }

    if !settings.whitelist_enabled {
        return Ok(AclDecision {
            allowed: true,
            kind: AclDecisionKind::None,
            reason: String::new(),
            detail: None,
        });
    }

    for entry in global_whitelist.iter().chain(server_whitelist.iter()) {
        if entry.display_name.eq_ignore_ascii_case(player_name) {
            return Ok(AclDecision {
                allowed: true,
                kind: AclDecisionKind::Whitelist,
                reason: String::new(),
                detail: Some(entry.id.clone()),
            });
        }
    }

    let reason = settings
        .whitelist_message
        .clone()
        .unwrap_or_else(|| "you are not whitelisted".to_owned());
    Ok(AclDecision {
        allowed: false,
        kind: AclDecisionKind::Whitelist,
        reason,
        detail: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bl(name: &str, expires_at: Option<i64>) -> BlacklistEntry {
        BlacklistEntry {
            id: name.to_owned(),
            display_name: name.to_owned(),
            reason: Some("grief".to_owned()),
            server_id: String::new(),
            added_at: 0,
            expires_at,
        }
    }

    fn wl(name: &str) -> WhitelistEntry {
        WhitelistEntry {
            id: name.to_owned(),
            display_name: name.to_owned(),
            server_id: String::new(),
        }
    }

    #[test]
    fn global_blacklist_beats_whitelist() {
        let settings = ACLSettings {
            whitelist_enabled: true,
            ..Default::default()
        };
        let (allowed, reason) = check_access(
            "Alice",
            &[bl("alice", None)],
            &[],
            &[wl("alice")],
            &[],
            &settings,
        );
        assert!(!allowed);
        assert_eq!(reason, "grief");
    }

    #[test]
    fn expired_blacklist_never_denies() {
        let (allowed, _) = check_access(
            "Alice",
            &[bl("alice", Some(1))],
            &[],
            &[],
            &[],
            &ACLSettings::default(),
        );
        assert!(allowed);
    }

    #[test]
    fn whitelist_disabled_allows_everyone() {
        let (allowed, _) = check_access(
            "Stranger",
            &[],
            &[],
            &[],
            &[],
            &ACLSettings::default(),
        );
        assert!(allowed);
    }

    #[test]
    fn whitelist_match_is_case_insensitive() {
        let settings = ACLSettings {
            whitelist_enabled: true,
            ..Default::default()
        };
        let (allowed, _) = check_access("aLiCe", &[], &[], &[wl("Alice")], &[], &settings);
        assert!(allowed);
    }

    #[test]
    fn not_whitelisted_denies_with_message() {
        let settings = ACLSettings {
            whitelist_enabled: true,
            whitelist_message: Some("nope".to_owned()),
            ..Default::default()
        };
        let (allowed, reason) = check_access("Stranger", &[], &[], &[wl("Alice")], &[], &settings);
        assert!(!allowed);
        assert_eq!(reason, "nope");
    }
}
