//! Contracts for the external collaborators (C11): storage-backed
//! repositories the engine consults or writes to. The engine does not
//! define a storage backend — these traits are the seam a real
//! SQLite/Postgres/whatever-backed implementation plugs into; this
//! crate ships in-memory defaults so the engine is runnable standalone.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::acl::{ACLSettings, BlacklistEntry, WhitelistEntry};

pub type StorageResult<T> = anyhow::Result<T>;

/// Blacklist, whitelist and ACL settings storage.
///
/// `server_id == ""` addresses the global scope throughout.
#[async_trait]
pub trait AclRepository: Send + Sync {
    async fn list_blacklist(&self, server_id: &str) -> StorageResult<Vec<BlacklistEntry>>;
    async fn list_whitelist(&self, server_id: &str) -> StorageResult<Vec<WhitelistEntry>>;
    async fn acl_settings(&self, server_id: &str) -> StorageResult<ACLSettings>;

    async fn create_blacklist_entry(&self, entry: BlacklistEntry) -> StorageResult<()>;
    async fn create_whitelist_entry(&self, entry: WhitelistEntry) -> StorageResult<()>;
    async fn delete_blacklist_entry(&self, name: &str, server_id: &str) -> StorageResult<()>;
    async fn delete_whitelist_entry(&self, name: &str, server_id: &str) -> StorageResult<()>;
    /// Purges expired blacklist entries; returns the number removed.
    async fn delete_expired(&self) -> StorageResult<usize>;
}

/// A snapshot of a session at the moment it ended, handed to the
/// session-persistence collaborator for write-only logging.
#[derive(Debug, Clone)]
pub struct SessionEndRecord {
    pub session_id: String,
    pub server_id: String,
    pub display_name: Option<String>,
    pub uuid: Option<String>,
    pub xuid: Option<String>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration_seconds: u64,
}

/// Write-only collaborator for session-end and player-stat records.
/// Writes are retried by the caller (3 attempts, exponential backoff);
/// persistent failure is logged, never propagated to the forwarding path.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn record_session_end(&self, record: SessionEndRecord) -> StorageResult<()>;
}

/// Retries an async write up to 3 times with 100ms/200ms backoff,
/// logging and swallowing the final failure.
pub async fn write_with_retry<F, Fut>(what: &str, mut attempt: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StorageResult<()>>,
{
    let mut delay = std::time::Duration::from_millis(100);
    for i in 0..3 {
        match attempt().await {
            Ok(()) => return,
            Err(err) if i < 2 => {
                log::warn!("{what}: attempt {} failed: {err}, retrying", i + 1);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                log::warn!("{what}: giving up after 3 attempts: {err}");
            }
        }
    }
}

/// In-memory [`AclRepository`] used when no external store is wired up.
#[derive(Default)]
pub struct InMemoryAclRepository {
    blacklist: RwLock<Vec<BlacklistEntry>>,
    whitelist: RwLock<Vec<WhitelistEntry>>,
    settings: RwLock<HashMap<String, ACLSettings>>,
}

#[async_trait]
impl AclRepository for InMemoryAclRepository {
    async fn list_blacklist(&self, server_id: &str) -> StorageResult<Vec<BlacklistEntry>> {
        Ok(self
            .blacklist
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn list_whitelist(&self, server_id: &str) -> StorageResult<Vec<WhitelistEntry>> {
        Ok(self
            .whitelist
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn acl_settings(&self, server_id: &str) -> StorageResult<ACLSettings> {
        Ok(self
            .settings
            .read()
            .unwrap()
            .get(server_id)
            .cloned()
            .unwrap_or_else(|| ACLSettings {
                server_id: server_id.to_owned(),
                ..Default::default()
            }))
    }

    async fn create_blacklist_entry(&self, entry: BlacklistEntry) -> StorageResult<()> {
        self.blacklist.write().unwrap().push(entry);
        Ok(())
    }

    async fn create_whitelist_entry(&self, entry: WhitelistEntry) -> StorageResult<()> {
        self.whitelist.write().unwrap().push(entry);
        Ok(())
    }

    async fn delete_blacklist_entry(&self, name: &str, server_id: &str) -> StorageResult<()> {
        self.blacklist
            .write()
            .unwrap()
            .retain(|e| !(e.display_name.eq_ignore_ascii_case(name) && e.server_id == server_id));
        Ok(())
    }

    async fn delete_whitelist_entry(&self, name: &str, server_id: &str) -> StorageResult<()> {
        self.whitelist
            .write()
            .unwrap()
            .retain(|e| !(e.display_name.eq_ignore_ascii_case(name) && e.server_id == server_id));
        Ok(())
    }

    async fn delete_expired(&self) -> StorageResult<usize> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut blacklist = self.blacklist.write().unwrap();
        let before = blacklist.len();
        blacklist.retain(|e| !e.is_expired(now));
        Ok(before - blacklist.len())
    }
}

/// In-memory [`SessionRepository`] that just logs.
#[derive(Default)]
pub struct LoggingSessionRepository;

#[async_trait]
impl SessionRepository for LoggingSessionRepository {
    async fn record_session_end(&self, record: SessionEndRecord) -> StorageResult<()> {
        log::info!(
            "session {} on {} ended: {:?} up={}B down={}B dur={}s",
            record.session_id,
            record.server_id,
            record.display_name,
            record.bytes_up,
            record.bytes_down,
            record.duration_seconds
        );
        Ok(())
    }
}
