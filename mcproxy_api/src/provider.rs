use anyhow::Result;

use crate::model::{
    BlacklistEntrySummary, CreateBlacklistEntry, CreateWhitelistEntry, GroupStatsSummary,
    OutboundSummary, ServerSummary, SessionSummary, WhitelistEntrySummary,
};

/// Read-only view over the running proxy, implemented by
/// `mcproxy_core::controller::ProxyServer` and consumed by the HTTP
/// admin layer.
#[async_trait::async_trait]
pub trait AdminApiRead: Send + Sync {
    async fn list_servers(&self) -> Vec<ServerSummary>;
    async fn get_server(&self, id: &str) -> Option<ServerSummary>;
    async fn list_sessions(&self) -> Vec<SessionSummary>;
    async fn list_outbounds(&self) -> Vec<OutboundSummary>;
    async fn list_groups(&self) -> Vec<String>;
    async fn group_stats(&self, group: &str) -> Option<GroupStatsSummary>;
    async fn list_blacklist(&self) -> Vec<BlacklistEntrySummary>;
    async fn list_whitelist(&self) -> Vec<WhitelistEntrySummary>;
}

/// Write operations extending [`AdminApiRead`].
#[async_trait::async_trait]
pub trait AdminApiWrite: Send + Sync {
    async fn enable_server(&self, id: &str) -> Result<()>;
    async fn disable_server(&self, id: &str) -> Result<()>;
    async fn reload_server(&self, id: &str) -> Result<()>;
    async fn delete_outbound(&self, name: &str) -> Result<()>;
    async fn kick_player(&self, name: &str) -> Result<usize>;
    async fn add_blacklist_entry(&self, entry: CreateBlacklistEntry) -> Result<()>;
    async fn remove_blacklist_entry(&self, id: &str) -> Result<()>;
    async fn add_whitelist_entry(&self, entry: CreateWhitelistEntry) -> Result<()>;
    async fn remove_whitelist_entry(&self, id: &str) -> Result<()>;
}
