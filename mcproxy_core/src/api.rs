//! [`AdminApiRead`]/[`AdminApiWrite`] implementation for [`ProxyServer`],
//! the single-node admin provider `mcproxy_http_api` is built over.

use mcproxy_api::model::{
    BlacklistEntrySummary, CreateBlacklistEntry, CreateWhitelistEntry, GroupStatsSummary,
    OutboundSummary, ServerSummary, SessionSummary, WhitelistEntrySummary,
};
use mcproxy_api::provider::{AdminApiRead, AdminApiWrite};

use crate::acl::{BlacklistEntry, WhitelistEntry};
use crate::controller::ProxyServer;

fn wire_mode_str(mode: crate::config::WireMode) -> String {
    serde_json::to_value(mode)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}

fn load_balance_str(method: crate::config::LoadBalanceMethod) -> String {
    serde_json::to_value(method)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_owned())
}

#[async_trait::async_trait]
impl AdminApiRead for ProxyServer {
    async fn list_servers(&self) -> Vec<ServerSummary> {
        let listening = self.listening_ids().await;
        let mut out = Vec::new();
        for server in self.deps().config.servers().await {
            out.push(serialize_server(self, &server, &listening).await);
        }
        out
    }

    async fn get_server(&self, id: &str) -> Option<ServerSummary> {
        let server = self.deps().config.server(id).await?;
        let listening = self.listening_ids().await;
        Some(serialize_server(self, &server, &listening).await)
    }

    async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.deps()
            .registry
            .get_all_sessions()
            .await
            .into_iter()
            .map(|session| SessionSummary {
                id: session.id,
                client_addr: session.client_addr.to_string(),
                server_id: session.server_id,
                display_name: session.display_name,
                uuid: session.uuid,
                xuid: session.xuid,
                start_time_unix_ms: session.start_time,
                last_seen_unix_ms: session.last_seen,
                bytes_up: session.bytes_up,
                bytes_down: session.bytes_down,
            })
            .collect()
    }

    async fn list_outbounds(&self) -> Vec<OutboundSummary> {
        let mut out = Vec::new();
        for cfg in self.deps().outbound_manager.list().await {
            let health = self.deps().outbound_manager.health_status(&cfg.name).await;
            out.push(OutboundSummary {
                name: cfg.name,
                kind: serde_json::to_value(cfg.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "unknown".to_owned()),
                server: cfg.server,
                port: cfg.port,
                group: cfg.group,
                enabled: cfg.enabled,
                healthy: health.as_ref().map(|h| h.healthy).unwrap_or(false),
                ever_tested: health.is_some(),
                latency_ms: health.as_ref().map(|h| h.latency_ms).unwrap_or(0),
                last_check_age_ms: health.as_ref().map(|h| h.last_check_age_ms).unwrap_or(0),
                conn_count: health.as_ref().map(|h| h.conn_count).unwrap_or(0),
                last_error: health.and_then(|h| h.last_error),
            });
        }
        out
    }

    async fn list_groups(&self) -> Vec<String> {
        self.deps().outbound_manager.list_groups().await
    }

    async fn group_stats(&self, group: &str) -> Option<GroupStatsSummary> {
        let groups = self.deps().outbound_manager.list_groups().await;
        if !groups.iter().any(|g| g == group) {
            return None;
        }
        let stats = self
            .deps()
            .outbound_manager
            .group_stats(group, crate::config::LatencyAxis::Udp)
            .await;
        Some(GroupStatsSummary {
            group: group.to_owned(),
            total_count: stats.total_count,
            healthy_count: stats.healthy_count,
            udp_available_count: stats.udp_available_count,
            min_latency_ms: stats.min_latency_ms,
            avg_latency_ms: stats.avg_latency_ms,
        })
    }

    async fn list_blacklist(&self) -> Vec<BlacklistEntrySummary> {
        let mut out = Vec::new();
        for server_id in acl_scopes(self).await {
            if let Ok(entries) = self.deps().acl_repo.list_blacklist(&server_id).await {
                out.extend(entries.into_iter().map(serialize_blacklist_entry));
            }
        }
        out
    }

    async fn list_whitelist(&self) -> Vec<WhitelistEntrySummary> {
        let mut out = Vec::new();
        for server_id in acl_scopes(self).await {
            if let Ok(entries) = self.deps().acl_repo.list_whitelist(&server_id).await {
                out.extend(entries.into_iter().map(serialize_whitelist_entry));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl AdminApiWrite for ProxyServer {
    async fn enable_server(&self, id: &str) -> anyhow::Result<()> {
        let mut servers = self.deps().config.servers().await;
        let Some(server) = servers.iter_mut().find(|s| s.id == id) else {
            anyhow::bail!("unknown server {id}");
        };
        server.enabled = true;
        server.disabled = false;
        self.deps().config.write_servers(servers).await?;
        Ok(())
    }

    async fn disable_server(&self, id: &str) -> anyhow::Result<()> {
        let mut servers = self.deps().config.servers().await;
        let Some(server) = servers.iter_mut().find(|s| s.id == id) else {
            anyhow::bail!("unknown server {id}");
        };
        server.disabled = true;
        self.deps().config.write_servers(servers).await?;
        Ok(())
    }

    async fn reload_server(&self, id: &str) -> anyhow::Result<()> {
        ProxyServer::reload_server(self, id).await
    }

    async fn delete_outbound(&self, name: &str) -> anyhow::Result<()> {
        self.deps().outbound_manager.delete(name).await?;
        Ok(())
    }

    async fn kick_player(&self, name: &str) -> anyhow::Result<usize> {
        Ok(self.deps().registry.remove_by_player_name(name).await)
    }

    async fn add_blacklist_entry(&self, entry: CreateBlacklistEntry) -> anyhow::Result<()> {
        self.deps()
            .acl_repo
            .create_blacklist_entry(BlacklistEntry {
                id: uuid::Uuid::new_v4().to_string(),
                display_name: entry.display_name,
                reason: entry.reason,
                server_id: entry.server_id,
                added_at: now_unix(),
                expires_at: entry.expires_at,
            })
            .await?;
        Ok(())
    }

    async fn remove_blacklist_entry(&self, id: &str) -> anyhow::Result<()> {
        for server_id in acl_scopes(self).await {
            self.deps().acl_repo.delete_blacklist_entry(id, &server_id).await?;
        }
        Ok(())
    }

    async fn add_whitelist_entry(&self, entry: CreateWhitelistEntry) -> anyhow::Result<()> {
        self.deps()
            .acl_repo
            .create_whitelist_entry(WhitelistEntry {
                id: uuid::Uuid::new_v4().to_string(),
                display_name: entry.display_name,
                server_id: entry.server_id,
            })
            .await?;
        Ok(())
    }

    async fn remove_whitelist_entry(&self, id: &str) -> anyhow::Result<()> {
        for server_id in acl_scopes(self).await {
            self.deps().acl_repo.delete_whitelist_entry(id, &server_id).await?;
        }
        Ok(())
    }
}

async fn acl_scopes(server: &ProxyServer) -> Vec<String> {
    let mut scopes: Vec<String> = vec![String::new()];
    for cfg in server.deps().config.servers().await {
        scopes.push(cfg.id);
    }
    scopes
}

async fn serialize_server(
    server: &ProxyServer,
    cfg: &crate::config::ServerConfig,
    listening: &std::collections::HashSet<String>,
) -> ServerSummary {
    let session_count = server
        .deps()
        .registry
        .get_all_sessions()
        .await
        .into_iter()
        .filter(|s| s.server_id == cfg.id)
        .count();
    ServerSummary {
        id: cfg.id.clone(),
        name: cfg.name.clone(),
        target: cfg.target.clone(),
        port: cfg.port,
        listen_addr: cfg.listen_addr.clone(),
        wire_mode: wire_mode_str(cfg.wire_mode),
        enabled: cfg.enabled,
        disabled: cfg.disabled,
        listening: listening.contains(&cfg.id),
        proxy_outbound: cfg.proxy_outbound.clone(),
        load_balance: load_balance_str(cfg.load_balance),
        session_count,
    }
}

fn serialize_blacklist_entry(entry: BlacklistEntry) -> BlacklistEntrySummary {
    BlacklistEntrySummary {
        id: entry.id,
        display_name: entry.display_name,
        reason: entry.reason,
        server_id: entry.server_id,
        added_at: entry.added_at,
        expires_at: entry.expires_at,
    }
}

fn serialize_whitelist_entry(entry: WhitelistEntry) -> WhitelistEntrySummary {
    WhitelistEntrySummary {
        id: entry.id,
        display_name: entry.display_name,
        server_id: entry.server_id,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
