use serde::{Deserialize, Serialize};

/// Summary of one proxied server, as surfaced to the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub target: String,
    pub port: u16,
    pub listen_addr: String,
    pub wire_mode: String,
    pub enabled: bool,
    pub disabled: bool,
    pub listening: bool,
    pub proxy_outbound: Option<String>,
    pub load_balance: String,
    pub session_count: usize,
}

/// Summary of one configured outbound tunnel, with its last observed
/// health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct OutboundSummary {
    pub name: String,
    pub kind: String,
    pub server: String,
    pub port: u16,
    pub group: String,
    pub enabled: bool,
    pub healthy: bool,
    pub ever_tested: bool,
    pub latency_ms: u64,
    pub last_check_age_ms: u64,
    pub last_error: Option<String>,
    pub conn_count: u64,
}

/// Aggregate health stats for a named outbound group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct GroupStatsSummary {
    pub group: String,
    pub total_count: usize,
    pub healthy_count: usize,
    pub udp_available_count: usize,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
}

/// A live client<->proxy<->remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct SessionSummary {
    pub id: String,
    pub client_addr: String,
    pub server_id: String,
    pub display_name: Option<String>,
    pub uuid: Option<String>,
    pub xuid: Option<String>,
    pub start_time_unix_ms: u64,
    pub last_seen_unix_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// A blacklist entry, global when `server_id` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct BlacklistEntrySummary {
    pub id: String,
    pub display_name: String,
    pub reason: Option<String>,
    pub server_id: String,
    pub added_at: i64,
    pub expires_at: Option<i64>,
}

/// A whitelist entry, global when `server_id` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct WhitelistEntrySummary {
    pub id: String,
    pub display_name: String,
    pub server_id: String,
}

/// Request body to add a blacklist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct CreateBlacklistEntry {
    pub display_name: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Request body to add a whitelist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct CreateWhitelistEntry {
    pub display_name: String,
    #[serde(default)]
    pub server_id: String,
}

