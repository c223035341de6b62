//! Typed configuration model (C1): servers, outbounds and global
//! settings, loaded from three JSON documents and kept current by a
//! debounced filesystem watch.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify_debouncer_mini::{new_debouncer, notify::RecursiveMode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, RwLockReadGuard};

use crate::acl::{ACLSettings, BlacklistEntry, WhitelistEntry};
use crate::error::{ProxyError, ProxyResult};
use crate::outbound::OutboundConfig;

/// Load balancing strategy used to pick among candidate outbound nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceMethod {
    LeastLatency,
    RoundRobin,
    Random,
    LeastConnections,
}

impl Default for LoadBalanceMethod {
    fn default() -> Self {
        Self::LeastLatency
    }
}

/// Axis a `least-latency`/stats query sorts or averages on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyAxis {
    Tcp,
    Udp,
    Http,
}

impl Default for LatencyAxis {
    fn default() -> Self {
        Self::Udp
    }
}

/// The wire mode a listener runs in for a given server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireMode {
    /// Full session engine: parses the login handshake and forwards
    /// the client's own JWTs unmodified.
    Passthrough,
    /// Session engine that only scrapes player info off the wire
    /// without gating on ACL.
    Raknet,
    /// Transparent UDP relay, no RakNet parsing at all.
    RawUdp,
    /// Transparent UDP relay with minimal session bookkeeping.
    Transparent,
    PlainTcp,
    PlainUdp,
    TcpUdp,
}

impl Default for WireMode {
    fn default() -> Self {
        Self::Passthrough
    }
}

/// One proxied Minecraft: Bedrock Edition server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub target: String,
    pub port: u16,
    pub listen_addr: String,

    #[serde(default)]
    pub wire_mode: WireMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub custom_motd: Option<String>,
    #[serde(default)]
    pub proxy_outbound: Option<String>,
    #[serde(default)]
    pub load_balance: LoadBalanceMethod,
    #[serde(default)]
    pub load_balance_sort: LatencyAxis,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_resolve_interval")]
    pub resolve_interval_seconds: u64,

    #[serde(default)]
    pub auto_ping_enabled: bool,
    #[serde(default = "default_auto_ping_interval")]
    pub auto_ping_interval_minutes: u64,
}

fn default_true() -> bool {
    true
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_resolve_interval() -> u64 {
    60
}
fn default_auto_ping_interval() -> u64 {
    10
}

impl ServerConfig {
    pub fn validate(&self) -> ProxyResult<()> {
        if self.id.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid("server id must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ProxyError::ConfigInvalid(format!(
                "server {}: port must be in [1,65535]",
                self.id
            )));
        }
        if self.target.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid(format!(
                "server {}: target must not be empty",
                self.id
            )));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid(format!(
                "server {}: listen_addr must not be empty",
                self.id
            )));
        }
        Ok(())
    }

    /// Effective `proxy_outbound` selector, `"direct"` standing in for
    /// "dial the target directly".
    pub fn outbound_selector(&self) -> &str {
        match &self.proxy_outbound {
            Some(selector) if !selector.is_empty() => selector,
            _ => "direct",
        }
    }
}

/// Global settings applying to every server unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_proxy_bind")]
    pub proxy_bind: String,
    #[serde(default)]
    pub passthrough_idle_timeout_override: Option<u64>,
    #[serde(default = "default_idle_gc_interval")]
    pub idle_gc_interval_seconds: u64,
    #[serde(default = "default_true")]
    pub show_real_latency: bool,
    #[serde(default)]
    pub acl: ACLSettings,
}

fn default_proxy_bind() -> String {
    "0.0.0.0:0".to_owned()
}
fn default_idle_gc_interval() -> u64 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            proxy_bind: default_proxy_bind(),
            passthrough_idle_timeout_override: None,
            idle_gc_interval_seconds: default_idle_gc_interval(),
            show_real_latency: true,
            acl: ACLSettings::default(),
        }
    }
}

/// ACL lists kept alongside the config documents when no external
/// persistence collaborator is configured (see [`crate::persistence`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclDocument {
    #[serde(default)]
    pub blacklist: Vec<BlacklistEntry>,
    #[serde(default)]
    pub whitelist: Vec<WhitelistEntry>,
}

/// A consistent, validated snapshot of everything loaded from disk.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub servers: Vec<ServerConfig>,
    pub outbounds: Vec<OutboundConfig>,
    pub global: GlobalConfig,
}

type OnChangeHook = Box<dyn Fn(&ConfigSnapshot) + Send + Sync>;

/// Paths to the three config documents.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub servers: PathBuf,
    pub outbounds: PathBuf,
    pub global: PathBuf,
}

/// Owns the current [`ConfigSnapshot`], a DNS resolution cache, and the
/// filesystem watcher that keeps both current.
pub struct ConfigProvider {
    paths: ConfigPaths,
    snapshot: RwLock<ConfigSnapshot>,
    dns_cache: RwLock<HashMap<String, (IpAddr, Instant)>>,
    reload_notify: Notify,
    on_change: RwLock<Vec<OnChangeHook>>,
    self_ref: std::sync::RwLock<std::sync::Weak<Self>>,
}

impl ConfigProvider {
    /// Loads the three documents from disk and validates every record.
    /// Returns the `ConfigInvalid` error of the first bad record without
    /// mutating any existing state.
    pub async fn load(paths: ConfigPaths) -> ProxyResult<Arc<Self>> {
        let snapshot = Self::read_snapshot(&paths).await?;
        let this = Arc::new(Self {
            paths,
            snapshot: RwLock::new(snapshot),
            dns_cache: RwLock::new(HashMap::new()),
            reload_notify: Notify::new(),
            on_change: RwLock::new(Vec::new()),
            self_ref: std::sync::RwLock::new(std::sync::Weak::new()),
        });
        *this.self_ref.write().unwrap() = Arc::downgrade(&this);
        Ok(this)
    }

    async fn read_snapshot(paths: &ConfigPaths) -> ProxyResult<ConfigSnapshot> {
        let servers = read_json_array::<ServerConfig>(&paths.servers).await?;
        for server in &servers {
            server.validate()?;
        }
        let outbounds = read_json_array::<OutboundConfig>(&paths.outbounds).await?;
        for outbound in &outbounds {
            outbound.validate()?;
        }
        let global = match tokio::fs::read(&paths.global).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| ProxyError::ConfigInvalid(format!("global settings: {err}")))?,
            Err(_) => GlobalConfig::default(),
        };
        Ok(ConfigSnapshot {
            servers,
            outbounds,
            global,
        })
    }

    #[inline]
    pub async fn snapshot(&self) -> RwLockReadGuard<'_, ConfigSnapshot> {
        self.snapshot.read().await
    }

    pub async fn servers(&self) -> Vec<ServerConfig> {
        self.snapshot.read().await.servers.clone()
    }

    pub async fn server(&self, id: &str) -> Option<ServerConfig> {
        self.snapshot
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn global(&self) -> GlobalConfig {
        self.snapshot.read().await.global.clone()
    }

    /// Registers a callback invoked after every successful reload, with
    /// the provider's internal lock already released.
    pub async fn on_change<F>(&self, hook: F)
    where
        F: Fn(&ConfigSnapshot) + Send + Sync + 'static,
    {
        self.on_change.write().await.push(Box::new(hook));
    }

    #[inline]
    pub async fn wait_reload(&self) {
        self.reload_notify.notified().await;
    }

    /// Re-reads all three documents; on any validation error the prior
    /// snapshot is retained and the error is returned to the caller.
    pub async fn reload(&self) -> ProxyResult<()> {
        let next = Self::read_snapshot(&self.paths).await?;
        {
            let mut snapshot = self.snapshot.write().await;
            *snapshot = next;
        }
        self.reload_notify.notify_waiters();
        let snapshot = self.snapshot.read().await;
        for hook in self.on_change.read().await.iter() {
            hook(&snapshot);
        }
        Ok(())
    }

    /// Spawns the debounced filesystem watcher over all three document
    /// directories. Each filesystem event coalesced within ~100ms
    /// triggers one [`ConfigProvider::reload`].
    pub fn watch(self: &Arc<Self>) -> anyhow::Result<notify_debouncer_mini::Debouncer<notify_debouncer_mini::notify::RecommendedWatcher>> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut debouncer = new_debouncer(Duration::from_millis(100), move |res| {
            let _ = tx.send(res);
        })?;

        for path in [&self.paths.servers, &self.paths.outbounds, &self.paths.global] {
            if let Some(dir) = path.parent() {
                debouncer
                    .watcher()
                    .watch(dir, RecursiveMode::NonRecursive)?;
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                if res.is_err() {
                    continue;
                }
                if let Err(err) = this.reload().await {
                    log::warn!("config reload rejected: {err}");
                }
            }
        });
        Ok(debouncer)
    }

    /// Looks up (and lazily populates) the cached resolved IP for a
    /// server's `target` hostname.
    pub async fn resolve_target(&self, server: &ServerConfig) -> std::io::Result<IpAddr> {
        {
            let cache = self.dns_cache.read().await;
            if let Some((ip, resolved_at)) = cache.get(&server.target) {
                let ttl = Duration::from_secs(server.resolve_interval_seconds.max(1));
                if resolved_at.elapsed() < ttl {
                    return Ok(*ip);
                }
            }
        }
        let ip = resolve_a_record(&server.target).await?;
        self.dns_cache
            .write()
            .await
            .insert(server.target.clone(), (ip, Instant::now()));
        Ok(ip)
    }

    /// Validates and persists a full replacement of the server list,
    /// then reloads so `on_change` hooks observe it.
    pub async fn write_servers(&self, servers: Vec<ServerConfig>) -> ProxyResult<()> {
        for server in &servers {
            server.validate()?;
        }
        write_json_array(&self.paths.servers, &servers).await?;
        self.reload().await
    }

    /// Validates and persists a full replacement of the outbound list,
    /// then reloads so `on_change` hooks observe it.
    pub async fn write_outbounds(&self, outbounds: Vec<OutboundConfig>) -> ProxyResult<()> {
        for outbound in &outbounds {
            outbound.validate()?;
        }
        write_json_array(&self.paths.outbounds, &outbounds).await?;
        self.reload().await
    }
}

impl crate::outbound::manager::ServerConfigUpdater for ConfigProvider {
    /// Rewrites every server referencing `outbound_name` to `"direct"`
    /// and persists the change. Runs synchronously from
    /// [`crate::outbound::manager::OutboundManager::delete`]'s caller
    /// context, so the write and reload are dispatched onto a detached
    /// task rather than awaited in place.
    fn rewrite_outbound_to_direct(&self, outbound_name: &str) {
        let Some(mut servers) = self.snapshot.try_read().ok().map(|s| s.servers.clone()) else {
            log::warn!("could not read config snapshot to cascade outbound deletion for {outbound_name}");
            return;
        };
        let mut changed = false;
        for server in &mut servers {
            if server.proxy_outbound.as_deref() == Some(outbound_name) {
                server.proxy_outbound = Some("direct".to_owned());
                changed = true;
            }
        }
        if !changed {
            return;
        }
        let Some(this) = self.self_ref.read().unwrap().upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = this.write_servers(servers).await {
                log::warn!("failed to persist cascade rewrite for deleted outbound: {err}");
            }
        });
    }
}

async fn resolve_a_record(host: &str) -> std::io::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = tokio::net::lookup_host((host, 0)).await?;
    addrs
        .find(|addr| addr.is_ipv4())
        .or_else(|| {
            // re-resolve for the v6-only case; lookup_host's iterator is single-pass
            None
        })
        .map(|addr| addr.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no A record"))
}

async fn read_json_array<T: for<'de> Deserialize<'de>>(path: &Path) -> ProxyResult<Vec<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            ProxyError::ConfigInvalid(format!("{}: {err}", path.display()))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(ProxyError::ConfigInvalid(format!("{}: {err}", path.display()))),
    }
}

/// Writes `items` as pretty JSON to `path` via a same-directory temp
/// file plus rename, so a reload racing the write never observes a
/// half-written document.
async fn write_json_array<T: Serialize>(path: &Path, items: &[T]) -> ProxyResult<()> {
    let body = serde_json::to_vec_pretty(items)
        .map_err(|err| ProxyError::ConfigInvalid(format!("{}: {err}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|err| ProxyError::ConfigInvalid(format!("{}: {err}", path.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| ProxyError::ConfigInvalid(format!("{}: {err}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_owned(),
            name: id.to_owned(),
            target: "127.0.0.1".to_owned(),
            port: 19132,
            listen_addr: "0.0.0.0:19132".to_owned(),
            wire_mode: WireMode::Passthrough,
            enabled: true,
            disabled: false,
            custom_motd: None,
            proxy_outbound: None,
            load_balance: LoadBalanceMethod::LeastLatency,
            load_balance_sort: LatencyAxis::Udp,
            idle_timeout_seconds: 300,
            resolve_interval_seconds: 60,
            auto_ping_enabled: false,
            auto_ping_interval_minutes: 10,
        }
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut cfg = server("s1");
        cfg.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn outbound_selector_defaults_to_direct() {
        let cfg = server("s1");
        assert_eq!(cfg.outbound_selector(), "direct");
    }

    #[test]
    fn config_round_trip_is_stable() {
        let cfg = server("s1");
        let json = serde_json::to_string(&cfg).unwrap();
        let reparsed: ServerConfig = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(json, json2);
    }
}
