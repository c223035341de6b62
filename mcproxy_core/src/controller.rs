//! ProxyServer controller (C9): owns a `serverId -> listener` map,
//! reacts to config reloads, and drives the background tasks every
//! listener depends on (idle-session GC, DNS refresh, auto-ping, MOTD
//! refresh, config watchers).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use raknet::datatypes::WriteBuf;
use raknet::message::{Message, RaknetMessage};
use raknet::MAGIC;

use crate::bedrock::listener::{spawn_listener, ListenerDeps, ListenerHandle};
use crate::bedrock::motd::MotdCache;
use crate::bedrock::snapshot::{ControllerSnapshot, ServerSessionSnapshot, SessionSnapshotRecord};
use crate::config::{ConfigProvider, LatencyAxis, ServerConfig};
use crate::dialer::ProxyDialer;
use crate::outbound::manager::OutboundManager;
use crate::persistence::{AclRepository, SessionRepository};
use crate::registry::SessionRegistry;
use crate::snapshot::RecoverableProxyServer;

const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const AUTO_PING_TICK: Duration = Duration::from_secs(30);
const AUTO_PING_DEFAULT_MINUTES: u64 = 10;
const AUTO_PING_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const AUTO_PING_PONG_TIMEOUT: Duration = Duration::from_secs(3);
const UNCONNECTED_PONG_ID: u8 = 0x1c;

struct RunningListener {
    server: ServerConfig,
    handle: ListenerHandle,
}

/// Everything a running listener or background task needs, bundled so
/// the controller can hand out a cheap clone to each spawned task.
#[derive(Clone)]
pub struct ControllerDeps {
    pub config: Arc<ConfigProvider>,
    pub acl_repo: Arc<dyn AclRepository>,
    pub session_repo: Arc<dyn SessionRepository>,
    pub registry: Arc<SessionRegistry>,
    pub outbound_manager: Arc<OutboundManager>,
    pub dialer: Arc<ProxyDialer>,
    pub motd_cache: Arc<MotdCache>,
}

pub struct ProxyServer {
    deps: ControllerDeps,
    listeners: RwLock<HashMap<String, RunningListener>>,
    root_cancel: CancellationToken,
    background: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(deps: ControllerDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            listeners: RwLock::new(HashMap::new()),
            root_cancel: CancellationToken::new(),
            background: RwLock::new(Vec::new()),
        })
    }

    /// Starts every enabled server's listener and the background
    /// tasks, then registers the config `OnChange` diff hook.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.deps
            .outbound_manager
            .set_server_config_updater(self.deps.config.clone())
            .await;

        let servers = self.deps.config.servers().await;
        for server in servers {
            if server.enabled && !server.disabled {
                if let Err(err) = self.start_listener(server.clone()).await {
                    log::error!("failed to start listener for {}: {err}", server.id);
                }
            }
        }

        self.spawn_background_tasks().await;

        let this = self.clone();
        self.deps
            .config
            .on_change(move |snapshot| {
                let this = this.clone();
                let desired = snapshot.servers.clone();
                let desired_outbounds = snapshot.outbounds.clone();
                tokio::spawn(async move {
                    this.deps.outbound_manager.reload(desired_outbounds).await;
                    this.reconcile(desired).await;
                });
            })
            .await;

        Ok(())
    }

    /// Diffs `desired` against the currently running listeners per the
    /// rules: removed/disabled -> stop, new enabled -> start, same kind
    /// -> leave in place (new sessions pick up the latest config from
    /// `ConfigProvider` directly), kind changed -> restart.
    async fn reconcile(&self, desired: Vec<ServerConfig>) {
        let desired_by_id: HashMap<&str, &ServerConfig> =
            desired.iter().map(|s| (s.id.as_str(), s)).collect();

        let current_ids: Vec<String> = self.listeners.read().await.keys().cloned().collect();
        for id in &current_ids {
            match desired_by_id.get(id.as_str()) {
                None => self.stop_listener(id).await,
                Some(wanted) if !wanted.enabled || wanted.disabled => self.stop_listener(id).await,
                Some(wanted) => {
                    let kind_changed = {
                        let listeners = self.listeners.read().await;
                        listeners
                            .get(id.as_str())
                            .map(|running| running.server.wire_mode != wanted.wire_mode)
                            .unwrap_or(false)
                    };
                    if kind_changed {
                        self.stop_listener(id).await;
                        if let Err(err) = self.start_listener((*wanted).clone()).await {
                            log::error!("failed to restart listener for {id}: {err}");
                        }
                    }
                }
            }
        }

        for server in desired {
            if !server.enabled || server.disabled {
                continue;
            }
            let already_running = self.listeners.read().await.contains_key(&server.id);
            if !already_running {
                if let Err(err) = self.start_listener(server.clone()).await {
                    log::error!("failed to start listener for {}: {err}", server.id);
                }
            }
        }
    }

    async fn start_listener(&self, server: ServerConfig) -> anyhow::Result<()> {
        let destination = self.resolve_destination(&server).await?;
        let deps = ListenerDeps {
            acl_repo: self.deps.acl_repo.clone(),
            session_repo: self.deps.session_repo.clone(),
            registry: self.deps.registry.clone(),
            dialer: self.deps.dialer.clone(),
        };
        let handle = spawn_listener(server.clone(), destination, deps, self.deps.motd_cache.clone()).await?;
        self.listeners
            .write()
            .await
            .insert(server.id.clone(), RunningListener { server, handle });
        Ok(())
    }

    async fn resolve_destination(&self, server: &ServerConfig) -> anyhow::Result<SocketAddr> {
        let ip = self.deps.config.resolve_target(server).await?;
        Ok(SocketAddr::new(ip, server.port))
    }

    async fn stop_listener(&self, id: &str) {
        let running = self.listeners.write().await.remove(id);
        if let Some(running) = running {
            running.handle.stop().await;
        }
    }

    /// Atomic-restart variant for a single server id: stop then start
    /// from the latest config (a no-op if the id no longer exists or
    /// is disabled).
    pub async fn reload_server(&self, id: &str) -> anyhow::Result<()> {
        self.stop_listener(id).await;
        if let Some(server) = self.deps.config.server(id).await {
            if server.enabled && !server.disabled {
                self.start_listener(server).await?;
            }
        }
        Ok(())
    }

    /// Shared collaborators, for admin-facing code that needs to reach
    /// into the registry, outbound manager or config provider directly.
    pub fn deps(&self) -> &ControllerDeps {
        &self.deps
    }

    /// Ids of servers with a currently running listener.
    pub async fn listening_ids(&self) -> std::collections::HashSet<String> {
        self.listeners.read().await.keys().cloned().collect()
    }

    async fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.background.write().await;
        tasks.push(self.clone().spawn_idle_gc());
        tasks.push(self.clone().spawn_dns_refresh());
        tasks.push(self.clone().spawn_auto_ping());
        tasks.push(self.clone().spawn_motd_refresh());
    }

    fn spawn_idle_gc(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel = self.root_cancel.clone();
        tokio::spawn(async move {
            loop {
                let interval = Duration::from_secs(self.deps.config.global().await.idle_gc_interval_seconds.max(1));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let global = self.deps.config.global().await;
                let servers = self.deps.config.servers().await;
                let servers_by_id: HashMap<String, ServerConfig> =
                    servers.into_iter().map(|s| (s.id.clone(), s)).collect();
                self.deps
                    .registry
                    .gc_idle(|session| effective_idle_timeout(&global, servers_by_id.get(&session.server_id)))
                    .await;
            }
        })
    }

    fn spawn_dns_refresh(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel = self.root_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(DNS_REFRESH_INTERVAL) => {}
                }
                for server in self.deps.config.servers().await {
                    if let Err(err) = self.deps.config.resolve_target(&server).await {
                        log::warn!("dns refresh failed for {}: {err}", server.id);
                    }
                }
            }
        })
    }

    fn spawn_motd_refresh(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel = self.root_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
                let global = self.deps.config.global().await;
                for server in self.deps.config.servers().await {
                    if !server.enabled || server.disabled {
                        continue;
                    }
                    let Ok(destination) = self.resolve_destination(&server).await else {
                        continue;
                    };
                    if let Err(err) = self
                        .deps
                        .motd_cache
                        .refresh(&global.proxy_bind, destination, false)
                        .await
                    {
                        log::debug!("motd refresh failed for {}: {err}", server.id);
                    }
                }
            }
        })
    }

    /// Per server with `auto_ping_enabled`, iterates the node set its
    /// `proxy_outbound` selector implies and pings each one through the
    /// outbound, recording the measured latency (or clearing it to 0 on
    /// failure) keyed by `(server, node)`.
    fn spawn_auto_ping(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cancel = self.root_cancel.clone();
        tokio::spawn(async move {
            let mut elapsed_since_run: HashMap<String, Duration> = HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(AUTO_PING_TICK) => {}
                }
                for server in self.deps.config.servers().await {
                    if !server.auto_ping_enabled {
                        continue;
                    }
                    let minutes = if server.auto_ping_interval_minutes == 0 {
                        AUTO_PING_DEFAULT_MINUTES
                    } else {
                        server.auto_ping_interval_minutes
                    };
                    let interval = Duration::from_secs(minutes * 60);
                    let since = elapsed_since_run.entry(server.id.clone()).or_insert(Duration::ZERO);
                    *since += AUTO_PING_TICK;
                    if *since < interval {
                        continue;
                    }
                    *since = Duration::ZERO;

                    let Ok(destination) = self.resolve_destination(&server).await else {
                        continue;
                    };
                    let nodes = self
                        .deps
                        .outbound_manager
                        .node_names_for_selector(server.outbound_selector())
                        .await;
                    for node in nodes {
                        self.ping_node(&node, destination).await;
                    }
                }
            }
        })
    }

    async fn ping_node(&self, node: &str, destination: SocketAddr) {
        let latency_ms = ping_via_outbound(&self.deps.outbound_manager, node, destination).await;
        self.deps
            .outbound_manager
            .record_ping_latency(node, LatencyAxis::Udp, latency_ms)
            .await;
    }

    /// Cancels the root context, stops every listener (draining its
    /// sessions, each removal triggering persistence), then waits for
    /// background tasks to exit.
    pub async fn stop(&self) {
        self.root_cancel.cancel();

        let ids: Vec<String> = self.listeners.read().await.keys().cloned().collect();
        for id in ids {
            self.stop_listener(&id).await;
        }

        for task in self.background.write().await.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

#[async_trait::async_trait]
impl RecoverableProxyServer for ProxyServer {
    type Snapshot = ControllerSnapshot;

    async fn take_snapshot(&self) -> anyhow::Result<ControllerSnapshot> {
        let proxy_bind = self.deps.config.global().await.proxy_bind;
        let sessions = self.deps.registry.get_all_sessions().await;

        let mut by_server: HashMap<String, Vec<SessionSnapshotRecord>> = HashMap::new();
        for session in sessions {
            by_server
                .entry(session.server_id.clone())
                .or_default()
                .push(SessionSnapshotRecord {
                    client_addr: session.client_addr.to_string(),
                    display_name: session.display_name,
                    uuid: session.uuid,
                    xuid: session.xuid,
                });
        }

        Ok(ControllerSnapshot {
            taken_at: std::time::SystemTime::now(),
            proxy_bind,
            servers: by_server
                .into_iter()
                .map(|(server_id, sessions)| ServerSessionSnapshot { server_id, sessions })
                .collect(),
        })
    }

    /// Sessions cannot be reattached to their UDP sockets across a
    /// process restart; recovery is informational only, so clients
    /// simply reconnect through the normal handshake and a fresh
    /// session registers itself.
    async fn recover_from_snapshot(&self, snapshot: ControllerSnapshot) {
        if snapshot.has_expired() {
            log::info!("recovery snapshot is stale, ignoring ({} sessions)", snapshot.total_sessions());
            return;
        }
        log::info!(
            "recovered {} sessions across {} servers from previous run; clients will reconnect",
            snapshot.total_sessions(),
            snapshot.servers.len()
        );
    }
}

fn effective_idle_timeout(global: &crate::config::GlobalConfig, server: Option<&ServerConfig>) -> Duration {
    if let Some(override_secs) = global.passthrough_idle_timeout_override {
        if override_secs > 0 {
            return Duration::from_secs(override_secs);
        }
    }
    if let Some(server) = server {
        if server.idle_timeout_seconds > 0 {
            return Duration::from_secs(server.idle_timeout_seconds);
        }
    }
    Duration::from_secs(300)
}

/// Opens a UDP packet conn through `node`, emits a RakNet unconnected
/// ping, and waits for the pong. Returns the round-trip latency in
/// milliseconds, or `None` if the node didn't answer in time.
async fn ping_via_outbound(manager: &OutboundManager, node: &str, destination: SocketAddr) -> Option<u64> {
    let conn = tokio::time::timeout(AUTO_PING_DIAL_TIMEOUT, manager.dial_packet_conn(node, destination))
        .await
        .ok()?
        .ok()?;

    let started = tokio::time::Instant::now();
    let ping = build_unconnected_ping();
    conn.send_to(&ping, destination).await.ok()?;

    let mut buf = vec![0u8; 1024];
    let result = tokio::time::timeout(AUTO_PING_PONG_TIMEOUT, async {
        loop {
            let (n, _from) = conn.recv_from(&mut buf).await.ok()?;
            if n > 0 && buf[0] == UNCONNECTED_PONG_ID {
                return Some(());
            }
        }
    })
    .await;

    conn.close().await.ok();
    match result {
        Ok(Some(())) => Some(started.elapsed().as_millis() as u64),
        _ => None,
    }
}

fn build_unconnected_ping() -> Vec<u8> {
    let mut buf = WriteBuf::new();
    buf.write_u8(RaknetMessage::UnconnectedPing.to_u8()).ok();
    buf.write_i64(now_ms() as i64).ok();
    buf.0.extend_from_slice(&MAGIC);
    buf.write_i64(rand::random::<i64>()).ok();
    buf.0.to_vec()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
