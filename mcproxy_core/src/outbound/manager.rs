//! Outbound manager (C4): named registry of outbound configs + live
//! instances, selection with failover, health checks and group stats.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::{LatencyAxis, LoadBalanceMethod};
use crate::error::{ProxyError, ProxyResult};
use crate::load_balancer::{Candidate, LoadBalancer};
use crate::outbound::{
    build_instance, now_ms, OutboundConfig, OutboundHealth, OutboundInstance, PacketConn,
};

struct Entry {
    config: OutboundConfig,
    instance: Option<Arc<dyn OutboundInstance>>,
    health: Arc<OutboundHealth>,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    pub last_check_age_ms: u64,
    pub conn_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupStats {
    pub total_count: usize,
    pub healthy_count: usize,
    pub udp_available_count: usize,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
}

/// Hook invoked when [`OutboundManager::delete`] cascades: every
/// server referencing the deleted outbound should have its
/// `proxy_outbound` rewritten to `"direct"`.
pub trait ServerConfigUpdater: Send + Sync {
    fn rewrite_outbound_to_direct(&self, outbound_name: &str);
}

const UNHEALTHY_GRACE_MS: u64 = 30_000;
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_RETRY_MAX_ATTEMPTS: u32 = 3;
const DIAL_RETRY_BASE: Duration = Duration::from_millis(100);
const DIAL_RETRY_CAP: Duration = Duration::from_secs(2);

pub struct OutboundManager {
    entries: RwLock<HashMap<String, Entry>>,
    load_balancer: LoadBalancer,
    server_config_updater: RwLock<Option<Arc<dyn ServerConfigUpdater>>>,
}

impl OutboundManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            load_balancer: LoadBalancer::new(),
            server_config_updater: RwLock::new(None),
        })
    }

    pub async fn set_server_config_updater(&self, updater: Arc<dyn ServerConfigUpdater>) {
        *self.server_config_updater.write().await = Some(updater);
    }

    pub async fn add(&self, cfg: OutboundConfig) -> ProxyResult<()> {
        cfg.validate()?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(&cfg.name) {
            return Err(ProxyError::OutboundExists(cfg.name));
        }
        entries.insert(
            cfg.name.clone(),
            Entry {
                config: cfg,
                instance: None,
                health: Arc::new(OutboundHealth::default()),
            },
        );
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<OutboundConfig> {
        self.entries.read().await.get(name).map(|e| e.config.clone())
    }

    pub async fn list(&self) -> Vec<OutboundConfig> {
        self.entries.read().await.values().map(|e| e.config.clone()).collect()
    }

    pub async fn update(&self, old_name: &str, cfg: OutboundConfig) -> ProxyResult<()> {
        cfg.validate()?;
        let mut entries = self.entries.write().await;
        if !entries.contains_key(old_name) {
            return Err(ProxyError::OutboundNotFound(old_name.to_owned()));
        }
        if cfg.name != old_name && entries.contains_key(&cfg.name) {
            return Err(ProxyError::OutboundExists(cfg.name));
        }
        entries.remove(old_name);
        entries.insert(
            cfg.name.clone(),
            Entry {
                config: cfg,
                instance: None,
                health: Arc::new(OutboundHealth::default()),
            },
        );
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> ProxyResult<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(name).is_none() {
            return Err(ProxyError::OutboundNotFound(name.to_owned()));
        }
        drop(entries);
        if let Some(updater) = self.server_config_updater.read().await.clone() {
            updater.rewrite_outbound_to_direct(name);
        }
        Ok(())
    }

    pub async fn check_health(&self, name: &str) -> ProxyResult<()> {
        let (cfg, health, needs_instance) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(name)
                .ok_or_else(|| ProxyError::OutboundNotFound(name.to_owned()))?;
            (
                entry.config.clone(),
                entry.health.clone(),
                !entry.health.is_healthy(),
            )
        };

        if needs_instance {
            self.ensure_instance(name).await?;
        }
        let instance = self.instance_of(name).await?;

        let probe_dest: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let started = Instant::now();
        let result = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, instance.open_udp(probe_dest)).await;
        match result {
            Ok(Ok(_conn)) => {
                health.mark_healthy();
                health.set_latency(LatencyAxis::Udp, started.elapsed().as_millis() as u64);
                health.udp_available.store(true, Ordering::Relaxed);
            }
            Ok(Err(err)) => health.mark_unhealthy(err),
            Err(_) => health.mark_unhealthy("health probe timed out"),
        }
        let _ = cfg;
        Ok(())
    }

    pub async fn health_status(&self, name: &str) -> Option<HealthStatus> {
        let entries = self.entries.read().await;
        let entry = entries.get(name)?;
        let health = &entry.health;
        Some(HealthStatus {
            healthy: health.is_healthy(),
            latency_ms: health.latency(entry.config.load_balance_sort_axis()),
            last_check_age_ms: health.last_check_age_ms(),
            conn_count: health.conn_count.load(Ordering::Relaxed),
            last_error: health.last_error.lock().unwrap().clone(),
        })
    }

    async fn ensure_instance(&self, name: &str) -> ProxyResult<()> {
        let cfg = {
            let entries = self.entries.read().await;
            entries
                .get(name)
                .ok_or_else(|| ProxyError::OutboundNotFound(name.to_owned()))?
                .config
                .clone()
        };
        let instance = build_instance(&cfg)
            .map_err(|err| ProxyError::OutboundUnhealthy(format!("{name}: {err}")))?;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(name) {
            entry.instance = Some(instance);
        }
        Ok(())
    }

    async fn instance_of(&self, name: &str) -> ProxyResult<Arc<dyn OutboundInstance>> {
        if let Some(instance) = self.entries.read().await.get(name).and_then(|e| e.instance.clone()) {
            return Ok(instance);
        }
        self.ensure_instance(name).await?;
        self.entries
            .read()
            .await
            .get(name)
            .and_then(|e| e.instance.clone())
            .ok_or_else(|| ProxyError::OutboundNotFound(name.to_owned()))
    }

    /// Hot path: dial through `name`, retrying with backoff.
    pub async fn dial_packet_conn(
        &self,
        name: &str,
        destination: SocketAddr,
    ) -> ProxyResult<Arc<dyn PacketConn>> {
        let health = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(name)
                .ok_or_else(|| ProxyError::OutboundNotFound(name.to_owned()))?;
            if !entry.config.enabled {
                return Err(ProxyError::OutboundUnhealthy(format!("{name}: disabled")));
            }
            entry.health.clone()
        };

        if !health.is_healthy()
            && health.last_error.lock().unwrap().is_some()
            && health.last_check_age_ms() < UNHEALTHY_GRACE_MS
        {
            return Err(ProxyError::OutboundUnhealthy(name.to_owned()));
        }
        if health.last_check_age_ms() >= UNHEALTHY_GRACE_MS {
            self.ensure_instance(name).await?;
        }

        let mut delay = DIAL_RETRY_BASE;
        let mut last_err = None;
        for attempt in 0..DIAL_RETRY_MAX_ATTEMPTS {
            if !health.is_healthy()
                && health.last_error.lock().unwrap().is_some()
                && health.last_check_age_ms() < UNHEALTHY_GRACE_MS
            {
                return Err(ProxyError::OutboundUnhealthy(name.to_owned()));
            }

            let instance = self.instance_of(name).await?;
            match instance.open_udp(destination).await {
                Ok(conn) => {
                    health.mark_healthy();
                    health.conn_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::new(CountedConn {
                        inner: conn,
                        health,
                        decremented: std::sync::atomic::AtomicBool::new(false),
                    }));
                }
                Err(err) => {
                    let recoverable = is_recoverable(&err);
                    if recoverable {
                        let _ = self.ensure_instance(name).await;
                    } else {
                        health.mark_unhealthy(&err);
                    }
                    last_err = Some(err);
                    if attempt + 1 < DIAL_RETRY_MAX_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(DIAL_RETRY_CAP);
                    }
                }
            }
        }
        Err(ProxyError::AllRetriesFailed(format!(
            "{name}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Node set implied by a `proxy_outbound` selector: a single name,
    /// `@group`, or a comma list, without the health-gating
    /// `resolve_selector` applies for the hot dial path.
    pub async fn node_names_for_selector(&self, selector: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        if let Some(group) = selector.strip_prefix('@') {
            entries
                .values()
                .filter(|e| e.config.group == group)
                .map(|e| e.config.name.clone())
                .collect()
        } else if selector.contains(',') {
            selector.split(',').map(|s| s.trim().to_owned()).collect()
        } else {
            vec![selector.to_owned()]
        }
    }

    /// Records a latency sample for `name` on `axis`, or clears it to 0
    /// (offline) when `latency_ms` is `None`. Used by the auto-ping
    /// scheduler, which probes nodes out of band from the hot dial path.
    pub async fn record_ping_latency(&self, name: &str, axis: LatencyAxis, latency_ms: Option<u64>) {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(name) {
            entry.health.set_latency(axis, latency_ms.unwrap_or(0));
        }
    }

    pub async fn list_groups(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut groups: Vec<String> = entries
            .values()
            .map(|e| e.config.group.clone())
            .filter(|g| !g.is_empty())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    pub async fn outbounds_by_group(&self, group: &str) -> Vec<OutboundConfig> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.config.group == group)
            .map(|e| e.config.clone())
            .collect()
    }

    pub async fn group_stats(&self, group: &str, axis: LatencyAxis) -> GroupStats {
        let entries = self.entries.read().await;
        let members: Vec<&Entry> = entries.values().filter(|e| e.config.group == group).collect();
        let total_count = members.len();
        let healthy_count = members.iter().filter(|e| e.health.is_healthy()).count();
        let udp_available_count = members
            .iter()
            .filter(|e| e.health.udp_available.load(Ordering::Relaxed))
            .count();
        let positive_latencies: Vec<u64> = members
            .iter()
            .map(|e| e.health.latency(axis))
            .filter(|&v| v > 0)
            .collect();
        let min_latency_ms = positive_latencies.iter().copied().min().unwrap_or(0);
        let avg_latency_ms = if positive_latencies.is_empty() {
            0.0
        } else {
            positive_latencies.iter().sum::<u64>() as f64 / positive_latencies.len() as f64
        };
        GroupStats {
            total_count,
            healthy_count,
            udp_available_count,
            min_latency_ms,
            avg_latency_ms,
        }
    }

    /// Picks a single outbound name per the `name` / `@group` / `a,b,c`
    /// selector grammar, honoring the 30s stale-health grace window.
    pub async fn select_outbound(
        &self,
        selector: &str,
        strategy: LoadBalanceMethod,
        axis: LatencyAxis,
    ) -> ProxyResult<String> {
        self.select_outbound_with_failover(selector, strategy, axis, &[]).await
    }

    pub async fn select_outbound_with_failover(
        &self,
        selector: &str,
        strategy: LoadBalanceMethod,
        axis: LatencyAxis,
        excluded: &[String],
    ) -> ProxyResult<String> {
        let candidates = self.resolve_selector(selector).await?;
        let usable: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !excluded.contains(&c.name))
            .collect();

        if usable.is_empty() {
            return Err(if excluded.is_empty() {
                ProxyError::NoHealthyNodes(selector.to_owned())
            } else {
                ProxyError::AllFailoversFailed(selector.to_owned())
            });
        }

        let key = cursor_key(selector);
        let chosen = self
            .load_balancer
            .pick(&key, strategy, axis, &usable)
            .await
            .ok_or_else(|| ProxyError::AllFailoversFailed(selector.to_owned()))?;
        Ok(chosen.name)
    }

    async fn resolve_selector(&self, selector: &str) -> ProxyResult<Vec<Candidate>> {
        let entries = self.entries.read().await;
        let names: Vec<String> = if let Some(group) = selector.strip_prefix('@') {
            let names: Vec<String> = entries
                .values()
                .filter(|e| e.config.group == group)
                .map(|e| e.config.name.clone())
                .collect();
            if names.is_empty() {
                return Err(ProxyError::GroupNotFound(group.to_owned()));
            }
            names
        } else if selector.contains(',') {
            selector.split(',').map(|s| s.trim().to_owned()).collect()
        } else {
            vec![selector.to_owned()]
        };

        let mut candidates = Vec::new();
        for name in names {
            if let Some(entry) = entries.get(&name) {
                let usable = entry.config.enabled
                    && (!entry.health.ever_tested.load(Ordering::Relaxed)
                        || entry.health.is_healthy()
                        || entry.health.last_check_age_ms() > UNHEALTHY_GRACE_MS);
                if usable {
                    candidates.push(Candidate {
                        name: entry.config.name.clone(),
                        healthy: entry.health.is_healthy(),
                        conn_count: entry.health.conn_count.load(Ordering::Relaxed),
                        latency_tcp: entry.health.latency(LatencyAxis::Tcp),
                        latency_udp: entry.health.latency(LatencyAxis::Udp),
                        latency_http: entry.health.latency(LatencyAxis::Http),
                    });
                }
            }
        }
        Ok(candidates)
    }

    /// Waits (polling every 100ms, up to 10s) for every outbound's
    /// `conn_count` to reach zero, then closes cached instances.
    pub async fn stop(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let drained = {
                let entries = self.entries.read().await;
                entries
                    .values()
                    .all(|e| e.health.conn_count.load(Ordering::Relaxed) == 0)
            };
            if drained || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            entry.instance = None;
        }
    }

    pub async fn reload(&self, configs: Vec<OutboundConfig>) {
        let mut entries = self.entries.write().await;
        let mut next = HashMap::new();
        for cfg in configs {
            if cfg.validate().is_err() {
                continue;
            }
            let reused = entries.remove(&cfg.name);
            next.insert(
                cfg.name.clone(),
                Entry {
                    config: cfg,
                    instance: reused.as_ref().and_then(|e| e.instance.clone()),
                    health: reused
                        .map(|e| e.health)
                        .unwrap_or_else(|| Arc::new(OutboundHealth::default())),
                },
            );
        }
        *entries = next;
    }

    /// Random-selection entry point used by [`crate::load_balancer`]'s
    /// `random` strategy seed when candidates tie; exposed for tests.
    pub async fn random_name(&self) -> Option<String> {
        let entries = self.entries.read().await;
        let names: Vec<&String> = entries.keys().collect();
        names.choose(&mut rand::thread_rng()).map(|s| s.to_string())
    }
}

impl OutboundConfig {
    fn load_balance_sort_axis(&self) -> LatencyAxis {
        LatencyAxis::Udp
    }
}

fn cursor_key(selector: &str) -> String {
    if let Some(group) = selector.strip_prefix('@') {
        group.to_owned()
    } else {
        format!("nodelist:{selector}")
    }
}

fn is_recoverable(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("connection closed") || msg.contains("eof") || msg.contains("after retries")
}

struct CountedConn {
    inner: Arc<dyn PacketConn>,
    health: Arc<OutboundHealth>,
    decremented: std::sync::atomic::AtomicBool,
}

impl Drop for CountedConn {
    fn drop(&mut self) {
        if !self.decremented.swap(true, Ordering::SeqCst) {
            self.health.conn_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[async_trait::async_trait]
impl PacketConn for CountedConn {
    async fn send_to(&self, buf: &[u8], destination: SocketAddr) -> std::io::Result<usize> {
        self.inner.send_to(buf, destination).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    async fn close(&self) -> std::io::Result<()> {
        if !self.decremented.swap(true, Ordering::SeqCst) {
            self.health.conn_count.fetch_sub(1, Ordering::Relaxed);
        }
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::{OutboundCredentials, OutboundKind};

    fn ss_cfg(name: &str, group: &str) -> OutboundConfig {
        OutboundConfig {
            name: name.to_owned(),
            kind: OutboundKind::Shadowsocks,
            server: "127.0.0.1".to_owned(),
            port: 8388,
            enabled: true,
            credentials: OutboundCredentials {
                method: Some("aes-256-gcm".to_owned()),
                password: Some("hunter2".to_owned()),
                ..Default::default()
            },
            tls: None,
            group: group.to_owned(),
        }
    }

    #[tokio::test]
    async fn add_then_get_round_trips_fields() {
        let manager = OutboundManager::new();
        manager.add(ss_cfg("n1", "")).await.unwrap();
        let got = manager.get("n1").await.unwrap();
        assert_eq!(got.server, "127.0.0.1");
        assert_eq!(got.port, 8388);
    }

    #[tokio::test]
    async fn add_duplicate_name_fails() {
        let manager = OutboundManager::new();
        manager.add(ss_cfg("n1", "")).await.unwrap();
        let err = manager.add(ss_cfg("n1", "")).await.unwrap_err();
        assert!(matches!(err, ProxyError::OutboundExists(_)));
    }

    #[tokio::test]
    async fn delete_then_get_not_found() {
        let manager = OutboundManager::new();
        manager.add(ss_cfg("n1", "")).await.unwrap();
        manager.delete("n1").await.unwrap();
        assert!(manager.get("n1").await.is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_server_config_updater() {
        struct Recorder(std::sync::Mutex<Vec<String>>);
        impl ServerConfigUpdater for Recorder {
            fn rewrite_outbound_to_direct(&self, outbound_name: &str) {
                self.0.lock().unwrap().push(outbound_name.to_owned());
            }
        }
        let manager = OutboundManager::new();
        manager.add(ss_cfg("n1", "")).await.unwrap();
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        manager.set_server_config_updater(recorder.clone()).await;
        manager.delete("n1").await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["n1"]);
    }

    #[tokio::test]
    async fn group_stats_count_and_average_positive_latencies() {
        let manager = OutboundManager::new();
        manager.add(ss_cfg("n1", "eu")).await.unwrap();
        manager.add(ss_cfg("n2", "eu")).await.unwrap();
        {
            let entries = manager.entries.read().await;
            entries.get("n1").unwrap().health.mark_healthy();
            entries.get("n1").unwrap().health.set_latency(LatencyAxis::Udp, 100);
            entries.get("n2").unwrap().health.set_latency(LatencyAxis::Udp, 200);
        }
        let stats = manager.group_stats("eu", LatencyAxis::Udp).await;
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.healthy_count, 1);
        assert_eq!(stats.min_latency_ms, 100);
        assert_eq!(stats.avg_latency_ms, 150.0);
    }

    #[tokio::test]
    async fn select_outbound_unknown_group_errors() {
        let manager = OutboundManager::new();
        let err = manager
            .select_outbound("@nope", LoadBalanceMethod::LeastLatency, LatencyAxis::Udp)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::GroupNotFound(_)));
    }
}
