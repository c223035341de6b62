//! Stateful outbound-node selector (C5): picks among candidates by
//! strategy, keeping a per-key round-robin cursor.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::config::{LatencyAxis, LoadBalanceMethod};

/// One selectable outbound node as seen by the load balancer; a
/// trimmed-down view of [`crate::outbound::OutboundConfig`] + health.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub healthy: bool,
    pub conn_count: u64,
    pub latency_tcp: u64,
    pub latency_udp: u64,
    pub latency_http: u64,
}

impl Candidate {
    fn latency(&self, axis: LatencyAxis) -> u64 {
        match axis {
            LatencyAxis::Tcp => self.latency_tcp,
            LatencyAxis::Udp => self.latency_udp,
            LatencyAxis::Http => self.latency_http,
        }
    }
}

/// Per-key round-robin cursor, keyed by group name or
/// `"nodelist:" + literal selector string`.
pub struct LoadBalancer {
    cursors: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Picks one candidate per `strategy`. Empty input returns `None`;
    /// a single-element input always returns that element regardless
    /// of strategy.
    pub async fn pick(
        &self,
        key: &str,
        strategy: LoadBalanceMethod,
        axis: LatencyAxis,
        candidates: &[Candidate],
    ) -> Option<Candidate> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0].clone());
        }
        match strategy {
            LoadBalanceMethod::LeastLatency => Some(self.least_latency(axis, candidates)),
            LoadBalanceMethod::RoundRobin => Some(self.round_robin(key, candidates).await),
            LoadBalanceMethod::Random => candidates.choose(&mut rand::thread_rng()).cloned(),
            LoadBalanceMethod::LeastConnections => Some(self.least_connections(candidates)),
        }
    }

    fn least_latency(&self, axis: LatencyAxis, candidates: &[Candidate]) -> Candidate {
        let positive = candidates.iter().filter(|c| c.latency(axis) > 0);
        positive
            .min_by_key(|c| c.latency(axis))
            .cloned()
            .unwrap_or_else(|| candidates[0].clone())
    }

    async fn round_robin(&self, key: &str, candidates: &[Candidate]) -> Candidate {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(key.to_owned()).or_insert(0);
        let index = *cursor % candidates.len();
        *cursor = (*cursor + 1) % candidates.len();
        candidates[index].clone()
    }

    fn least_connections(&self, candidates: &[Candidate]) -> Candidate {
        candidates
            .iter()
            .min_by_key(|c| c.conn_count)
            .cloned()
            .expect("candidates is non-empty")
    }

    /// Resets a round-robin cursor. Idempotent.
    pub async fn reset(&self, key: &str) {
        self.cursors.lock().await.remove(key);
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, conn_count: u64, latency_udp: u64) -> Candidate {
        Candidate {
            name: name.to_owned(),
            healthy: true,
            conn_count,
            latency_tcp: 0,
            latency_udp,
            latency_http: 0,
        }
    }

    #[tokio::test]
    async fn least_latency_picks_minimum_positive() {
        let lb = LoadBalancer::new();
        let candidates = vec![
            candidate("n1", 0, 120),
            candidate("n2", 0, 80),
            candidate("n3", 0, 200),
        ];
        let picked = lb
            .pick("eu", LoadBalanceMethod::LeastLatency, LatencyAxis::Udp, &candidates)
            .await
            .unwrap();
        assert_eq!(picked.name, "n2");
    }

    #[tokio::test]
    async fn least_latency_falls_back_to_first_when_all_zero() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate("n1", 0, 0), candidate("n2", 0, 0)];
        let picked = lb
            .pick("eu", LoadBalanceMethod::LeastLatency, LatencyAxis::Udp, &candidates)
            .await
            .unwrap();
        assert_eq!(picked.name, "n1");
    }

    #[tokio::test]
    async fn round_robin_cycles_every_candidate_once() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate("n1", 0, 0), candidate("n2", 0, 0), candidate("n3", 0, 0)];
        let mut seen = Vec::new();
        for _ in 0..3 {
            let picked = lb
                .pick("key", LoadBalanceMethod::RoundRobin, LatencyAxis::Udp, &candidates)
                .await
                .unwrap();
            seen.push(picked.name);
        }
        seen.sort();
        assert_eq!(seen, vec!["n1", "n2", "n3"]);

        let fourth = lb
            .pick("key", LoadBalanceMethod::RoundRobin, LatencyAxis::Udp, &candidates)
            .await
            .unwrap();
        assert_eq!(fourth.name, "n1");
    }

    #[tokio::test]
    async fn round_robin_cursors_are_independent_per_key() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate("n1", 0, 0), candidate("n2", 0, 0)];
        let a = lb
            .pick("keyA", LoadBalanceMethod::RoundRobin, LatencyAxis::Udp, &candidates)
            .await
            .unwrap();
        let b = lb
            .pick("keyB", LoadBalanceMethod::RoundRobin, LatencyAxis::Udp, &candidates)
            .await
            .unwrap();
        assert_eq!(a.name, "n1");
        assert_eq!(b.name, "n1");
    }

    #[tokio::test]
    async fn least_connections_picks_minimum() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate("n1", 5, 0), candidate("n2", 1, 0), candidate("n3", 9, 0)];
        let picked = lb
            .pick("k", LoadBalanceMethod::LeastConnections, LatencyAxis::Udp, &candidates)
            .await
            .unwrap();
        assert_eq!(picked.name, "n2");
    }

    #[tokio::test]
    async fn single_candidate_always_wins() {
        let lb = LoadBalancer::new();
        let candidates = vec![candidate("only", 999, 0)];
        for strategy in [
            LoadBalanceMethod::LeastLatency,
            LoadBalanceMethod::RoundRobin,
            LoadBalanceMethod::Random,
            LoadBalanceMethod::LeastConnections,
        ] {
            let picked = lb.pick("k", strategy, LatencyAxis::Udp, &candidates).await.unwrap();
            assert_eq!(picked.name, "only");
        }
    }
}
