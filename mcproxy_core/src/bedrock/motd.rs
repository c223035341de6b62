//! Per-server MOTD cache: either a static `custom_motd` or the live
//! pong from the remote server, optionally decorated with the
//! measured one-way latency.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};

use raknet::bedrock::{ping, Motd};

pub struct MotdCache {
    update_lock: Semaphore,
    last_motd: RwLock<Option<Motd>>,
}

impl MotdCache {
    pub fn new() -> Self {
        Self {
            update_lock: Semaphore::new(1),
            last_motd: RwLock::new(None),
        }
    }

    pub async fn last_motd(&self) -> Option<Motd> {
        self.last_motd.read().await.clone()
    }

    /// Pings `target` and caches the resulting MOTD. Overwritten by
    /// `custom_motd` at response time if one is configured, so the
    /// cache here always reflects the remote's own state.
    pub async fn refresh(
        &self,
        local_bind: &str,
        target: SocketAddr,
        use_proxy_protocol: bool,
    ) -> anyhow::Result<()> {
        let _permit = self.update_lock.acquire().await?;
        let motd = ping(local_bind, target, use_proxy_protocol, Duration::from_secs(5)).await?;
        *self.last_motd.write().await = Some(motd);
        Ok(())
    }
}

impl Default for MotdCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency color band, inserted into the MOTD's second line.
/// Negative latency means the server is considered offline.
pub fn latency_color_code(latency_ms: i64) -> &'static str {
    if latency_ms < 0 {
        "\u{00a7}4" // red
    } else if latency_ms < 50 {
        "\u{00a7}a" // green
    } else if latency_ms < 100 {
        "\u{00a7}e" // yellow
    } else if latency_ms < 200 {
        "\u{00a7}6" // orange
    } else {
        "\u{00a7}4" // red
    }
}

/// Builds the final payload to answer an unconnected ping with: the
/// configured `custom_motd` if present, otherwise the cached live
/// MOTD decorated with `latency_ms` in its second line.
pub fn build_pong_payload(
    custom_motd: Option<&str>,
    cached: Option<&Motd>,
    latency_ms: Option<i64>,
) -> Option<String> {
    if let Some(custom) = custom_motd {
        return Some(custom.to_owned());
    }
    let motd = cached?;
    let mut motd = motd.clone();
    if let Some(latency_ms) = latency_ms {
        let band = latency_color_code(latency_ms);
        motd.lines[1] = format!("{band}{}", motd.lines[1]);
    }
    Some(motd.encode_payload())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_bands_match_thresholds() {
        assert_eq!(latency_color_code(10), "\u{00a7}a");
        assert_eq!(latency_color_code(75), "\u{00a7}e");
        assert_eq!(latency_color_code(150), "\u{00a7}6");
        assert_eq!(latency_color_code(500), "\u{00a7}4");
        assert_eq!(latency_color_code(-1), "\u{00a7}4");
    }

    #[test]
    fn custom_motd_wins_over_cache() {
        let payload = build_pong_payload(Some("custom"), None, None);
        assert_eq!(payload.as_deref(), Some("custom"));
    }
}
