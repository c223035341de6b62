//! Outbound tunnel instances (C3): one endpoint per configured
//! [`OutboundConfig`], each exposing the same `open_udp` contract to
//! the rest of the core regardless of the tunneling protocol behind it.

pub mod manager;
pub mod protocols;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LatencyAxis;
use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
    Hysteria2,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Protocol-specific credentials. Exactly the fields relevant to
/// `kind` need to be populated; validated exhaustively in
/// [`OutboundConfig::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundCredentials {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub security: Option<String>,
    #[serde(default)]
    pub alter_id: Option<u16>,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default)]
    pub obfs: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub name: String,
    pub kind: OutboundKind,
    pub server: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: OutboundCredentials,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub group: String,
}

fn default_true() -> bool {
    true
}

impl OutboundConfig {
    pub fn validate(&self) -> ProxyResult<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid("outbound name must not be empty".into()));
        }
        let creds = &self.credentials;
        let missing = |field: &str| {
            ProxyError::ConfigInvalid(format!(
                "outbound {}: missing credential field `{field}` for {:?}",
                self.name, self.kind
            ))
        };
        match self.kind {
            OutboundKind::Shadowsocks => {
                if creds.method.is_none() {
                    return Err(missing("method"));
                }
                if creds.password.is_none() {
                    return Err(missing("password"));
                }
            }
            OutboundKind::Vmess | OutboundKind::Vless => {
                if creds.uuid.is_none() {
                    return Err(missing("uuid"));
                }
            }
            OutboundKind::Trojan | OutboundKind::Hysteria2 => {
                if creds.password.is_none() {
                    return Err(missing("password"));
                }
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// A bare UDP relay endpoint handed back by an [`OutboundInstance`].
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, buf: &[u8], destination: SocketAddr) -> std::io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
    async fn close(&self) -> std::io::Result<()>;
}

/// One live instance of a tunneling protocol pointed at one remote
/// endpoint. From the core's perspective every outbound kind behaves
/// identically: dial it, get back a [`PacketConn`].
#[async_trait]
pub trait OutboundInstance: Send + Sync {
    async fn open_udp(&self, destination: SocketAddr) -> anyhow::Result<Arc<dyn PacketConn>>;
}

/// Runtime health/usage state tracked alongside an [`OutboundConfig`].
#[derive(Debug, Default)]
pub struct OutboundHealth {
    pub healthy: std::sync::atomic::AtomicBool,
    pub ever_tested: std::sync::atomic::AtomicBool,
    pub last_check_unix_ms: AtomicU64,
    pub last_error: std::sync::Mutex<Option<String>>,
    pub latency_tcp_ms: AtomicU64,
    pub latency_udp_ms: AtomicU64,
    pub latency_http_ms: AtomicU64,
    pub udp_available: std::sync::atomic::AtomicBool,
    pub conn_count: AtomicU64,
}

impl OutboundHealth {
    pub fn latency(&self, axis: LatencyAxis) -> u64 {
        match axis {
            LatencyAxis::Tcp => self.latency_tcp_ms.load(Ordering::Relaxed),
            LatencyAxis::Udp => self.latency_udp_ms.load(Ordering::Relaxed),
            LatencyAxis::Http => self.latency_http_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_latency(&self, axis: LatencyAxis, value_ms: u64) {
        let field = match axis {
            LatencyAxis::Tcp => &self.latency_tcp_ms,
            LatencyAxis::Udp => &self.latency_udp_ms,
            LatencyAxis::Http => &self.latency_http_ms,
        };
        field.store(value_ms, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        self.ever_tested.store(true, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = None;
        self.last_check_unix_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn mark_unhealthy(&self, err: impl ToString) {
        self.healthy.store(false, Ordering::Relaxed);
        self.ever_tested.store(true, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(err.to_string());
        self.last_check_unix_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_check_age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_check_unix_ms.load(Ordering::Relaxed))
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builds the protocol-specific instance for a validated config.
pub fn build_instance(cfg: &OutboundConfig) -> anyhow::Result<Arc<dyn OutboundInstance>> {
    cfg.validate()?;
    match cfg.kind {
        OutboundKind::Shadowsocks => Ok(Arc::new(protocols::shadowsocks::ShadowsocksOutbound::new(cfg)?)),
        OutboundKind::Vmess => Ok(Arc::new(protocols::vmess::VmessOutbound::new(cfg)?)),
        OutboundKind::Vless => Ok(Arc::new(protocols::vless::VlessOutbound::new(cfg)?)),
        OutboundKind::Trojan => Ok(Arc::new(protocols::trojan::TrojanOutbound::new(cfg)?)),
        OutboundKind::Hysteria2 => Ok(Arc::new(protocols::hysteria2::Hysteria2Outbound::new(cfg)?)),
    }
}

/// A plain, untunneled UDP relay, used for `proxy_outbound == "direct"`.
pub mod direct {
    use super::*;
    use tokio::net::UdpSocket;

    pub struct DirectConn(UdpSocket);

    impl DirectConn {
        pub async fn bind() -> std::io::Result<Arc<dyn PacketConn>> {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            Ok(Arc::new(Self(socket)))
        }
    }

    #[async_trait]
    impl PacketConn for DirectConn {
        async fn send_to(&self, buf: &[u8], destination: SocketAddr) -> std::io::Result<usize> {
            self.0.send_to(buf, destination).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            self.0.recv_from(buf).await
        }

        async fn close(&self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
