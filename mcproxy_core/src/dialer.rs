//! Proxy dialer (C6): adapts `(OutboundManager, ServerConfig)` into a
//! UDP relay, transparently routing through the configured outbound
//! selector and falling back to a direct dial on selection/dial
//! exhaustion.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::ProxyResult;
use crate::outbound::{direct::DirectConn, manager::OutboundManager, PacketConn};

/// `net.Conn`-shaped adapter wrapping the dialed [`PacketConn`].
pub struct DialedConn {
    inner: Arc<dyn PacketConn>,
    remote_addr: SocketAddr,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    closed: std::sync::atomic::AtomicBool,
    pub via_node: Option<String>,
}

impl DialedConn {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let _guard = self.read_lock.lock().await;
        let (n, _from) = self.inner.recv_from(buf).await?;
        Ok(n)
    }

    pub async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.inner.send_to(buf, self.remote_addr).await
    }

    pub async fn close(&self) -> std::io::Result<()> {
        if !self
            .closed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            self.inner.close().await?;
        }
        Ok(())
    }
}

pub struct ProxyDialer {
    outbound_manager: Arc<OutboundManager>,
}

impl ProxyDialer {
    pub fn new(outbound_manager: Arc<OutboundManager>) -> Self {
        Self { outbound_manager }
    }

    pub async fn dial(&self, server: &ServerConfig, destination: SocketAddr) -> ProxyResult<DialedConn> {
        let selector = server.outbound_selector();

        if selector == "direct" {
            return Ok(self.direct(destination).await?);
        }

        if selector.starts_with('@') || selector.contains(',') {
            let mut excluded = Vec::new();
            loop {
                let picked = match self
                    .outbound_manager
                    .select_outbound_with_failover(
                        selector,
                        server.load_balance,
                        server.load_balance_sort,
                        &excluded,
                    )
                    .await
                {
                    Ok(name) => name,
                    Err(_) => return Ok(self.direct(destination).await?),
                };
                match self.outbound_manager.dial_packet_conn(&picked, destination).await {
                    Ok(conn) => {
                        return Ok(DialedConn {
                            inner: conn,
                            remote_addr: destination,
                            read_lock: Mutex::new(()),
                            write_lock: Mutex::new(()),
                            closed: std::sync::atomic::AtomicBool::new(false),
                            via_node: Some(picked),
                        })
                    }
                    Err(err) => {
                        log::warn!("dial via {picked} failed: {err}, trying next candidate");
                        excluded.push(picked);
                    }
                }
            }
        }

        match self.outbound_manager.dial_packet_conn(selector, destination).await {
            Ok(conn) => Ok(DialedConn {
                inner: conn,
                remote_addr: destination,
                read_lock: Mutex::new(()),
                write_lock: Mutex::new(()),
                closed: std::sync::atomic::AtomicBool::new(false),
                via_node: Some(selector.to_owned()),
            }),
            Err(err) => {
                log::warn!("dial via {selector} failed: {err}, falling back to direct");
                Ok(self.direct(destination).await?)
            }
        }
    }

    async fn direct(&self, destination: SocketAddr) -> std::io::Result<DialedConn> {
        let conn = DirectConn::bind().await?;
        Ok(DialedConn {
            inner: conn,
            remote_addr: destination,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            closed: std::sync::atomic::AtomicBool::new(false),
            via_node: None,
        })
    }
}
