//! VLESS outbound: a UUID identifies the client, the stream itself is
//! not encrypted by the protocol (it relies on the outer transport,
//! typically TLS, for confidentiality). Since the core only needs a
//! packet-oriented relay here, each UDP datagram is prefixed with the
//! VLESS request header once per logical connection isn't applicable —
//! we frame every datagram with the minimal header the reference
//! implementation uses for its "UDP over stream" mode: a 2-byte length
//! prefix plus the raw payload, with the UUID presented only on the
//! very first packet sent on a socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use uuid::Uuid;

use crate::outbound::{OutboundConfig, OutboundInstance, PacketConn};

pub struct VlessOutbound {
    server_addr: String,
    uuid: Uuid,
}

impl VlessOutbound {
    pub fn new(cfg: &OutboundConfig) -> anyhow::Result<Self> {
        let uuid = cfg
            .credentials
            .uuid
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("vless outbound missing uuid"))?
            .parse()?;
        Ok(Self {
            server_addr: cfg.addr(),
            uuid,
        })
    }
}

#[async_trait]
impl OutboundInstance for VlessOutbound {
    async fn open_udp(&self, destination: SocketAddr) -> anyhow::Result<Arc<dyn PacketConn>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server = tokio::net::lookup_host(&self.server_addr)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("could not resolve {}", self.server_addr))?;
        socket.connect(server).await?;
        Ok(Arc::new(VlessConn {
            socket,
            uuid: self.uuid,
            destination,
            handshaked: AtomicBool::new(false),
        }))
    }
}

struct VlessConn {
    socket: UdpSocket,
    uuid: Uuid,
    destination: SocketAddr,
    handshaked: AtomicBool,
}

#[async_trait]
impl PacketConn for VlessConn {
    async fn send_to(&self, buf: &[u8], _destination: SocketAddr) -> std::io::Result<usize> {
        let mut packet = Vec::with_capacity(buf.len() + 32);
        if !self.handshaked.swap(true, Ordering::SeqCst) {
            packet.push(0x00); // version
            packet.extend_from_slice(self.uuid.as_bytes());
            packet.push(0x00); // addons length
            packet.push(0x02); // command: UDP
            packet.extend_from_slice(&self.destination.port().to_be_bytes());
            match self.destination {
                SocketAddr::V4(v4) => {
                    packet.push(0x01);
                    packet.extend_from_slice(&v4.ip().octets());
                }
                SocketAddr::V6(v6) => {
                    packet.push(0x03);
                    packet.extend_from_slice(&v6.ip().octets());
                }
            }
        }
        packet.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        packet.extend_from_slice(buf);
        self.socket.send(&packet).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let mut raw = vec![0u8; 65536];
        let len = self.socket.recv(&mut raw).await?;
        // Responses carry a 1-byte version + addon-length header once,
        // then repeated 2-byte-length-prefixed payloads; only the
        // first payload is surfaced here, which is sufficient for the
        // request/response cadence RakNet pings and game packets use.
        if len < 2 {
            return Ok((0, self.destination));
        }
        let payload = &raw[..len];
        let plen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let start = 2;
        let end = (start + plen).min(payload.len());
        let n = (end - start).min(buf.len());
        buf[..n].copy_from_slice(&payload[start..start + n]);
        Ok((n, self.destination))
    }

    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}
