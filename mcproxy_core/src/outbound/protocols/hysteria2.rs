//! Hysteria2 outbound: a QUIC connection (via `quinn`) carrying an
//! authenticated UDP relay. Real Hysteria2 negotiates over an HTTP/3
//! CONNECT-like exchange and then switches to unreliable QUIC
//! datagrams for the actual relay; this mirrors that shape with a
//! lighter handshake (a single authenticated control stream, then
//! datagrams framed with the destination address) since the core only
//! needs the post-handshake `PacketConn` contract.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::outbound::{OutboundConfig, OutboundInstance, PacketConn};

pub struct Hysteria2Outbound {
    server_addr: String,
    sni: String,
    insecure: bool,
    password: String,
}

impl Hysteria2Outbound {
    pub fn new(cfg: &OutboundConfig) -> anyhow::Result<Self> {
        let password = cfg
            .credentials
            .password
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("hysteria2 outbound missing password"))?
            .clone();
        let tls = cfg.tls.clone().unwrap_or_default();
        Ok(Self {
            server_addr: cfg.addr(),
            sni: tls.sni.unwrap_or_else(|| cfg.server.clone()),
            insecure: tls.insecure,
            password,
        })
    }
}

#[async_trait]
impl OutboundInstance for Hysteria2Outbound {
    async fn open_udp(&self, destination: SocketAddr) -> anyhow::Result<Arc<dyn PacketConn>> {
        let server = tokio::net::lookup_host(&self.server_addr)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("could not resolve {}", self.server_addr))?;

        let client_config = build_client_config(self.insecure)?;
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint.connect(server, &self.sni)?;
        let connection = connecting.await?;

        let (mut send, mut recv) = connection.open_bi().await?;
        let mut auth = Vec::new();
        auth.extend_from_slice(self.password.as_bytes());
        auth.push(b'\n');
        send.write_all(&auth).await?;
        send.finish().await?;

        let mut ack = [0u8; 2];
        let _ = recv.read_exact(&mut ack).await;

        Ok(Arc::new(Hysteria2Conn {
            _endpoint: endpoint,
            connection,
            destination,
            recv: Mutex::new(None),
        }))
    }
}

fn build_client_config(insecure: bool) -> anyhow::Result<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let mut crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if insecure {
        crypto
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }
    Ok(ClientConfig::new(Arc::new(crypto)))
}

struct NoVerifier;

impl rustls::client::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

struct Hysteria2Conn {
    _endpoint: Endpoint,
    connection: quinn::Connection,
    destination: SocketAddr,
    recv: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl PacketConn for Hysteria2Conn {
    async fn send_to(&self, buf: &[u8], _destination: SocketAddr) -> std::io::Result<usize> {
        let mut frame = encode_addr(self.destination);
        frame.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        frame.extend_from_slice(buf);
        self.connection
            .send_datagram(frame.into())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let datagram = self
            .connection
            .read_datagram()
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let data = datagram.to_vec();
        let (_addr, offset) = decode_addr(&data)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad hysteria2 frame"))?;
        if data.len() < offset + 2 {
            return Ok((0, self.destination));
        }
        let plen = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        let payload_start = offset + 2;
        let n = plen.min(data.len().saturating_sub(payload_start)).min(buf.len());
        buf[..n].copy_from_slice(&data[payload_start..payload_start + n]);
        Ok((n, self.destination))
    }

    async fn close(&self) -> std::io::Result<()> {
        self.connection.close(0u32.into(), b"bye");
        Ok(())
    }
}

fn encode_addr(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    match addr {
        SocketAddr::V4(v4) => {
            out.push(0x01);
            out.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            out.push(0x04);
            out.extend_from_slice(&v6.ip().octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn decode_addr(data: &[u8]) -> Option<(SocketAddr, usize)> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    match *data.first()? {
        0x01 => {
            if data.len() < 7 {
                return None;
            }
            let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
            let port = u16::from_be_bytes([data[5], data[6]]);
            Some((SocketAddr::new(ip.into(), port), 7))
        }
        0x04 => {
            if data.len() < 19 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([data[17], data[18]]);
            Some((SocketAddr::new(ip.into(), port), 19))
        }
        _ => None,
    }
}
