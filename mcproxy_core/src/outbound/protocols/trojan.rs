//! Trojan outbound over TLS. The wire format is
//! `SHA224(password)-as-hex-lowercase || CRLF || cmd || SOCKS5-addr || CRLF || payload`,
//! sent once per TLS stream and followed by UDP-associate framed
//! payloads (`SOCKS5-addr || 2-byte-length || CRLF || payload`) for
//! every subsequent datagram.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha224};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::{self, ServerName};
use tokio_rustls::TlsConnector;

use crate::outbound::{OutboundConfig, OutboundInstance, PacketConn};

const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub struct TrojanOutbound {
    server_addr: String,
    sni: String,
    insecure: bool,
    password_hex: String,
}

impl TrojanOutbound {
    pub fn new(cfg: &OutboundConfig) -> anyhow::Result<Self> {
        let password = cfg
            .credentials
            .password
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("trojan outbound missing password"))?;
        let mut hasher = Sha224::new();
        hasher.update(password.as_bytes());
        let password_hex = hex_lower(&hasher.finalize());

        let tls = cfg.tls.clone().unwrap_or_default();
        Ok(Self {
            server_addr: cfg.addr(),
            sni: tls.sni.unwrap_or_else(|| cfg.server.clone()),
            insecure: tls.insecure,
            password_hex,
        })
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl OutboundInstance for TrojanOutbound {
    async fn open_udp(&self, destination: SocketAddr) -> anyhow::Result<Arc<dyn PacketConn>> {
        let server = tokio::net::lookup_host(&self.server_addr)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("could not resolve {}", self.server_addr))?;
        let tcp = TcpStream::connect(server).await?;

        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let mut config = config;
        if self.insecure {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(danger::NoVerifier));
        }
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.sni.as_str())
            .map_err(|_| anyhow::anyhow!("invalid trojan sni {}", self.sni))?;
        let mut stream = connector.connect(server_name, tcp).await?;

        let mut request = Vec::new();
        request.extend_from_slice(self.password_hex.as_bytes());
        request.extend_from_slice(b"\r\n");
        request.push(CMD_UDP_ASSOCIATE);
        request.extend_from_slice(&encode_socks_addr(destination));
        request.extend_from_slice(b"\r\n");
        stream.write_all(&request).await?;

        Ok(Arc::new(TrojanConn {
            stream: Mutex::new(stream),
            destination,
        }))
    }
}

mod danger {
    use tokio_rustls::rustls;

    pub struct NoVerifier;

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
}

fn encode_socks_addr(addr: SocketAddr) -> Vec<u8> {
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

struct TrojanConn {
    stream: Mutex<tokio_rustls::client::TlsStream<TcpStream>>,
    destination: SocketAddr,
}

#[async_trait]
impl PacketConn for TrojanConn {
    async fn send_to(&self, buf: &[u8], _destination: SocketAddr) -> std::io::Result<usize> {
        let mut frame = encode_socks_addr(self.destination);
        frame.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(buf);
        self.stream.lock().await.write_all(&frame).await?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let mut stream = self.stream.lock().await;
        let mut atyp = [0u8; 1];
        stream.read_exact(&mut atyp).await?;
        let addr_len = match atyp[0] {
            0x01 => 4,
            0x04 => 16,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unknown trojan udp atyp",
                ))
            }
        };
        let mut addr_buf = vec![0u8; addr_len + 2];
        stream.read_exact(&mut addr_buf).await?;
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let plen = u16::from_be_bytes(len_buf) as usize;
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf).await?;
        let mut payload = vec![0u8; plen];
        stream.read_exact(&mut payload).await?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, self.destination))
    }

    async fn close(&self) -> std::io::Result<()> {
        self.stream.lock().await.get_mut().0.shutdown().await
    }
}
