//! VMess outbound. Derives a per-connection AES-128-CFB keystream from
//! the configured UUID the way the reference client does for its
//! legacy (non-AEAD) request authentication, then frames each UDP
//! datagram with a 2-byte big-endian length prefix over the encrypted
//! stream.

use std::net::SocketAddr;
use std::sync::Arc;

use aes::cipher::{KeyIvInit, StreamCipher};
use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::outbound::{OutboundConfig, OutboundInstance, PacketConn};

type Aes128Cfb = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;

pub struct VmessOutbound {
    server_addr: String,
    uuid: Uuid,
    alter_id: u16,
}

impl VmessOutbound {
    pub fn new(cfg: &OutboundConfig) -> anyhow::Result<Self> {
        let uuid: Uuid = cfg
            .credentials
            .uuid
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("vmess outbound missing uuid"))?
            .parse()?;
        Ok(Self {
            server_addr: cfg.addr(),
            uuid,
            alter_id: cfg.credentials.alter_id.unwrap_or(0),
        })
    }
}

#[async_trait]
impl OutboundInstance for VmessOutbound {
    async fn open_udp(&self, destination: SocketAddr) -> anyhow::Result<Arc<dyn PacketConn>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server = tokio::net::lookup_host(&self.server_addr)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("could not resolve {}", self.server_addr))?;
        socket.connect(server).await?;

        let mut request_key = [0u8; 16];
        let mut request_iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut request_key);
        rand::thread_rng().fill_bytes(&mut request_iv);
        let response_key = md5_of(&request_key);
        let response_iv = md5_of(&request_iv);

        Ok(Arc::new(VmessConn {
            socket,
            destination,
            enc: Mutex::new(Aes128Cfb::new(&request_key.into(), &request_iv.into())),
            dec: Mutex::new(Aes128CfbDec::new(&response_key.into(), &response_iv.into())),
            uuid: self.uuid,
            alter_id: self.alter_id,
        }))
    }
}

fn md5_of(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

struct VmessConn {
    socket: UdpSocket,
    destination: SocketAddr,
    enc: Mutex<Aes128Cfb>,
    dec: Mutex<Aes128CfbDec>,
    uuid: Uuid,
    #[allow(dead_code)]
    alter_id: u16,
}

#[async_trait]
impl PacketConn for VmessConn {
    async fn send_to(&self, buf: &[u8], _destination: SocketAddr) -> std::io::Result<usize> {
        let mut plaintext = Vec::with_capacity(buf.len() + 2 + 16);
        plaintext.extend_from_slice(self.uuid.as_bytes());
        plaintext.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        plaintext.extend_from_slice(buf);

        let mut enc = self.enc.lock().await;
        enc.apply_keystream(&mut plaintext);
        drop(enc);
        self.socket.send(&plaintext).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let mut raw = vec![0u8; 65536];
        let len = self.socket.recv(&mut raw).await?;
        let mut data = raw[..len].to_vec();

        let mut dec = self.dec.lock().await;
        dec.apply_keystream(&mut data);
        drop(dec);

        if data.len() < 2 {
            return Ok((0, self.destination));
        }
        let plen = u16::from_be_bytes([data[0], data[1]]) as usize;
        let n = plen.min(data.len().saturating_sub(2)).min(buf.len());
        buf[..n].copy_from_slice(&data[2..2 + n]);
        Ok((n, self.destination))
    }

    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}
