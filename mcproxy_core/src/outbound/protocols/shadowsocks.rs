//! Shadowsocks AEAD-UDP outbound (AES-256-GCM only; the config's
//! `method` field is validated but only the AEAD family is supported,
//! matching what current Shadowsocks servers actually deploy).

use std::net::SocketAddr;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use sha1::Sha1;
use tokio::net::UdpSocket;

use crate::outbound::{OutboundConfig, OutboundInstance, PacketConn};

const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const SUBKEY_INFO: &[u8] = b"ss-subkey";

pub struct ShadowsocksOutbound {
    server_addr: String,
    key: [u8; KEY_LEN],
}

impl ShadowsocksOutbound {
    pub fn new(cfg: &OutboundConfig) -> anyhow::Result<Self> {
        let password = cfg
            .credentials
            .password
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("shadowsocks outbound missing password"))?;
        Ok(Self {
            server_addr: cfg.addr(),
            key: derive_key(password.as_bytes()),
        })
    }
}

/// OpenSSL's EVP_BytesToKey with MD5, as used by every Shadowsocks
/// implementation to turn a password into a fixed-length key.
fn derive_key(password: &[u8]) -> [u8; KEY_LEN] {
    let mut key = Vec::with_capacity(KEY_LEN);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < KEY_LEN {
        let mut hasher_input = prev.clone();
        hasher_input.extend_from_slice(password);
        let digest = md5_digest(&hasher_input);
        key.extend_from_slice(&digest);
        prev = digest.to_vec();
    }
    key.truncate(KEY_LEN);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&key);
    out
}

fn md5_digest(data: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn subkey(master_key: &[u8; KEY_LEN], salt: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut out = [0u8; KEY_LEN];
    hk.expand(SUBKEY_INFO, &mut out)
        .expect("hkdf output length is valid for sha1");
    out
}

fn encrypt(master_key: &[u8; KEY_LEN], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = subkey(master_key, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let nonce = Nonce::from_slice(&[0u8; 12]);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| anyhow::anyhow!("shadowsocks encrypt failed"))?;

    let mut out = Vec::with_capacity(SALT_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(master_key: &[u8; KEY_LEN], packet: &[u8]) -> anyhow::Result<Vec<u8>> {
    if packet.len() < SALT_LEN + TAG_LEN {
        anyhow::bail!("shadowsocks packet too short");
    }
    let (salt, ciphertext) = packet.split_at(SALT_LEN);
    let key = subkey(master_key, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let nonce = Nonce::from_slice(&[0u8; 12]);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| anyhow::anyhow!("shadowsocks decrypt/auth failed"))
}

#[async_trait]
impl OutboundInstance for ShadowsocksOutbound {
    async fn open_udp(&self, destination: SocketAddr) -> anyhow::Result<Arc<dyn PacketConn>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(resolve(&self.server_addr).await?).await?;
        Ok(Arc::new(ShadowsocksConn {
            socket,
            key: self.key,
            destination,
        }))
    }
}

async fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {addr}"))
}

struct ShadowsocksConn {
    socket: UdpSocket,
    key: [u8; KEY_LEN],
    destination: SocketAddr,
}

#[async_trait]
impl PacketConn for ShadowsocksConn {
    async fn send_to(&self, buf: &[u8], _destination: SocketAddr) -> std::io::Result<usize> {
        let mut plaintext = encode_socks_addr(self.destination);
        plaintext.extend_from_slice(buf);
        let packet = encrypt(&self.key, &plaintext)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        self.socket.send(&packet).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let mut raw = vec![0u8; 65536];
        let len = self.socket.recv(&mut raw).await?;
        let plaintext = decrypt(&self.key, &raw[..len])
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let (_addr, payload_offset) = decode_socks_addr(&plaintext)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad ss addr header"))?;
        let payload = &plaintext[payload_offset..];
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, self.destination))
    }

    async fn close(&self) -> std::io::Result<()> {
        Ok(())
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

fn decode_socks_addr(data: &[u8]) -> Option<(SocketAddr, usize)> {
    use std::net::{Ipv4Addr, Ipv6Addr};
    match data.first()? {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_is_deterministic_and_right_length() {
        let a = derive_key(b"hunter2");
        let b = derive_key(b"hunter2");
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_LEN);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_key(b"hunter2");
        let packet = encrypt(&key, b"hello world").unwrap();
        let plain = decrypt(&key, &packet).unwrap();
        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn socks_addr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let encoded = encode_socks_addr(addr);
        let (decoded, offset) = decode_socks_addr(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(offset, encoded.len());
    }
}
