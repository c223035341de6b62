//! Session engine (C7): per-client state machine driving a single
//! passthrough/raknet session from the offline handshake through
//! login-phase identity extraction, ACL gating, remote dial, and
//! steady-state forwarding.
//!
//! ```text
//! START -> READ_NETSETTINGS_REQ -> SEND_NETSETTINGS_RESP ->
//! READ_LOGIN -> PARSE_IDENTITY -> ACL_GATE -> OPEN_REMOTE ->
//! FORWARD_NETSETTINGS_TO_REMOTE -> FORWARD_LOGIN_TO_REMOTE ->
//! FORWARDING (rw copiers) -> END
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use raknet::connection::{ConnectionError, RawTransport, RaknetEndpoint};
use raknet::datatypes::WriteBuf;
use raknet::mcbe::{
    decode_batch, decode_login_identity, encode_batch, CompressionAlgorithm, GamePacket,
    PACKET_ID_DISCONNECT, PACKET_ID_LOGIN, PACKET_ID_NETWORK_SETTINGS,
    PACKET_ID_REQUEST_NETWORK_SETTINGS,
};
use raknet::GAME_PACKET_HEADER;

use crate::acl::check_access_full;
use crate::config::ServerConfig;
use crate::dialer::{DialedConn, ProxyDialer};
use crate::persistence::{write_with_retry, AclRepository, SessionEndRecord, SessionRepository};
use crate::registry::SessionRegistry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REMOTE_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const FORWARD_READ_DEADLINE: Duration = Duration::from_millis(100);
const COMPRESSION_THRESHOLD: u16 = 512;
const DISCONNECT_REASON_KICKED: u32 = 2;

/// Bundles the collaborators a session needs; cheap to clone, every
/// field is already `Arc`-backed.
#[derive(Clone)]
pub struct SessionDeps {
    pub acl_repo: Arc<dyn AclRepository>,
    pub session_repo: Arc<dyn SessionRepository>,
    pub registry: Arc<SessionRegistry>,
    pub dialer: Arc<ProxyDialer>,
}

/// `RawTransport` over a single UDP client address, demultiplexed by
/// the listener's shared accept loop: outbound writes go straight to
/// the socket, inbound datagrams arrive over a channel the listener
/// feeds after dispatching by source address.
pub struct ClientTransport {
    socket: Arc<tokio::net::UdpSocket>,
    addr: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ClientTransport {
    pub fn new(
        socket: Arc<tokio::net::UdpSocket>,
        addr: SocketAddr,
        inbox: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            socket,
            addr,
            inbox: tokio::sync::Mutex::new(inbox),
        }
    }
}

#[async_trait]
impl RawTransport for ClientTransport {
    async fn send(&self, buf: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(buf, self.addr).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "client transport closed",
            )),
        }
    }
}

/// `RawTransport` wrapper over a dialed (possibly tunneled) remote
/// connection, so the same [`RaknetEndpoint`] code works on either
/// side of the proxy.
pub struct DialedTransport(pub Arc<DialedConn>);

#[async_trait]
impl RawTransport for DialedTransport {
    async fn send(&self, buf: &[u8]) -> std::io::Result<()> {
        self.0.write(buf).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("batch decode error: {0:?}")]
    Batch(raknet::mcbe::BatchError),
    #[error("acl denied: {0}")]
    AclDenied(String),
    #[error("remote dial failed: {0}")]
    DialFailed(String),
    #[error("unexpected packet during handshake")]
    UnexpectedPacket,
}

impl From<raknet::mcbe::BatchError> for SessionError {
    fn from(err: raknet::mcbe::BatchError) -> Self {
        Self::Batch(err)
    }
}

/// Drives one client session to completion. Never returns an `Err`
/// the caller must propagate further than logging: every failure path
/// ends in the client side being closed and, if a session was
/// registered, removed.
pub async fn run_session(
    client_guid: i64,
    client_transport: ClientTransport,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    first_datagram: Vec<u8>,
    server: ServerConfig,
    destination: SocketAddr,
    deps: SessionDeps,
) {
    let result = run_session_inner(
        client_guid,
        client_transport,
        client_addr,
        local_addr,
        first_datagram,
        &server,
        destination,
        &deps,
    )
    .await;

    if let Err(err) = result {
        log::debug!("session {client_addr} ({}) ended: {err}", server.id);
    }
}

async fn run_session_inner(
    client_guid: i64,
    client_transport: ClientTransport,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
    first_datagram: Vec<u8>,
    server: &ServerConfig,
    destination: SocketAddr,
    deps: &SessionDeps,
) -> Result<(), SessionError> {
    let client = RaknetEndpoint::accept_server(
        Box::new(client_transport),
        client_guid,
        local_addr,
        client_addr,
        &first_datagram,
    )
    .await?;

    // READ_NETSETTINGS_REQ
    let netsettings_req_bodies =
        recv_within(&client, HANDSHAKE_TIMEOUT, "network settings request").await?;
    let netsettings_req_raw = netsettings_req_bodies
        .into_iter()
        .next()
        .ok_or(SessionError::UnexpectedPacket)?;
    decode_forwarded_batch(&netsettings_req_raw, PACKET_ID_REQUEST_NETWORK_SETTINGS, true)?;

    // SEND_NETSETTINGS_RESP
    let netsettings_resp = build_netsettings_response()?;
    client.send_reliable(&netsettings_resp).await?;

    // READ_LOGIN
    let login_bodies = recv_within(&client, HANDSHAKE_TIMEOUT, "login").await?;
    let login_raw = login_bodies.into_iter().next().ok_or(SessionError::UnexpectedPacket)?;
    let login_packet = decode_forwarded_batch(&login_raw, PACKET_ID_LOGIN, false)?;

    // PARSE_IDENTITY
    let identity = decode_login_identity(&login_packet.body)?;

    // ACL_GATE
    let (decision, io_err) =
        check_access_full(&deps.acl_repo, &identity.display_name, &server.id).await;
    if let Some(err) = io_err {
        log::warn!("acl storage error for {}: {err}", identity.display_name);
    }
    if !decision.allowed {
        let reason = if decision.reason.is_empty() {
            "You are not allowed to join".to_owned()
        } else {
            decision.reason
        };
        send_disconnect_best_effort(&client, &reason).await;
        return Err(SessionError::AclDenied(reason));
    }

    // Remove any stale session for the same identity before registering.
    if let Some(xuid) = identity.xuid.as_deref() {
        deps.registry.remove_by_xuid(xuid).await;
    } else {
        deps.registry.remove_by_player_name(&identity.display_name).await;
    }

    let cancel = CancellationToken::new();
    let session = deps
        .registry
        .get_or_create(client_addr, &server.id, cancel.clone())
        .await;
    session
        .set_identity(identity.display_name.clone(), identity.identity.clone(), identity.xuid.clone())
        .await;

    // OPEN_REMOTE
    let dialed = match tokio::time::timeout(REMOTE_DIAL_TIMEOUT, deps.dialer.dial(server, destination)).await {
        Ok(Ok(conn)) => Arc::new(conn),
        Ok(Err(err)) => {
            deps.registry.remove(&client_addr).await;
            return Err(SessionError::DialFailed(err.to_string()));
        }
        Err(_) => {
            deps.registry.remove(&client_addr).await;
            return Err(SessionError::DialFailed("timed out".to_owned()));
        }
    };

    let remote_guid = rand::random::<i64>();
    let remote = match RaknetEndpoint::connect_client(
        Box::new(DialedTransport(dialed.clone())),
        remote_guid,
        local_addr,
        destination,
    )
    .await
    {
        Ok(endpoint) => endpoint,
        Err(err) => {
            deps.registry.remove(&client_addr).await;
            dialed.close().await.ok();
            return Err(SessionError::Connection(err));
        }
    };

    // FORWARD_NETSETTINGS_TO_REMOTE / FORWARD_LOGIN_TO_REMOTE: original
    // bytes, unmodified, so the remote validates the client's JWT chain
    // exactly as received.
    remote.send_reliable(&netsettings_req_raw).await.ok();
    remote.send_reliable(&login_raw).await.ok();

    forward_loop(&client, &remote, &session, cancel).await;

    deps.registry.remove(&client_addr).await;
    let snapshot = session.snapshot().await;
    let record = SessionEndRecord {
        session_id: snapshot.id,
        server_id: snapshot.server_id,
        display_name: snapshot.display_name,
        uuid: snapshot.uuid,
        xuid: snapshot.xuid,
        bytes_up: snapshot.bytes_up,
        bytes_down: snapshot.bytes_down,
        duration_seconds: snapshot.last_seen.saturating_sub(snapshot.start_time) / 1000,
    };
    let session_repo = deps.session_repo.clone();
    write_with_retry("record_session_end", move || {
        let session_repo = session_repo.clone();
        let record = record.clone();
        async move { session_repo.record_session_end(record).await }
    })
    .await;

    dialed.close().await.ok();
    Ok(())
}

/// FORWARDING: two concurrent copier tasks, each with a 100ms read
/// deadline so they can observe cancellation. The first to exit
/// cancels the shared token, unblocking the other.
async fn forward_loop(
    client: &RaknetEndpoint,
    remote: &RaknetEndpoint,
    session: &Arc<crate::registry::Session>,
    cancel: CancellationToken,
) {
    let done = Arc::new(AtomicBool::new(false));

    let client_to_remote = {
        let cancel = cancel.clone();
        let done = done.clone();
        async move {
            loop {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = tokio::time::timeout(FORWARD_READ_DEADLINE, client.recv_datagram()) => {
                        match res {
                            Ok(Ok(bodies)) => {
                                for body in &bodies {
                                    session.bytes_up.fetch_add(body.len() as u64, Ordering::Relaxed);
                                    if remote.send_reliable(body).await.is_err() {
                                        done.store(true, Ordering::SeqCst);
                                        cancel.cancel();
                                        return;
                                    }
                                }
                                session.touch();
                            }
                            Ok(Err(_)) => {
                                done.store(true, Ordering::SeqCst);
                                cancel.cancel();
                                return;
                            }
                            Err(_) => continue, // 100ms deadline elapsed, not an error
                        }
                    }
                }
            }
        }
    };

    let remote_to_client = {
        let cancel = cancel.clone();
        let done = done.clone();
        async move {
            loop {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = tokio::time::timeout(FORWARD_READ_DEADLINE, remote.recv_datagram()) => {
                        match res {
                            Ok(Ok(bodies)) => {
                                for body in &bodies {
                                    session.bytes_down.fetch_add(body.len() as u64, Ordering::Relaxed);
                                    if client.send_reliable(body).await.is_err() {
                                        done.store(true, Ordering::SeqCst);
                                        cancel.cancel();
                                        return;
                                    }
                                }
                                session.touch();
                            }
                            Ok(Err(_)) => {
                                done.store(true, Ordering::SeqCst);
                                cancel.cancel();
                                return;
                            }
                            Err(_) => continue,
                        }
                    }
                }
            }
        }
    };

    tokio::join!(client_to_remote, remote_to_client);
}

async fn recv_within(
    endpoint: &RaknetEndpoint,
    timeout: Duration,
    what: &str,
) -> Result<Vec<Vec<u8>>, SessionError> {
    tokio::time::timeout(timeout, endpoint.recv_datagram())
        .await
        .map_err(|_| {
            log::debug!("timed out waiting for {what}");
            SessionError::Connection(ConnectionError::Timeout)
        })?
        .map_err(SessionError::from)
}

/// Decodes a raw game-packet-batch frame body (`0xfe` header, optional
/// compression-id byte, compressed/plain payload) and returns the
/// single packet it must carry, verifying its id matches `expect`.
/// `precompression` is true only for the very first batch exchanged
/// (the `NetworkSettingsRequest`), which never carries a
/// compression-id byte because compression hasn't been negotiated yet.
fn decode_forwarded_batch(
    raw: &[u8],
    expect: u32,
    precompression: bool,
) -> Result<GamePacket, SessionError> {
    if raw.is_empty() || raw[0] != GAME_PACKET_HEADER {
        return Err(SessionError::UnexpectedPacket);
    }
    let (compression, payload) = if precompression {
        (None, &raw[1..])
    } else {
        if raw.len() < 2 {
            return Err(SessionError::UnexpectedPacket);
        }
        (CompressionAlgorithm::from_id(raw[1]), &raw[2..])
    };
    let packets = decode_batch(payload, compression)?;
    let packet = packets
        .into_iter()
        .find(|p| p.packet_id == expect)
        .ok_or(SessionError::UnexpectedPacket)?;
    Ok(packet)
}

fn build_netsettings_response() -> Result<Vec<u8>, SessionError> {
    let mut body = WriteBuf::new();
    body.write_u16_le(COMPRESSION_THRESHOLD).ok();
    body.write_u8(CompressionAlgorithm::Flate.id()).ok();
    let packet = GamePacket {
        packet_id: PACKET_ID_NETWORK_SETTINGS,
        body: bytes::Bytes::from(body.0.to_vec()),
    };
    Ok(encode_batch(&[packet], CompressionAlgorithm::None)?)
}

/// Best-effort Disconnect write: a Flate-compressed batch (matching
/// the compression the client was just told to use) and, in case it
/// hasn't applied that yet, an uncompressed variant too.
async fn send_disconnect_best_effort(client: &RaknetEndpoint, reason: &str) {
    if let Ok(compressed) = build_disconnect_batch(reason, CompressionAlgorithm::Flate) {
        client.send_reliable(&compressed).await.ok();
    }
    if let Ok(uncompressed) = build_disconnect_batch(reason, CompressionAlgorithm::None) {
        client.send_reliable(&uncompressed).await.ok();
    }
}

fn build_disconnect_batch(reason: &str, compression: CompressionAlgorithm) -> Result<Vec<u8>, SessionError> {
    let mut body = WriteBuf::new();
    body.write_varuint32(DISCONNECT_REASON_KICKED).ok();
    body.write_bool(false).ok(); // hide_screen
    body.write_str(reason).ok();
    body.write_str(reason).ok(); // filtered_message
    let packet = GamePacket {
        packet_id: PACKET_ID_DISCONNECT,
        body: bytes::Bytes::from(body.0.to_vec()),
    };
    Ok(encode_batch(&[packet], compression)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netsettings_response_round_trips_compression() {
        let raw = build_netsettings_response().unwrap();
        assert_eq!(raw[0], GAME_PACKET_HEADER);
        let packets = decode_batch(&raw[1..], Some(CompressionAlgorithm::None)).unwrap();
        assert_eq!(packets[0].packet_id, PACKET_ID_NETWORK_SETTINGS);
    }

    #[test]
    fn disconnect_batch_carries_reason() {
        let raw = build_disconnect_batch("banned", CompressionAlgorithm::Flate).unwrap();
        assert_eq!(raw[0], GAME_PACKET_HEADER);
        assert_eq!(raw[1], CompressionAlgorithm::Flate.id());
    }
}
