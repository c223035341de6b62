//! Listener dispatch (§6): binds the socket(s) for one [`ServerConfig`]
//! and runs whichever relay kind its `wire_mode` calls for.
//!
//! `Passthrough`/`Raknet` get the full session engine (§4.7, see
//! [`super::session`]); `RawUdp`/`Transparent`/`PlainUdp`/`TcpUdp` get a
//! byte-for-byte relay with optional registry bookkeeping;
//! `PlainTcp`/`TcpUdp` get a direct TCP relay. The tunnel outbound
//! abstraction in this crate is UDP-only (`OutboundInstance::open_udp`),
//! so TCP wire modes dial the target directly rather than through
//! `proxy_outbound` — recorded in `DESIGN.md`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use raknet::message::{Message, RaknetMessage};

use crate::bedrock::motd::{build_pong_payload, MotdCache};
use crate::config::{ServerConfig, WireMode};
use crate::dialer::ProxyDialer;
use crate::persistence::{AclRepository, SessionRepository};
use crate::registry::SessionRegistry;

use super::session::{run_session, ClientTransport, SessionDeps};

pub struct ListenerDeps {
    pub acl_repo: Arc<dyn AclRepository>,
    pub session_repo: Arc<dyn SessionRepository>,
    pub registry: Arc<SessionRegistry>,
    pub dialer: Arc<ProxyDialer>,
}

/// A running listener; dropping/cancelling `token` tears it down.
pub struct ListenerHandle {
    pub token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Cancels the listener and waits for its tasks to finish, bounded
    /// so a single stuck listener cannot block the whole shutdown.
    pub async fn stop(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

/// Binds and runs whatever relay `server.wire_mode` calls for.
pub async fn spawn_listener(
    server: ServerConfig,
    destination: SocketAddr,
    deps: ListenerDeps,
    motd_cache: Arc<MotdCache>,
) -> anyhow::Result<ListenerHandle> {
    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    match server.wire_mode {
        WireMode::Passthrough | WireMode::Raknet => {
            tasks.push(spawn_raknet_listener(server, destination, deps, motd_cache, token.clone()).await?);
        }
        WireMode::RawUdp => {
            tasks.push(spawn_udp_relay(server, destination, deps, token.clone(), false).await?);
        }
        WireMode::Transparent | WireMode::PlainUdp => {
            tasks.push(spawn_udp_relay(server, destination, deps, token.clone(), true).await?);
        }
        WireMode::PlainTcp => {
            tasks.push(spawn_tcp_relay(server, destination, token.clone()).await?);
        }
        WireMode::TcpUdp => {
            tasks.push(spawn_tcp_relay(server.clone(), destination, token.clone()).await?);
            tasks.push(spawn_udp_relay(server, destination, deps, token.clone(), true).await?);
        }
    }

    Ok(ListenerHandle { token, tasks })
}

/// Full Raknet session engine: binds one UDP socket, demultiplexes
/// datagrams by source address, answers unconnected pings itself and
/// spawns [`run_session`] for every new client.
async fn spawn_raknet_listener(
    server: ServerConfig,
    destination: SocketAddr,
    deps: ListenerDeps,
    motd_cache: Arc<MotdCache>,
    token: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let socket = Arc::new(UdpSocket::bind(&server.listen_addr).await?);
    let local_addr = socket.local_addr()?;
    let clients: Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
        Arc::new(RwLock::new(HashMap::new()));
    let client_guid = rand::random::<i64>();

    let session_deps = SessionDeps {
        acl_repo: deps.acl_repo,
        session_repo: deps.session_repo,
        registry: deps.registry,
        dialer: deps.dialer,
    };

    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let recv = tokio::select! {
                _ = token.cancelled() => break,
                res = socket.recv_from(&mut buf) => res,
            };
            let (n, addr) = match recv {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("listener {} recv error: {err}", server.id);
                    continue;
                }
            };
            let datagram = buf[..n].to_vec();

            if let Some(tx) = clients.read().await.get(&addr).cloned() {
                let _ = tx.send(datagram).await;
                continue;
            }

            if n == 0 {
                continue;
            }
            match datagram[0] {
                id if id == RaknetMessage::UnconnectedPing.to_u8()
                    || id == RaknetMessage::UnconnectedPingOpenConnections.to_u8() =>
                {
                    handle_unconnected_ping(&socket, addr, &datagram, &server, &motd_cache).await;
                }
                id if id == RaknetMessage::OpenConnectionRequest1.to_u8() => {
                    let (tx, rx) = mpsc::channel(32);
                    clients.write().await.insert(addr, tx);
                    let transport = ClientTransport::new(socket.clone(), addr, rx);
                    let server = server.clone();
                    let deps = session_deps.clone();
                    let clients = clients.clone();
                    tokio::spawn(async move {
                        run_session(
                            client_guid,
                            transport,
                            addr,
                            local_addr,
                            datagram,
                            server,
                            destination,
                            deps,
                        )
                        .await;
                        clients.write().await.remove(&addr);
                    });
                }
                _ => {}
            }
        }
    });
    Ok(handle)
}

async fn handle_unconnected_ping(
    socket: &UdpSocket,
    addr: SocketAddr,
    datagram: &[u8],
    server: &ServerConfig,
    motd_cache: &MotdCache,
) {
    let mut buf = raknet::datatypes::ReadBuf::new(bytes::Bytes::copy_from_slice(datagram));
    let _id = match buf.read_u8() {
        Ok(v) => v,
        Err(_) => return,
    };
    let ping = match raknet::message::MessageUnconnectedPing::deserialize(&mut buf) {
        Ok(p) => p,
        Err(_) => return,
    };

    let cached = motd_cache.last_motd().await;
    let motd = match build_pong_payload(server.custom_motd.as_deref(), cached.as_ref(), None) {
        Some(m) => m,
        None => return,
    };
    let pong = raknet::message::MessageUnconnectedPong {
        timestamp: ping.forward_timestamp,
        server_uuid: ping.client_uuid,
        motd,
    };
    if let Ok(bytes) = pong.to_bytes() {
        let _ = socket.send_to(&bytes, addr).await;
    }
}

/// Byte-for-byte UDP NAT, optionally mirrored into the session
/// registry for idle-GC and `/sessions` visibility (no identity is
/// ever known in this mode).
async fn spawn_udp_relay(
    server: ServerConfig,
    destination: SocketAddr,
    deps: ListenerDeps,
    token: CancellationToken,
    bookkeeping: bool,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let socket = Arc::new(UdpSocket::bind(&server.listen_addr).await?);

    struct Peer {
        dialed: Arc<crate::dialer::DialedConn>,
        cancel: CancellationToken,
        last_seen: Arc<AtomicU64>,
    }

    let peers: Arc<RwLock<HashMap<SocketAddr, Peer>>> = Arc::new(RwLock::new(HashMap::new()));
    let registry = deps.registry.clone();
    let dialer = deps.dialer.clone();

    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let recv = tokio::select! {
                _ = token.cancelled() => break,
                res = socket.recv_from(&mut buf) => res,
            };
            let (n, addr) = match recv {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("udp relay {} recv error: {err}", server.id);
                    continue;
                }
            };

            let existing = peers.read().await.get(&addr).map(|p| p.dialed.clone());
            let dialed = if let Some(dialed) = existing {
                dialed
            } else {
                let dialed = match dialer.dial(&server, destination).await {
                    Ok(d) => Arc::new(d),
                    Err(err) => {
                        log::warn!("udp relay {} dial failed for {addr}: {err}", server.id);
                        continue;
                    }
                };
                let cancel = CancellationToken::new();
                let last_seen = Arc::new(AtomicU64::new(now_ms()));

                if bookkeeping {
                    registry.get_or_create(addr, &server.id, cancel.clone()).await;
                }

                spawn_reverse_copy(
                    socket.clone(),
                    addr,
                    dialed.clone(),
                    cancel.clone(),
                    registry.clone(),
                    bookkeeping,
                );

                peers.write().await.insert(
                    addr,
                    Peer {
                        dialed: dialed.clone(),
                        cancel,
                        last_seen,
                    },
                );
                dialed
            };

            if dialed.write(&buf[..n]).await.is_err() {
                peers.write().await.remove(&addr);
                continue;
            }
            if bookkeeping {
                if let Some(session) = registry.get(&addr).await {
                    session.touch();
                    session.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                }
            } else if let Some(peer) = peers.read().await.get(&addr) {
                peer.last_seen.store(now_ms(), Ordering::Relaxed);
            }
        }

        for (_, peer) in peers.write().await.drain() {
            peer.cancel.cancel();
        }
    });
    Ok(handle)
}

fn spawn_reverse_copy(
    socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
    dialed: Arc<crate::dialer::DialedConn>,
    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
    bookkeeping: bool,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = dialed.read(&mut buf) => {
                    match res {
                        Ok(n) if n > 0 => {
                            if socket.send_to(&buf[..n], client_addr).await.is_err() {
                                break;
                            }
                            if bookkeeping {
                                if let Some(session) = registry.get(&client_addr).await {
                                    session.touch();
                                    session.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
                                }
                            }
                        }
                        Ok(_) => break,
                        Err(_) => break,
                    }
                }
            }
        }
        if bookkeeping {
            registry.remove(&client_addr).await;
        }
        dialed.close().await.ok();
    });
}

/// Direct TCP relay: no outbound-tunnel support (the tunnel protocols
/// in this crate are UDP-only), so this dials `destination` directly.
async fn spawn_tcp_relay(
    server: ServerConfig,
    destination: SocketAddr,
    token: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(&server.listen_addr).await?;
    let handle = tokio::spawn(async move {
        loop {
            let accept = tokio::select! {
                _ = token.cancelled() => break,
                res = listener.accept() => res,
            };
            let (mut inbound, addr) = match accept {
                Ok(v) => v,
                Err(err) => {
                    log::warn!("tcp relay {} accept error: {err}", server.id);
                    continue;
                }
            };
            let server_id = server.id.clone();
            tokio::spawn(async move {
                let mut outbound = match tokio::net::TcpStream::connect(destination).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("tcp relay {server_id}: dial {destination} for {addr} failed: {err}");
                        return;
                    }
                };
                if let Err(err) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                    log::debug!("tcp relay {server_id}: session {addr} ended: {err}");
                }
            });
        }
    });
    Ok(handle)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
