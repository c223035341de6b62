//! Minimal connected-Raknet endpoint, covering exactly what the proxy
//! needs to terminate a session on either side: the offline handshake
//! (open connection request/reply 1 & 2), the online handshake
//! (connection request / accepted / new incoming connection) and a
//! best-effort reliable-ordered message stream on top of [`Frame`].
//!
//! This intentionally does not implement Raknet's ACK/NACK-driven
//! retransmission or congestion control: every received datagram is
//! ACKed immediately so well-behaved peers never have a reason to
//! resend, but this endpoint never resends its own sends. That is fine
//! for the login-phase handshake (a handful of small messages on an
//! otherwise idle link) and for the steady-state relay, where the
//! outer dialed transport (direct UDP or a tunnel) already absorbs
//! most loss; it would not be fine for a general-purpose Raknet
//! implementation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::datatypes::{ReadBuf, WriteBuf};
use crate::frame::{Frame, Reliability};
use crate::message::{
    Message, MessageConnectionRequest, MessageConnectionRequestAccepted,
    MessageNewIncomingConnection, MessageOpenConnectionReply1, MessageOpenConnectionReply2,
    MessageOpenConnectionRequest1, MessageOpenConnectionRequest2, MessageUnconnectedPing,
};
use crate::ProtocolVersion;

const DATAGRAM_FLAG: u8 = 0x80;
const ACK_FLAG: u8 = 0xc0;
const DEFAULT_MTU: u16 = 1400;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Abstracts over "a socket bound to exactly one peer", so the same
/// endpoint code works whether the peer is a raw `UdpSocket` demuxed
/// by address (listener side) or a [`crate`]-external dialed/tunneled
/// connection (outbound side).
#[async_trait]
pub trait RawTransport: Send + Sync {
    async fn send(&self, buf: &[u8]) -> std::io::Result<()>;
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message error: {0:?}")]
    Message(#[from] crate::message::MessageError),
    #[error("buffer error: {0:?}")]
    Buf(#[from] crate::datatypes::BufError),
    #[error("handshake timed out")]
    Timeout,
    #[error("unexpected message during handshake")]
    UnexpectedMessage,
}

/// A connected Raknet session over an arbitrary [`RawTransport`].
///
/// Produced either by [`Self::accept_server`] (we are the Raknet
/// server, typically the client-facing listener) or
/// [`Self::connect_client`] (we are the Raknet client, dialing an
/// upstream/remote server).
pub struct RaknetEndpoint {
    transport: Box<dyn RawTransport>,
    own_guid: i64,
    peer_guid: i64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    send_seq: AtomicU32,
    send_frame_idx: AtomicU32,
    send_order_idx: AtomicU32,
}

impl RaknetEndpoint {
    /// Server-side offline + online handshake: waits for
    /// `OpenConnectionRequest1`/`2` and `ConnectionRequest` from the
    /// peer, replying at each step, and finishes once
    /// `NewIncomingConnection` arrives.
    pub async fn accept_server(
        transport: Box<dyn RawTransport>,
        own_guid: i64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        first_datagram: &[u8],
    ) -> Result<Self, ConnectionError> {
        let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(first_datagram));
        let id = buf.read_u8().map_err(crate::message::MessageError::from)?;
        if id == crate::message::RaknetMessage::OpenConnectionRequest1.to_u8() {
            let req1 = MessageOpenConnectionRequest1::deserialize(&mut buf)?;
            let reply1 = MessageOpenConnectionReply1 {
                server_uuid: own_guid,
                use_encryption: false,
                preferred_mtu_size: req1.mtu_size.max(DEFAULT_MTU),
            };
            transport.send(&reply1.to_bytes()?).await?;
        }

        let mut raw = vec![0u8; 2048];
        let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.recv(&mut raw))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(&raw[..n]));
        let id = buf.read_u8().map_err(crate::message::MessageError::from)?;
        if id != crate::message::RaknetMessage::OpenConnectionRequest2.to_u8() {
            return Err(ConnectionError::UnexpectedMessage);
        }
        let req2 = MessageOpenConnectionRequest2::deserialize(&mut buf)?;
        let reply2 = MessageOpenConnectionReply2 {
            server_uuid: own_guid,
            client_address: peer_addr,
            use_encryption: false,
            mtu_size: req2.preferred_mtu_size,
        };
        transport.send(&reply2.to_bytes()?).await?;

        let mut endpoint = Self {
            transport,
            own_guid,
            peer_guid: req2.client_uuid,
            local_addr,
            peer_addr,
            send_seq: AtomicU32::new(0),
            send_frame_idx: AtomicU32::new(0),
            send_order_idx: AtomicU32::new(0),
        };

        let bodies = endpoint.recv_datagram_with_timeout(HANDSHAKE_TIMEOUT).await?;
        let body = bodies.first().ok_or(ConnectionError::UnexpectedMessage)?;
        let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(body));
        let id = buf.read_u8().map_err(crate::message::MessageError::from)?;
        if id != crate::message::RaknetMessage::ConnectionRequest.to_u8() {
            return Err(ConnectionError::UnexpectedMessage);
        }
        let conn_req = MessageConnectionRequest::deserialize(&mut buf)?;

        let accepted = MessageConnectionRequestAccepted {
            client_address: peer_addr,
            system_index: 0,
            request_timestamp: conn_req.request_timestamp,
            accepted_timestamp: now_ms() as i64,
        };
        endpoint.send_message(&accepted).await?;

        let bodies = endpoint.recv_datagram_with_timeout(HANDSHAKE_TIMEOUT).await?;
        let body = bodies.first().ok_or(ConnectionError::UnexpectedMessage)?;
        let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(body));
        let id = buf.read_u8().map_err(crate::message::MessageError::from)?;
        if id != crate::message::RaknetMessage::NewIncomingConnection.to_u8() {
            return Err(ConnectionError::UnexpectedMessage);
        }
        let _nic = MessageNewIncomingConnection::deserialize(&mut buf)?;

        Ok(endpoint)
    }

    /// Client-side handshake: dials `peer_addr` through `transport`,
    /// driving the same four-message exchange from the other end.
    pub async fn connect_client(
        transport: Box<dyn RawTransport>,
        own_guid: i64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Result<Self, ConnectionError> {
        let req1 = MessageOpenConnectionRequest1 {
            raknet_protocol: ProtocolVersion::V11,
            mtu_size: DEFAULT_MTU,
        };
        transport.send(&req1.to_bytes()?).await?;
        let reply1: MessageOpenConnectionReply1 =
            recv_offline_message(&*transport, crate::message::RaknetMessage::OpenConnectionReply1).await?;

        let req2 = MessageOpenConnectionRequest2 {
            client_uuid: own_guid,
            server_address: peer_addr,
            preferred_mtu_size: reply1.preferred_mtu_size,
        };
        transport.send(&req2.to_bytes()?).await?;
        let _reply2: MessageOpenConnectionReply2 =
            recv_offline_message(&*transport, crate::message::RaknetMessage::OpenConnectionReply2).await?;

        let mut endpoint = Self {
            transport,
            own_guid,
            peer_guid: 0,
            local_addr,
            peer_addr,
            send_seq: AtomicU32::new(0),
            send_frame_idx: AtomicU32::new(0),
            send_order_idx: AtomicU32::new(0),
        };

        let request_timestamp = now_ms() as i64;
        let conn_req = MessageConnectionRequest {
            client_guid: own_guid,
            request_timestamp,
        };
        endpoint.send_message(&conn_req).await?;

        let bodies = endpoint.recv_datagram_with_timeout(HANDSHAKE_TIMEOUT).await?;
        let body = bodies.first().ok_or(ConnectionError::UnexpectedMessage)?;
        let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(body));
        let id = buf.read_u8().map_err(crate::message::MessageError::from)?;
        if id != crate::message::RaknetMessage::ConnectionRequestAccepted.to_u8() {
            return Err(ConnectionError::UnexpectedMessage);
        }
        let accepted = MessageConnectionRequestAccepted::deserialize(&mut buf)?;

        let nic = MessageNewIncomingConnection {
            server_address: peer_addr,
            request_timestamp: accepted.request_timestamp,
            accepted_timestamp: accepted.accepted_timestamp,
        };
        endpoint.send_message(&nic).await?;

        Ok(endpoint)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_guid(&self) -> i64 {
        self.peer_guid
    }

    async fn send_message<M: Message>(&self, msg: &M) -> Result<(), ConnectionError> {
        self.send_reliable(&msg.to_bytes()?).await
    }

    /// Wraps `body` in a single reliable-ordered frame inside a single
    /// datagram. Assumes `body` fits well under the negotiated MTU,
    /// true for every message this proxy ever sends (handshake
    /// messages and MCBE game-packet batches are both small).
    pub async fn send_reliable(&self, body: &[u8]) -> Result<(), ConnectionError> {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            frame_idx: self.send_frame_idx.fetch_add(1, Ordering::SeqCst),
            seq: 0,
            order_idx: self.send_order_idx.fetch_add(1, Ordering::SeqCst),
            fragment: None,
            body: body.to_vec(),
        };
        let mut buf = WriteBuf::new();
        buf.write_u8(DATAGRAM_FLAG)?;
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        buf.write_u24(seq)?;
        frame
            .serialize(&mut buf)
            .map_err(crate::message::MessageError::from)?;
        self.transport.send(&buf.0).await?;
        Ok(())
    }

    /// Blocks until one datagram carrying application frames arrives,
    /// returning each frame's body in wire order. ACK datagrams are
    /// consumed and skipped transparently; every data datagram we see
    /// is ACKed back immediately.
    pub async fn recv_datagram(&self) -> Result<Vec<Vec<u8>>, ConnectionError> {
        loop {
            let mut raw = vec![0u8; 2048];
            let n = self.transport.recv(&mut raw).await?;
            if n == 0 {
                continue;
            }
            let header = raw[0];
            if header & DATAGRAM_FLAG == 0 {
                // ACK/NACK packet, or a stray offline message; ignore.
                continue;
            }
            let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(&raw[..n]));
            let _flags = buf.read_u8()?;
            let _seq = buf.read_u24()?;
            let mut bodies = Vec::new();
            while !buf.0.is_empty() {
                match Frame::deserialize(&mut buf) {
                    Ok(frame) => {
                        if frame.fragment.is_none() {
                            bodies.push(frame.body);
                        }
                    }
                    Err(_) => break,
                }
            }
            self.send_ack(_seq).await.ok();
            if !bodies.is_empty() {
                return Ok(bodies);
            }
        }
    }

    async fn recv_datagram_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, ConnectionError> {
        tokio::time::timeout(timeout, self.recv_datagram())
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    async fn send_ack(&self, seq: u32) -> std::io::Result<()> {
        let mut buf = WriteBuf::new();
        buf.write_u8(ACK_FLAG).ok();
        buf.write_u16(1).ok();
        buf.write_u8(1).ok();
        buf.write_u24(seq).ok();
        self.transport.send(&buf.0).await
    }

    pub fn own_guid(&self) -> i64 {
        self.own_guid
    }
}

async fn recv_offline_message<M: Message>(
    transport: &dyn RawTransport,
    expect: crate::message::RaknetMessage,
) -> Result<M, ConnectionError> {
    let mut raw = vec![0u8; 2048];
    let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.recv(&mut raw))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    let mut buf = ReadBuf::new(bytes::Bytes::copy_from_slice(&raw[..n]));
    let id = buf.read_u8().map_err(crate::message::MessageError::from)?;
    if id != expect.to_u8() {
        return Err(ConnectionError::UnexpectedMessage);
    }
    Ok(M::deserialize(&mut buf)?)
}

/// Sends an unconnected ping and waits for the pong, used by
/// motd refresh; kept here since it shares the magic/read plumbing.
pub async fn probe_unconnected(
    transport: &dyn RawTransport,
    client_uuid: i64,
) -> Result<Vec<u8>, ConnectionError> {
    let ping = MessageUnconnectedPing {
        client_uuid,
        forward_timestamp: now_ms() as i64,
    };
    transport.send(&ping.to_bytes()?).await?;
    let mut raw = vec![0u8; 2048];
    let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.recv(&mut raw))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    Ok(raw[..n].to_vec())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
