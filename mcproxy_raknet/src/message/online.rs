use std::net::SocketAddr;

use crate::datatypes::{ReadBuf, WriteBuf};

use super::{write_header, Message, MessageError, RaknetMessage};

/// Sent by the connecting peer once the offline handshake (open
/// connection request/reply 1 & 2) has completed.
#[derive(Clone, Debug)]
pub struct MessageConnectionRequest {
    pub client_guid: i64,
    pub request_timestamp: i64,
}

/// Reply to [`MessageConnectionRequest`]; completes the online
/// handshake from the server's point of view.
#[derive(Clone, Debug)]
pub struct MessageConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: i16,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

/// Sent by the connecting peer after receiving
/// [`MessageConnectionRequestAccepted`]; the server considers the
/// session fully established once this arrives.
#[derive(Clone, Debug)]
pub struct MessageNewIncomingConnection {
    pub server_address: SocketAddr,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct MessageConnectedPing {
    pub client_timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct MessageConnectedPong {
    pub client_timestamp: i64,
    pub server_timestamp: i64,
}

/// Raknet pads [`MessageConnectionRequestAccepted`] with a handful of
/// loopback "system addresses" that nothing in this core ever inspects.
const SYSTEM_ADDRESS_COUNT: usize = 10;

fn dummy_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

impl Message for MessageConnectionRequest {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectionRequest)?;
        buf.write_i64(self.client_guid)?;
        buf.write_i64(self.request_timestamp)?;
        buf.write_bool(false)?; // no secure handshake
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            client_guid: buf.read_i64()?,
            request_timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageConnectionRequestAccepted {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectionRequestAccepted)?;
        buf.write_address(self.client_address)?;
        buf.write_i16(self.system_index)?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            buf.write_address(dummy_address())?;
        }
        buf.write_i64(self.request_timestamp)?;
        buf.write_i64(self.accepted_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        let client_address = buf.read_address()?;
        let system_index = buf.read_i16()?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            let _ = buf.read_address();
        }
        Ok(Self {
            client_address,
            system_index,
            request_timestamp: buf.read_i64()?,
            accepted_timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageNewIncomingConnection {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::NewIncomingConnection)?;
        buf.write_address(self.server_address)?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            buf.write_address(dummy_address())?;
        }
        buf.write_i64(self.request_timestamp)?;
        buf.write_i64(self.accepted_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        let server_address = buf.read_address()?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            let _ = buf.read_address();
        }
        Ok(Self {
            server_address,
            request_timestamp: buf.read_i64()?,
            accepted_timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageConnectedPing {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectedPing)?;
        buf.write_i64(self.client_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            client_timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageConnectedPong {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectedPong)?;
        buf.write_i64(self.client_timestamp)?;
        buf.write_i64(self.server_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            client_timestamp: buf.read_i64()?,
            server_timestamp: buf.read_i64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_request_accepted_round_trips_client_address() {
        let msg = MessageConnectionRequestAccepted {
            client_address: "203.0.113.7:19132".parse().unwrap(),
            system_index: 0,
            request_timestamp: 123,
            accepted_timestamp: 456,
        };
        let bytes = msg.to_bytes().unwrap();
        let mut buf = ReadBuf::new(bytes::Bytes::from(bytes));
        let _id = buf.read_u8().unwrap();
        let decoded = MessageConnectionRequestAccepted::deserialize(&mut buf).unwrap();
        assert_eq!(decoded.client_address, msg.client_address);
        assert_eq!(decoded.request_timestamp, 123);
        assert_eq!(decoded.accepted_timestamp, 456);
    }
}
