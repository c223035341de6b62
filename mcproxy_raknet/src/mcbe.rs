//! Minecraft: Bedrock Edition game-protocol framing.
//!
//! This only implements the slice of the protocol needed to read the
//! login handshake of a proxied session: the `NetworkSettings`
//! request/response exchange (which negotiates batch compression) and
//! the `Login` packet that carries the player's identity chain. Once a
//! session has logged in, later batches are forwarded as opaque bytes.

use bytes::Bytes;
use serde::Deserialize;

use crate::datatypes::{BufError, ReadBuf, WriteBuf};

/// Header byte of a game packet batch datagram.
pub const BATCH_HEADER: u8 = 0xfe;

/// Packet id of the `NetworkSettingsRequest` packet.
pub const PACKET_ID_REQUEST_NETWORK_SETTINGS: u32 = 0xc1;
/// Packet id of the `NetworkSettings` packet.
pub const PACKET_ID_NETWORK_SETTINGS: u32 = 0x8f;
/// Packet id of the `Login` packet.
pub const PACKET_ID_LOGIN: u32 = 0x01;
/// Packet id of the `Disconnect` packet.
pub const PACKET_ID_DISCONNECT: u32 = 0x05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Flate,
    Snappy,
}

impl CompressionAlgorithm {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::Flate),
            0x01 => Some(Self::Snappy),
            0xff => Some(Self::None),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Self::Flate => 0x00,
            Self::Snappy => 0x01,
            Self::None => 0xff,
        }
    }
}

#[derive(Clone, Debug)]
pub enum BatchError {
    NotABatch,
    Buf(BufError),
    Decompress(String),
    Compress(String),
    UnknownCompression(u8),
}

impl From<BufError> for BatchError {
    fn from(err: BufError) -> Self {
        Self::Buf(err)
    }
}

impl From<BatchError> for anyhow::Error {
    fn from(value: BatchError) -> Self {
        Self::msg(format!("{:?}", value))
    }
}

/// A single decoded game packet inside a batch: its id and raw, still
/// length-prefixed-stripped body.
#[derive(Clone, Debug)]
pub struct GamePacket {
    pub packet_id: u32,
    pub body: Bytes,
}

/// Decompresses a game packet batch datagram (everything after the
/// leading [`BATCH_HEADER`] byte) into the individual packets it carries.
///
/// `compression` is `None` until `NetworkSettings` has been exchanged;
/// before that point batches are sent uncompressed.
pub fn decode_batch(
    payload: &[u8],
    compression: Option<CompressionAlgorithm>,
) -> Result<Vec<GamePacket>, BatchError> {
    let decompressed = match compression {
        None | Some(CompressionAlgorithm::None) => payload.to_vec(),
        Some(CompressionAlgorithm::Flate) => decompress_flate(payload)?,
        Some(CompressionAlgorithm::Snappy) => decompress_snappy(payload)?,
    };

    let mut buf = ReadBuf::new(Bytes::from(decompressed));
    let mut packets = Vec::new();
    while buf.0.len() > 0 {
        let len = buf.read_varuint32()?;
        let mut body = vec![0u8; len as usize];
        buf.read_bytes(&mut body)?;

        let mut body_buf = ReadBuf::new(Bytes::from(body));
        let packet_id = body_buf.read_varuint32()?;
        let remaining = body_buf.read_remaining();
        packets.push(GamePacket {
            packet_id,
            body: Bytes::from(remaining),
        });
    }
    Ok(packets)
}

/// Encodes a set of game packets into a single compressed batch
/// datagram, including the leading [`BATCH_HEADER`] byte.
pub fn encode_batch(
    packets: &[GamePacket],
    compression: CompressionAlgorithm,
) -> Result<Vec<u8>, BatchError> {
    let mut inner = WriteBuf::new();
    for packet in packets {
        let mut body = WriteBuf::new();
        body.write_varuint32(packet.packet_id)?;
        body.0.extend_from_slice(&packet.body);

        inner.write_varuint32(body.0.len() as u32)?;
        inner.0.extend_from_slice(&body.0);
    }

    let compressed = match compression {
        CompressionAlgorithm::None => inner.0.to_vec(),
        CompressionAlgorithm::Flate => compress_flate(&inner.0)?,
        CompressionAlgorithm::Snappy => compress_snappy(&inner.0)?,
    };

    let mut out = Vec::with_capacity(compressed.len() + 2);
    out.push(BATCH_HEADER);
    if compression != CompressionAlgorithm::None {
        out.push(compression.id());
    }
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn decompress_flate(data: &[u8]) -> Result<Vec<u8>, BatchError> {
    use std::io::Read;
    let mut decoder = flate2::read::DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| BatchError::Decompress(err.to_string()))?;
    Ok(out)
}

fn compress_flate(data: &[u8]) -> Result<Vec<u8>, BatchError> {
    use std::io::Write;
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| BatchError::Compress(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| BatchError::Compress(err.to_string()))
}

fn decompress_snappy(data: &[u8]) -> Result<Vec<u8>, BatchError> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|err| BatchError::Decompress(err.to_string()))
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>, BatchError> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|err| BatchError::Compress(err.to_string()))
}

/// Parsed `NetworkSettings` response: the compression algorithm the
/// server told the client to use for everything that follows.
#[derive(Clone, Debug)]
pub struct NetworkSettings {
    pub compression_algorithm: CompressionAlgorithm,
}

impl NetworkSettings {
    pub fn decode(body: &[u8]) -> Result<Self, BatchError> {
        let mut buf = ReadBuf::new(Bytes::copy_from_slice(body));
        // compression_threshold: u16
        buf.0.advance(2.min(buf.0.len()));
        let id = buf.read_u8().unwrap_or(0xff);
        let compression_algorithm =
            CompressionAlgorithm::from_id(id).ok_or(BatchError::UnknownCompression(id))?;
        Ok(Self {
            compression_algorithm,
        })
    }
}

/// The player identity extracted from a `Login` packet's JWT chain.
/// Signatures are not verified; this proxy is not the authority on
/// player identity, it only reads what the client/Xbox Live asserted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub display_name: String,
    pub identity: String,
    pub xuid: Option<String>,
}

#[derive(Deserialize)]
struct ChainPayload {
    #[serde(rename = "extraData")]
    extra_data: Option<ExtraData>,
}

#[derive(Deserialize)]
struct ExtraData {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    identity: Option<String>,
    #[serde(rename = "XUID")]
    xuid: Option<String>,
}

#[derive(Deserialize)]
struct ChainBody {
    chain: Vec<String>,
}

/// The preferred connection-request shape: `Certificate` is itself a
/// JSON-encoded string holding `{"chain": [...]}`.
#[derive(Deserialize)]
struct ConnectionRequest {
    #[serde(rename = "Certificate")]
    certificate: String,
}

/// Decodes the player identity out of a `Login` packet body: a
/// varuint32-prefixed JWT chain followed by a varuint32-prefixed skin
/// data JWT (ignored here).
pub fn decode_login_identity(body: &[u8]) -> Result<PlayerIdentity, BatchError> {
    let mut buf = ReadBuf::new(Bytes::copy_from_slice(body));
    // protocol_version: i32 (big-endian in the wild, but we don't need it)
    buf.0.advance(4.min(buf.0.len()));
    let chain_len = buf.read_varuint32()? as usize;
    let mut chain_bytes = vec![0u8; chain_len];
    buf.read_bytes(&mut chain_bytes)?;

    let chain_body = parse_chain_body(&chain_bytes)
        .map_err(|err| BatchError::Decompress(format!("invalid login chain json: {err}")))?;

    for token in &chain_body.chain {
        if let Some(identity) = try_decode_chain_link(token) {
            return Ok(identity);
        }
    }
    Err(BatchError::Decompress(
        "no extraData claim in login chain".to_owned(),
    ))
}

/// Parses the connection-request JSON in either of its two shapes: the
/// preferred `{"AuthenticationType":N,"Certificate":"{\"chain\":[...]}"}`
/// wrapper (`Certificate` is a JSON-encoded string, not a nested object),
/// or the bare `{"chain":[...]}` body.
fn parse_chain_body(bytes: &[u8]) -> Result<ChainBody, serde_json::Error> {
    if let Ok(request) = serde_json::from_slice::<ConnectionRequest>(bytes) {
        return serde_json::from_str(&request.certificate);
    }
    serde_json::from_slice(bytes)
}

fn try_decode_chain_link(token: &str) -> Option<PlayerIdentity> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = base64_url_decode(payload_b64)?;
    let payload: ChainPayload = serde_json::from_slice(&payload).ok()?;
    let extra_data = payload.extra_data?;
    Some(PlayerIdentity {
        display_name: extra_data.display_name?,
        identity: extra_data.identity?,
        xuid: extra_data.xuid,
    })
}

fn base64_url_decode(input: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(input)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(input))
        .ok()
}

use bytes::Buf;

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn batch_round_trip_uncompressed() {
        let packets = vec![GamePacket {
            packet_id: PACKET_ID_DISCONNECT,
            body: Bytes::from_static(b"bye"),
        }];
        let encoded = encode_batch(&packets, CompressionAlgorithm::None).unwrap();
        assert_eq!(encoded[0], BATCH_HEADER);
        let decoded = decode_batch(&encoded[1..], Some(CompressionAlgorithm::None)).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].packet_id, PACKET_ID_DISCONNECT);
        assert_eq!(&decoded[0].body[..], b"bye");
    }

    #[test]
    fn batch_round_trip_flate() {
        let packets = vec![GamePacket {
            packet_id: PACKET_ID_NETWORK_SETTINGS,
            body: Bytes::from_static(&[0, 0, 0xff]),
        }];
        let encoded = encode_batch(&packets, CompressionAlgorithm::Flate).unwrap();
        assert_eq!(encoded[0], BATCH_HEADER);
        assert_eq!(encoded[1], CompressionAlgorithm::Flate.id());
        let decoded = decode_batch(&encoded[2..], Some(CompressionAlgorithm::Flate)).unwrap();
        assert_eq!(decoded[0].packet_id, PACKET_ID_NETWORK_SETTINGS);
    }

    #[test]
    fn batch_round_trip_snappy() {
        let packets = vec![GamePacket {
            packet_id: 42,
            body: Bytes::from_static(b"hello world, this compresses a little"),
        }];
        let encoded = encode_batch(&packets, CompressionAlgorithm::Snappy).unwrap();
        let decoded = decode_batch(&encoded[2..], Some(CompressionAlgorithm::Snappy)).unwrap();
        assert_eq!(decoded[0].packet_id, 42);
    }

    #[test]
    fn network_settings_decodes_compression_id() {
        let body = [0u8, 0u8, CompressionAlgorithm::Snappy.id()];
        let settings = NetworkSettings::decode(&body).unwrap();
        assert_eq!(settings.compression_algorithm, CompressionAlgorithm::Snappy);
    }

    #[test]
    fn login_identity_reads_extra_data() {
        let claims = serde_json::json!({
            "extraData": {
                "displayName": "Notch",
                "identity": "11111111-1111-1111-1111-111111111111",
                "XUID": "2535400000000000",
            }
        });
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("header.{payload}.sig");
        let chain = serde_json::json!({ "chain": [token] });

        let mut body = WriteBuf::new();
        body.0.extend_from_slice(&0i32.to_be_bytes());
        let chain_bytes = serde_json::to_vec(&chain).unwrap();
        body.write_varuint32(chain_bytes.len() as u32).unwrap();
        body.0.extend_from_slice(&chain_bytes);

        let identity = decode_login_identity(&body.0).unwrap();
        assert_eq!(identity.display_name, "Notch");
        assert_eq!(identity.xuid.as_deref(), Some("2535400000000000"));
    }

    #[test]
    fn login_identity_reads_certificate_wrapper() {
        let claims = serde_json::json!({
            "extraData": {
                "displayName": "Notch",
                "identity": "11111111-1111-1111-1111-111111111111",
                "XUID": "2535400000000000",
            }
        });
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("header.{payload}.sig");
        let certificate = serde_json::json!({ "chain": [token] }).to_string();
        let request = serde_json::json!({
            "AuthenticationType": 0,
            "Certificate": certificate,
        });

        let mut body = WriteBuf::new();
        body.0.extend_from_slice(&0i32.to_be_bytes());
        let request_bytes = serde_json::to_vec(&request).unwrap();
        body.write_varuint32(request_bytes.len() as u32).unwrap();
        body.0.extend_from_slice(&request_bytes);

        let identity = decode_login_identity(&body.0).unwrap();
        assert_eq!(identity.display_name, "Notch");
    }
}
