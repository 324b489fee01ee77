//! The P2P wire format: frame layout, message types, and payload schemas.
//!
//! Every frame is `magic(4B) || type(12B ascii, null-padded) || payload_len(4B LE)
//! || checksum(4B) || payload`, with `checksum` the first four bytes of
//! `hash256(payload)`. Payloads are encoded with the same `Codec` used for
//! transaction and block hashing, never `serde_json` — JSON's output isn't
//! fixed-width and has no business feeding a hash or a length-prefixed frame.

use thiserror::Error;

use emberchain_core::codec::{self, Cursor, Decode, Encode};
use emberchain_core::consts::MAX_MESSAGE_SIZE;
use emberchain_core::{Block, Hash, Transaction};
use emberchain_crypto::hash256;

/// Magic bytes identifying the Emberchain wire protocol ("EMBR").
pub const NETWORK_MAGIC: [u8; 4] = [0x45, 0x4d, 0x42, 0x52];

const FRAME_HEADER_LEN: usize = 4 + 12 + 4 + 4;
pub const HEADER_LEN: usize = FRAME_HEADER_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unrecognized message type {0:?}")]
    UnknownType([u8; 12]),
    #[error("payload of {0} bytes exceeds the maximum message size")]
    OversizedMessage(usize),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("malformed payload: {0}")]
    Codec(#[from] codec::CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Inv,
    GetData,
    Block,
    Tx,
    GetBlocks,
    NotFound,
}

impl MessageType {
    fn as_ascii12(self) -> [u8; 12] {
        let name: &[u8] = match self {
            MessageType::Version => b"version",
            MessageType::Verack => b"verack",
            MessageType::Ping => b"ping",
            MessageType::Pong => b"pong",
            MessageType::GetAddr => b"getaddr",
            MessageType::Addr => b"addr",
            MessageType::Inv => b"inv",
            MessageType::GetData => b"getdata",
            MessageType::Block => b"block",
            MessageType::Tx => b"tx",
            MessageType::GetBlocks => b"getblocks",
            MessageType::NotFound => b"notfound",
        };
        let mut buf = [0u8; 12];
        buf[..name.len()].copy_from_slice(name);
        buf
    }

    fn from_ascii12(raw: [u8; 12]) -> Result<Self, MessageError> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(12);
        match &raw[..end] {
            b"version" => Ok(MessageType::Version),
            b"verack" => Ok(MessageType::Verack),
            b"ping" => Ok(MessageType::Ping),
            b"pong" => Ok(MessageType::Pong),
            b"getaddr" => Ok(MessageType::GetAddr),
            b"addr" => Ok(MessageType::Addr),
            b"inv" => Ok(MessageType::Inv),
            b"getdata" => Ok(MessageType::GetData),
            b"block" => Ok(MessageType::Block),
            b"tx" => Ok(MessageType::Tx),
            b"getblocks" => Ok(MessageType::GetBlocks),
            b"notfound" => Ok(MessageType::NotFound),
            _ => Err(MessageError::UnknownType(raw)),
        }
    }
}

/// A decoded frame: type tag plus its still-encoded payload bytes. Callers
/// decode the payload into the type-specific struct via `Decode`.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new<T: Encode>(msg_type: MessageType, payload: &T) -> Self {
        Message { msg_type, payload: codec::encode_to_vec(payload) }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Message { msg_type, payload: Vec::new() }
    }

    pub fn decode_payload<T: Decode>(&self) -> Result<T, MessageError> {
        Ok(codec::decode_from_slice(&self.payload)?)
    }

    /// Serializes the full wire frame: header plus payload.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&NETWORK_MAGIC);
        out.extend_from_slice(&self.msg_type.as_ascii12());
        codec::write_u32(&mut out, self.payload.len() as u32);
        let checksum = hash256(&self.payload);
        out.extend_from_slice(&checksum[..4]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses just the frame header (everything but the payload), returning
    /// the message type and the expected payload length so the caller can
    /// read exactly that many more bytes off the socket.
    pub fn parse_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(MessageType, u32, [u8; 4]), MessageError> {
        let mut cursor = Cursor::new(header);
        let magic: [u8; 4] = cursor.read_array().expect("fixed-size header");
        if magic != NETWORK_MAGIC {
            return Err(MessageError::BadMagic);
        }
        let type_bytes: [u8; 12] = cursor.read_array().expect("fixed-size header");
        let msg_type = MessageType::from_ascii12(type_bytes)?;
        let payload_len = cursor.read_u32().expect("fixed-size header");
        if payload_len as usize > MAX_MESSAGE_SIZE {
            return Err(MessageError::OversizedMessage(payload_len as usize));
        }
        let checksum: [u8; 4] = cursor.read_array().expect("fixed-size header");
        Ok((msg_type, payload_len, checksum))
    }

    /// Verifies a just-read payload against the checksum from the header.
    pub fn verify_checksum(payload: &[u8], expected: &[u8; 4]) -> Result<(), MessageError> {
        let checksum = hash256(payload);
        if &checksum[..4] != expected {
            return Err(MessageError::BadChecksum);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: u64,
    pub start_height: u64,
    pub user_agent: String,
    pub nonce: u64,
}

impl Encode for VersionPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_u32(out, self.version);
        codec::write_u64(out, self.services);
        codec::write_u64(out, self.timestamp);
        codec::write_u64(out, self.start_height);
        codec::write_string(out, &self.user_agent);
        codec::write_u64(out, self.nonce);
    }
}

impl Decode for VersionPayload {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        Ok(VersionPayload {
            version: cursor.read_u32()?,
            services: cursor.read_u64()?,
            timestamp: cursor.read_u64()?,
            start_height: cursor.read_u64()?,
            user_agent: cursor.read_string()?,
            nonce: cursor.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongPayload {
    pub nonce: u64,
}

impl Encode for PingPongPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_u64(out, self.nonce);
    }
}

impl Decode for PingPongPayload {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        Ok(PingPongPayload { nonce: cursor.read_u64()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Block,
    Tx,
}

impl InvType {
    fn tag(self) -> u8 {
        match self {
            InvType::Block => 1,
            InvType::Tx => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, codec::CodecError> {
        match tag {
            1 => Ok(InvType::Block),
            2 => Ok(InvType::Tx),
            _ => Err(codec::CodecError::Oversized),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub item_type: InvType,
    pub hash: Hash,
}

impl Encode for InvItem {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_u8(out, self.item_type.tag());
        out.extend_from_slice(&self.hash);
    }
}

impl Decode for InvItem {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let item_type = InvType::from_tag(cursor.read_u8()?)?;
        let hash = cursor.read_array::<32>()?;
        Ok(InvItem { item_type, hash })
    }
}

/// Used for INV, GETDATA, and NOTFOUND payloads alike — all three are a bare
/// list of inventory items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvPayload {
    pub items: Vec<InvItem>,
}

impl Encode for InvPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_varint(out, self.items.len() as u64);
        for item in &self.items {
            item.encode(out);
        }
    }
}

impl Decode for InvPayload {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let count = cursor.read_varint()?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(InvItem::decode(cursor)?);
        }
        Ok(InvPayload { items })
    }
}

/// The block locator sent with GETBLOCKS: exponentially-spaced hashes from
/// the requester's tip back towards genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksPayload {
    pub locator: Vec<Hash>,
    pub stop_hash: Hash,
}

impl Encode for GetBlocksPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_varint(out, self.locator.len() as u64);
        for hash in &self.locator {
            out.extend_from_slice(hash);
        }
        out.extend_from_slice(&self.stop_hash);
    }
}

impl Decode for GetBlocksPayload {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let count = cursor.read_varint()?;
        let mut locator = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator.push(cursor.read_array::<32>()?);
        }
        let stop_hash = cursor.read_array::<32>()?;
        Ok(GetBlocksPayload { locator, stop_hash })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrPayload {
    pub addrs: Vec<String>,
}

impl Encode for AddrPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        codec::write_varint(out, self.addrs.len() as u64);
        for addr in &self.addrs {
            codec::write_string(out, addr);
        }
    }
}

impl Decode for AddrPayload {
    fn decode(cursor: &mut Cursor) -> Result<Self, codec::CodecError> {
        let count = cursor.read_varint()?;
        let mut addrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addrs.push(cursor.read_string()?);
        }
        Ok(AddrPayload { addrs })
    }
}

pub fn block_message(block: &Block) -> Message {
    Message::new(MessageType::Block, block)
}

pub fn tx_message(tx: &Transaction) -> Message {
    Message::new(MessageType::Tx, tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_header_and_payload() {
        let payload = PingPongPayload { nonce: 0xdead_beef };
        let msg = Message::new(MessageType::Ping, &payload);
        let frame = msg.to_frame();

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        let (msg_type, payload_len, checksum) = Message::parse_header(&header).unwrap();
        assert_eq!(msg_type, MessageType::Ping);
        assert_eq!(payload_len as usize, frame.len() - HEADER_LEN);

        let payload_bytes = &frame[HEADER_LEN..];
        Message::verify_checksum(payload_bytes, &checksum).unwrap();
        let decoded: PingPongPayload = codec::decode_from_slice(payload_bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn parse_header_rejects_bad_magic() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 0xff;
        assert_eq!(Message::parse_header(&header), Err(MessageError::BadMagic));
    }

    #[test]
    fn inv_payload_roundtrips() {
        let payload = InvPayload {
            items: vec![
                InvItem { item_type: InvType::Block, hash: [1u8; 32] },
                InvItem { item_type: InvType::Tx, hash: [2u8; 32] },
            ],
        };
        let bytes = codec::encode_to_vec(&payload);
        let decoded: InvPayload = codec::decode_from_slice(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }
}
