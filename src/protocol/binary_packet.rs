use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::{CommandError, ProtocolError};
use crate::protocol::code::Magic;
use crate::Result;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 24;

/// The 24-byte header shared by request and response frames.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub vbucket_id_or_status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl PacketHeader {
    /// Append the 24 header bytes to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(self.magic);
        buf.push(self.opcode);
        buf.extend_from_slice(&self.key_length.to_be_bytes());
        buf.push(self.extras_length);
        buf.push(self.data_type);
        buf.extend_from_slice(&self.vbucket_id_or_status.to_be_bytes());
        buf.extend_from_slice(&self.total_body_length.to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());
    }

    /// Decode a header from the first 24 bytes of `frame`.
    pub fn read(frame: &[u8]) -> Result<PacketHeader> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::BadFrame("short header".into()).into());
        }
        let mut cursor = Cursor::new(frame);
        Ok(PacketHeader {
            magic: cursor.read_u8()?,
            opcode: cursor.read_u8()?,
            key_length: cursor.read_u16::<BigEndian>()?,
            extras_length: cursor.read_u8()?,
            data_type: cursor.read_u8()?,
            vbucket_id_or_status: cursor.read_u16::<BigEndian>()?,
            total_body_length: cursor.read_u32::<BigEndian>()?,
            opaque: cursor.read_u32::<BigEndian>()?,
            cas: cursor.read_u64::<BigEndian>()?,
        })
    }

    /// Byte ranges of extras, key and value within a full frame.
    fn body_ranges(&self, frame_len: usize) -> Result<(usize, usize, usize)> {
        let extras = self.extras_length as usize;
        let key = self.key_length as usize;
        let body = self.total_body_length as usize;
        if extras + key > body || HEADER_LEN + body != frame_len {
            return Err(ProtocolError::BadFrame("inconsistent body lengths".into()).into());
        }
        let extras_end = HEADER_LEN + extras;
        let key_end = extras_end + key;
        Ok((extras_end, key_end, HEADER_LEN + body))
    }
}

/// One decoded backend response, the unit every completion handle yields.
///
/// `err` carries the status-mapped error kind; `raw` keeps the entire frame so
/// the frontend can forward it bit for bit.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub extras: Vec<u8>,
    pub cas: u64,
    pub err: Option<CommandError>,
    pub raw: Vec<u8>,
}

impl Item {
    /// The correlation tag the responder echoed.
    pub fn opaque(&self) -> u32 {
        BigEndian::read_u32(&self.raw[12..16])
    }
}

/// Decode a complete response frame into an [`Item`].
pub fn parse_response(frame: Vec<u8>) -> Result<Item> {
    let header = PacketHeader::read(&frame)?;
    if header.magic != Magic::Response as u8 {
        return Err(ProtocolError::BadMagic(header.magic).into());
    }
    let (extras_end, key_end, value_end) = header.body_ranges(frame.len())?;

    Ok(Item {
        extras: frame[HEADER_LEN..extras_end].to_vec(),
        key: frame[extras_end..key_end].to_vec(),
        value: frame[key_end..value_end].to_vec(),
        cas: header.cas,
        err: CommandError::from_status(header.vbucket_id_or_status),
        raw: frame,
    })
}

/// A request frame split into its parts, borrowed from the frame buffer.
#[derive(Debug)]
pub struct Request<'a> {
    pub opcode: u8,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub opaque: u32,
    pub cas: u64,
}

/// Decode a complete request frame.
pub fn parse_request(frame: &[u8]) -> Result<Request<'_>> {
    let header = PacketHeader::read(frame)?;
    if header.magic != Magic::Request as u8 {
        return Err(ProtocolError::BadMagic(header.magic).into());
    }
    let (extras_end, key_end, value_end) = header.body_ranges(frame.len())?;

    Ok(Request {
        opcode: header.opcode,
        extras: &frame[HEADER_LEN..extras_end],
        key: &frame[extras_end..key_end],
        value: &frame[key_end..value_end],
        opaque: header.opaque,
        cas: header.cas,
    })
}

/// Encode a header-plus-key request (Get, Delete).
pub fn encode_keyed(buf: &mut Vec<u8>, opcode: u8, key: &[u8], opaque: u32) {
    let header = PacketHeader {
        magic: Magic::Request as u8,
        opcode,
        key_length: key.len() as u16,
        total_body_length: key.len() as u32,
        opaque,
        ..Default::default()
    };
    header.write(buf);
    buf.extend_from_slice(key);
}

/// Encode a store request (Set, Add, Replace).
///
/// Extras are always exactly 8 bytes: 4-byte user flags, 4-byte expiration.
pub fn encode_store(
    buf: &mut Vec<u8>,
    opcode: u8,
    key: &[u8],
    value: &[u8],
    cas: u64,
    flags: u32,
    expiration: u32,
    opaque: u32,
) {
    let header = PacketHeader {
        magic: Magic::Request as u8,
        opcode,
        key_length: key.len() as u16,
        extras_length: 8,
        total_body_length: (8 + key.len() + value.len()) as u32,
        opaque,
        cas,
        ..Default::default()
    };
    header.write(buf);
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&expiration.to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Encode a counter request (Increment, Decrement).
pub fn encode_counter(
    buf: &mut Vec<u8>,
    opcode: u8,
    key: &[u8],
    delta: u64,
    initial: u64,
    expiration: u32,
    opaque: u32,
) {
    let header = PacketHeader {
        magic: Magic::Request as u8,
        opcode,
        key_length: key.len() as u16,
        extras_length: 20,
        total_body_length: (20 + key.len()) as u32,
        opaque,
        ..Default::default()
    };
    header.write(buf);
    buf.extend_from_slice(&delta.to_be_bytes());
    buf.extend_from_slice(&initial.to_be_bytes());
    buf.extend_from_slice(&expiration.to_be_bytes());
    buf.extend_from_slice(key);
}

/// Encode a bodiless response frame with the given status (used by the
/// frontend to answer opcodes it does not route).
pub fn encode_status_response(buf: &mut Vec<u8>, opcode: u8, status: u16, opaque: u32) {
    let header = PacketHeader {
        magic: Magic::Response as u8,
        opcode,
        vbucket_id_or_status: status,
        opaque,
        ..Default::default()
    };
    header.write(buf);
}
