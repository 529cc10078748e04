//! Memcached binary protocol: frame layout, codecs and frame assembly.
//!
//! The same frame format flows on both sides of the proxy, so the client and
//! the frontend share this module.

pub mod binary_packet;
pub mod code;

pub use binary_packet::{
    encode_counter, encode_keyed, encode_status_response, encode_store, parse_request,
    parse_response, Item, PacketHeader, Request, HEADER_LEN,
};
pub use code::{Magic, Opcode};

use byteorder::{BigEndian, ByteOrder};

use crate::error::ProtocolError;
use crate::Result;

/// Upper bound on a frame's declared body. Anything larger is treated as a
/// protocol fault rather than an allocation request.
const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

/// Length-driven frame assembler.
///
/// TCP reads of any size are appended with [`extend`](Self::extend); complete
/// frames come back out of [`next_frame`](Self::next_frame) one at a time.
/// A frame is never emitted before all `24 + total_body_length` bytes have
/// arrived, no matter how the transport chunked them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_length = BigEndian::read_u32(&self.buf[8..12]) as usize;
        if body_length > MAX_BODY_LENGTH {
            return Err(ProtocolError::BadFrame("declared body too large".into()).into());
        }
        let key_length = BigEndian::read_u16(&self.buf[2..4]) as usize;
        let extras_length = self.buf[4] as usize;
        if key_length + extras_length > body_length {
            return Err(ProtocolError::BadFrame("inconsistent body lengths".into()).into());
        }

        let frame_length = HEADER_LEN + body_length;
        if self.buf.len() < frame_length {
            return Ok(None);
        }

        let frame = self.buf.drain(..frame_length).collect();
        Ok(Some(frame))
    }
}
