// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Bit-exact framing of a single radio packet.
//!
//! Every frame is a 6 byte big-endian header followed by a MessagePack
//! encoded payload:
//!
//! ```text
//! bit  47      46..39        38..20          19..0
//!     +------+-------------+---------------+--------------+---------------+
//!     | kind | payload_len | sequence_num  | payload_id   | payload ...   |
//!     | 1    | 8           | 19            | 20           | payload_len   |
//!     +------+-------------+---------------+--------------+---------------+
//! ```
//!
//! `kind` is 0 for data and 1 for control. The all-ones value of
//! `sequence_num` and of `payload_id` means "not applicable"; on the Rust
//! side that is `None`.

use rmpv::Value;
use std::fmt;

use crate::{DecodeError, DecodeResult, EncodeError, EncodeResult, LinkError, LinkResult};

pub const HEADER_SIZE: usize = 6;

/// Sentinel for an unused sequence number, also the exclusive upper bound.
pub const SEQUENCE_NUM_SENTINEL: u32 = (1 << 19) - 1;

/// Sentinel for an unused payload id, also the exclusive upper bound.
pub const PAYLOAD_ID_SENTINEL: u32 = (1 << 20) - 1;

/// The header's length field is 8 bits wide.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// rfm9x buffer (256) less its own 4 byte header less one byte because
/// full length packets are unreliable on that chip.
pub const DEFAULT_PACKET_SIZE: usize = 256 - 4 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Control,
}

impl FrameKind {
    fn bit(self) -> u64 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Control => 1,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            FrameKind::Data => "data",
            FrameKind::Control => "control",
        };
        write!(f, "{}", description)
    }
}

/// One discrete message unit exchanged over the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sequence_num: Option<u32>,
    pub payload_id: Option<u32>,
    pub payload: Value,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Value) -> Self {
        Frame {
            kind,
            sequence_num: None,
            payload_id: None,
            payload,
        }
    }

    pub fn with_sequence_num(mut self, sequence_num: u32) -> Self {
        self.sequence_num = Some(sequence_num);
        self
    }

    pub fn with_payload_id(mut self, payload_id: u32) -> Self {
        self.payload_id = Some(payload_id);
        self
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(seq) = self.sequence_num {
            write!(f, " seq={}", seq)?;
        }
        if let Some(id) = self.payload_id {
            write!(f, " id={}", id)?;
        }
        write!(f, " {}", self.payload)
    }
}

/// Encodes frames against a configured packet size.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    packet_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(packet_size: usize) -> LinkResult<Self> {
        if packet_size <= HEADER_SIZE {
            return Err(LinkError::invalid_argument(format!(
                "packet size {} leaves no room after the {} byte header",
                packet_size, HEADER_SIZE
            )));
        }
        Ok(FrameCodec { packet_size })
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Largest serialized payload that fits in one packet.
    pub fn payload_limit(&self) -> usize {
        (self.packet_size - HEADER_SIZE).min(MAX_PAYLOAD_LEN)
    }

    /// Appends the encoded frame to `out` and returns the number of bytes
    /// written. On error `out` is left untouched.
    pub fn encode_into(&self, frame: &Frame, out: &mut Vec<u8>) -> EncodeResult<usize> {
        let sequence_num =
            field_value("sequence_num", frame.sequence_num, SEQUENCE_NUM_SENTINEL)?;
        let payload_id = field_value("payload_id", frame.payload_id, PAYLOAD_ID_SENTINEL)?;

        let mut payload = Vec::with_capacity(self.payload_limit());
        rmpv::encode::write_value(&mut payload, &frame.payload)
            .map_err(|err| EncodeError::Serialize(err.to_string()))?;

        let limit = self.payload_limit();
        if payload.len() > limit {
            return Err(EncodeError::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }

        let header = (frame.kind.bit() << 47)
            | ((payload.len() as u64) << 39)
            | ((sequence_num as u64) << 20)
            | payload_id as u64;
        out.extend_from_slice(&header.to_be_bytes()[2..]);
        out.extend_from_slice(&payload);
        Ok(HEADER_SIZE + payload.len())
    }

    pub fn encode(&self, frame: &Frame) -> EncodeResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.packet_size);
        self.encode_into(frame, &mut out)?;
        Ok(out)
    }
}

fn field_value(field: &'static str, value: Option<u32>, sentinel: u32) -> EncodeResult<u32> {
    match value {
        None => Ok(sentinel),
        Some(value) if value < sentinel => Ok(value),
        Some(value) => Err(EncodeError::FieldOutOfRange {
            field,
            value,
            max: sentinel - 1,
        }),
    }
}

/// Decodes one frame. Bytes past `HEADER_SIZE + payload_len` are padding
/// and ignored.
pub fn decode(buf: &[u8]) -> DecodeResult<Frame> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }

    let mut raw = [0u8; 8];
    raw[2..].copy_from_slice(&buf[..HEADER_SIZE]);
    let header = u64::from_be_bytes(raw);

    let kind = if (header >> 47) & 1 == 1 {
        FrameKind::Control
    } else {
        FrameKind::Data
    };
    let payload_len = ((header >> 39) & 0xff) as usize;
    let sequence_num = ((header >> 20) as u32) & SEQUENCE_NUM_SENTINEL;
    let payload_id = (header as u32) & PAYLOAD_ID_SENTINEL;

    let needed = HEADER_SIZE + payload_len;
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }

    let mut cursor = &buf[HEADER_SIZE..needed];
    let payload = rmpv::decode::read_value(&mut cursor)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;
    if !cursor.is_empty() {
        return Err(DecodeError::Malformed(format!(
            "{} unread bytes after payload value",
            cursor.len()
        )));
    }

    Ok(Frame {
        kind,
        sequence_num: (sequence_num != SEQUENCE_NUM_SENTINEL).then_some(sequence_num),
        payload_id: (payload_id != PAYLOAD_ID_SENTINEL).then_some(payload_id),
        payload,
    })
}
