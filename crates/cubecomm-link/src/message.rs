// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Logical messages carried in frames.
//!
//! | message       | kind    | payload                                         |
//! |---------------|---------|-------------------------------------------------|
//! | Handshake1    | control | `["#IRVCB", telemetry]`                         |
//! | Handshake2    | control | `["#IRVCBH2", settings, new_timeout, picture]`  |
//! | Handshake3    | control | `["#IRVCBH3", image_count]`                     |
//! | FileRequest   | control | `["req", "all" \| [index, ...]]`                |
//! | FileLength    | control | `-chunk_count`                                  |
//! | FileDelete    | control | `"del"`                                         |
//! | StateOfHealth | control | `["#IRCVBST", field, ...]`                      |
//! | FileData      | data    | chunk bytes, `sequence_num` is the chunk index  |
//!
//! File messages carry the file id in `payload_id`.

use log::*;
use rmpv::Value;
use std::{fmt, time::Duration};

use crate::{Frame, FrameKind, SEQUENCE_NUM_SENTINEL};

pub const TAG_HANDSHAKE1: &str = "#IRVCB";
pub const TAG_HANDSHAKE2: &str = "#IRVCBH2";
pub const TAG_HANDSHAKE3: &str = "#IRVCBH3";
pub const TAG_FILE_REQUEST: &str = "req";
// sic, the deployed ground software matches on this spelling
pub const TAG_STATE_OF_HEALTH: &str = "#IRCVBST";
pub const TAG_FILE_DELETE: &str = "del";
pub const REQUEST_ALL: &str = "all";

/// Chunk indices travel in `sequence_num`, so a file has at most this many
/// chunks.
pub const MAX_CHUNK_COUNT: u32 = SEQUENCE_NUM_SENTINEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Handshake1,
    Handshake2,
    Handshake3,
    FileRequest,
    FileLength,
    FileData,
    FileDelete,
    StateOfHealth,
    None,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Category::Handshake1 => "handshake1",
            Category::Handshake2 => "handshake2",
            Category::Handshake3 => "handshake3",
            Category::FileRequest => "file_req",
            Category::FileLength => "file_len",
            Category::FileData => "file_data",
            Category::FileDelete => "file_del",
            Category::StateOfHealth => "state_of_health",
            Category::None => "none",
        };
        write!(f, "{}", description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRequest {
    All,
    Indices(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake1 {
        telemetry: Value,
    },
    Handshake2 {
        camera_settings: Option<Vec<(Value, Value)>>,
        new_timeout: Option<Duration>,
        take_picture: bool,
    },
    Handshake3 {
        image_count: u32,
    },
    FileRequest {
        file_id: u32,
        request: ChunkRequest,
    },
    FileLength {
        file_id: u32,
        chunk_count: u32,
    },
    FileData {
        file_id: u32,
        index: u32,
        chunk: Vec<u8>,
    },
    FileDelete {
        file_id: u32,
    },
    StateOfHealth {
        fields: Vec<Value>,
    },
    /// Nothing usable arrived: timeout, undecodable bytes or an
    /// unrecognized payload shape.
    None,
}

impl Message {
    pub fn category(&self) -> Category {
        match self {
            Message::Handshake1 { .. } => Category::Handshake1,
            Message::Handshake2 { .. } => Category::Handshake2,
            Message::Handshake3 { .. } => Category::Handshake3,
            Message::FileRequest { .. } => Category::FileRequest,
            Message::FileLength { .. } => Category::FileLength,
            Message::FileData { .. } => Category::FileData,
            Message::FileDelete { .. } => Category::FileDelete,
            Message::StateOfHealth { .. } => Category::StateOfHealth,
            Message::None => Category::None,
        }
    }

    /// Classifies a decoded frame. Never fails: shapes that do not match a
    /// known message resolve to `Message::None`.
    pub fn from_frame(frame: &Frame) -> Message {
        let message = match frame.kind {
            FrameKind::Data => classify_data(frame),
            FrameKind::Control => classify_control(frame),
        };
        if message == Message::None {
            warn!("unrecognized frame shape: {}", frame);
        }
        message
    }

    /// Same as [`Message::from_frame`] with `None` for "no frame".
    pub fn classify(frame: Option<&Frame>) -> Message {
        frame.map(Message::from_frame).unwrap_or(Message::None)
    }

    /// The frame that carries this message, `None` for `Message::None`.
    pub fn to_frame(&self) -> Option<Frame> {
        let frame = match self {
            Message::Handshake1 { telemetry } => Frame::handshake1(telemetry.clone()),
            Message::Handshake2 {
                camera_settings,
                new_timeout,
                take_picture,
            } => Frame::handshake2(camera_settings.clone(), *new_timeout, *take_picture),
            Message::Handshake3 { image_count } => Frame::handshake3(*image_count),
            Message::FileRequest { file_id, request } => Frame::file_request(*file_id, request),
            Message::FileLength {
                file_id,
                chunk_count,
            } => Frame::file_length(*file_id, *chunk_count),
            Message::FileData {
                file_id,
                index,
                chunk,
            } => Frame::file_data(*index, *file_id, chunk.clone()),
            Message::FileDelete { file_id } => Frame::file_delete(*file_id),
            Message::StateOfHealth { fields } => Frame::state_of_health(fields.clone()),
            Message::None => return None,
        };
        Some(frame)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::FileRequest { file_id, request } => match request {
                ChunkRequest::All => write!(f, "file_req {}: all", file_id),
                ChunkRequest::Indices(indices) => {
                    write!(f, "file_req {}: {:?}", file_id, indices)
                }
            },
            Message::FileLength {
                file_id,
                chunk_count,
            } => write!(f, "file_len {}: {} chunks", file_id, chunk_count),
            Message::FileData {
                file_id,
                index,
                chunk,
            } => write!(f, "file_data {}:{} sz: {}", file_id, index, chunk.len()),
            Message::FileDelete { file_id } => write!(f, "file_del {}", file_id),
            Message::Handshake3 { image_count } => write!(f, "handshake3: {} images", image_count),
            other => write!(f, "{}", other.category()),
        }
    }
}

/// Shorthand for `categorize(frame)`.
pub fn categorize(frame: &Frame) -> Category {
    Message::from_frame(frame).category()
}

fn classify_data(frame: &Frame) -> Message {
    match (frame.payload_id, frame.sequence_num, &frame.payload) {
        (Some(file_id), Some(index), Value::Binary(chunk)) => Message::FileData {
            file_id,
            index,
            chunk: chunk.clone(),
        },
        _ => Message::None,
    }
}

fn classify_control(frame: &Frame) -> Message {
    match &frame.payload {
        Value::Array(items) => match items.first().and_then(Value::as_str) {
            Some(TAG_HANDSHAKE1) => Message::Handshake1 {
                telemetry: items.get(1).cloned().unwrap_or(Value::Nil),
            },
            Some(TAG_HANDSHAKE2) => classify_handshake2(items),
            Some(TAG_HANDSHAKE3) => items
                .get(1)
                .and_then(Value::as_u64)
                .and_then(|count| u32::try_from(count).ok())
                .map(|image_count| Message::Handshake3 { image_count })
                .unwrap_or(Message::None),
            Some(TAG_FILE_REQUEST) => match (frame.payload_id, items.get(1)) {
                (Some(file_id), Some(body)) => parse_request(body)
                    .map(|request| Message::FileRequest { file_id, request })
                    .unwrap_or(Message::None),
                _ => Message::None,
            },
            Some(TAG_STATE_OF_HEALTH) => Message::StateOfHealth {
                fields: items[1..].to_vec(),
            },
            _ => Message::None,
        },
        Value::String(text) if text.as_str() == Some(TAG_FILE_DELETE) => match frame.payload_id {
            Some(file_id) => Message::FileDelete { file_id },
            None => Message::None,
        },
        Value::Integer(count) => match (frame.payload_id, count.as_i64()) {
            (Some(file_id), Some(count)) => u32::try_from(count.unsigned_abs())
                .map(|chunk_count| Message::FileLength {
                    file_id,
                    chunk_count,
                })
                .unwrap_or(Message::None),
            _ => Message::None,
        },
        _ => Message::None,
    }
}

fn classify_handshake2(items: &[Value]) -> Message {
    let camera_settings = items.get(1).and_then(Value::as_map).cloned();
    let new_timeout = items.get(2).and_then(|value| {
        let secs = value.as_f64()?;
        let timeout = Duration::try_from_secs_f64(secs).ok();
        if timeout.is_none() {
            warn!("ignoring invalid timeout override: {}", value);
        }
        timeout
    });
    let take_picture = items.get(3).and_then(Value::as_bool).unwrap_or(false);
    Message::Handshake2 {
        camera_settings,
        new_timeout,
        take_picture,
    }
}

fn parse_request(body: &Value) -> Option<ChunkRequest> {
    match body {
        Value::String(text) if text.as_str() == Some(REQUEST_ALL) => Some(ChunkRequest::All),
        Value::Array(indices) => indices
            .iter()
            .map(|index| index.as_u64().and_then(|index| u32::try_from(index).ok()))
            .collect::<Option<Vec<u32>>>()
            .map(ChunkRequest::Indices),
        _ => None,
    }
}

fn timeout_value(timeout: Duration) -> Value {
    if timeout.subsec_nanos() == 0 {
        Value::from(timeout.as_secs())
    } else {
        Value::F64(timeout.as_secs_f64())
    }
}

impl Frame {
    pub fn handshake1(telemetry: Value) -> Frame {
        Frame::new(
            FrameKind::Control,
            Value::Array(vec![Value::from(TAG_HANDSHAKE1), telemetry]),
        )
    }

    pub fn handshake2(
        camera_settings: Option<Vec<(Value, Value)>>,
        new_timeout: Option<Duration>,
        take_picture: bool,
    ) -> Frame {
        Frame::new(
            FrameKind::Control,
            Value::Array(vec![
                Value::from(TAG_HANDSHAKE2),
                camera_settings.map(Value::Map).unwrap_or(Value::Nil),
                new_timeout.map(timeout_value).unwrap_or(Value::Nil),
                Value::from(take_picture),
            ]),
        )
    }

    pub fn handshake3(image_count: u32) -> Frame {
        Frame::new(
            FrameKind::Control,
            Value::Array(vec![Value::from(TAG_HANDSHAKE3), Value::from(image_count)]),
        )
    }

    pub fn file_request(file_id: u32, request: &ChunkRequest) -> Frame {
        let body = match request {
            ChunkRequest::All => Value::from(REQUEST_ALL),
            ChunkRequest::Indices(indices) => {
                Value::Array(indices.iter().copied().map(Value::from).collect())
            }
        };
        Frame::new(
            FrameKind::Control,
            Value::Array(vec![Value::from(TAG_FILE_REQUEST), body]),
        )
        .with_payload_id(file_id)
    }

    /// The count travels negated so a zero-length file is still told apart
    /// from data.
    pub fn file_length(file_id: u32, chunk_count: u32) -> Frame {
        Frame::new(FrameKind::Control, Value::from(-i64::from(chunk_count)))
            .with_payload_id(file_id)
    }

    pub fn file_data(index: u32, file_id: u32, chunk: Vec<u8>) -> Frame {
        Frame::new(FrameKind::Data, Value::from(chunk))
            .with_sequence_num(index)
            .with_payload_id(file_id)
    }

    pub fn file_delete(file_id: u32) -> Frame {
        Frame::new(FrameKind::Control, Value::from(TAG_FILE_DELETE)).with_payload_id(file_id)
    }

    pub fn state_of_health(fields: Vec<Value>) -> Frame {
        let mut payload = Vec::with_capacity(fields.len() + 1);
        payload.push(Value::from(TAG_STATE_OF_HEALTH));
        payload.extend(fields);
        Frame::new(FrameKind::Control, Value::Array(payload))
    }
}
