// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use thiserror::Error;

/// Failures while turning a [`crate::Frame`] into bytes. Nothing is
/// transmitted when one of these is returned.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encode: {field} {value} out of range (max {max})")]
    FieldOutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("encode: payload too large ({size} bytes, limit is {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("encode: payload serialization failed: {0}")]
    Serialize(String),
}

/// Failures while turning received bytes into a [`crate::Frame`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode: truncated frame, need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("decode: malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("link: internal error: {0}")]
    InternalError(String),

    #[error("link: {0}")]
    Encode(#[from] EncodeError),

    #[error("link: {0}")]
    Decode(#[from] DecodeError),

    #[error("link: transceiver error: {0}")]
    Transceiver(String),

    #[error("link: transmission not acknowledged")]
    NotAcknowledged,

    #[error("link: channel closed")]
    ChannelClosed,
}

impl LinkError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        LinkError::InvalidArgument(msg.into())
    }
    pub fn internal_error<S: Into<String>>(msg: S) -> Self {
        LinkError::InternalError(msg.into())
    }
    pub fn transceiver<S: Into<String>>(msg: S) -> Self {
        LinkError::Transceiver(msg.into())
    }
}

pub type EncodeResult<T> = Result<T, EncodeError>;
pub type DecodeResult<T> = Result<T, DecodeError>;
pub type LinkResult<T> = Result<T, LinkError>;
