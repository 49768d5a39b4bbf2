// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use cubecomm_link::{Category, LinkError};
use thiserror::Error;

/// Everything here scopes to one contact attempt; persisted job state
/// survives all of them.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transfer: internal error: {0}")]
    InternalError(String),

    #[error("transfer: expected {expected}, got {got}")]
    Protocol { expected: Category, got: Category },

    #[error("transfer: file id mismatch, requested {expected}, got {got}")]
    UnexpectedFile { expected: u32, got: u32 },

    #[error("transfer: file {file_id} has {chunk_count} chunks, at most {max} are addressable")]
    TooManyChunks {
        file_id: u32,
        chunk_count: u64,
        max: u32,
    },

    #[error("transfer: no response from peer")]
    NoResponse,

    #[error("transfer: retry limit {0} reached with chunks still missing")]
    RetriesExhausted(u32),

    #[error("transfer: corrupt record: {0}")]
    Corrupt(String),

    #[error("transfer: link error: {0}")]
    Link(#[from] LinkError),

    #[error("transfer: io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        TransferError::InvalidArgument(msg.into())
    }
    pub fn internal_error<S: Into<String>>(msg: S) -> Self {
        TransferError::InternalError(msg.into())
    }
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        TransferError::Corrupt(msg.into())
    }
    pub fn protocol(expected: Category, got: Category) -> Self {
        TransferError::Protocol { expected, got }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
