// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

pub mod error;
pub use error::*;

mod contact;
mod ftp;
mod handshake;
mod job;
mod session;
mod spacecraft;
mod state;
mod store;

pub use contact::{image_filename, ContactReport, GroundStation, Satellite};
pub use ftp::{
    Completion, FileTransfer, FtpConfig, FtpConfigBuilder, ServeSummary, BIN_OVERHEAD,
    DEFAULT_CHUNK_SIZE, DEFAULT_REQUEST_SIZE, DEFAULT_STALL_TIMEOUT, REQUEST_SIZE_WARN,
};
pub use handshake::{
    HandshakeConfig, HandshakeConfigBuilder, HandshakeState, Initiator, Responder, ResponsePlan,
    Spacecraft, DEFAULT_COOLDOWN, DEFAULT_INVENTORY_TIMEOUT,
};
pub use job::{artifact_key, job_dir, Artifact, ChunkOutcome, MissingBitmap, TransferJob};
pub use session::{CameraSettings, Session, CAMERA_SETTINGS_KEY, TELEMETRY_DIR};
pub use spacecraft::{
    default_camera_settings, image_key, SimSpacecraft, IMAGE_COUNT_KEY, IMAGE_DIR,
};
pub use state::{PersistentState, STATE_KEY};
pub use store::{FsStore, MemStore, Store};
