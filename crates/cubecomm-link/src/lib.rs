// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

pub mod error;
pub use error::*;

mod frame;
mod message;
mod transceiver;
mod transport;

// In-memory channel used by the simulator and the tests
mod loopback_driver;

pub use frame::{
    decode, Frame, FrameCodec, FrameKind, DEFAULT_PACKET_SIZE, HEADER_SIZE, MAX_PAYLOAD_LEN,
    PAYLOAD_ID_SENTINEL, SEQUENCE_NUM_SENTINEL,
};
pub use loopback_driver::{loopback_pair, LoopbackTransceiver, Loss};
pub use message::{categorize, Category, ChunkRequest, Message, MAX_CHUNK_COUNT};
pub use transceiver::{RadioDiagnostics, SignalQuality, Transceiver};
pub use transport::{LinkConfig, LinkConfigBuilder, LinkStats, Transport, DEFAULT_TIMEOUT};

// re-exported so dependents build payloads with the same Value type
pub use rmpv;
