// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use std::time::Duration;

use crate::{
    decode, Frame, FrameCodec, FrameKind, LinkError, LinkResult, Message, Transceiver,
    DEFAULT_PACKET_SIZE,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub packet_size: usize,
    pub timeout: Duration,
    pub ack_control: bool, // control frames go out with send_with_ack
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfigBuilder::new().build()
    }
}

#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    packet_size: Option<usize>,
    timeout: Option<Duration>,
    ack_control: Option<bool>,
}

impl LinkConfigBuilder {
    pub fn new() -> Self {
        Self {
            packet_size: None,
            timeout: None,
            ack_control: None,
        }
    }

    pub fn packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = Some(packet_size);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ack_control(mut self, ack_control: bool) -> Self {
        self.ack_control = Some(ack_control);
        self
    }

    pub fn build(self) -> LinkConfig {
        LinkConfig {
            packet_size: self.packet_size.unwrap_or(DEFAULT_PACKET_SIZE),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            ack_control: self.ack_control.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub timeouts: u64,
    pub receive_failures: u64,
    pub dropped: u64, // arrived but could not be decoded
}

/// Whole-frame send and receive over a [`Transceiver`].
///
/// The link is half-duplex; `&mut self` on every operation keeps a receive
/// from overlapping an outstanding acknowledged send.
pub struct Transport<T: Transceiver> {
    transceiver: T,
    codec: FrameCodec,
    timeout: Duration,
    ack_control: bool,
    stats: LinkStats,
}

impl<T: Transceiver> Transport<T> {
    pub fn new(transceiver: T, config: LinkConfig) -> LinkResult<Self> {
        Ok(Transport {
            transceiver,
            codec: FrameCodec::new(config.packet_size)?,
            timeout: config.timeout,
            ack_control: config.ack_control,
            stats: LinkStats::default(),
        })
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        info!("receive timeout {:?} -> {:?}", self.timeout, timeout);
        self.timeout = timeout;
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    pub fn transceiver_mut(&mut self) -> &mut T {
        &mut self.transceiver
    }

    pub fn report_diagnostics(&self) {
        self.transceiver.diagnostics().report();
    }

    /// Encodes and transmits one frame, returning the bytes sent. Frames
    /// that fail to encode are never transmitted.
    pub async fn send_frame(&mut self, frame: &Frame) -> LinkResult<usize> {
        let buffer = match self.codec.encode(frame) {
            Ok(buffer) => buffer,
            Err(err) => {
                error!("not sending {}: {}", frame, err);
                self.stats.send_failures += 1;
                return Err(err.into());
            }
        };

        let outcome = if self.ack_control && frame.kind == FrameKind::Control {
            match self.transceiver.send_with_ack(&buffer).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(LinkError::NotAcknowledged),
                Err(err) => Err(err),
            }
        } else {
            self.transceiver.send(&buffer).await
        };

        match outcome {
            Ok(()) => {
                trace!("sent {}, sz: {}", frame, buffer.len());
                self.stats.sent += 1;
                Ok(buffer.len())
            }
            Err(err) => {
                warn!("send of {} failed: {}", frame, err);
                self.stats.send_failures += 1;
                Err(err)
            }
        }
    }

    /// Waits up to `timeout` (or the transport default) for one frame.
    /// Timeouts, transceiver failures and undecodable bytes all come back
    /// as `None`.
    pub async fn receive_frame(&mut self, timeout: Option<Duration>) -> Option<Frame> {
        let timeout = timeout.unwrap_or(self.timeout);
        match self.transceiver.receive(timeout).await {
            Ok(Some(buffer)) => match decode(&buffer) {
                Ok(frame) => {
                    trace!("received {}, sz: {}", frame, buffer.len());
                    self.stats.received += 1;
                    Some(frame)
                }
                Err(err) => {
                    warn!("dropping undecodable frame ({} bytes): {}", buffer.len(), err);
                    self.stats.dropped += 1;
                    None
                }
            },
            Ok(None) => {
                debug!("nothing received within {:?}", timeout);
                self.stats.timeouts += 1;
                None
            }
            Err(err) => {
                warn!("receive failed: {}", err);
                self.stats.receive_failures += 1;
                None
            }
        }
    }

    /// Receives and classifies one frame.
    pub async fn receive_message(&mut self, timeout: Option<Duration>) -> Message {
        let frame = self.receive_frame(timeout).await;
        Message::classify(frame.as_ref())
    }
}
