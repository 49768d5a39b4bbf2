// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use async_trait::async_trait;
use log::*;
use std::{fmt, time::Duration};

use crate::LinkResult;

/// The radio as seen from the protocol: whole packets in, whole packets
/// out, no guarantees.
#[async_trait]
pub trait Transceiver: Send {
    async fn send(&mut self, data: &[u8]) -> LinkResult<()>;

    /// Returns false when the peer did not acknowledge the packet.
    async fn send_with_ack(&mut self, data: &[u8]) -> LinkResult<bool>;

    /// `Ok(None)` when nothing arrived within `timeout`.
    async fn receive(&mut self, timeout: Duration) -> LinkResult<Option<Vec<u8>>>;

    fn diagnostics(&self) -> RadioDiagnostics;
}

/// Read-only radio settings, used for logging only.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioDiagnostics {
    pub frequency_mhz: f32,
    pub signal_bandwidth_hz: u32,
    pub coding_rate: u8,
    pub spreading_factor: u8,
    pub last_rssi: Option<i16>,
    pub tx_power_dbm: i8,
    pub preamble_length: u16,
    pub crc_enabled: bool,
}

impl Default for RadioDiagnostics {
    fn default() -> Self {
        RadioDiagnostics {
            frequency_mhz: 437.4,
            signal_bandwidth_hz: 125_000,
            coding_rate: 5,
            spreading_factor: 8,
            last_rssi: None,
            tx_power_dbm: 23,
            preamble_length: 8,
            crc_enabled: true,
        }
    }
}

impl RadioDiagnostics {
    pub fn report(&self) {
        info!("radio diagnostics:");
        info!("  frequency: {} MHz", self.frequency_mhz);
        info!("  signal bandwidth: {} Hz", self.signal_bandwidth_hz);
        info!("  coding rate: 4/{}", self.coding_rate);
        info!("  spreading factor: {}", self.spreading_factor);
        match self.last_rssi {
            Some(rssi) => info!("  rssi: {} dB ({})", rssi, SignalQuality::from_rssi(rssi)),
            None => info!("  rssi: n/a"),
        }
        info!("  transmit power: {} dBm", self.tx_power_dbm);
        info!("  preamble length: {}", self.preamble_length);
        info!("  crc enabled: {}", self.crc_enabled);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Weak,
    VeryWeak,
}

impl SignalQuality {
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r > -50 => SignalQuality::Excellent,
            r if r > -70 => SignalQuality::Good,
            r if r > -90 => SignalQuality::Fair,
            r if r > -110 => SignalQuality::Weak,
            _ => SignalQuality::VeryWeak,
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            SignalQuality::Excellent => "Excellent",
            SignalQuality::Good => "Good",
            SignalQuality::Fair => "Fair",
            SignalQuality::Weak => "Weak",
            SignalQuality::VeryWeak => "Very Weak",
        };
        write!(f, "{}", description)
    }
}
