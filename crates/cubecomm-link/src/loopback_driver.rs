// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use async_trait::async_trait;
use log::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{collections::BTreeSet, time::Duration};
use tokio::sync::mpsc;

use crate::{LinkError, LinkResult, RadioDiagnostics, Transceiver};

/// Which outgoing packets the simulated channel loses.
#[derive(Debug, Clone, PartialEq)]
pub enum Loss {
    None,
    /// Zero-based indices of this end's transmissions.
    Drop(BTreeSet<usize>),
    Random { probability: f64, seed: u64 },
}

impl Loss {
    pub fn drop_frames<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        Loss::Drop(indices.into_iter().collect())
    }
}

/// One end of an in-memory radio channel.
pub struct LoopbackTransceiver {
    name: &'static str,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    loss: Loss,
    rng: Option<StdRng>,
    sent: usize,
    lost: usize,
    diagnostics: RadioDiagnostics,
}

/// Two connected ends; what one sends the other receives, in order.
pub fn loopback_pair() -> (LoopbackTransceiver, LoopbackTransceiver) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LoopbackTransceiver::new("a", a_tx, a_rx),
        LoopbackTransceiver::new("b", b_tx, b_rx),
    )
}

impl LoopbackTransceiver {
    fn new(
        name: &'static str,
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        LoopbackTransceiver {
            name,
            outgoing,
            incoming,
            loss: Loss::None,
            rng: None,
            sent: 0,
            lost: 0,
            diagnostics: RadioDiagnostics::default(),
        }
    }

    pub fn with_loss(mut self, loss: Loss) -> Self {
        self.rng = match &loss {
            Loss::Random { seed, .. } => Some(StdRng::seed_from_u64(*seed)),
            _ => None,
        };
        self.loss = loss;
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: RadioDiagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Transmissions attempted, lost ones included.
    pub fn frames_sent(&self) -> usize {
        self.sent
    }

    pub fn frames_lost(&self) -> usize {
        self.lost
    }

    fn is_lost(&mut self, index: usize) -> bool {
        match (&self.loss, self.rng.as_mut()) {
            (Loss::None, _) => false,
            (Loss::Drop(indices), _) => indices.contains(&index),
            (Loss::Random { probability, .. }, Some(rng)) => {
                rng.gen_bool(probability.clamp(0.0, 1.0))
            }
            (Loss::Random { .. }, None) => false,
        }
    }

    // Returns whether the packet reached the peer.
    fn transmit(&mut self, data: &[u8]) -> LinkResult<bool> {
        let index = self.sent;
        self.sent += 1;
        if self.is_lost(index) {
            debug!("{}: losing transmission #{} ({} bytes)", self.name, index, data.len());
            self.lost += 1;
            return Ok(false);
        }
        self.outgoing
            .send(data.to_vec())
            .map_err(|_| LinkError::ChannelClosed)?;
        Ok(true)
    }
}

#[async_trait]
impl Transceiver for LoopbackTransceiver {
    async fn send(&mut self, data: &[u8]) -> LinkResult<()> {
        self.transmit(data).map(|_| ())
    }

    async fn send_with_ack(&mut self, data: &[u8]) -> LinkResult<bool> {
        self.transmit(data)
    }

    async fn receive(&mut self, timeout: Duration) -> LinkResult<Option<Vec<u8>>> {
        match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Ok(Some(data)) => Ok(Some(data)),
            Ok(None) => {
                // peer hung up, behave like a silent channel
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    fn diagnostics(&self) -> RadioDiagnostics {
        self.diagnostics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_drop_by_index() {
        let (a, mut b) = loopback_pair();
        let mut a = a.with_loss(Loss::drop_frames([0, 2]));
        for n in 0..4u8 {
            a.send(&[n]).await.unwrap();
        }
        assert_eq!(a.frames_sent(), 4);
        assert_eq!(a.frames_lost(), 2);
        let timeout = Duration::from_secs(1);
        assert_eq!(b.receive(timeout).await.unwrap(), Some(vec![1]));
        assert_eq!(b.receive(timeout).await.unwrap(), Some(vec![3]));
        assert_eq!(b.receive(timeout).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_reflects_delivery() {
        let (a, _b) = loopback_pair();
        let mut a = a.with_loss(Loss::drop_frames([1]));
        assert!(a.send_with_ack(&[0]).await.unwrap());
        assert!(!a.send_with_ack(&[1]).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_loss_is_reproducible() {
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let (a, _b) = loopback_pair();
            let mut a = a.with_loss(Loss::Random {
                probability: 0.5,
                seed: 7,
            });
            let mut delivered = Vec::new();
            for n in 0..32u8 {
                delivered.push(a.send_with_ack(&[n]).await.unwrap());
            }
            outcomes.push(delivered);
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_peer() {
        let (mut a, b) = loopback_pair();
        drop(b);
        assert!(matches!(a.send(&[1]).await, Err(LinkError::ChannelClosed)));
        assert_eq!(a.receive(Duration::from_secs(5)).await.unwrap(), None);
    }
}
