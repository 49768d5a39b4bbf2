// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Three step contact handshake.
//!
//! ```text
//! initiator (satellite)              responder (ground station)
//!   Handshake1 [telemetry]  ------>
//!                           <------  Handshake2 [settings, timeout, picture]
//!   Handshake3 [images]     ------>
//! ```

use async_trait::async_trait;
use log::*;
use rmpv::Value;
use std::{fmt, time::Duration};

use cubecomm_link::{Category, Frame, Message, Transceiver, Transport};

use crate::{PersistentState, Session, Store, TransferError, TransferResult};

pub const DEFAULT_INVENTORY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Wait for Handshake3, long enough for the peer to take a picture.
    pub inventory_timeout: Duration,
    pub ping_attempts: Option<u32>, // None polls forever
    /// Initiator backoff after a failed contact.
    pub cooldown: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfigBuilder::new().build()
    }
}

#[derive(Debug, Default)]
pub struct HandshakeConfigBuilder {
    inventory_timeout: Option<Duration>,
    ping_attempts: Option<u32>,
    cooldown: Option<Duration>,
}

impl HandshakeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inventory_timeout(mut self, inventory_timeout: Duration) -> Self {
        self.inventory_timeout = Some(inventory_timeout);
        self
    }

    pub fn ping_attempts(mut self, ping_attempts: u32) -> Self {
        self.ping_attempts = Some(ping_attempts);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn build(self) -> HandshakeConfig {
        HandshakeConfig {
            inventory_timeout: self.inventory_timeout.unwrap_or(DEFAULT_INVENTORY_TIMEOUT),
            ping_attempts: self.ping_attempts,
            cooldown: self.cooldown.unwrap_or(DEFAULT_COOLDOWN),
        }
    }
}

/// Responder side states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitH1,
    H1Received,
    H2Sent,
    AwaitH3,
    H3Received,
    SessionActive,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            HandshakeState::Idle => "IDLE",
            HandshakeState::AwaitH1 => "AWAIT_H1",
            HandshakeState::H1Received => "H1_RECEIVED",
            HandshakeState::H2Sent => "H2_SENT",
            HandshakeState::AwaitH3 => "AWAIT_H3",
            HandshakeState::H3Received => "H3_RECEIVED",
            HandshakeState::SessionActive => "SESSION_ACTIVE",
        };
        write!(f, "{}", description)
    }
}

/// What the responder puts in its Handshake2.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePlan {
    pub camera_settings: Option<Vec<(Value, Value)>>,
    pub new_timeout: Option<Duration>,
    pub take_picture: bool,
}

impl Default for ResponsePlan {
    fn default() -> Self {
        ResponsePlan {
            camera_settings: None,
            new_timeout: None,
            take_picture: true,
        }
    }
}

/// The initiator's hardware: sensors, camera and image inventory.
#[async_trait]
pub trait Spacecraft: Send {
    async fn telemetry(&mut self) -> TransferResult<Value>;

    /// Returns whether the settings were accepted.
    async fn apply_camera_settings(&mut self, delta: &[(Value, Value)]) -> TransferResult<bool>;

    /// Takes a picture, returning its image id.
    async fn capture(&mut self) -> TransferResult<Option<u32>>;

    /// Images taken so far; ids run from 1 to this count.
    async fn image_count(&mut self) -> TransferResult<u32>;
}

/// Ground station side: waits for a ping and answers it.
#[derive(Debug)]
pub struct Responder {
    config: HandshakeConfig,
    plan: ResponsePlan,
    state: HandshakeState,
}

impl Responder {
    pub fn new(config: HandshakeConfig, plan: ResponsePlan) -> Self {
        Responder {
            config,
            plan,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn plan_mut(&mut self) -> &mut ResponsePlan {
        &mut self.plan
    }

    /// One receive in AWAIT_H1. Anything but a Handshake1 leaves the state
    /// where it is.
    pub async fn poll_ping<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
    ) -> Option<Session> {
        self.receive_ping(transport).await.ok()
    }

    async fn receive_ping<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
    ) -> Result<Session, Category> {
        self.state = HandshakeState::AwaitH1;
        match transport.receive_message(None).await {
            Message::Handshake1 { telemetry } => {
                debug!("handshake1 received, telemetry: {}", telemetry);
                self.state = HandshakeState::H1Received;
                Ok(Session::new(telemetry))
            }
            other => {
                if other != Message::None {
                    debug!("ignoring {} while in {}", other, self.state);
                }
                Err(other.category())
            }
        }
    }

    /// Polls for a ping until `ping_attempts` receive windows pass in
    /// silence, or forever. Stray frames do not use up an attempt.
    pub async fn await_ping<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
    ) -> TransferResult<Session> {
        let mut attempts = 0;
        loop {
            match self.receive_ping(transport).await {
                Ok(session) => return Ok(session),
                Err(Category::None) => attempts += 1,
                Err(_) => continue,
            }
            if let Some(limit) = self.config.ping_attempts {
                if attempts >= limit {
                    info!("no ping after {} attempts", attempts);
                    self.state = HandshakeState::Idle;
                    return Err(TransferError::NoResponse);
                }
            }
        }
    }

    /// Sends Handshake2 and records what was offered in `session`.
    pub async fn answer<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
        session: &mut Session,
    ) -> TransferResult<()> {
        if self.state != HandshakeState::H1Received {
            return Err(TransferError::internal_error(format!(
                "cannot answer in state {}",
                self.state
            )));
        }
        let frame = Frame::handshake2(
            self.plan.camera_settings.clone(),
            self.plan.new_timeout,
            self.plan.take_picture,
        );
        if let Err(err) = transport.send_frame(&frame).await {
            self.state = HandshakeState::Idle;
            return Err(err.into());
        }
        self.state = HandshakeState::H2Sent;
        session.camera_settings = self.plan.camera_settings.clone();
        session.new_timeout = self.plan.new_timeout;
        session.take_picture = self.plan.take_picture;
        debug!("handshake2 sent");
        self.state = HandshakeState::AwaitH3;
        Ok(())
    }

    /// Waits for Handshake3. Anything else ends the contact attempt.
    pub async fn await_inventory<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
        session: &mut Session,
    ) -> TransferResult<u32> {
        if self.state != HandshakeState::AwaitH3 {
            return Err(TransferError::internal_error(format!(
                "cannot await inventory in state {}",
                self.state
            )));
        }
        match transport
            .receive_message(Some(self.config.inventory_timeout))
            .await
        {
            Message::Handshake3 { image_count } => {
                self.state = HandshakeState::H3Received;
                session.image_count = Some(image_count);
                info!("handshake3 received, satellite has {} images", image_count);
                Ok(image_count)
            }
            Message::None => {
                warn!("no handshake3 within {:?}", self.config.inventory_timeout);
                self.state = HandshakeState::Idle;
                Err(TransferError::NoResponse)
            }
            other => {
                warn!("expected handshake3, got {}", other);
                self.state = HandshakeState::Idle;
                Err(TransferError::protocol(Category::Handshake3, other.category()))
            }
        }
    }

    /// Full responder exchange. Telemetry is saved, newly announced images
    /// are added to `persisted` and saved.
    pub async fn run<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
        store: &dyn Store,
        persisted: &mut PersistentState,
    ) -> TransferResult<Session> {
        let mut session = self.await_ping(transport).await?;
        if let Err(err) = session.save_telemetry(store).await {
            warn!("telemetry not saved: {}", err);
        }
        self.answer(transport, &mut session).await?;
        let image_count = self.await_inventory(transport, &mut session).await?;
        if !persisted.discover(image_count).is_empty() {
            persisted.save(store).await?;
        }
        self.state = HandshakeState::SessionActive;
        info!("{} active", session);
        Ok(session)
    }

    /// Ends the contact window.
    pub fn finish(&mut self) {
        self.state = HandshakeState::Idle;
    }
}

/// Satellite side: pings and follows the responder's instructions.
#[derive(Debug, Default)]
pub struct Initiator {
    config: HandshakeConfig,
}

impl Initiator {
    pub fn new(config: HandshakeConfig) -> Self {
        Initiator { config }
    }

    pub fn config(&self) -> &HandshakeConfig {
        &self.config
    }

    pub async fn run<T: Transceiver>(
        &mut self,
        transport: &mut Transport<T>,
        craft: &mut dyn Spacecraft,
    ) -> TransferResult<Session> {
        let telemetry = craft.telemetry().await?;
        let mut session = Session::new(telemetry.clone());
        transport.send_frame(&Frame::handshake1(telemetry)).await?;
        debug!("handshake1 sent, waiting for handshake2");

        let (camera_settings, new_timeout, take_picture) =
            match transport.receive_message(None).await {
                Message::Handshake2 {
                    camera_settings,
                    new_timeout,
                    take_picture,
                } => (camera_settings, new_timeout, take_picture),
                Message::None => return Err(TransferError::NoResponse),
                other => {
                    warn!("expected handshake2, got {}", other);
                    return Err(TransferError::protocol(
                        Category::Handshake2,
                        other.category(),
                    ));
                }
            };

        if let Some(delta) = &camera_settings {
            if !craft.apply_camera_settings(delta).await? {
                warn!("camera settings rejected");
            }
        }
        if let Some(timeout) = new_timeout {
            transport.set_timeout(timeout);
        }
        if take_picture {
            match craft.capture().await? {
                Some(image_id) => info!("captured image {}", image_id),
                None => warn!("capture produced no image"),
            }
        }
        session.camera_settings = camera_settings;
        session.new_timeout = new_timeout;
        session.take_picture = take_picture;

        let image_count = craft.image_count().await?;
        transport
            .send_frame(&Frame::handshake3(image_count))
            .await?;
        session.image_count = Some(image_count);
        info!("{} active", session);
        Ok(session)
    }
}
