// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! One contact window, end to end, for each side of the link.

use log::*;
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};

use cubecomm_link::{Transceiver, Transport};

use crate::{
    image_key, FileTransfer, FtpConfig, HandshakeConfig, Initiator, PersistentState, Responder,
    ResponsePlan, ServeSummary, Session, Spacecraft, Store, TransferError, TransferResult,
};

/// Ground side artifact name for an image.
pub fn image_filename(image_id: u32) -> String {
    format!("image_{}.jpeg", image_id)
}

#[derive(Debug)]
pub struct ContactReport {
    pub session: Session,
    pub received: Vec<u32>,
    pub assembled: Vec<u32>,
    /// The image that stopped the contact, and why.
    pub failed: Option<(u32, TransferError)>,
}

pub struct GroundStation<T: Transceiver> {
    transport: Transport<T>,
    store: Arc<dyn Store>,
    ftp: FileTransfer,
    responder: Responder,
    state: PersistentState,
}

impl<T: Transceiver> GroundStation<T> {
    pub async fn new(
        transport: Transport<T>,
        store: Arc<dyn Store>,
        ftp_config: FtpConfig,
        handshake_config: HandshakeConfig,
        plan: ResponsePlan,
    ) -> TransferResult<Self> {
        let ftp = FileTransfer::new(ftp_config, store.clone(), transport.codec())?;
        let state = match PersistentState::load(store.as_ref()).await {
            Ok(state) => state,
            Err(TransferError::Corrupt(msg)) => {
                error!("saved state is corrupt ({}), starting fresh", msg);
                PersistentState::default()
            }
            Err(err) => return Err(err),
        };
        info!(
            "ground station: {} images known, incomplete {:?}, to assemble {:?}",
            state.images_known, state.incomplete, state.to_assemble
        );
        Ok(GroundStation {
            transport,
            store,
            ftp,
            responder: Responder::new(handshake_config, plan),
            state,
        })
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn transport(&self) -> &Transport<T> {
        &self.transport
    }

    pub fn responder_mut(&mut self) -> &mut Responder {
        &mut self.responder
    }

    /// Handshake, then fetch incomplete images oldest first until one
    /// fails, then assemble whatever was deferred.
    pub async fn run_contact(&mut self) -> TransferResult<ContactReport> {
        let store = self.store.clone();
        let session = match self
            .responder
            .run(&mut self.transport, store.as_ref(), &mut self.state)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.responder.finish();
                return Err(err);
            }
        };

        let mut report = ContactReport {
            session,
            received: Vec::new(),
            assembled: Vec::new(),
            failed: None,
        };

        while let Some(&image_id) = self.state.incomplete.first() {
            let started = Instant::now();
            let result = self
                .ftp
                .request_file(&mut self.transport, image_id, &image_filename(image_id))
                .await;
            match result {
                Ok(completion) => {
                    info!(
                        "image {} fully received, taking {:?}",
                        image_id,
                        started.elapsed()
                    );
                    self.state
                        .mark_received(image_id, completion.artifact.is_none());
                    self.state.save(store.as_ref()).await?;
                    report.received.push(image_id);
                }
                Err(err) => {
                    warn!(
                        "image {} not fully received after {:?}: {}",
                        image_id,
                        started.elapsed(),
                        err
                    );
                    self.state.save(store.as_ref()).await?;
                    report.failed = Some((image_id, err));
                    break;
                }
            }
        }

        for image_id in self.state.to_assemble.clone() {
            match self
                .ftp
                .assemble_file(image_id, &image_filename(image_id))
                .await
            {
                Ok(_) => {
                    self.state.mark_assembled(image_id);
                    self.state.save(store.as_ref()).await?;
                    report.assembled.push(image_id);
                }
                Err(err) => warn!("image {} not assembled: {}", image_id, err),
            }
        }

        self.responder.finish();
        Ok(report)
    }
}

pub struct Satellite<T: Transceiver, S: Spacecraft> {
    transport: Transport<T>,
    ftp: FileTransfer,
    initiator: Initiator,
    craft: S,
}

impl<T: Transceiver, S: Spacecraft> Satellite<T, S> {
    pub fn new(
        transport: Transport<T>,
        store: Arc<dyn Store>,
        ftp_config: FtpConfig,
        handshake_config: HandshakeConfig,
        craft: S,
    ) -> TransferResult<Self> {
        let ftp = FileTransfer::new(ftp_config, store, transport.codec())?;
        Ok(Satellite {
            transport,
            ftp,
            initiator: Initiator::new(handshake_config),
            craft,
        })
    }

    pub fn craft(&self) -> &S {
        &self.craft
    }

    pub fn transport(&self) -> &Transport<T> {
        &self.transport
    }

    fn cooldown(&self) -> Duration {
        self.initiator.config().cooldown
    }

    /// Pings the ground and serves its requests. A failed handshake
    /// sleeps out the cooldown before returning the error.
    pub async fn run_contact(&mut self) -> TransferResult<ServeSummary> {
        match self.initiator.run(&mut self.transport, &mut self.craft).await {
            Ok(_session) => {
                self.ftp
                    .serve_requests(&mut self.transport, image_key)
                    .await
            }
            Err(err) => {
                info!("contact failed ({}), cooling down {:?}", err, self.cooldown());
                sleep(self.cooldown()).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FtpConfigBuilder, HandshakeConfigBuilder, MemStore, SimSpacecraft, STATE_KEY};
    use cubecomm_link::{loopback_pair, LinkConfig, LoopbackTransceiver, Loss};
    use once_cell::sync::Lazy;

    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
    });

    type Link = Transport<LoopbackTransceiver>;

    struct Pass {
        ground: GroundStation<LoopbackTransceiver>,
        ground_store: MemStore,
        satellite: Satellite<LoopbackTransceiver, SimSpacecraft>,
        sat_store: MemStore,
    }

    async fn pass(sat_loss: Loss, take_picture: bool, images: u32, ground_ftp: FtpConfig) -> Pass {
        pass_over(MemStore::new(), sat_loss, take_picture, images, ground_ftp).await
    }

    // a ground station resuming from whatever `ground_store` holds
    async fn pass_over(
        ground_store: MemStore,
        sat_loss: Loss,
        take_picture: bool,
        images: u32,
        ground_ftp: FtpConfig,
    ) -> Pass {
        Lazy::force(&INIT);
        let (ground, sat) = loopback_pair();
        let ground: Link =
            Transport::new(ground.with_name("ground"), LinkConfig::default()).unwrap();
        let sat: Link = Transport::new(
            sat.with_name("sat").with_loss(sat_loss),
            LinkConfig::default(),
        )
        .unwrap();

        let sat_store = MemStore::new();
        let plan = ResponsePlan {
            camera_settings: None,
            new_timeout: Some(Duration::from_secs(30)),
            take_picture,
        };
        let handshake = HandshakeConfigBuilder::new().ping_attempts(3).build();
        let ground = GroundStation::new(
            ground,
            Arc::new(ground_store.clone()),
            ground_ftp,
            handshake.clone(),
            plan,
        )
        .await
        .unwrap();

        let mut craft = SimSpacecraft::load(Arc::new(sat_store.clone()), 5, 600)
            .await
            .unwrap();
        for _ in 0..images {
            craft.capture().await.unwrap();
        }
        let satellite = Satellite::new(
            sat,
            Arc::new(sat_store.clone()),
            FtpConfig::default(),
            handshake,
            craft,
        )
        .unwrap();
        Pass {
            ground,
            ground_store,
            satellite,
            sat_store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_contact() {
        let Pass {
            mut ground,
            ground_store,
            mut satellite,
            sat_store,
        } = pass(Loss::None, true, 0, FtpConfig::default()).await;
        let image = sat_store.read("images/image_1.jpeg").await.unwrap();
        assert_eq!(image, None);

        let (report, summary) = tokio::join!(ground.run_contact(), satellite.run_contact());
        let report = report.unwrap();
        let summary = summary.unwrap();

        assert_eq!(report.session.image_count, Some(1));
        assert_eq!(report.received, vec![1]);
        assert!(report.failed.is_none());
        assert_eq!(summary.full_sends, 1);
        assert_eq!(summary.deleted, vec![1]);
        // satellite released its copy
        assert!(!sat_store.exists(&image_key(1)).await.unwrap());

        let received = ground_store
            .read("files/1/image_1.jpeg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.len(), 600);
        assert_eq!(&received[..2], &[0xff, 0xd8]);
        assert_eq!(
            ground_store.read(STATE_KEY).await.unwrap(),
            Some(b"1\n\n".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_losses_recovered_over_two_contacts() {
        // sat transmissions: 0 H1, 1 H3, 2 length(1), 3 chunk 0, 4..5 rest
        // of image 1, 6 the resent chunk 0, 7 length(2)
        let Pass {
            mut ground,
            ground_store,
            mut satellite,
            sat_store,
        } = pass(Loss::drop_frames([3, 7]), false, 2, FtpConfig::default()).await;
        let originals = vec![
            sat_store.read(&image_key(1)).await.unwrap().unwrap(),
            sat_store.read(&image_key(2)).await.unwrap().unwrap(),
        ];

        let (report, summary) = tokio::join!(ground.run_contact(), satellite.run_contact());
        let report = report.unwrap();
        assert_eq!(report.received, vec![1]);
        assert!(matches!(
            report.failed,
            Some((2, TransferError::Protocol { .. }))
        ));
        let summary = summary.unwrap();
        assert_eq!(summary.full_sends, 2);
        assert_eq!(summary.partial_sends, 1);
        assert_eq!(ground.state().incomplete, vec![2]);

        // the unread chunks from the failed request are still queued at the
        // ground; the next ping must get through them
        let (report, summary) = tokio::join!(ground.run_contact(), satellite.run_contact());
        let report = report.unwrap();
        assert_eq!(report.received, vec![2]);
        assert!(report.failed.is_none());
        assert_eq!(summary.unwrap().deleted, vec![2]);
        assert_eq!(ground.state().images_known, 2);
        assert!(ground.state().incomplete.is_empty());

        for (n, original) in originals.into_iter().enumerate() {
            let image_id = n as u32 + 1;
            let key = format!("files/{}/{}", image_id, image_filename(image_id));
            assert_eq!(ground_store.read(&key).await.unwrap(), Some(original));
        }
        assert!(sat_store.list("images").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_assembly_at_end_of_contact() {
        let config = FtpConfigBuilder::new().defer_assembly(true).build();
        let Pass {
            mut ground,
            ground_store,
            mut satellite,
            ..
        } = pass(Loss::None, false, 1, config).await;

        let (report, summary) = tokio::join!(ground.run_contact(), satellite.run_contact());
        let report = report.unwrap();
        summary.unwrap();
        assert_eq!(report.received, vec![1]);
        assert_eq!(report.assembled, vec![1]);
        assert!(ground.state().to_assemble.is_empty());
        assert_eq!(
            ground_store.list("files/1").await.unwrap(),
            vec!["image_1.jpeg"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembled_image_counted_after_interrupted_save() {
        // image 1 was assembled, cleaned up and released by the satellite,
        // but the contact ended before the state recorded it
        let ground_store = MemStore::new();
        ground_store.write(STATE_KEY, b"2\n1 2\n").await.unwrap();
        ground_store
            .write("files/1/image_1.jpeg", &[0xab; 600])
            .await
            .unwrap();
        let Pass {
            mut ground,
            ground_store,
            mut satellite,
            sat_store,
        } = pass_over(ground_store, Loss::None, false, 2, FtpConfig::default()).await;
        assert!(sat_store.remove(&image_key(1)).await.unwrap());
        assert_eq!(ground.state().incomplete, vec![1, 2]);

        let (report, summary) = tokio::join!(ground.run_contact(), satellite.run_contact());
        let report = report.unwrap();
        let summary = summary.unwrap();
        assert_eq!(report.received, vec![1, 2]);
        assert!(report.failed.is_none());
        assert!(ground.state().incomplete.is_empty());
        // only image 2 crossed the link
        assert_eq!(summary.full_sends, 1);
        assert_eq!(summary.deleted, vec![1, 2]);
        assert_eq!(
            ground_store.read("files/1/image_1.jpeg").await.unwrap(),
            Some(vec![0xab; 600])
        );
        assert_eq!(
            ground_store.size("files/2/image_2.jpeg").await.unwrap(),
            Some(600)
        );
        assert_eq!(
            ground_store.read(STATE_KEY).await.unwrap(),
            Some(b"2\n\n".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_state_starts_fresh() {
        let store = MemStore::new();
        store.write(STATE_KEY, b"garbage\n").await.unwrap();
        let (ground_end, _sat_end) = loopback_pair();
        let ground = GroundStation::new(
            Transport::new(ground_end, LinkConfig::default()).unwrap(),
            Arc::new(store),
            FtpConfig::default(),
            HandshakeConfig::default(),
            ResponsePlan::default(),
        )
        .await
        .unwrap();
        assert_eq!(ground.state(), &PersistentState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_satellite_cools_down_after_silence() {
        let Pass {
            ground: _ground,
            mut satellite,
            ..
        } = pass(Loss::None, false, 0, FtpConfig::default()).await;
        let started = Instant::now();
        assert!(satellite.run_contact().await.is_err());
        // handshake2 wait plus cooldown
        assert!(started.elapsed() >= Duration::from_secs(40));
    }
}
