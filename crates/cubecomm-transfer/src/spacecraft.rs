// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use async_trait::async_trait;
use log::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rmpv::Value;
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, sync::Arc};

use crate::{CameraSettings, Spacecraft, Store, TransferError, TransferResult};

pub const IMAGE_DIR: &str = "images";
pub const IMAGE_COUNT_KEY: &str = "image_count";

/// JPEG start-of-image and APP0 markers.
const JPEG_MAGIC: [u8; 4] = [0xff, 0xd8, 0xff, 0xe0];

/// Satellite side store key of image `image_id`.
pub fn image_key(image_id: u32) -> String {
    format!("{}/image_{}.jpeg", IMAGE_DIR, image_id)
}

pub fn default_camera_settings() -> CameraSettings {
    CameraSettings::new(BTreeMap::from([
        ("brightness".to_string(), Value::from(0)),
        ("contrast".to_string(), Value::from(0)),
        ("exposure_value".to_string(), Value::from(0)),
        ("quality".to_string(), Value::from(10)),
        ("white_balance".to_string(), Value::from(0)),
    ]))
}

/// A spacecraft without hardware: pictures are seeded noise written to
/// the store, telemetry is a handful of counters.
pub struct SimSpacecraft {
    store: Arc<dyn Store>,
    settings: CameraSettings,
    rng: StdRng,
    image_size: usize,
    images_taken: u32,
    pings: u32,
}

impl SimSpacecraft {
    pub async fn load(store: Arc<dyn Store>, seed: u64, image_size: usize) -> TransferResult<Self> {
        let settings = match CameraSettings::load(store.as_ref()).await {
            Ok(Some(settings)) => settings,
            Ok(None) => default_camera_settings(),
            Err(err) => {
                warn!("camera settings unreadable, using defaults: {}", err);
                default_camera_settings()
            }
        };
        let images_taken = match store.read(IMAGE_COUNT_KEY).await? {
            Some(data) => String::from_utf8_lossy(&data)
                .trim()
                .parse()
                .map_err(|_| TransferError::corrupt("image count"))?,
            None => 0,
        };
        Ok(SimSpacecraft {
            store,
            settings,
            rng: StdRng::seed_from_u64(seed),
            image_size,
            images_taken,
            pings: 0,
        })
    }

    pub fn camera_settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

#[async_trait]
impl Spacecraft for SimSpacecraft {
    async fn telemetry(&mut self) -> TransferResult<Value> {
        self.pings += 1;
        let temperature = self.rng.gen_range(-200..400) as f64 / 10.0;
        Ok(Value::Array(vec![
            Value::from(self.pings),
            Value::from(self.images_taken),
            Value::from("nominal"),
            Value::F64(temperature),
        ]))
    }

    async fn apply_camera_settings(&mut self, delta: &[(Value, Value)]) -> TransferResult<bool> {
        if !self.settings.apply_delta(delta) {
            return Ok(false);
        }
        self.settings.save(self.store.as_ref()).await?;
        Ok(true)
    }

    async fn capture(&mut self) -> TransferResult<Option<u32>> {
        let image_id = self.images_taken + 1;
        let mut image = Vec::with_capacity(self.image_size.max(JPEG_MAGIC.len()));
        image.extend_from_slice(&JPEG_MAGIC);
        image.resize(self.image_size.max(JPEG_MAGIC.len()), 0);
        self.rng.fill(&mut image[JPEG_MAGIC.len()..]);
        self.store.write(&image_key(image_id), &image).await?;
        self.images_taken = image_id;
        self.store
            .write(IMAGE_COUNT_KEY, image_id.to_string().as_bytes())
            .await?;
        info!(
            "captured {}, sz: {}, sha256: {}",
            image_key(image_id),
            image.len(),
            hex::encode(Sha256::digest(&image))
        );
        Ok(Some(image_id))
    }

    async fn image_count(&mut self) -> TransferResult<u32> {
        Ok(self.images_taken)
    }
}
