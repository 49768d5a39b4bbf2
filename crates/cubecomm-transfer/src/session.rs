// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use chrono::{DateTime, Utc};
use log::*;
use rmpv::Value;
use std::{collections::BTreeMap, fmt, time::Duration};

use crate::{Store, TransferError, TransferResult};

pub const CAMERA_SETTINGS_KEY: &str = "camera_settings";
pub const TELEMETRY_DIR: &str = "telemetry";

/// What the two ends agreed on during one contact window. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub started: DateTime<Utc>,
    pub telemetry: Value,
    pub camera_settings: Option<Vec<(Value, Value)>>,
    pub new_timeout: Option<Duration>,
    pub take_picture: bool,
    pub image_count: Option<u32>,
}

impl Session {
    pub fn new(telemetry: Value) -> Self {
        Session {
            started: Utc::now(),
            telemetry,
            camera_settings: None,
            new_timeout: None,
            take_picture: false,
            image_count: None,
        }
    }

    /// Writes the contact's telemetry as MessagePack under
    /// `telemetry/<start time>` and returns the key.
    pub async fn save_telemetry(&self, store: &dyn Store) -> TransferResult<String> {
        let key = format!(
            "{}/{}",
            TELEMETRY_DIR,
            self.started.format("%Y%m%dT%H%M%S%.3fZ")
        );
        let mut data = Vec::new();
        rmpv::encode::write_value(&mut data, &self.telemetry)
            .map_err(|err| TransferError::internal_error(err.to_string()))?;
        store.write(&key, &data).await?;
        debug!("telemetry saved to {}", key);
        Ok(key)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.started.format("%H:%M:%S"))?;
        if let Some(count) = self.image_count {
            write!(f, " images={}", count)?;
        }
        if let Some(timeout) = self.new_timeout {
            write!(f, " timeout={:?}", timeout)?;
        }
        if self.take_picture {
            write!(f, " +picture")?;
        }
        Ok(())
    }
}

/// Named camera parameters, persisted as a MessagePack map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraSettings(BTreeMap<String, Value>);

impl CameraSettings {
    pub fn new(settings: BTreeMap<String, Value>) -> Self {
        CameraSettings(settings)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn to_map(&self) -> Vec<(Value, Value)> {
        self.0
            .iter()
            .map(|(name, value)| (Value::from(name.as_str()), value.clone()))
            .collect()
    }

    /// Replaces every setting when `delta` names exactly the current
    /// settings. Anything else is treated as garbled in transit and
    /// ignored; returns whether the delta was applied.
    pub fn apply_delta(&mut self, delta: &[(Value, Value)]) -> bool {
        let mut incoming = BTreeMap::new();
        for (name, value) in delta {
            match name.as_str() {
                Some(name) => {
                    incoming.insert(name.to_string(), value.clone());
                }
                None => {
                    warn!("camera settings name {} is not a string, ignoring delta", name);
                    return false;
                }
            }
        }
        if !incoming.keys().eq(self.0.keys()) {
            warn!(
                "camera settings delta {:?} does not match {:?}, ignoring",
                incoming.keys().collect::<Vec<_>>(),
                self.0.keys().collect::<Vec<_>>()
            );
            return false;
        }
        info!("applying camera settings {:?}", incoming);
        self.0 = incoming;
        true
    }

    pub async fn load(store: &dyn Store) -> TransferResult<Option<Self>> {
        let data = match store.read(CAMERA_SETTINGS_KEY).await? {
            Some(data) => data,
            None => return Ok(None),
        };
        let value = rmpv::decode::read_value(&mut data.as_slice())
            .map_err(|err| TransferError::corrupt(format!("camera settings: {}", err)))?;
        let map = value
            .as_map()
            .ok_or_else(|| TransferError::corrupt("camera settings are not a map"))?;
        let mut settings = BTreeMap::new();
        for (name, value) in map {
            let name = name
                .as_str()
                .ok_or_else(|| TransferError::corrupt("camera setting name is not a string"))?;
            settings.insert(name.to_string(), value.clone());
        }
        Ok(Some(CameraSettings(settings)))
    }

    pub async fn save(&self, store: &dyn Store) -> TransferResult<()> {
        let mut data = Vec::new();
        rmpv::encode::write_value(&mut data, &Value::Map(self.to_map()))
            .map_err(|err| TransferError::internal_error(err.to_string()))?;
        store.write(CAMERA_SETTINGS_KEY, &data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    fn settings() -> CameraSettings {
        CameraSettings::new(BTreeMap::from([
            ("exposure_value".to_string(), Value::from(0)),
            ("quality".to_string(), Value::from(10)),
        ]))
    }

    #[test]
    fn test_matching_delta_applied() {
        let mut current = settings();
        let delta = vec![
            (Value::from("quality"), Value::from(4)),
            (Value::from("exposure_value"), Value::from(-2)),
        ];
        assert!(current.apply_delta(&delta));
        assert_eq!(current.get("quality"), Some(&Value::from(4)));
        assert_eq!(current.get("exposure_value"), Some(&Value::from(-2)));
    }

    #[test]
    fn test_mismatched_delta_rejected() {
        let mut current = settings();
        let partial = vec![(Value::from("quality"), Value::from(4))];
        assert!(!current.apply_delta(&partial));
        let extra = vec![
            (Value::from("quality"), Value::from(4)),
            (Value::from("exposure_value"), Value::from(1)),
            (Value::from("effect"), Value::from(2)),
        ];
        assert!(!current.apply_delta(&extra));
        let numeric = vec![
            (Value::from(1), Value::from(4)),
            (Value::from("exposure_value"), Value::from(1)),
        ];
        assert!(!current.apply_delta(&numeric));
        assert_eq!(current, settings());
    }

    #[tokio::test]
    async fn test_settings_and_telemetry_persist() {
        let store = MemStore::new();
        assert_eq!(CameraSettings::load(&store).await.unwrap(), None);
        settings().save(&store).await.unwrap();
        assert_eq!(CameraSettings::load(&store).await.unwrap(), Some(settings()));

        let session = Session::new(Value::Array(vec![Value::from(1), Value::from("nominal")]));
        let key = session.save_telemetry(&store).await.unwrap();
        assert!(key.starts_with("telemetry/"));
        let data = store.read(&key).await.unwrap().unwrap();
        assert_eq!(
            rmpv::decode::read_value(&mut data.as_slice()).unwrap(),
            session.telemetry
        );
    }
}
