// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use std::fmt;

use crate::{Store, TransferError, TransferResult};

pub const STATE_KEY: &str = "state";

/// Ground station bookkeeping that must survive restarts.
///
/// Stored under [`STATE_KEY`] as three text lines: the number of images the
/// satellite has reported, the space separated ids still incomplete, and
/// the space separated ids received but not yet assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub images_known: u32,
    pub incomplete: Vec<u32>,
    pub to_assemble: Vec<u32>,
}

impl PersistentState {
    /// A missing record is a first run; an unreadable one is an error.
    pub async fn load(store: &dyn Store) -> TransferResult<Self> {
        match store.read(STATE_KEY).await? {
            Some(data) => {
                let text = String::from_utf8(data)
                    .map_err(|_| TransferError::corrupt("state is not utf-8"))?;
                text.parse()
            }
            None => {
                info!("no saved state, starting fresh");
                Ok(PersistentState::default())
            }
        }
    }

    pub async fn save(&self, store: &dyn Store) -> TransferResult<()> {
        store.write(STATE_KEY, self.to_string().as_bytes()).await
    }

    /// Records the satellite's reported inventory and returns the ids it
    /// has not announced before. Ids are 1-based.
    pub fn discover(&mut self, image_count: u32) -> Vec<u32> {
        if image_count <= self.images_known {
            return Vec::new();
        }
        let new_ids: Vec<u32> = (self.images_known + 1..=image_count).collect();
        info!("satellite reports new images {:?}", new_ids);
        self.incomplete.extend(&new_ids);
        self.images_known = image_count;
        new_ids
    }

    /// Moves a fully received file out of the incomplete list, onto the
    /// assembly list when assembly was deferred.
    pub fn mark_received(&mut self, file_id: u32, deferred: bool) {
        self.incomplete.retain(|id| *id != file_id);
        if deferred && !self.to_assemble.contains(&file_id) {
            self.to_assemble.push(file_id);
        }
    }

    pub fn mark_assembled(&mut self, file_id: u32) {
        self.to_assemble.retain(|id| *id != file_id);
    }
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_ids(line: Option<&str>) -> TransferResult<Vec<u32>> {
    line.unwrap_or_default()
        .split_whitespace()
        .map(|id| {
            id.parse()
                .map_err(|_| TransferError::corrupt(format!("bad file id {:?} in state", id)))
        })
        .collect()
}

impl fmt::Display for PersistentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\n{}",
            self.images_known,
            join_ids(&self.incomplete),
            join_ids(&self.to_assemble)
        )
    }
}

impl std::str::FromStr for PersistentState {
    type Err = TransferError;

    fn from_str(text: &str) -> TransferResult<Self> {
        let mut lines = text.lines();
        let images_known = lines
            .next()
            .map(str::trim)
            .and_then(|line| line.parse().ok())
            .ok_or_else(|| TransferError::corrupt("state has no image count"))?;
        Ok(PersistentState {
            images_known,
            incomplete: parse_ids(lines.next())?,
            to_assemble: parse_ids(lines.next())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    #[tokio::test]
    async fn test_first_run_and_roundtrip() {
        let store = MemStore::new();
        let mut state = PersistentState::load(&store).await.unwrap();
        assert_eq!(state, PersistentState::default());

        assert_eq!(state.discover(3), vec![1, 2, 3]);
        state.mark_received(2, true);
        state.save(&store).await.unwrap();
        assert_eq!(
            store.read(STATE_KEY).await.unwrap().unwrap(),
            b"3\n1 3\n2".to_vec()
        );

        let reloaded = PersistentState::load(&store).await.unwrap();
        assert_eq!(reloaded, state);
    }

    #[test]
    fn test_discover_only_counts_increases() {
        let mut state = PersistentState {
            images_known: 4,
            incomplete: vec![4],
            to_assemble: vec![],
        };
        assert!(state.discover(4).is_empty());
        assert!(state.discover(2).is_empty());
        assert_eq!(state.discover(6), vec![5, 6]);
        assert_eq!(state.incomplete, vec![4, 5, 6]);
        assert_eq!(state.images_known, 6);
    }

    #[test]
    fn test_received_and_assembled() {
        let mut state: PersistentState = "2\n1 2\n".parse().unwrap();
        state.mark_received(1, false);
        state.mark_received(2, true);
        state.mark_received(2, true);
        assert!(state.incomplete.is_empty());
        assert_eq!(state.to_assemble, vec![2]);
        state.mark_assembled(2);
        assert!(state.to_assemble.is_empty());
    }

    #[test]
    fn test_short_and_corrupt_records() {
        let state: PersistentState = "5".parse().unwrap();
        assert_eq!(state.images_known, 5);
        assert!(state.incomplete.is_empty());
        assert!(matches!(
            "".parse::<PersistentState>(),
            Err(TransferError::Corrupt(_))
        ));
        assert!(matches!(
            "2\n1 x\n".parse::<PersistentState>(),
            Err(TransferError::Corrupt(_))
        ));
    }
}
