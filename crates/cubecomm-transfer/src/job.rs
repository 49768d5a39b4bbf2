// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

use cubecomm_link::MAX_CHUNK_COUNT;

use crate::{Store, TransferError, TransferResult};

/// One flag per chunk, `true` while the chunk is still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingBitmap(Vec<bool>);

impl MissingBitmap {
    pub fn all_missing(total_chunks: u32) -> Self {
        MissingBitmap(vec![true; total_chunks as usize])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_missing(&self, index: u32) -> bool {
        self.0.get(index as usize).copied().unwrap_or(false)
    }

    pub fn missing_count(&self) -> usize {
        self.0.iter().filter(|missing| **missing).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// Clears the flag, returns whether it was set.
    pub fn clear(&mut self, index: u32) -> bool {
        match self.0.get_mut(index as usize) {
            Some(flag) => std::mem::replace(flag, false),
            None => false,
        }
    }

    /// The lowest `limit` missing indices, ascending.
    pub fn first_missing(&self, limit: usize) -> Vec<u32> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, missing)| **missing)
            .map(|(index, _)| index as u32)
            .take(limit)
            .collect()
    }
}

impl From<Vec<bool>> for MissingBitmap {
    fn from(flags: Vec<bool>) -> Self {
        MissingBitmap(flags)
    }
}

impl fmt::Display for MissingBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for missing in &self.0 {
            write!(f, "{}", if *missing { '1' } else { '0' })?;
        }
        Ok(())
    }
}

impl FromStr for MissingBitmap {
    type Err = TransferError;

    fn from_str(text: &str) -> TransferResult<Self> {
        text.trim()
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(TransferError::corrupt(format!(
                    "bad bitmap character {:?}",
                    other
                ))),
            })
            .collect::<TransferResult<Vec<bool>>>()
            .map(MissingBitmap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    New,
    Duplicate,
    OutOfRange,
}

/// Where an assembled file landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    pub size: usize,
    pub sha256: String,
}

impl Artifact {
    fn of(key: String, contents: &[u8]) -> Self {
        Artifact {
            key,
            size: contents.len(),
            sha256: hex::encode(Sha256::digest(contents)),
        }
    }

    /// The assembled file, if one is already in the store.
    pub async fn load(
        store: &dyn Store,
        file_id: u32,
        filename: &str,
    ) -> TransferResult<Option<Artifact>> {
        let key = artifact_key(file_id, filename);
        Ok(store
            .read(&key)
            .await?
            .map(|contents| Artifact::of(key, &contents)))
    }
}

/// Receive-side bookkeeping for one file.
///
/// Lives under `files/<id>/`: `status` holds the chunk count and the
/// missing bitmap, `chunk_<i>` the raw chunks, `<filename>` the assembled
/// result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    file_id: u32,
    total_chunks: u32,
    missing: MissingBitmap,
}

pub fn job_dir(file_id: u32) -> String {
    format!("files/{}", file_id)
}

/// Store key of the assembled file.
pub fn artifact_key(file_id: u32, filename: &str) -> String {
    format!("{}/{}", job_dir(file_id), filename)
}

fn status_key(file_id: u32) -> String {
    format!("{}/status", job_dir(file_id))
}

fn chunk_key(file_id: u32, index: u32) -> String {
    format!("{}/chunk_{}", job_dir(file_id), index)
}

impl TransferJob {
    pub fn new(file_id: u32, total_chunks: u32) -> Self {
        TransferJob {
            file_id,
            total_chunks,
            missing: MissingBitmap::all_missing(total_chunks),
        }
    }

    pub fn with_missing(file_id: u32, missing: MissingBitmap) -> Self {
        TransferJob {
            file_id,
            total_chunks: missing.len() as u32,
            missing,
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn missing(&self) -> &MissingBitmap {
        &self.missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_complete()
    }

    pub fn first_missing(&self, limit: usize) -> Vec<u32> {
        self.missing.first_missing(limit)
    }

    /// `None` when no earlier attempt left a record for `file_id`.
    pub async fn load(store: &dyn Store, file_id: u32) -> TransferResult<Option<Self>> {
        let data = match store.read(&status_key(file_id)).await? {
            Some(data) => data,
            None => return Ok(None),
        };
        let text = String::from_utf8(data)
            .map_err(|_| TransferError::corrupt(format!("file {} status is not utf-8", file_id)))?;
        let mut lines = text.lines();
        let total_chunks: u32 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| {
                TransferError::corrupt(format!("file {} status has no chunk count", file_id))
            })?;
        if total_chunks > MAX_CHUNK_COUNT {
            return Err(TransferError::corrupt(format!(
                "file {} status claims {} chunks",
                file_id, total_chunks
            )));
        }
        let missing: MissingBitmap = lines.next().unwrap_or_default().parse()?;
        if missing.len() != total_chunks as usize {
            return Err(TransferError::corrupt(format!(
                "file {} bitmap has {} flags for {} chunks",
                file_id,
                missing.len(),
                total_chunks
            )));
        }
        Ok(Some(TransferJob {
            file_id,
            total_chunks,
            missing,
        }))
    }

    pub async fn save(&self, store: &dyn Store) -> TransferResult<()> {
        let status = format!("{}\n{}", self.total_chunks, self.missing);
        store.write(&status_key(self.file_id), status.as_bytes()).await
    }

    /// Stores one chunk and clears its flag. The bitmap is not persisted
    /// here; callers save after each batch.
    pub async fn record_chunk(
        &mut self,
        store: &dyn Store,
        index: u32,
        chunk: &[u8],
    ) -> TransferResult<ChunkOutcome> {
        if index >= self.total_chunks {
            warn!(
                "file {}: discarding chunk {} (only {} chunks)",
                self.file_id, index, self.total_chunks
            );
            return Ok(ChunkOutcome::OutOfRange);
        }
        store.write(&chunk_key(self.file_id, index), chunk).await?;
        if self.missing.clear(index) {
            Ok(ChunkOutcome::New)
        } else {
            debug!("file {}: duplicate chunk {}", self.file_id, index);
            Ok(ChunkOutcome::Duplicate)
        }
    }

    /// Concatenates the chunks in index order into `files/<id>/<filename>`.
    pub async fn assemble(&self, store: &dyn Store, filename: &str) -> TransferResult<Artifact> {
        if !self.is_complete() {
            return Err(TransferError::invalid_argument(format!(
                "file {} still missing {} chunks",
                self.file_id,
                self.missing.missing_count()
            )));
        }
        if filename.contains('/') || filename == "status" || filename.starts_with("chunk_") {
            return Err(TransferError::invalid_argument(format!(
                "bad filename {:?}",
                filename
            )));
        }

        let mut contents = Vec::new();
        for index in 0..self.total_chunks {
            let chunk = store
                .read(&chunk_key(self.file_id, index))
                .await?
                .ok_or_else(|| {
                    TransferError::corrupt(format!(
                        "file {} chunk {} marked received but not stored",
                        self.file_id, index
                    ))
                })?;
            contents.extend_from_slice(&chunk);
        }

        let key = artifact_key(self.file_id, filename);
        store.write(&key, &contents).await?;
        let artifact = Artifact::of(key, &contents);
        info!(
            "file {} assembled as {}, sz: {}, sha256: {}",
            self.file_id, artifact.key, artifact.size, artifact.sha256
        );
        Ok(artifact)
    }

    /// Drops the status record and raw chunks, keeping any artifact.
    pub async fn discard(&self, store: &dyn Store) -> TransferResult<()> {
        for index in 0..self.total_chunks {
            store.remove(&chunk_key(self.file_id, index)).await?;
        }
        store.remove(&status_key(self.file_id)).await?;
        debug!("file {}: chunk storage discarded", self.file_id);
        Ok(())
    }
}
