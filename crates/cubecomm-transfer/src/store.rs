// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

//! Durable key to bytes storage.
//!
//! Keys are `/` separated relative paths such as `files/7/chunk_3`. A key
//! names either a value or, through [`Store::list`], a directory of values.

use async_trait::async_trait;
use log::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{TransferError, TransferResult};

#[async_trait]
pub trait Store: Send + Sync {
    /// `None` when the key does not exist.
    async fn read(&self, key: &str) -> TransferResult<Option<Vec<u8>>>;

    /// Up to `len` bytes starting at `offset`; short at end of value.
    async fn read_range(&self, key: &str, offset: u64, len: usize) -> TransferResult<Vec<u8>>;

    async fn size(&self, key: &str) -> TransferResult<Option<u64>>;

    /// Creates or replaces the value, creating parent directories.
    async fn write(&self, key: &str, data: &[u8]) -> TransferResult<()>;

    /// Sorted names directly under `dir`; empty if `dir` does not exist.
    async fn list(&self, dir: &str) -> TransferResult<Vec<String>>;

    /// Removes a value or a whole directory, returns whether anything
    /// was there.
    async fn remove(&self, key: &str) -> TransferResult<bool>;

    async fn exists(&self, key: &str) -> TransferResult<bool> {
        Ok(self.size(key).await?.is_some() || !self.list(key).await?.is_empty())
    }
}

fn check_key(key: &str) -> TransferResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(TransferError::invalid_argument(format!(
            "bad store key: {:?}",
            key
        )));
    }
    Ok(())
}

fn not_found<T>(result: std::io::Result<T>) -> TransferResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Store rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FsStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> TransferResult<PathBuf> {
        check_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl Store for FsStore {
    async fn read(&self, key: &str) -> TransferResult<Option<Vec<u8>>> {
        not_found(fs::read(self.path(key)?).await)
    }

    async fn read_range(&self, key: &str, offset: u64, len: usize) -> TransferResult<Vec<u8>> {
        let mut file = fs::File::open(self.path(key)?).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn size(&self, key: &str) -> TransferResult<Option<u64>> {
        let meta = not_found(fs::metadata(self.path(key)?).await)?;
        Ok(meta.filter(|meta| meta.is_file()).map(|meta| meta.len()))
    }

    async fn write(&self, key: &str, data: &[u8]) -> TransferResult<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // replace via rename so a power cut leaves the old or new value
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn list(&self, dir: &str) -> TransferResult<Vec<String>> {
        let mut entries = match not_found(fs::read_dir(self.path(dir)?).await)? {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            match entry.file_name().into_string() {
                Ok(name) if !name.ends_with(".tmp") => names.push(name),
                Ok(_) => {}
                Err(name) => warn!("skipping non utf-8 entry {:?} in {}", name, dir),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn remove(&self, key: &str) -> TransferResult<bool> {
        let path = self.path(key)?;
        match not_found(fs::metadata(&path).await)? {
            None => Ok(false),
            Some(meta) if meta.is_dir() => {
                fs::remove_dir_all(&path).await?;
                Ok(true)
            }
            Some(_) => {
                fs::remove_file(&path).await?;
                Ok(true)
            }
        }
    }
}

/// In-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    values: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> R,
    ) -> TransferResult<R> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| TransferError::internal_error("mem store lock poisoned"))?;
        Ok(f(&mut values))
    }

    /// All keys, for inspection.
    pub fn keys(&self) -> TransferResult<Vec<String>> {
        self.with_values(|values| values.keys().cloned().collect())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn read(&self, key: &str) -> TransferResult<Option<Vec<u8>>> {
        check_key(key)?;
        self.with_values(|values| values.get(key).cloned())
    }

    async fn read_range(&self, key: &str, offset: u64, len: usize) -> TransferResult<Vec<u8>> {
        let data = self.read(key).await?.ok_or_else(|| {
            TransferError::Io(std::io::Error::new(ErrorKind::NotFound, key.to_string()))
        })?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn size(&self, key: &str) -> TransferResult<Option<u64>> {
        check_key(key)?;
        self.with_values(|values| values.get(key).map(|data| data.len() as u64))
    }

    async fn write(&self, key: &str, data: &[u8]) -> TransferResult<()> {
        check_key(key)?;
        self.with_values(|values| {
            values.insert(key.to_string(), data.to_vec());
        })
    }

    async fn list(&self, dir: &str) -> TransferResult<Vec<String>> {
        check_key(dir)?;
        let prefix = format!("{}/", dir);
        self.with_values(|values| {
            values
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .filter_map(|(key, _)| key[prefix.len()..].split('/').next())
                .map(str::to_string)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        })
    }

    async fn remove(&self, key: &str) -> TransferResult<bool> {
        check_key(key)?;
        let prefix = format!("{}/", key);
        self.with_values(|values| {
            let before = values.len();
            values.retain(|k, _| k != key && !k.starts_with(&prefix));
            values.len() != before
        })
    }
}
