// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubecomm, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use log::*;
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, Instant};

use cubecomm_link::{
    Category, ChunkRequest, Frame, FrameCodec, Message, Transceiver, Transport,
    DEFAULT_PACKET_SIZE, HEADER_SIZE, MAX_CHUNK_COUNT,
};

use crate::{Artifact, Store, TransferError, TransferJob, TransferResult};

/// MessagePack bin8 length prefix.
pub const BIN_OVERHEAD: usize = 2;

pub const DEFAULT_CHUNK_SIZE: usize = DEFAULT_PACKET_SIZE - HEADER_SIZE - BIN_OVERHEAD;
pub const DEFAULT_REQUEST_SIZE: usize = 10;
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Larger partial requests overflow the ground side request frame.
pub const REQUEST_SIZE_WARN: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpConfig {
    pub chunk_size: usize,
    pub packet_delay: Duration,
    pub request_size: usize,
    pub stall_timeout: Duration,
    pub retry_limit: Option<u32>, // None retries forever
    pub defer_assembly: bool,
    pub discard_chunks: bool,
    pub send_delete: bool,
}

impl Default for FtpConfig {
    fn default() -> Self {
        FtpConfigBuilder::new().build()
    }
}

impl FtpConfig {
    pub fn validate(&self, codec: &FrameCodec) -> TransferResult<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::invalid_argument("chunk size must be positive"));
        }
        if self.chunk_size + BIN_OVERHEAD > codec.payload_limit() {
            return Err(TransferError::invalid_argument(format!(
                "chunk size {} does not fit a {} byte packet (payload limit {})",
                self.chunk_size,
                codec.packet_size(),
                codec.payload_limit()
            )));
        }
        if self.request_size == 0 {
            return Err(TransferError::invalid_argument("request size must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FtpConfigBuilder {
    chunk_size: Option<usize>,
    packet_delay: Option<Duration>,
    request_size: Option<usize>,
    stall_timeout: Option<Duration>,
    retry_limit: Option<u32>,
    defer_assembly: Option<bool>,
    discard_chunks: Option<bool>,
    send_delete: Option<bool>,
}

impl FtpConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn packet_delay(mut self, packet_delay: Duration) -> Self {
        self.packet_delay = Some(packet_delay);
        self
    }

    pub fn request_size(mut self, request_size: usize) -> Self {
        self.request_size = Some(request_size);
        self
    }

    pub fn stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = Some(stall_timeout);
        self
    }

    pub fn retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    pub fn defer_assembly(mut self, defer_assembly: bool) -> Self {
        self.defer_assembly = Some(defer_assembly);
        self
    }

    pub fn discard_chunks(mut self, discard_chunks: bool) -> Self {
        self.discard_chunks = Some(discard_chunks);
        self
    }

    pub fn send_delete(mut self, send_delete: bool) -> Self {
        self.send_delete = Some(send_delete);
        self
    }

    pub fn build(self) -> FtpConfig {
        let request_size = self.request_size.unwrap_or(DEFAULT_REQUEST_SIZE);
        if request_size > REQUEST_SIZE_WARN {
            warn!(
                "request size {} exceeds {}, requests may not fit a packet",
                request_size, REQUEST_SIZE_WARN
            );
        }
        FtpConfig {
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            packet_delay: self.packet_delay.unwrap_or(Duration::ZERO),
            request_size,
            stall_timeout: self.stall_timeout.unwrap_or(DEFAULT_STALL_TIMEOUT),
            retry_limit: self.retry_limit,
            defer_assembly: self.defer_assembly.unwrap_or(false),
            discard_chunks: self.discard_chunks.unwrap_or(true),
            send_delete: self.send_delete.unwrap_or(true),
        }
    }
}

/// A file that is durably received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub file_id: u32,
    pub total_chunks: u32,
    /// `None` when assembly was deferred.
    pub artifact: Option<Artifact>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub full_sends: usize,
    pub partial_sends: usize,
    pub deleted: Vec<u32>,
}

/// Chunked, resumable file transfer. Both roles share one configuration;
/// the sending side reads files from the store by key, the receiving side
/// keeps its jobs under `files/<id>/`.
pub struct FileTransfer {
    config: FtpConfig,
    store: Arc<dyn Store>,
}

impl FileTransfer {
    pub fn new(
        config: FtpConfig,
        store: Arc<dyn Store>,
        codec: &FrameCodec,
    ) -> TransferResult<Self> {
        config.validate(codec)?;
        Ok(FileTransfer { config, store })
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn chunk_count(&self, file_id: u32, size: u64) -> TransferResult<u32> {
        let chunk_count = size.div_ceil(self.config.chunk_size as u64);
        u32::try_from(chunk_count)
            .ok()
            .filter(|count| *count <= MAX_CHUNK_COUNT)
            .ok_or(TransferError::TooManyChunks {
                file_id,
                chunk_count,
                max: MAX_CHUNK_COUNT,
            })
    }

    async fn file_size(&self, key: &str) -> TransferResult<u64> {
        self.store
            .size(key)
            .await?
            .ok_or_else(|| TransferError::invalid_argument(format!("no file at {}", key)))
    }

    async fn pace(&self) {
        if !self.config.packet_delay.is_zero() {
            sleep(self.config.packet_delay).await;
        }
    }

    async fn send_chunk<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        key: &str,
        file_id: u32,
        index: u32,
    ) -> TransferResult<()> {
        let offset = index as u64 * self.config.chunk_size as u64;
        let chunk = self
            .store
            .read_range(key, offset, self.config.chunk_size)
            .await?;
        if let Err(err) = transport
            .send_frame(&Frame::file_data(index, file_id, chunk))
            .await
        {
            // recovered later through a partial request
            warn!("file {}: chunk {} not sent: {}", file_id, index, err);
        }
        Ok(())
    }

    /// Sends the length announcement and then every chunk in order.
    /// Returns the chunk count.
    pub async fn send_file<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        key: &str,
        file_id: u32,
    ) -> TransferResult<u32> {
        let size = self.file_size(key).await?;
        let chunk_count = self.chunk_count(file_id, size)?;
        info!(
            "sending file {} ({}), sz: {}, {} chunks",
            file_id, key, size, chunk_count
        );
        transport
            .send_frame(&Frame::file_length(file_id, chunk_count))
            .await?;
        for index in 0..chunk_count {
            self.pace().await;
            self.send_chunk(transport, key, file_id, index).await?;
        }
        Ok(chunk_count)
    }

    /// Sends only the requested chunks, no length announcement. Returns
    /// how many were sent.
    pub async fn send_partial_file<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        key: &str,
        file_id: u32,
        indices: &[u32],
    ) -> TransferResult<usize> {
        let chunk_count = self.chunk_count(file_id, self.file_size(key).await?)?;
        debug!("sending file {} chunks {:?}", file_id, indices);
        let mut sent = 0;
        for &index in indices {
            if index >= chunk_count {
                warn!(
                    "file {}: chunk {} requested but file has {} chunks",
                    file_id, index, chunk_count
                );
                continue;
            }
            self.pace().await;
            self.send_chunk(transport, key, file_id, index).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Fetches `file_id`, resuming from a persisted job when one exists.
    ///
    /// On failure whatever was received stays on disk for the next
    /// attempt.
    pub async fn request_file<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        file_id: u32,
        filename: &str,
    ) -> TransferResult<Completion> {
        let store = self.store.as_ref();
        let (mut job, mut waiting_on) = match TransferJob::load(store, file_id).await? {
            Some(job) if job.is_complete() => {
                info!("file {} already fully received", file_id);
                return self.finish(transport, job, filename).await;
            }
            Some(job) => {
                info!(
                    "resuming file {}, missing {}",
                    file_id,
                    job.missing().missing_count()
                );
                let waiting_on = self.request_partial(transport, &job).await?;
                (job, waiting_on)
            }
            None => {
                if let Some(artifact) = Artifact::load(store, file_id, filename).await? {
                    // assembled, but the contact ended before it was recorded
                    info!("file {} already assembled as {}", file_id, artifact.key);
                    self.release(transport, file_id).await;
                    return Ok(Completion {
                        file_id,
                        total_chunks: self.chunk_count(file_id, artifact.size as u64)?,
                        artifact: Some(artifact),
                    });
                }
                info!("requesting all of file {}", file_id);
                transport
                    .send_frame(&Frame::file_request(file_id, &ChunkRequest::All))
                    .await?;
                let job = self.await_length(transport, file_id).await?;
                if job.is_complete() {
                    // empty file
                    job.save(store).await?;
                    return self.finish(transport, job, filename).await;
                }
                let waiting_on = job.total_chunks() as usize;
                (job, waiting_on)
            }
        };

        let mut retries = 0;
        loop {
            let received = self.receive_chunks(transport, &mut job, waiting_on).await?;
            if received == 0 {
                warn!("file {}: no response to request", file_id);
                return Err(TransferError::NoResponse);
            }
            job.save(store).await?;

            if job.is_complete() {
                return self.finish(transport, job, filename).await;
            }

            if let Some(limit) = self.config.retry_limit {
                if retries >= limit {
                    warn!(
                        "file {}: retry limit {} reached, missing {}",
                        file_id,
                        limit,
                        job.missing()
                    );
                    return Err(TransferError::RetriesExhausted(limit));
                }
            }
            retries += 1;
            debug!(
                "file {}: missing {}, partial request attempt {}",
                file_id,
                job.missing(),
                retries
            );
            waiting_on = self.request_partial(transport, &job).await?;
        }
    }

    async fn await_length<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        file_id: u32,
    ) -> TransferResult<TransferJob> {
        match transport.receive_message(None).await {
            Message::FileLength {
                file_id: got,
                chunk_count,
            } => {
                if got != file_id {
                    return Err(TransferError::UnexpectedFile {
                        expected: file_id,
                        got,
                    });
                }
                if chunk_count > MAX_CHUNK_COUNT {
                    warn!("file {}: length of {} chunks refused", file_id, chunk_count);
                    return Err(TransferError::TooManyChunks {
                        file_id,
                        chunk_count: chunk_count.into(),
                        max: MAX_CHUNK_COUNT,
                    });
                }
                info!("file {} has {} chunks", file_id, chunk_count);
                Ok(TransferJob::new(file_id, chunk_count))
            }
            Message::None => Err(TransferError::NoResponse),
            other => {
                warn!("file {}: expected length, got {}", file_id, other);
                Err(TransferError::protocol(Category::FileLength, other.category()))
            }
        }
    }

    /// Requests the lowest missing chunks, at most `request_size` of them.
    /// Returns how many were requested.
    pub async fn request_partial<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        job: &TransferJob,
    ) -> TransferResult<usize> {
        let indices = job.first_missing(self.config.request_size);
        debug!("file {}: requesting chunks {:?}", job.file_id(), indices);
        let requested = indices.len();
        transport
            .send_frame(&Frame::file_request(
                job.file_id(),
                &ChunkRequest::Indices(indices),
            ))
            .await?;
        Ok(requested)
    }

    /// Takes up to `expected` frames, storing every chunk of `job`'s file.
    /// Stops early once `stall_timeout` passes without a chunk. Returns
    /// the number of chunk frames seen.
    pub async fn receive_chunks<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        job: &mut TransferJob,
        expected: usize,
    ) -> TransferResult<usize> {
        let mut seen = 0;
        let mut last_progress = Instant::now();
        for _ in 0..expected {
            match transport.receive_message(None).await {
                Message::FileData {
                    file_id,
                    index,
                    chunk,
                } if file_id == job.file_id() => {
                    job.record_chunk(self.store.as_ref(), index, &chunk).await?;
                    seen += 1;
                    last_progress = Instant::now();
                    trace!(
                        "file {}: chunk {} ({}/{})",
                        file_id,
                        index,
                        seen,
                        expected
                    );
                }
                other => {
                    if other != Message::None {
                        warn!("file {}: expected data, got {}", job.file_id(), other);
                    }
                    if last_progress.elapsed() >= self.config.stall_timeout {
                        debug!(
                            "file {}: nothing for {:?}, ending batch",
                            job.file_id(),
                            self.config.stall_timeout
                        );
                        break;
                    }
                }
            }
        }
        Ok(seen)
    }

    async fn finish<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        job: TransferJob,
        filename: &str,
    ) -> TransferResult<Completion> {
        info!("file {} completely received", job.file_id());
        let artifact = if self.config.defer_assembly {
            None
        } else {
            Some(self.assemble_job(&job, filename).await?)
        };
        self.release(transport, job.file_id()).await;
        Ok(Completion {
            file_id: job.file_id(),
            total_chunks: job.total_chunks(),
            artifact,
        })
    }

    async fn release<T: Transceiver>(&self, transport: &mut Transport<T>, file_id: u32) {
        if self.config.send_delete {
            if let Err(err) = self.send_delete(transport, file_id).await {
                warn!("file {}: delete not sent: {}", file_id, err);
            }
        }
    }

    async fn assemble_job(&self, job: &TransferJob, filename: &str) -> TransferResult<Artifact> {
        let artifact = job.assemble(self.store.as_ref(), filename).await?;
        if self.config.discard_chunks {
            job.discard(self.store.as_ref()).await?;
        }
        Ok(artifact)
    }

    /// Assembles a file received with deferred assembly.
    pub async fn assemble_file(&self, file_id: u32, filename: &str) -> TransferResult<Artifact> {
        let job = TransferJob::load(self.store.as_ref(), file_id)
            .await?
            .ok_or_else(|| {
                TransferError::invalid_argument(format!("no received chunks for file {}", file_id))
            })?;
        self.assemble_job(&job, filename).await
    }

    /// Tells the sender it may drop its copy of `file_id`.
    pub async fn send_delete<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        file_id: u32,
    ) -> TransferResult<()> {
        transport.send_frame(&Frame::file_delete(file_id)).await?;
        debug!("file {}: delete sent", file_id);
        Ok(())
    }

    /// Sending side loop: answers file requests and deletes until anything
    /// else arrives, or nothing does. `key_for` maps a file id to its store
    /// key.
    pub async fn serve_requests<T: Transceiver>(
        &self,
        transport: &mut Transport<T>,
        key_for: fn(u32) -> String,
    ) -> TransferResult<ServeSummary> {
        let mut summary = ServeSummary::default();
        loop {
            match transport.receive_message(None).await {
                Message::FileRequest { file_id, request } => {
                    let key = key_for(file_id);
                    if self.store.size(&key).await?.is_none() {
                        warn!("request for file {} but {} does not exist", file_id, key);
                        continue;
                    }
                    match request {
                        ChunkRequest::All => {
                            self.send_file(transport, &key, file_id).await?;
                            summary.full_sends += 1;
                        }
                        ChunkRequest::Indices(indices) => {
                            self.send_partial_file(transport, &key, file_id, &indices)
                                .await?;
                            summary.partial_sends += 1;
                        }
                    }
                }
                Message::FileDelete { file_id } => {
                    let key = key_for(file_id);
                    if self.store.remove(&key).await? {
                        info!("removed file {} ({})", file_id, key);
                    } else {
                        info!("no file {} to remove", file_id);
                    }
                    summary.deleted.push(file_id);
                }
                Message::None => {
                    debug!("no more requests");
                    return Ok(summary);
                }
                other => {
                    info!("stopped serving on {}", other);
                    return Ok(summary);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemStore, MissingBitmap};
    use cubecomm_link::{loopback_pair, LinkConfig, LinkConfigBuilder, LoopbackTransceiver, Loss};
    use once_cell::sync::Lazy;

    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
    });

    type Link = Transport<LoopbackTransceiver>;

    const PATIENT: Duration = Duration::from_secs(60);

    fn outbox_key(file_id: u32) -> String {
        format!("outbox/{}", file_id)
    }

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|n| (n * 7 % 251) as u8).collect()
    }

    struct Ends {
        ground: Link,
        ground_ftp: FileTransfer,
        ground_store: MemStore,
        sat: Link,
        sat_ftp: FileTransfer,
        sat_store: MemStore,
    }

    // room for 250 byte chunks
    fn wide_link() -> LinkConfig {
        LinkConfigBuilder::new().packet_size(258).build()
    }

    fn ends(config: FtpConfig, sat_loss: Loss) -> Ends {
        Lazy::force(&INIT);
        let (ground, sat) = loopback_pair();
        let ground = Transport::new(ground.with_name("ground"), wide_link()).unwrap();
        let sat = Transport::new(sat.with_name("sat").with_loss(sat_loss), wide_link()).unwrap();
        let ground_store = MemStore::new();
        let sat_store = MemStore::new();
        let ground_ftp =
            FileTransfer::new(config.clone(), Arc::new(ground_store.clone()), ground.codec())
                .unwrap();
        let sat_ftp = FileTransfer::new(config, Arc::new(sat_store.clone()), sat.codec()).unwrap();
        Ends {
            ground,
            ground_ftp,
            ground_store,
            sat,
            sat_ftp,
            sat_store,
        }
    }

    fn chunk250() -> FtpConfig {
        FtpConfigBuilder::new().chunk_size(250).build()
    }

    #[test]
    fn test_config_validation() {
        let codec = FrameCodec::default();
        assert!(FtpConfig::default().validate(&codec).is_ok());
        assert_eq!(FtpConfig::default().chunk_size, 243);
        assert!(FtpConfigBuilder::new()
            .chunk_size(244)
            .build()
            .validate(&codec)
            .is_err());
        assert!(FtpConfigBuilder::new()
            .chunk_size(0)
            .build()
            .validate(&codec)
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_transfer() {
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            sat_ftp,
            sat_store,
        } = ends(chunk250(), Loss::None);
        let contents = pattern(1000);
        sat_store.write(&outbox_key(1), &contents).await.unwrap();

        let (completion, summary) = tokio::join!(
            ground_ftp.request_file(&mut ground, 1, "image.jpeg"),
            sat_ftp.serve_requests(&mut sat, outbox_key),
        );
        let completion = completion.unwrap();
        let summary = summary.unwrap();

        assert_eq!(completion.total_chunks, 4);
        let artifact = completion.artifact.unwrap();
        assert_eq!(artifact.size, 1000);
        assert_eq!(
            ground_store.read("files/1/image.jpeg").await.unwrap(),
            Some(contents)
        );
        // chunks and status discarded after assembly
        assert_eq!(
            ground_store.list("files/1").await.unwrap(),
            vec!["image.jpeg"]
        );
        assert_eq!(summary.full_sends, 1);
        assert_eq!(summary.deleted, vec![1]);
        assert!(!sat_store.exists(&outbox_key(1)).await.unwrap());
        // length announcement plus four chunks
        assert_eq!(sat.transceiver().frames_sent(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_chunk_requested_again() {
        // transmission 3 is chunk 2
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            sat_ftp,
            sat_store,
        } = ends(chunk250(), Loss::drop_frames([3]));
        let contents = pattern(1000);
        sat_store.write(&outbox_key(1), &contents).await.unwrap();

        let satellite = async {
            let key = outbox_key(1);
            assert_eq!(
                sat.receive_message(None).await,
                Message::FileRequest {
                    file_id: 1,
                    request: ChunkRequest::All
                }
            );
            sat_ftp.send_file(&mut sat, &key, 1).await.unwrap();
            // ground only asks again once its batch stalls
            assert_eq!(
                sat.receive_message(Some(PATIENT)).await,
                Message::FileRequest {
                    file_id: 1,
                    request: ChunkRequest::Indices(vec![2])
                }
            );
            sat_ftp
                .send_partial_file(&mut sat, &key, 1, &[2])
                .await
                .unwrap();
            sat.receive_message(Some(PATIENT)).await
        };

        let (completion, last) = tokio::join!(
            ground_ftp.request_file(&mut ground, 1, "image.jpeg"),
            satellite
        );
        assert!(completion.unwrap().artifact.is_some());
        assert_eq!(last, Message::FileDelete { file_id: 1 });
        assert_eq!(
            ground_store.read("files/1/image.jpeg").await.unwrap(),
            Some(contents)
        );
    }

    async fn seed_job(store: &MemStore, file_id: u32, contents: &[u8], chunk: usize, bitmap: &str) {
        let missing: MissingBitmap = bitmap.parse().unwrap();
        for (index, piece) in contents.chunks(chunk).enumerate() {
            if !missing.is_missing(index as u32) {
                store
                    .write(&format!("files/{}/chunk_{}", file_id, index), piece)
                    .await
                    .unwrap();
            }
        }
        TransferJob::with_missing(file_id, missing)
            .save(store)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_requests_only_missing() {
        let config = FtpConfigBuilder::new().chunk_size(100).build();
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            sat_ftp,
            sat_store,
        } = ends(config, Loss::None);
        let contents = pattern(950);
        sat_store.write(&outbox_key(3), &contents).await.unwrap();
        seed_job(&ground_store, 3, &contents, 100, "0010001000").await;

        let satellite = async {
            let request = sat.receive_message(None).await;
            assert_eq!(
                request,
                Message::FileRequest {
                    file_id: 3,
                    request: ChunkRequest::Indices(vec![2, 6])
                }
            );
            sat_ftp
                .send_partial_file(&mut sat, &outbox_key(3), 3, &[2, 6])
                .await
                .unwrap()
        };

        let (completion, sent) = tokio::join!(
            ground_ftp.request_file(&mut ground, 3, "image.jpeg"),
            satellite
        );
        assert_eq!(sent, 2);
        let completion = completion.unwrap();
        assert_eq!(completion.total_chunks, 10);
        assert_eq!(
            ground_store.read("files/3/image.jpeg").await.unwrap(),
            Some(contents)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_skips_request_all() {
        let config = FtpConfigBuilder::new()
            .chunk_size(10)
            .defer_assembly(true)
            .send_delete(false)
            .build();
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            sat_ftp,
            sat_store,
        } = ends(config, Loss::None);
        let contents = pattern(25);
        sat_store.write(&outbox_key(7), &contents).await.unwrap();
        seed_job(&ground_store, 7, &contents, 10, "010").await;

        let satellite = async {
            match sat.receive_message(None).await {
                Message::FileRequest { file_id, request } => {
                    assert_eq!(file_id, 7);
                    assert_eq!(request, ChunkRequest::Indices(vec![1]));
                    sat_ftp
                        .send_partial_file(&mut sat, &outbox_key(7), 7, &[1])
                        .await
                        .unwrap();
                }
                other => panic!("unexpected {}", other),
            }
        };

        let (completion, ()) = tokio::join!(
            ground_ftp.request_file(&mut ground, 7, "image.jpeg"),
            satellite
        );
        let completion = completion.unwrap();
        assert_eq!(completion.artifact, None);
        assert_eq!(
            ground_store.read("files/7/status").await.unwrap(),
            Some(b"3\n000".to_vec())
        );

        let artifact = ground_ftp.assemble_file(7, "image.jpeg").await.unwrap();
        assert_eq!(artifact.size, 25);
        assert_eq!(
            ground_store.read("files/7/image.jpeg").await.unwrap(),
            Some(contents)
        );
        assert!(ground_store.read("files/7/status").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_file_completes_immediately() {
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            sat_ftp,
            sat_store,
        } = ends(FtpConfig::default(), Loss::None);
        sat_store.write(&outbox_key(2), b"").await.unwrap();

        let (completion, summary) = tokio::join!(
            ground_ftp.request_file(&mut ground, 2, "empty.bin"),
            sat_ftp.serve_requests(&mut sat, outbox_key),
        );
        let completion = completion.unwrap();
        assert_eq!(completion.total_chunks, 0);
        assert_eq!(completion.artifact.unwrap().size, 0);
        assert_eq!(
            ground_store.read("files/2/empty.bin").await.unwrap(),
            Some(Vec::new())
        );
        assert_eq!(summary.unwrap().deleted, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_keeps_progress() {
        let config = FtpConfigBuilder::new().chunk_size(10).retry_limit(1).build();
        // transmission 2 is chunk 1
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            sat_ftp,
            sat_store,
        } = ends(config, Loss::drop_frames([2]));
        let contents = pattern(30);
        sat_store.write(&outbox_key(4), &contents).await.unwrap();

        let satellite = async {
            let key = outbox_key(4);
            sat.receive_message(None).await;
            sat_ftp.send_file(&mut sat, &key, 4).await.unwrap();
            // answer the retry with the wrong chunk
            sat.receive_message(Some(PATIENT)).await;
            sat_ftp
                .send_partial_file(&mut sat, &key, 4, &[0])
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(
            ground_ftp.request_file(&mut ground, 4, "image.jpeg"),
            satellite
        );
        assert!(matches!(result, Err(TransferError::RetriesExhausted(1))));
        assert_eq!(
            ground_store.read("files/4/status").await.unwrap(),
            Some(b"3\n010".to_vec())
        );
        assert!(ground_store.read("files/4/image.jpeg").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer() {
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            sat: _sat,
            ..
        } = ends(FtpConfig::default(), Loss::None);
        assert!(matches!(
            ground_ftp.request_file(&mut ground, 9, "image.jpeg").await,
            Err(TransferError::NoResponse)
        ));
        assert!(ground_store.keys().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_file_length() {
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            ..
        } = ends(FtpConfig::default(), Loss::None);
        sat.send_frame(&Frame::file_length(8, 3)).await.unwrap();
        assert!(matches!(
            ground_ftp.request_file(&mut ground, 5, "image.jpeg").await,
            Err(TransferError::UnexpectedFile {
                expected: 5,
                got: 8
            })
        ));
        sat.send_frame(&Frame::handshake3(1)).await.unwrap();
        assert!(matches!(
            ground_ftp.request_file(&mut ground, 5, "image.jpeg").await,
            Err(TransferError::Protocol {
                expected: Category::FileLength,
                got: Category::Handshake3
            })
        ));
        assert!(ground_store.keys().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaddressable_length_refused() {
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            ..
        } = ends(FtpConfig::default(), Loss::None);
        sat.send_frame(&Frame::file_length(5, MAX_CHUNK_COUNT + 10))
            .await
            .unwrap();
        sat.send_frame(&Frame::file_data(0, 5, vec![1; 10]))
            .await
            .unwrap();
        assert!(matches!(
            ground_ftp.request_file(&mut ground, 5, "image.jpeg").await,
            Err(TransferError::TooManyChunks { file_id: 5, .. })
        ));
        assert!(ground_store.keys().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaddressable_file_not_sent() {
        let Ends {
            ground: _ground,
            mut sat,
            sat_ftp,
            sat_store,
            ..
        } = ends(FtpConfigBuilder::new().chunk_size(1).build(), Loss::None);
        let size = MAX_CHUNK_COUNT as usize + 1;
        sat_store.write(&outbox_key(2), &vec![0; size]).await.unwrap();
        assert!(matches!(
            sat_ftp.send_file(&mut sat, &outbox_key(2), 2).await,
            Err(TransferError::TooManyChunks {
                file_id: 2,
                chunk_count,
                ..
            }) if chunk_count == size as u64
        ));
        assert!(sat_ftp
            .send_partial_file(&mut sat, &outbox_key(2), 2, &[0])
            .await
            .is_err());
        assert_eq!(sat.transceiver().frames_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembled_file_not_requested_again() {
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            ..
        } = ends(chunk250(), Loss::None);
        // assembled and cleaned up, but never marked received
        ground_store
            .write("files/3/image.jpeg", &pattern(600))
            .await
            .unwrap();

        let (completion, message) = tokio::join!(
            ground_ftp.request_file(&mut ground, 3, "image.jpeg"),
            sat.receive_message(None),
        );
        let completion = completion.unwrap();
        assert_eq!(completion.total_chunks, 3);
        assert_eq!(completion.artifact.unwrap().size, 600);
        // no request, only the delete
        assert_eq!(message, Message::FileDelete { file_id: 3 });
        assert_eq!(ground.transceiver().frames_sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_chunk_discarded() {
        let config = FtpConfigBuilder::new().chunk_size(10).build();
        let Ends {
            mut ground,
            ground_ftp,
            ground_store,
            mut sat,
            ..
        } = ends(config, Loss::None);

        let satellite = async {
            sat.receive_message(None).await;
            sat.send_frame(&Frame::file_length(6, 2)).await.unwrap();
            sat.send_frame(&Frame::file_data(5, 6, vec![0xee; 10]))
                .await
                .unwrap();
            sat.send_frame(&Frame::file_data(0, 6, vec![1; 10]))
                .await
                .unwrap();
            assert_eq!(
                sat.receive_message(None).await,
                Message::FileRequest {
                    file_id: 6,
                    request: ChunkRequest::Indices(vec![1])
                }
            );
            sat.send_frame(&Frame::file_data(1, 6, vec![2; 4]))
                .await
                .unwrap();
        };

        let (completion, ()) = tokio::join!(
            ground_ftp.request_file(&mut ground, 6, "out.bin"),
            satellite
        );
        assert_eq!(completion.unwrap().artifact.unwrap().size, 14);
        assert!(ground_store.read("files/6/chunk_5").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_request_for_unknown_chunks() {
        let Ends {
            ground: _ground,
            mut sat,
            sat_ftp,
            sat_store,
            ..
        } = ends(FtpConfigBuilder::new().chunk_size(10).build(), Loss::None);
        sat_store.write(&outbox_key(1), &pattern(15)).await.unwrap();
        let sent = sat_ftp
            .send_partial_file(&mut sat, &outbox_key(1), 1, &[1, 2, 40])
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert!(sat_ftp.send_file(&mut sat, "outbox/404", 404).await.is_err());
    }
}
