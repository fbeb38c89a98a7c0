use std::pin::pin;
use std::sync::Arc;
use std::thread::available_parallelism;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chunker::fixed_chunks;
use crate::error::{Error, Result};
use crate::folder::Folder;
use crate::manifest::BackupManifest;
use crate::naming::{ChunkName, ChunkNamer, RunId, FIXED_WIDTH_CHUNKS};
use crate::processor::Processor;

pub(crate) fn default_parallelism() -> usize {
    available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Chunks read from the input but not yet stored. Bounds memory use to
    /// roughly `max_in_flight` times the chunk size.
    pub max_in_flight: usize,
    /// Concurrent `Processor::forward` calls.
    pub transform_workers: usize,
    /// Upper bound on the raw chunk size. The effective size is further
    /// capped so that a transformed chunk always fits the folder.
    pub chunk_size: Option<usize>,
    /// Write a completion marker after the last chunk.
    pub write_manifest: bool,
    /// Refuse to start when the folder already holds objects.
    pub require_empty_folder: bool,
    /// Fail the run once the input needs more chunks than this.
    ///
    /// `Some(FIXED_WIDTH_CHUNKS)` keeps every chunk name sortable as a plain
    /// string, for readers that do not parse sequence numbers.
    pub max_chunks: Option<u64>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let parallelism = default_parallelism();
        Self {
            max_in_flight: 2 * parallelism,
            transform_workers: parallelism,
            chunk_size: None,
            write_manifest: true,
            require_empty_folder: true,
            max_chunks: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub run: RunId,
    pub chunks: u64,
    pub bytes_read: u64,
    pub bytes_stored: u64,
    pub hash: blake3::Hash,
}

impl BackupSummary {
    /// Whether plain string order of the chunk names matches their sequence.
    pub fn names_sort_as_strings(&self) -> bool {
        self.chunks <= FIXED_WIDTH_CHUNKS
    }
}

/// Splits a stream into chunks, transforms them concurrently, and stores
/// them in a [`Folder`] under order-preserving names.
pub struct BackupPipeline<F, P> {
    folder: Arc<F>,
    processor: Arc<P>,
    config: BackupConfig,
}

impl<F: Folder, P: Processor> BackupPipeline<F, P> {
    pub fn new(folder: Arc<F>, processor: Arc<P>) -> Self {
        Self {
            folder,
            processor,
            config: BackupConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BackupConfig) -> Self {
        self.config = config;
        self
    }

    /// The raw chunk size used for this folder and processor.
    pub fn chunk_size(&self) -> Result<usize> {
        let cap = self.folder.max_object_size();
        let fits = cap.saturating_sub(self.processor.max_expansion(cap));
        let chunk_size = match self.config.chunk_size {
            Some(configured) => configured.min(fits),
            None => fits,
        };
        if chunk_size == 0 {
            return Err(Error::InvalidConfig {
                reason: format!("no chunk fits into objects of {cap} bytes"),
            });
        }
        Ok(chunk_size)
    }

    /// Backs up `stream` under a run id taken from the current time.
    pub async fn backup(&self, stream: impl AsyncRead + Unpin) -> Result<BackupSummary> {
        self.backup_at(RunId::now(), stream, CancellationToken::new())
            .await
    }

    /// Backs up `stream` as `run`.
    ///
    /// The first failing chunk aborts the run: reading stops, outstanding
    /// chunks are cancelled, and the error is returned. Chunks that were
    /// already stored stay in the folder, which must then be treated as
    /// corrupt.
    #[tracing::instrument(skip_all, fields(run = %run))]
    pub async fn backup_at(
        &self,
        run: RunId,
        stream: impl AsyncRead + Unpin,
        cancel: CancellationToken,
    ) -> Result<BackupSummary> {
        let chunk_size = self.chunk_size()?;
        if self.config.require_empty_folder {
            let objects = self.folder.list().await?.len();
            if objects > 0 {
                return Err(Error::FolderNotEmpty { objects });
            }
        }
        tracing::debug!(chunk_size, "reading input");

        let mut run_state = RunState {
            namer: ChunkNamer::new(run),
            hasher: blake3::Hasher::new(),
            bytes_read: 0,
            bytes_stored: 0,
            units: JoinSet::new(),
        };

        let result = self
            .store_chunks(&mut run_state, chunk_size, stream, &cancel)
            .await;
        if let Err(err) = result {
            run_state.units.shutdown().await;
            tracing::warn!(
                %err,
                chunks = run_state.namer.issued(),
                "backup failed, stored chunks are left in place"
            );
            return Err(err);
        }

        let RunState {
            namer,
            hasher,
            bytes_read,
            mut bytes_stored,
            ..
        } = run_state;
        let hash = hasher.finalize();

        if self.config.write_manifest {
            let manifest = BackupManifest::new(namer.issued(), bytes_read, hash);
            let stored = self.transform(manifest.encode()?).await?;
            bytes_stored += stored.len() as u64;
            self.folder
                .write(&namer.manifest().to_string(), stored)
                .await?;
        }

        let summary = BackupSummary {
            run,
            chunks: namer.issued(),
            bytes_read,
            bytes_stored,
            hash,
        };
        tracing::info!(
            chunks = summary.chunks,
            bytes_read,
            bytes_stored,
            "backup done"
        );
        Ok(summary)
    }

    async fn store_chunks(
        &self,
        run_state: &mut RunState,
        chunk_size: usize,
        stream: impl AsyncRead + Unpin,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let in_flight = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let transform_slots = Arc::new(Semaphore::new(self.config.transform_workers.max(1)));
        let mut chunks = pin!(fixed_chunks(chunk_size, stream));

        loop {
            // finished units are reaped while waiting, so a failure
            // surfaces before the next chunk is read
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                Some(finished) = run_state.units.join_next() => {
                    run_state.bytes_stored += finished??;
                    continue;
                }
                permit = Arc::clone(&in_flight).acquire_owned() => {
                    permit.map_err(|_| Error::Cancelled)?
                }
            };

            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = chunks.next() => chunk,
            };
            let Some(data) = chunk.transpose()? else {
                break;
            };
            let issued = run_state.namer.issued();
            if let Some(max) = self.config.max_chunks {
                if issued >= max {
                    return Err(Error::TooManyChunks { max });
                }
            }
            if issued == FIXED_WIDTH_CHUNKS {
                tracing::warn!("chunk names outgrow six digits, string order no longer holds");
            }

            run_state.hasher.update(&data);
            run_state.bytes_read += data.len() as u64;

            let unit = StoreUnit {
                folder: Arc::clone(&self.folder),
                processor: Arc::clone(&self.processor),
                transform_slots: Arc::clone(&transform_slots),
                name: run_state.namer.next_name(),
                data,
                _permit: permit,
            };
            run_state.units.spawn(unit.run());
        }

        tracing::debug!(chunks = run_state.namer.issued(), "draining");
        loop {
            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                finished = run_state.units.join_next() => finished,
            };
            let Some(finished) = finished else {
                return Ok(());
            };
            run_state.bytes_stored += finished??;
        }
    }

    async fn transform(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        let processor = Arc::clone(&self.processor);
        tokio::task::spawn_blocking(move || processor.forward(&raw)).await?
    }
}

struct RunState {
    namer: ChunkNamer,
    hasher: blake3::Hasher,
    bytes_read: u64,
    bytes_stored: u64,
    units: JoinSet<Result<u64>>,
}

/// Transform-then-write for one chunk.
struct StoreUnit<F, P> {
    folder: Arc<F>,
    processor: Arc<P>,
    transform_slots: Arc<Semaphore>,
    name: ChunkName,
    data: Vec<u8>,
    _permit: OwnedSemaphorePermit,
}

impl<F: Folder, P: Processor> StoreUnit<F, P> {
    async fn run(self) -> Result<u64> {
        let Self {
            folder,
            processor,
            transform_slots,
            name,
            data,
            _permit,
        } = self;
        let raw_len = data.len();

        let stored = {
            let _slot = transform_slots
                .acquire()
                .await
                .map_err(|_| Error::Cancelled)?;
            tokio::task::spawn_blocking(move || processor.forward(&data)).await??
        };
        let stored_len = stored.len();

        folder.write(&name.to_string(), stored).await?;
        tracing::debug!(%name, raw_len, stored_len, "stored chunk");

        Ok(stored_len as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::*;
    use crate::folder::MemoryFolder;
    use crate::processor::{XorProcessor, ZstdProcessor};

    fn run() -> RunId {
        let started = NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        RunId::new(started)
    }

    /// Counts how many `forward` calls overlap.
    #[derive(Default)]
    struct CountingProcessor {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Processor for CountingProcessor {
        fn forward(&self, raw: &[u8]) -> Result<Vec<u8>> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(raw.to_vec())
        }

        fn reverse(&self, stored: &[u8]) -> Result<Vec<u8>> {
            Ok(stored.to_vec())
        }
    }

    #[test]
    fn chunk_size_leaves_room_for_expansion() {
        let folder = Arc::new(MemoryFolder::new(1024));

        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::default()));
        assert_eq!(pipeline.chunk_size().unwrap(), 1024);

        let zstd = Arc::new(ZstdProcessor::default());
        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::clone(&zstd));
        assert_eq!(pipeline.chunk_size().unwrap(), 1024 - zstd.max_expansion(1024));

        let pipeline = pipeline.with_config(BackupConfig {
            chunk_size: Some(100),
            ..Default::default()
        });
        assert_eq!(pipeline.chunk_size().unwrap(), 100);
    }

    #[tokio::test]
    async fn rejects_caps_without_room_for_data() {
        let folder = Arc::new(MemoryFolder::new(8));
        let pipeline = BackupPipeline::new(folder, Arc::new(ZstdProcessor::default()));

        let err = pipeline.backup(&b"abc"[..]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn names_chunks_in_input_order() {
        let folder = Arc::new(MemoryFolder::new(4));
        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::new(0)))
            .with_config(BackupConfig {
                write_manifest: false,
                ..Default::default()
            });

        let summary = pipeline
            .backup_at(run(), &b"aaaabbbbcc"[..], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.bytes_read, 10);
        assert_eq!(summary.bytes_stored, 10);
        assert_eq!(summary.hash, blake3::hash(b"aaaabbbbcc"));

        assert_eq!(folder.get("2025_01_02_03_04_05_000000").unwrap(), b"aaaa");
        assert_eq!(folder.get("2025_01_02_03_04_05_000001").unwrap(), b"bbbb");
        assert_eq!(folder.get("2025_01_02_03_04_05_000002").unwrap(), b"cc");
        assert_eq!(folder.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounds_concurrent_transforms() {
        let folder = Arc::new(MemoryFolder::new(1));
        let processor = Arc::new(CountingProcessor::default());
        let pipeline = BackupPipeline::new(folder, Arc::clone(&processor)).with_config(BackupConfig {
            max_in_flight: 16,
            transform_workers: 3,
            write_manifest: false,
            ..Default::default()
        });

        pipeline.backup(&[7u8; 24][..]).await.unwrap();

        let peak = processor.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {peak}");
        assert!(peak > 1, "transforms never overlapped");
    }

    #[tokio::test]
    async fn refuses_non_empty_folder() {
        let folder = Arc::new(MemoryFolder::new(16));
        folder.insert("leftover", vec![1]);
        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::default()));

        let err = pipeline.backup(&b"abc"[..]).await.unwrap_err();
        assert!(matches!(err, Error::FolderNotEmpty { objects: 1 }));
        assert_eq!(folder.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_stores_nothing_new() {
        let folder = Arc::new(MemoryFolder::new(4));
        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::default()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline
            .backup_at(run(), &b"abcdefgh"[..], cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(folder.is_empty());
    }
    #[tokio::test]
    async fn enforces_chunk_limit() {
        let folder = Arc::new(MemoryFolder::new(4));
        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::default()))
            .with_config(BackupConfig {
                max_in_flight: 1,
                write_manifest: false,
                max_chunks: Some(2),
                ..Default::default()
            });

        let summary = pipeline
            .backup_at(run(), &b"aaaabbbb"[..], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.chunks, 2);
        assert!(summary.names_sort_as_strings());

        let folder = Arc::new(MemoryFolder::new(4));
        let err = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::default()))
            .with_config(BackupConfig {
                max_in_flight: 1,
                max_chunks: Some(2),
                ..Default::default()
            })
            .backup_at(run(), &b"aaaabbbbc"[..], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyChunks { max: 2 }), "{err}");
        assert!(folder.get("2025_01_02_03_04_05_000002").is_none());
        assert!(folder.get("2025_01_02_03_04_05_manifest").is_none());
    }

    #[tokio::test]
    async fn cancelling_mid_run_keeps_stored_chunks() {
        let folder = Arc::new(MemoryFolder::new(4).with_latency(Duration::from_millis(20)));
        let pipeline = BackupPipeline::new(Arc::clone(&folder), Arc::new(XorProcessor::default()))
            .with_config(BackupConfig {
                max_in_flight: 2,
                write_manifest: false,
                ..Default::default()
            });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let input = [9u8; 400];
        let (result, ()) = tokio::join!(
            pipeline.backup_at(run(), &input[..], cancel),
            async move {
                tokio::time::sleep(Duration::from_millis(70)).await;
                trigger.cancel();
            }
        );

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err}");
        let stored = folder.len();
        assert!(stored > 0, "nothing was stored before cancelling");
        assert!(stored < 100, "all {stored} chunks were stored");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(folder.len(), stored);
        for name in folder.list().await.unwrap() {
            assert_eq!(folder.get(&name).unwrap(), [9 ^ 0x55; 4], "{name}");
        }
    }
}
