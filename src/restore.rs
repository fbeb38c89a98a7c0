use std::pin::pin;
use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::backup::default_parallelism;
use crate::error::{Error, Result};
use crate::folder::Folder;
use crate::manifest::BackupManifest;
use crate::naming::{ChunkName, ObjectName, RunId};
use crate::processor::Processor;

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Chunks read and reversed ahead of the one being written out.
    pub prefetch: usize,
    /// Fail unless the folder holds a completion marker.
    ///
    /// Off by default so that folders written without a marker can still be
    /// restored; such folders cannot be told apart from an interrupted backup.
    pub require_manifest: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            prefetch: default_parallelism(),
            require_manifest: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    /// `None` for an empty folder.
    pub run: Option<RunId>,
    pub chunks: u64,
    pub bytes_written: u64,
    /// Whether the output was checked against a completion marker.
    pub verified: bool,
}

/// The objects of one run, in restore order.
#[derive(Debug, Default)]
struct RestorePlan {
    run: Option<RunId>,
    chunks: Vec<ChunkName>,
    manifest: Option<ObjectName>,
}

impl RestorePlan {
    fn from_listing(names: Vec<String>) -> Result<Self> {
        let mut plan = Self::default();

        for raw in names {
            let name: ObjectName = match raw.parse() {
                Ok(name) => name,
                Err(err) => {
                    tracing::warn!(%err, "ignoring foreign object");
                    continue;
                }
            };

            match plan.run {
                Some(run) if run != name.run() => {
                    let (first, other) = (run.min(name.run()), run.max(name.run()));
                    return Err(Error::MixedRuns {
                        first: first.to_string(),
                        other: other.to_string(),
                    });
                }
                _ => plan.run = Some(name.run()),
            }

            match name {
                ObjectName::Chunk(chunk) => plan.chunks.push(chunk),
                ObjectName::Manifest(_) => plan.manifest = Some(name),
            }
        }

        // listings come back in backend order, which means nothing
        plan.chunks.sort_unstable();

        for (expected, chunk) in (0..).zip(&plan.chunks) {
            if chunk.sequence != expected {
                return Err(Error::Incomplete {
                    reason: format!("chunk {expected} is missing, next is `{chunk}`"),
                });
            }
        }

        Ok(plan)
    }

    fn check_manifest(&self, manifest: &BackupManifest) -> Result<()> {
        let found = self.chunks.len() as u64;
        if found != manifest.chunk_count {
            return Err(Error::Incomplete {
                reason: format!(
                    "manifest lists {} chunks, folder holds {found}",
                    manifest.chunk_count
                ),
            });
        }
        Ok(())
    }
}

/// Reassembles the original stream from a [`Folder`] written by
/// [`BackupPipeline`](crate::backup::BackupPipeline).
pub struct RestorePipeline<F, P> {
    folder: Arc<F>,
    processor: Arc<P>,
    config: RestoreConfig,
}

impl<F: Folder, P: Processor> RestorePipeline<F, P> {
    pub fn new(folder: Arc<F>, processor: Arc<P>) -> Self {
        Self {
            folder,
            processor,
            config: RestoreConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RestoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Writes the backed up stream to `out`, chunk by chunk.
    ///
    /// On failure, whatever was written so far stays in `out`. Callers that
    /// need all-or-nothing output must stage it themselves.
    #[tracing::instrument(skip_all)]
    pub async fn restore(&self, mut out: impl AsyncWrite + Unpin) -> Result<RestoreSummary> {
        let plan = RestorePlan::from_listing(self.folder.list().await?)?;

        let manifest = match &plan.manifest {
            Some(name) => {
                let stored = self.folder.read(&name.to_string()).await?;
                let manifest = BackupManifest::decode(&self.reverse(stored).await?)?;
                plan.check_manifest(&manifest)?;
                Some(manifest)
            }
            None if self.config.require_manifest => {
                return Err(Error::Incomplete {
                    reason: "completion marker is missing".into(),
                });
            }
            None => {
                if !plan.chunks.is_empty() {
                    tracing::warn!("no completion marker, restoring unverified");
                }
                None
            }
        };
        tracing::debug!(run = ?plan.run, chunks = plan.chunks.len(), "restoring");

        let mut hasher = blake3::Hasher::new();
        let mut bytes_written = 0u64;
        let mut chunks = pin!(stream::iter(plan.chunks.iter().copied())
            .map(|name| self.fetch(name))
            .buffered(self.config.prefetch.max(1)));

        while let Some(raw) = chunks.next().await {
            let raw = raw?;
            hasher.update(&raw);
            out.write_all(&raw).await?;
            bytes_written += raw.len() as u64;
        }
        out.flush().await?;

        if let Some(manifest) = &manifest {
            if bytes_written != manifest.total_len {
                return Err(Error::corruption(format!(
                    "restored {bytes_written} bytes, expected {}",
                    manifest.total_len
                )));
            }
            if hasher.finalize() != blake3::Hash::from_bytes(manifest.hash) {
                return Err(Error::corruption("restored stream does not match its hash"));
            }
        }

        let summary = RestoreSummary {
            run: plan.run,
            chunks: plan.chunks.len() as u64,
            bytes_written,
            verified: manifest.is_some(),
        };
        tracing::info!(
            chunks = summary.chunks,
            bytes_written,
            verified = summary.verified,
            "restore done"
        );
        Ok(summary)
    }

    async fn fetch(&self, name: ChunkName) -> Result<Vec<u8>> {
        let stored = self.folder.read(&name.to_string()).await?;
        let raw = self.reverse(stored).await?;
        tracing::debug!(%name, len = raw.len(), "fetched chunk");
        Ok(raw)
    }

    async fn reverse(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        let processor = Arc::clone(&self.processor);
        tokio::task::spawn_blocking(move || processor.reverse(&stored)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn plan_sorts_and_skips_foreign_objects() {
        let plan = RestorePlan::from_listing(listing(&[
            "2025_01_02_03_04_05_000002",
            "notes.txt",
            "2025_01_02_03_04_05_000000",
            "2025_01_02_03_04_05_manifest",
            "2025_01_02_03_04_05_000001",
        ]))
        .unwrap();

        let sequences: Vec<_> = plan.chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, [0, 1, 2]);
        assert!(plan.manifest.is_some());
        assert_eq!(plan.run.unwrap().to_string(), "2025_01_02_03_04_05");
    }

    #[test]
    fn plan_rejects_mixed_runs() {
        let err = RestorePlan::from_listing(listing(&[
            "2025_01_02_03_04_06_000000",
            "2025_01_02_03_04_05_000000",
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MixedRuns { first, other }
                if first == "2025_01_02_03_04_05" && other == "2025_01_02_03_04_06"
        ));
    }

    #[test]
    fn plan_rejects_gaps() {
        let err = RestorePlan::from_listing(listing(&[
            "2025_01_02_03_04_05_000000",
            "2025_01_02_03_04_05_000002",
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Incomplete { .. }));

        let err = RestorePlan::from_listing(listing(&["2025_01_02_03_04_05_000001"])).unwrap_err();
        assert!(matches!(err, Error::Incomplete { .. }));
    }

    #[test]
    fn empty_listing_is_an_empty_plan() {
        let plan = RestorePlan::from_listing(vec![]).unwrap();
        assert!(plan.run.is_none());
        assert!(plan.chunks.is_empty());
        assert!(plan.manifest.is_none());
    }
}
