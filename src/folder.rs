use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Durable, size-capped object storage holding the chunks of one backup.
///
/// All operations may be called concurrently: the pipeline writes distinct
/// names in parallel and prefetches reads during restore.
#[async_trait::async_trait]
pub trait Folder: Send + Sync + 'static {
    /// The largest object this backend accepts, in bytes.
    fn max_object_size(&self) -> usize;

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<()>;

    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// All object names, in no particular order.
    async fn list(&self) -> Result<Vec<String>>;
}

fn check_size(name: &str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::ChunkTooLarge {
            name: name.into(),
            len,
            max,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Objects {
    data: HashMap<String, Vec<u8>>,
    insertion_order: Vec<String>,
}

/// An in-process folder with artificial latency.
///
/// `list` reports names in reverse insertion order, so anything relying on
/// backend iteration order breaks loudly in tests.
#[derive(Debug)]
pub struct MemoryFolder {
    max_object_size: usize,
    latency: Duration,
    jitter: Duration,
    write_budget: Option<AtomicUsize>,
    objects: Mutex<Objects>,
}

impl MemoryFolder {
    pub fn new(max_object_size: usize) -> Self {
        Self {
            max_object_size,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            write_budget: None,
            objects: Default::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds up to `jitter` of extra latency per write, derived from the
    /// object name, so writes complete out of submission order.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Fails every write after the first `writes` with `StorageUnavailable`.
    pub fn with_write_limit(mut self, writes: usize) -> Self {
        self.write_budget = Some(AtomicUsize::new(writes));
        self
    }

    /// Stores an object directly, bypassing the size cap and latency.
    pub fn insert(&self, name: &str, data: Vec<u8>) {
        let mut objects = self.objects.lock().unwrap();
        if objects.data.insert(name.into(), data).is_none() {
            objects.insertion_order.push(name.into());
        }
    }

    pub fn remove(&self, name: &str) -> Option<Vec<u8>> {
        let mut objects = self.objects.lock().unwrap();
        objects.insertion_order.retain(|n| n != name);
        objects.data.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().data.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_delay(&self, name: &str) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        let hash = blake3::hash(name.as_bytes());
        let [a, b, c, d, e, f, g, h, ..] = *hash.as_bytes();
        let seed = u64::from_le_bytes([a, b, c, d, e, f, g, h]);
        let extra = seed % (self.jitter.as_micros() as u64 + 1);
        self.latency + Duration::from_micros(extra)
    }

    fn take_write_permit(&self) -> Result<()> {
        let Some(budget) = &self.write_budget else {
            return Ok(());
        };
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| {
                Error::StorageUnavailable(std::io::Error::new(
                    ErrorKind::ConnectionRefused,
                    "write limit reached",
                ))
            })
    }
}

#[async_trait::async_trait]
impl Folder for MemoryFolder {
    fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<()> {
        check_size(name, data.len(), self.max_object_size)?;
        self.take_write_permit()?;

        tokio::time::sleep(self.write_delay(name)).await;
        self.insert(name, data);
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        tokio::time::sleep(self.latency).await;
        self.get(name).ok_or_else(|| Error::NotFound { name: name.into() })
    }

    async fn list(&self) -> Result<Vec<String>> {
        tokio::time::sleep(self.latency).await;
        let objects = self.objects.lock().unwrap();
        Ok(objects.insertion_order.iter().rev().cloned().collect())
    }
}

/// A folder backed by a local directory, one file per object.
///
/// Objects are written to a hidden temporary file and renamed into place, so
/// a crashed write never leaves a truncated object under its final name.
#[derive(Debug, Clone)]
pub struct DirFolder {
    root: PathBuf,
    max_object_size: usize,
}

impl DirFolder {
    pub fn new(root: impl Into<PathBuf>, max_object_size: usize) -> Self {
        Self {
            root: root.into(),
            max_object_size,
        }
    }

    /// Like [`DirFolder::new`], creating the directory if it does not exist.
    pub async fn create(root: impl Into<PathBuf>, max_object_size: usize) -> Result<Self> {
        let folder = Self::new(root, max_object_size);
        tokio::fs::create_dir_all(&folder.root)
            .await
            .map_err(Error::StorageUnavailable)?;
        Ok(folder)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
            && name != "..";
        if !valid {
            return Err(Error::InvalidConfig {
                reason: format!("`{name}` is not a valid object name"),
            });
        }
        Ok(self.root.join(name))
    }
}

fn storage_error(name: &str, err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::NotFound => Error::NotFound { name: name.into() },
        _ => Error::StorageUnavailable(err),
    }
}

#[async_trait::async_trait]
impl Folder for DirFolder {
    fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let path = self.object_path(name)?;
        check_size(name, data.len(), self.max_object_size)?;

        let tmp_path = self.root.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp_path, data)
            .await
            .map_err(Error::StorageUnavailable)?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(Error::StorageUnavailable)?;
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| storage_error(name, err))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = vec![];
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // a folder that was never written to holds no backup
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(Error::StorageUnavailable(err)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(Error::StorageUnavailable)? {
            let file_type = entry.file_type().await.map_err(Error::StorageUnavailable)?;
            if !file_type.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        Ok(names)
    }
}
