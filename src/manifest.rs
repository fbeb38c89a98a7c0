use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const FORMAT_VERSION: u8 = 1;

/// The completion marker of a backup run.
///
/// Written as the very last object of a successful run, so its presence
/// proves that every chunk before it was stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: u8,
    pub chunk_count: u64,
    pub total_len: u64,
    /// BLAKE3 hash of the original stream.
    pub hash: [u8; 32],
}

impl BackupManifest {
    pub fn new(chunk_count: u64, total_len: u64, hash: blake3::Hash) -> Self {
        Self {
            version: FORMAT_VERSION,
            chunk_count,
            total_len,
            hash: *hash.as_bytes(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|err| Error::transform(format!("manifest: {err}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = postcard::from_bytes(bytes)
            .map_err(|err| Error::corruption(format!("manifest: {err}")))?;
        if manifest.version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }
}

impl fmt::Debug for BackupManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupManifest")
            .field("version", &self.version)
            .field("chunk_count", &self.chunk_count)
            .field("total_len", &self.total_len)
            .field("hash", &format_args!("{:x}", base16ct::HexDisplay(&self.hash)))
            .finish()
    }
}
