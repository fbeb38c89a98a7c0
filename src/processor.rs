use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Error, Result};

/// The compress+encrypt transform applied to every chunk.
///
/// Both directions are called from blocking worker threads, concurrently for
/// different chunks, so implementations must not depend on call order.
/// An empty input maps to an empty output in both directions.
pub trait Processor: Send + Sync + 'static {
    fn forward(&self, raw: &[u8]) -> Result<Vec<u8>>;

    fn reverse(&self, stored: &[u8]) -> Result<Vec<u8>>;

    /// Worst-case number of bytes `forward` may add to a `raw_len` input.
    fn max_expansion(&self, raw_len: usize) -> usize {
        let _ = raw_len;
        0
    }
}

const LEN_PREFIX: usize = 4;
const DEFAULT_MAX_RAW_LEN: usize = 256 * 1024 * 1024;

/// zstd bulk compression, prefixed with the little-endian raw length.
///
/// The prefix is checked against `max_raw_len` before anything is
/// allocated for decompression.
#[derive(Debug, Clone, Copy)]
pub struct ZstdProcessor {
    level: i32,
    max_raw_len: usize,
}

impl ZstdProcessor {
    pub fn new(level: i32) -> Self {
        Self {
            level,
            max_raw_len: DEFAULT_MAX_RAW_LEN,
        }
    }

    /// Largest chunk accepted in either direction, usually the folder's
    /// object size cap.
    pub fn with_max_raw_len(mut self, max_raw_len: usize) -> Self {
        self.max_raw_len = max_raw_len;
        self
    }
}

impl Default for ZstdProcessor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Processor for ZstdProcessor {
    fn forward(&self, raw: &[u8]) -> Result<Vec<u8>> {
        if raw.is_empty() {
            return Ok(vec![]);
        }
        let raw_len = u32::try_from(raw.len())
            .ok()
            .filter(|_| raw.len() <= self.max_raw_len)
            .ok_or_else(|| Error::transform(format!("chunk of {} bytes is too large", raw.len())))?;

        let compressed =
            zstd::bulk::compress(raw, self.level).map_err(|err| Error::transform(err.to_string()))?;

        let mut stored = Vec::with_capacity(LEN_PREFIX + compressed.len());
        stored.extend_from_slice(&raw_len.to_le_bytes());
        stored.extend_from_slice(&compressed);
        Ok(stored)
    }

    fn reverse(&self, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.is_empty() {
            return Ok(vec![]);
        }
        let Some((prefix, compressed)) = stored.split_first_chunk::<LEN_PREFIX>() else {
            return Err(Error::corruption("truncated zstd length prefix"));
        };
        let raw_len = u32::from_le_bytes(*prefix) as usize;
        if raw_len > self.max_raw_len {
            return Err(Error::corruption(format!(
                "zstd length prefix of {raw_len} bytes exceeds {}",
                self.max_raw_len
            )));
        }

        let raw = zstd::bulk::decompress(compressed, raw_len)
            .map_err(|err| Error::corruption(format!("zstd: {err}")))?;
        if raw.len() != raw_len {
            return Err(Error::corruption(format!(
                "expected {raw_len} decompressed bytes, got {}",
                raw.len()
            )));
        }
        Ok(raw)
    }

    fn max_expansion(&self, raw_len: usize) -> usize {
        let bound = zstd::zstd_safe::compress_bound(raw_len);
        bound.saturating_sub(raw_len) + LEN_PREFIX
    }
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals the output of an inner processor with AES-256-GCM.
///
/// Stored layout is `nonce || ciphertext || tag`, with a fresh random nonce
/// per chunk.
pub struct SealedProcessor<P> {
    inner: P,
    cipher: Aes256Gcm,
}

impl<P: Processor> SealedProcessor<P> {
    pub fn new(inner: P, key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { inner, cipher }
    }
}

impl<P: Processor> Processor for SealedProcessor<P> {
    fn forward(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let plain = self.inner.forward(raw)?;
        if plain.is_empty() {
            return Ok(vec![]);
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain.as_slice())
            .map_err(|_| Error::transform("aes-gcm encryption failed"))?;

        let mut stored = Vec::with_capacity(NONCE_LEN + sealed.len());
        stored.extend_from_slice(nonce.as_slice());
        stored.extend_from_slice(&sealed);
        Ok(stored)
    }

    fn reverse(&self, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.is_empty() {
            return Ok(vec![]);
        }
        if stored.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::corruption("sealed chunk is shorter than nonce and tag"));
        }

        let (nonce, sealed) = stored.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::corruption("aes-gcm authentication failed"))?;

        self.inner.reverse(&plain)
    }

    fn max_expansion(&self, raw_len: usize) -> usize {
        self.inner.max_expansion(raw_len) + NONCE_LEN + TAG_LEN
    }
}

/// A trivially reversible processor for tests and benchmarks.
///
/// XORs every byte with `key`, optionally burning `delay` of wall time per
/// call to stand in for an expensive transform.
#[derive(Debug, Clone, Copy)]
pub struct XorProcessor {
    key: u8,
    delay: Duration,
}

impl XorProcessor {
    pub fn new(key: u8) -> Self {
        Self {
            key,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        if data.is_empty() {
            return vec![];
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        data.iter().map(|b| b ^ self.key).collect()
    }
}

impl Default for XorProcessor {
    fn default() -> Self {
        Self::new(0x55)
    }
}

impl Processor for XorProcessor {
    fn forward(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(raw))
    }

    fn reverse(&self, stored: &[u8]) -> Result<Vec<u8>> {
        Ok(self.apply(stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        blake3::Hasher::new().finalize_xof().fill(&mut buf);
        buf
    }

    #[test]
    fn empty_input_short_circuits() {
        let sealed = SealedProcessor::new(ZstdProcessor::default(), &[7; 32]);
        let processors: [&dyn Processor; 3] =
            [&ZstdProcessor::default(), &sealed, &XorProcessor::default()];

        for processor in processors {
            assert!(processor.forward(b"").unwrap().is_empty());
            assert!(processor.reverse(b"").unwrap().is_empty());
        }
    }

    #[test]
    fn zstd_roundtrip() {
        let processor = ZstdProcessor::default();
        let raw = b"abcde".repeat(1000);

        let stored = processor.forward(&raw).unwrap();
        assert!(stored.len() < raw.len());
        assert_eq!(processor.reverse(&stored).unwrap(), raw);
    }

    #[test]
    fn zstd_rejects_garbage() {
        let processor = ZstdProcessor::default();

        let err = processor.reverse(b"\x05\x00").unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));

        let err = processor.reverse(b"\x05\x00\x00\x00not zstd").unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));
    }

    #[test]
    fn zstd_bounds_length_prefix() {
        let processor = ZstdProcessor::default().with_max_raw_len(1024);

        let mut stored = processor.forward(&[7; 1024]).unwrap();
        stored[..LEN_PREFIX].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = processor.reverse(&stored).unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }), "{err}");

        let err = processor.forward(&[7; 1025]).unwrap_err();
        assert!(matches!(err, Error::TransformFailure { .. }), "{err}");
    }

    #[test]
    fn expansion_bound_covers_incompressible_data() {
        let sealed = SealedProcessor::new(ZstdProcessor::new(19), &[1; 32]);
        let raw = noise(64 * 1024);

        let stored = sealed.forward(&raw).unwrap();
        assert!(stored.len() <= raw.len() + sealed.max_expansion(raw.len()));
        assert_eq!(sealed.reverse(&stored).unwrap(), raw);
    }

    #[test]
    fn sealed_detects_tampering() {
        let sealed = SealedProcessor::new(ZstdProcessor::default(), &[42; 32]);
        let mut stored = sealed.forward(b"attack at dawn").unwrap();

        let last = stored.len() - 1;
        stored[last] ^= 1;
        let err = sealed.reverse(&stored).unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));

        let err = sealed.reverse(&stored[..10]).unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));
    }

    #[test]
    fn sealed_rejects_wrong_key() {
        let stored = SealedProcessor::new(XorProcessor::default(), &[1; 32])
            .forward(b"secret")
            .unwrap();

        let err = SealedProcessor::new(XorProcessor::default(), &[2; 32])
            .reverse(&stored)
            .unwrap_err();
        assert!(matches!(err, Error::DataCorruption { .. }));
    }

    #[test]
    fn xor_is_its_own_inverse() {
        let processor = XorProcessor::new(0x55);
        let stored = processor.forward(b"abcdef").unwrap();
        assert_ne!(stored, b"abcdef");
        assert_eq!(processor.reverse(&stored).unwrap(), b"abcdef");
    }
}
