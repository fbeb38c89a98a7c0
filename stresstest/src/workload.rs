use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::io::{AsyncRead, ReadBuf};

pub struct WorkloadBuilder {
    name: &'static str,
    seed: u64,
    concurrency: usize,

    payload_size: u64,
    object_size: usize,

    write_latency: Duration,
    write_jitter: Duration,
    transform_delay: Duration,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn sizes(mut self, payload_size: u64, object_size: usize) -> Self {
        self.payload_size = payload_size;
        self.object_size = object_size;
        self
    }

    pub fn latency(mut self, latency: Duration, jitter: Duration) -> Self {
        self.write_latency = latency;
        self.write_jitter = jitter;
        self
    }

    pub fn transform_delay(mut self, delay: Duration) -> Self {
        self.transform_delay = delay;
        self
    }

    pub fn build(self) -> Workload {
        Workload {
            name: self.name,
            seed: self.seed,
            concurrency: self.concurrency,
            payload_size: self.payload_size,
            object_size: self.object_size,
            write_latency: self.write_latency,
            write_jitter: self.write_jitter,
            transform_delay: self.transform_delay,
        }
    }
}

pub struct Workload {
    pub name: &'static str,
    pub seed: u64,
    /// Chunks in flight during backup, and prefetched during restore.
    pub concurrency: usize,

    pub payload_size: u64,
    pub object_size: usize,

    pub write_latency: Duration,
    pub write_jitter: Duration,
    pub transform_delay: Duration,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            seed: 0,
            concurrency: 16,
            payload_size: 16 * 1024 * 1024,
            object_size: 1024 * 1024,
            write_latency: Duration::from_millis(5),
            write_jitter: Duration::ZERO,
            transform_delay: Duration::ZERO,
        }
    }

    pub fn payload(&self) -> Payload {
        Payload {
            len: self.payload_size,
            rng: SmallRng::seed_from_u64(self.seed),
        }
    }
}

/// A reproducible pseudo-random byte stream of `len` bytes.
pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl AsyncRead for Payload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let len_to_fill = (buf.remaining() as u64).min(self.len) as usize;

        let fill_buf = buf.initialize_unfilled_to(len_to_fill);
        self.rng.fill_bytes(fill_buf);
        buf.advance(len_to_fill);
        self.len -= len_to_fill as u64;

        Poll::Ready(Ok(()))
    }
}
