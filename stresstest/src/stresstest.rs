use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use bytesize::ByteSize;
use chunkpipe::{
    BackupConfig, BackupPipeline, MemoryFolder, RestoreConfig, RestorePipeline, XorProcessor,
};

use crate::workload::Workload;

fn throughput(bytes: u64, elapsed: Duration) -> ByteSize {
    ByteSize::b((bytes as f64 / elapsed.as_secs_f64()) as u64)
}

pub async fn perform_stresstest(workload: &Workload) -> Result<()> {
    let folder = Arc::new(
        MemoryFolder::new(workload.object_size)
            .with_latency(workload.write_latency)
            .with_jitter(workload.write_jitter),
    );
    let processor = Arc::new(XorProcessor::default().with_delay(workload.transform_delay));

    let backup = BackupPipeline::new(Arc::clone(&folder), Arc::clone(&processor)).with_config(
        BackupConfig {
            max_in_flight: workload.concurrency,
            ..Default::default()
        },
    );
    let backup_start = Instant::now();
    let summary = backup.backup(workload.payload()).await?;
    let backup_time = backup_start.elapsed();

    let restore = RestorePipeline::new(folder, processor).with_config(RestoreConfig {
        prefetch: workload.concurrency,
        require_manifest: true,
    });
    let mut restored = Vec::with_capacity(workload.payload_size as usize);
    let restore_start = Instant::now();
    restore.restore(&mut restored).await?;
    let restore_time = restore_start.elapsed();

    ensure!(
        blake3::hash(&restored) == summary.hash,
        "restored payload does not match"
    );

    println!(
        "# Workload {} (concurrency: {})",
        workload.name, workload.concurrency
    );
    println!(
        "  {} in {} chunks of at most {}",
        ByteSize::b(summary.bytes_read),
        summary.chunks,
        ByteSize::b(workload.object_size as u64)
    );
    println!(
        "=> backup: {backup_time:.2?} ({}/s); restore: {restore_time:.2?} ({}/s)",
        throughput(summary.bytes_read, backup_time),
        throughput(summary.bytes_read, restore_time)
    );

    Ok(())
}
