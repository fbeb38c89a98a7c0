use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chunkpipe=warn")),
        )
        .init();

    let workloads = [
        Workload::builder("many small objects")
            .seed(1)
            .concurrency(32)
            .sizes(64 * 1024 * 1024, 256 * 1024)
            .latency(Duration::from_millis(5), Duration::from_millis(20))
            .build(),
        Workload::builder("few large objects")
            .seed(2)
            .concurrency(8)
            .sizes(128 * 1024 * 1024, 16 * 1024 * 1024)
            .latency(Duration::from_millis(50), Duration::from_millis(50))
            .build(),
        Workload::builder("slow transforms")
            .seed(3)
            .concurrency(16)
            .sizes(32 * 1024 * 1024, 1024 * 1024)
            .transform_delay(Duration::from_millis(25))
            .build(),
    ];

    for workload in &workloads {
        perform_stresstest(workload).await?;
    }

    Ok(())
}
