use anyhow::Result;
use log::LevelFilter;
use tracing::{subscriber, Level};
use tracing_log::LogTracer;
use tracing_subscriber::FmtSubscriber;

/// Routes both `tracing` and legacy `log` records to stderr.
pub fn init_tracing(level: Level) -> Result<()> {
    // sled and friends are chatty at debug; cap bridged log records at info.
    LogTracer::init_with_filter(LevelFilter::Info)?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();

    subscriber::set_global_default(subscriber)?;
    tracing::info!("initialized tracing with level {}", level);

    Ok(())
}
