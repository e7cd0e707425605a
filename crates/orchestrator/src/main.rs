//! Camera pipeline binary entry point: loads configuration from the
//! environment, initializes `FFmpeg` (needed by stream-mode ingestion),
//! builds the Supervisor, and runs it until a shutdown signal arrives.

use anyhow::Context;
use camwatch_orchestrator::{PipelineConfig, Supervisor};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    camwatch_ingestion::init().context("failed to initialize FFmpeg")?;

    let config = PipelineConfig::from_env().context("fatal configuration error")?;

    info!(
        cameras = config.cameras.len(),
        queue_size = config.queue_size,
        "camwatch starting"
    );

    let supervisor = Supervisor::new(config);
    supervisor.run().await.context("pipeline exited with error")?;

    info!("camwatch stopped");
    Ok(())
}

/// Installs a `tracing-subscriber` `fmt` layer, honoring `LOG_LEVEL`/
/// `RUST_LOG` for verbosity and `LOG_FORMAT=json` for the one-JSON-line-
/// per-event format external log collectors expect.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_string());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

