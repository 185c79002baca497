//! Mirage - an MTProto proxy that hides Telegram traffic behind TLS

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mirage::{Config, Result, Runtime};

fn main() -> Result<()> {
    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let config = Config::from_env()?;

    info!("Mirage v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::new(config);
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}
