//! # labwire master
//!
//! Long-running process exposing named targets over RPC.
//!
//! ## Services
//!
//! The master listens on four ports of the same host:
//! 1. **RPC**: the `calc` and `status` targets, plus the built-in `terminate`
//! 2. **Sync**: the `status` structure, replicated to subscribers
//! 3. **Broadcast**: log records on the `log` channel
//! 4. **Log**: records forwarded by other processes, logged and broadcast

use anyhow::Result;
use labwire_sync::FORWARDED_TARGET;
use tracing_subscriber::EnvFilter;

mod config;
mod runtime;
mod targets;

pub use config::MasterConfig;
pub use runtime::Master;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; forwarded records were filtered by their source
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("info,{FORWARDED_TARGET}=trace"))),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting labwire master");

    let config = MasterConfig::from_env()?;
    let master = Master::new(config).start().await?;
    master.run().await;

    Ok(())
}
