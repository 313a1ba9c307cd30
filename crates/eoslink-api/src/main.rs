//! eoslink server binary.

#![forbid(unsafe_code)]

use eoslink_api::prelude::{Config, Server};
use eoslink_core::observability::{init_logging, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let format = if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    };
    init_logging(format);

    tracing::info!(
        port = config.port,
        eos_base_url = %config.eos_base_url,
        "starting eoslink"
    );

    let server = Server::from_config(config)?;
    server.serve().await?;
    Ok(())
}
