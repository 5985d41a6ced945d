// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use tracing_subscriber::EnvFilter;

use vault_server::config::{LogFormat, VaultConfig};
use vault_server::state::VaultServices;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = VaultConfig::from_env()?;
    let services = VaultServices::open(config)?;
    services.start_background_tasks();

    tracing::info!("Knowledge vault running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown signal received");
    services.shutdown().await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match LogFormat::from_env() {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
