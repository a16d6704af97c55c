// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Gateway - FaaS invocation gateway
//!
//! The gateway accepts external function invocations over HTTP, dispatches
//! them to locally-connected worker processes over a UNIX-domain socket,
//! and returns results inline or through shared-memory regions.

use anyhow::Result;
use tracing::{error, info};

use nimbus_gateway::config::Config;
use nimbus_gateway::runtime::GatewayRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nimbus_gateway=info".parse().unwrap()),
        )
        .init();

    info!("Starting Nimbus Gateway");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        ipc_path = %config.ipc_path.display(),
        func_config = %config.func_config_file.display(),
        max_running = config.max_running_external_requests,
        "Configuration loaded"
    );

    let runtime = GatewayRuntime::start(config).await?;
    let mut shutdown_signal = runtime.shutdown_signal();

    // Run until ctrl-c or a POST /shutdown request
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received ctrl-c");
        }
        _ = shutdown_signal.wait_for(|&stop| stop) => {
            info!("Shutdown requested");
        }
    }

    runtime.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}
