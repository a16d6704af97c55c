// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Nimbus gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address for the HTTP surface
    pub http_addr: SocketAddr,
    /// UNIX-domain socket path for worker/launcher connections
    pub ipc_path: PathBuf,
    /// Path of the function-config JSON document
    pub func_config_file: PathBuf,
    /// Cap on concurrently-running external calls (0 = unbounded)
    pub max_running_external_requests: usize,
    /// Disable container-monitor notifications
    pub disable_monitor: bool,
    /// Listen backlog for both listeners
    pub listen_backlog: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `NIMBUS_FUNC_CONFIG_FILE`: path of the function-config document
    ///
    /// Optional (with defaults):
    /// - `NIMBUS_HTTP_ADDR`: HTTP listen address (default: 0.0.0.0:8080)
    /// - `NIMBUS_IPC_PATH`: worker socket path (default: /tmp/nimbus/gateway.sock)
    /// - `NIMBUS_MAX_RUNNING_EXTERNAL_REQUESTS`: concurrency cap, 0 for unbounded (default: 0)
    /// - `NIMBUS_DISABLE_MONITOR`: disable container-monitor notifications (default: false)
    /// - `NIMBUS_LISTEN_BACKLOG`: listen backlog (default: 511)
    pub fn from_env() -> Result<Self, ConfigError> {
        let func_config_file = std::env::var("NIMBUS_FUNC_CONFIG_FILE")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("NIMBUS_FUNC_CONFIG_FILE"))?;

        let http_addr: SocketAddr = std::env::var("NIMBUS_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("NIMBUS_HTTP_ADDR", "must be a socket address"))?;

        let ipc_path = std::env::var("NIMBUS_IPC_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/nimbus/gateway.sock"));

        let max_running_external_requests: usize =
            std::env::var("NIMBUS_MAX_RUNNING_EXTERNAL_REQUESTS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "NIMBUS_MAX_RUNNING_EXTERNAL_REQUESTS",
                        "must be a non-negative integer",
                    )
                })?;

        let disable_monitor: bool = std::env::var("NIMBUS_DISABLE_MONITOR")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("NIMBUS_DISABLE_MONITOR", "must be true or false"))?;

        let listen_backlog: u32 = std::env::var("NIMBUS_LISTEN_BACKLOG")
            .unwrap_or_else(|_| "511".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("NIMBUS_LISTEN_BACKLOG", "must be a positive integer")
            })?;

        Ok(Self {
            http_addr,
            ipc_path,
            func_config_file,
            max_running_external_requests,
            disable_monitor,
            listen_backlog,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
