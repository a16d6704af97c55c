// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the gateway.
//!
//! [`GatewayRuntime::start`] assembles the engine, binds the HTTP and IPC
//! listeners, and spawns the server tasks. Embedders (and the end-to-end
//! tests) hold the returned handle and call
//! [`shutdown`](GatewayRuntime::shutdown) for graceful termination; the
//! standalone binary in `main.rs` does the same.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use nimbus_protocol::FuncConfig;

use crate::config::Config;
use crate::engine::Engine;
use crate::http::{HttpState, run_http_server};
use crate::ipc::run_ipc_server;
use crate::metrics::GatewayMetrics;
use crate::registry::{LogMonitor, Monitor, WorkerRegistry};

/// A running gateway that can be embedded in an application.
pub struct GatewayRuntime {
    http_addr: SocketAddr,
    ipc_path: PathBuf,
    engine: Arc<Engine>,
    registry: Arc<WorkerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    http_handle: JoinHandle<std::io::Result<()>>,
    ipc_handle: JoinHandle<()>,
}

impl GatewayRuntime {
    /// Start the gateway described by `config`.
    ///
    /// Reads and validates the function-config document, binds both
    /// listeners (removing a stale IPC socket file first) and spawns the
    /// server tasks.
    pub async fn start(config: Config) -> Result<Self> {
        let config_bytes = tokio::fs::read(&config.func_config_file)
            .await
            .with_context(|| {
                format!(
                    "failed to read function config {}",
                    config.func_config_file.display()
                )
            })?;
        let func_config = Arc::new(FuncConfig::load(config_bytes)?);
        info!(functions = func_config.len(), "function config loaded");

        let monitor: Option<Arc<dyn Monitor>> = if config.disable_monitor {
            None
        } else {
            Some(Arc::new(LogMonitor))
        };
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(WorkerRegistry::new(func_config.clone(), monitor));
        let engine = Arc::new(Engine::new(
            func_config.clone(),
            registry.clone(),
            metrics,
            config.max_running_external_requests,
        ));

        let http_listener = bind_tcp(config.http_addr, config.listen_backlog)?;
        let http_addr = http_listener.local_addr()?;
        info!(addr = %http_addr, "listening for HTTP requests");

        let ipc_listener = bind_unix(&config.ipc_path, config.listen_backlog)?;
        info!(path = %config.ipc_path.display(), "listening for IPC connections");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_state = HttpState {
            engine: engine.clone(),
            func_config,
            shutdown: shutdown_tx.clone(),
        };
        let http_handle = tokio::spawn(run_http_server(
            http_listener,
            http_state,
            shutdown_rx.clone(),
        ));
        let ipc_handle = tokio::spawn(run_ipc_server(
            ipc_listener,
            engine.clone(),
            registry.clone(),
            shutdown_rx,
        ));

        info!("GatewayRuntime started");
        Ok(Self {
            http_addr,
            ipc_path: config.ipc_path,
            engine,
            registry,
            shutdown_tx,
            http_handle,
            ipc_handle,
        })
    }

    /// Actual address of the HTTP listener.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Path of the IPC socket.
    pub fn ipc_path(&self) -> &Path {
        &self.ipc_path
    }

    /// The invocation engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The worker registry.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// A receiver that observes the shutdown signal, including one
    /// triggered by `POST /shutdown`.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Whether the server tasks are still alive.
    pub fn is_running(&self) -> bool {
        !self.http_handle.is_finished() && !self.ipc_handle.is_finished()
    }

    /// Gracefully shut the gateway down.
    pub async fn shutdown(self) -> Result<()> {
        info!("GatewayRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.ipc_handle.await {
            error!(error = %e, "IPC server task panicked");
        }
        match self.http_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server error during shutdown"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }
        let _ = std::fs::remove_file(&self.ipc_path);
        info!("GatewayRuntime shutdown complete");
        Ok(())
    }
}

fn bind_tcp(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {}", addr))?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}

fn bind_unix(path: &Path, backlog: u32) -> Result<UnixListener> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // A stale socket file from a previous run blocks the bind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&socket2::SockAddr::unix(path)?)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    socket.listen(backlog as i32)?;
    let std_listener: std::os::unix::net::UnixListener = socket.into();
    Ok(UnixListener::from_std(std_listener)?)
}
