// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of launcher and function-worker endpoints.
//!
//! The first message on every IPC connection must be a handshake naming a
//! configured function. Launchers announce the container they run in;
//! function workers are assigned a process-wide unique client id that
//! identifies them in the calls they originate. Either way the accepted
//! connection receives a handshake response carrying the verbatim
//! function-config document, so all workers share the gateway's view.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use nimbus_protocol::{
    CONTAINER_ID_LENGTH, FuncConfig, INVALID_CONTAINER_ID, Message, MessageKind,
};

use crate::error::GatewayError;
use crate::ipc::{MessageTx, Outbound};

/// Receiver of container notifications, implemented by the process
/// monitor. The gateway only reports; tracking is the monitor's business.
pub trait Monitor: Send + Sync {
    /// A launcher announced the container it runs in.
    fn on_new_func_container(&self, func_id: u16, container_id: &str);
}

/// Monitor that just records the containers it is told about.
#[derive(Debug, Default)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn on_new_func_container(&self, func_id: u16, container_id: &str) {
        info!(func_id, container_id, "new function container");
    }
}

/// The role a connection negotiated in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// A launcher endpoint.
    Launcher,
    /// A function-worker endpoint with its assigned client id.
    FuncWorker {
        /// The process-wide unique worker identity.
        client_id: u16,
    },
}

/// Outcome of an accepted handshake.
#[derive(Debug)]
pub struct HandshakeAccept {
    /// The role the connection negotiated.
    pub role: HandshakeRole,
    /// The function the endpoint belongs to.
    pub func_id: u16,
    /// Handshake response to write first on the connection.
    pub response: Outbound,
}

#[derive(Debug)]
struct WorkerEndpoint {
    func_id: u16,
    tx: MessageTx,
}

#[derive(Default)]
struct RegistryState {
    launchers: HashMap<u16, MessageTx>,
    workers: HashMap<u16, WorkerEndpoint>,
}

/// Tracks connected launcher and worker endpoints.
pub struct WorkerRegistry {
    func_config: Arc<FuncConfig>,
    monitor: Option<Arc<dyn Monitor>>,
    next_client_id: AtomicU16,
    state: Mutex<RegistryState>,
}

impl WorkerRegistry {
    /// Create a registry over the loaded function configuration.
    pub fn new(func_config: Arc<FuncConfig>, monitor: Option<Arc<dyn Monitor>>) -> Self {
        Self {
            func_config,
            monitor,
            next_client_id: AtomicU16::new(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Validate a connection's first message and register the endpoint.
    ///
    /// On accept, the returned response (handshake response + config
    /// payload) must be the first thing written to the connection. On
    /// reject the connection is to be closed without touching any state.
    pub fn on_new_handshake(
        &self,
        message: &Message,
        tx: MessageTx,
    ) -> Result<HandshakeAccept, GatewayError> {
        match message.kind {
            MessageKind::LauncherHandshake | MessageKind::FuncWorkerHandshake => {}
            kind => {
                return Err(GatewayError::InvalidHandshake {
                    details: format!("first message has kind {:?}", kind),
                });
            }
        }
        let func_id = message.func_id;
        if self.func_config.find_by_func_id(func_id).is_none() {
            return Err(GatewayError::UnknownFuncId { func_id });
        }

        let role = if message.kind == MessageKind::LauncherHandshake {
            let container_id = message.inline_data();
            if container_id.len() != CONTAINER_ID_LENGTH {
                return Err(GatewayError::InvalidHandshake {
                    details: format!(
                        "launcher handshake carries {} bytes of container ID (expected {})",
                        container_id.len(),
                        CONTAINER_ID_LENGTH
                    ),
                });
            }
            if let Some(monitor) = &self.monitor
                && container_id != INVALID_CONTAINER_ID
            {
                monitor
                    .on_new_func_container(func_id, &String::from_utf8_lossy(container_id));
            }
            let mut state = self.state.lock().unwrap();
            if state.launchers.contains_key(&func_id) {
                return Err(GatewayError::InvalidHandshake {
                    details: format!("func_id {} already has a launcher", func_id),
                });
            }
            state.launchers.insert(func_id, tx);
            info!(func_id, "launcher connected");
            HandshakeRole::Launcher
        } else {
            let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            let mut state = self.state.lock().unwrap();
            state.workers.insert(client_id, WorkerEndpoint { func_id, tx });
            info!(func_id, client_id, "function worker connected");
            HandshakeRole::FuncWorker { client_id }
        };

        let client_id = match role {
            HandshakeRole::FuncWorker { client_id } => client_id,
            HandshakeRole::Launcher => 0,
        };
        let config_bytes = self.func_config.raw_bytes().clone();
        let response = Outbound {
            message: Message::handshake_response(client_id, config_bytes.len()),
            payload: config_bytes,
        };
        Ok(HandshakeAccept {
            role,
            func_id,
            response,
        })
    }

    /// A launcher connection closed.
    pub fn on_launcher_disconnected(&self, func_id: u16) {
        let mut state = self.state.lock().unwrap();
        if state.launchers.remove(&func_id).is_some() {
            info!(func_id, "launcher disconnected");
        }
    }

    /// A function-worker connection closed.
    pub fn on_func_worker_disconnected(&self, client_id: u16) {
        let mut state = self.state.lock().unwrap();
        if state.workers.remove(&client_id).is_some() {
            info!(client_id, "function worker removed");
        }
    }

    /// Send a message to the worker identified by `client_id`.
    pub fn forward_to_worker(&self, client_id: u16, message: Message, payload: Bytes) {
        let state = self.state.lock().unwrap();
        let Some(endpoint) = state.workers.get(&client_id) else {
            warn!(client_id, "cannot forward message, worker is gone");
            return;
        };
        if endpoint.tx.send(Outbound { message, payload }).is_err() {
            warn!(client_id, "worker channel closed while forwarding");
        }
    }

    /// Number of connected function workers.
    pub fn worker_count(&self) -> usize {
        self.state.lock().unwrap().workers.len()
    }

    /// Whether a launcher is connected for `func_id`.
    pub fn has_launcher(&self, func_id: u16) -> bool {
        self.state.lock().unwrap().launchers.contains_key(&func_id)
    }
}
