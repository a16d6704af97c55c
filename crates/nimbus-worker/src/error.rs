// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the worker-side gateway connection.

use nimbus_protocol::{FuncConfigError, MessageError, ShmError};
use thiserror::Error;

/// Errors that can occur on a worker's gateway connection.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("function config error: {0}")]
    FuncConfig(#[from] FuncConfigError),

    #[error("gateway rejected the handshake")]
    HandshakeRejected,

    #[error("protocol violation: {0}")]
    Protocol(String),
}
