// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Worker - worker-side gateway connection
//!
//! Function runtimes and launchers use this crate to attach to a Nimbus
//! gateway:
//!
//! ```ignore
//! use nimbus_worker::GatewayConnection;
//!
//! let conn = GatewayConnection::connect_func_worker("/tmp/nimbus/gateway.sock", 1).await?;
//! conn.serve(|invocation| async move {
//!     Some(invocation.input) // echo
//! })
//! .await?;
//! ```
//!
//! [`GatewayConnection::serve`] implements the full invocation loop:
//! inline vs. shared-memory input resolution, handler timing, and the
//! output size policy for the completion reply. Lower-level access
//! ([`GatewayConnection::recv`] / [`GatewayConnection::send`] /
//! [`GatewayConnection::invoke`]) is available for workers that originate
//! calls of their own.

pub mod connection;
pub mod error;

pub use connection::{GatewayConnection, Invocation, build_completion, read_invocation};
pub use error::WorkerError;
