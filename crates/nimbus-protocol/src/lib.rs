// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Protocol - gateway/worker IPC layer
//!
//! This crate provides the wire protocol shared by the Nimbus gateway and
//! its worker processes:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     nimbus-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Control Messages: fixed-size records + inline data         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Oversize Payloads: named shared-memory regions             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: UNIX-domain stream socket                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection sequence
//!
//! 1. A launcher or function worker connects to the gateway socket.
//! 2. It sends a [`MessageKind::LauncherHandshake`] or
//!    [`MessageKind::FuncWorkerHandshake`].
//! 3. The gateway replies with a [`MessageKind::HandshakeResponse`] whose
//!    payload is the raw function-config document (see [`func_config`]),
//!    so every worker shares the gateway's exact view.
//! 4. Steady state: [`MessageKind::InvokeFunc`] /
//!    [`MessageKind::FuncCallComplete`] / [`MessageKind::FuncCallFailed`].
//!
//! # Payload channels
//!
//! Bodies up to [`INLINE_DATA_SIZE`] travel inline; larger bodies go
//! through shared-memory regions named `input:<full_call_id>` and
//! `output:<full_call_id>` (see [`shm`]).

pub mod func_config;
pub mod message;
pub mod shm;

pub use func_config::{FuncConfig, FuncConfigEntry, FuncConfigError, GRPC_FUNC_NAME_PREFIX};
pub use message::{
    CONTAINER_ID_LENGTH, FuncCall, HEADER_SIZE, INLINE_DATA_SIZE, INTERNAL_OUTPUT_INLINE_CAP,
    INVALID_CONTAINER_ID, INVALID_FUNC_CALL, MESSAGE_SIZE, Message, MessageError, MessageKind,
    PIPE_BUF, compute_message_delay, monotonic_micros, read_message, write_message,
};
pub use shm::{ShmError, ShmRegion, input_shm_name, output_shm_name};
