// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Gateway - FaaS invocation gateway
//!
//! This crate implements the gateway of the Nimbus FaaS platform: the
//! invocation lifecycle engine, per-function dispatch to worker
//! processes, and the external HTTP surface.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                             │
//! │                      (HTTP, gRPC call contexts)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//!                │ POST /function/<name>
//!                ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        nimbus-gateway                                │
//! │                                                                      │
//! │   HTTP surface ──► Engine ──► Dispatcher (per func_id)               │
//! │                      │              │                                │
//! │                      │              ▼                                │
//! │                 WorkerRegistry ◄── IPC server (UNIX socket)          │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                      │ control messages
//!                                      │ + shm regions for big payloads
//!                                      ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │              Launchers and Function Workers                          │
//! │                   (using nimbus-worker)                              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invocation lifecycle
//!
//! | Step | What happens |
//! |------|--------------|
//! | ingest | a call context is created and counted inflight |
//! | admit | below the cap it enters `running`, else the FIFO queue |
//! | dispatch | the function's dispatcher picks an idle worker |
//! | await | the call sits in `running` keyed by its 64-bit id |
//! | settle | a completion/failure message finishes the context |
//! | discard | worker loss surfaces parked calls as dispatch failures |
//!
//! Admission is strictly FIFO: one parked call is promoted per
//! completion, and a catch-up pass after worker churn promotes up to the
//! cap.
//!
//! # Payload channels
//!
//! Inputs and outputs up to the protocol's inline capacity travel inside
//! control messages; larger payloads go through named shared-memory
//! regions owned by the call context and unlinked with it. Outputs of
//! worker-originated calls are relayed over the originator's connection
//! while they fit an atomic pipe write.
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`context`]: Per-call context and the HTTP/gRPC response sink
//! - [`dispatcher`]: Per-function worker selection and accounting
//! - [`engine`]: Admission, dispatch, settlement and discard handling
//! - [`error`]: Error types with stable error codes
//! - [`http`]: axum routes for the external surface
//! - [`ipc`]: UNIX-socket server for worker connections
//! - [`metrics`]: OpenTelemetry instruments
//! - [`registry`]: Launcher/worker endpoint registry and handshakes
//! - [`runtime`]: Embeddable assembly of all of the above

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// Per-call context for external invocations.
pub mod context;

/// Per-function dispatch of invocations to workers.
pub mod dispatcher;

/// The invocation lifecycle engine.
pub mod engine;

/// Gateway error types with stable error codes.
pub mod error;

/// HTTP surface of the gateway.
pub mod http;

/// UNIX-domain socket server for worker and launcher connections.
pub mod ipc;

/// Gateway metrics.
pub mod metrics;

/// Registry of launcher and function-worker endpoints.
pub mod registry;

/// Embeddable gateway runtime.
pub mod runtime;
