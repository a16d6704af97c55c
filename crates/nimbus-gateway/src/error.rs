// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the gateway.
//!
//! Request-path failures are surfaced to callers through the response sink
//! (status codes and bodies), so this enum covers the boundaries where an
//! error is handled by code instead: handshake validation, dispatch
//! refusal, shared-memory allocation.

use std::fmt;

/// Result type using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway errors that can occur during request or connection processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum GatewayError {
    /// No function with the given name is configured.
    UnknownFunction {
        /// The requested function name.
        name: String,
    },

    /// The gRPC service or method is not configured.
    UnknownGrpcMethod {
        /// The requested service name.
        service: String,
        /// The requested method name.
        method: String,
    },

    /// No worker could be assigned for the function.
    DispatchFailed {
        /// The function id that could not be dispatched.
        func_id: u16,
    },

    /// A shared-memory region could not be created.
    ShmAllocFailed {
        /// The region name.
        name: String,
        /// Error details.
        details: String,
    },

    /// A connection's first message was not an acceptable handshake.
    InvalidHandshake {
        /// What was wrong with it.
        details: String,
    },

    /// A message referenced a function id absent from the configuration.
    UnknownFuncId {
        /// The unknown function id.
        func_id: u16,
    },
}

impl GatewayError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownFunction { .. } => "UNKNOWN_FUNCTION",
            Self::UnknownGrpcMethod { .. } => "UNKNOWN_GRPC_METHOD",
            Self::DispatchFailed { .. } => "DISPATCH_FAILED",
            Self::ShmAllocFailed { .. } => "SHM_ALLOC_FAILED",
            Self::InvalidHandshake { .. } => "INVALID_HANDSHAKE",
            Self::UnknownFuncId { .. } => "UNKNOWN_FUNC_ID",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction { name } => {
                write!(f, "Function '{}' not found", name)
            }
            Self::UnknownGrpcMethod { service, method } => {
                write!(f, "gRPC method '{}/{}' not found", service, method)
            }
            Self::DispatchFailed { func_id } => {
                write!(f, "Dispatch failed for func_id {}", func_id)
            }
            Self::ShmAllocFailed { name, details } => {
                write!(f, "Failed to create shm region '{}': {}", name, details)
            }
            Self::InvalidHandshake { details } => {
                write!(f, "Invalid handshake: {}", details)
            }
            Self::UnknownFuncId { func_id } => {
                write!(f, "Unknown func_id {}", func_id)
            }
        }
    }
}

impl std::error::Error for GatewayError {}
