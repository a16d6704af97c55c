// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only function configuration.
//!
//! The configuration is a JSON array of entries:
//!
//! ```json
//! [
//!   { "funcName": "echo", "funcId": 1 },
//!   { "funcName": "grpc:Greeter", "funcId": 2, "grpcMethods": ["SayHello"] }
//! ]
//! ```
//!
//! gRPC services are named `grpc:<service>`; their method ids are assigned
//! from the `grpcMethods` list order, starting at 1. The raw document
//! bytes are retained verbatim so the gateway can hand every worker the
//! identical view in its handshake response.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

/// Prefix naming gRPC service entries.
pub const GRPC_FUNC_NAME_PREFIX: &str = "grpc:";

/// Errors from loading a function-config document.
#[derive(Debug, Error)]
pub enum FuncConfigError {
    #[error("config document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid func_id {0} (must be nonzero)")]
    InvalidFuncId(u16),

    #[error("duplicate func_id {0}")]
    DuplicateFuncId(u16),

    #[error("duplicate function name '{0}'")]
    DuplicateFuncName(String),

    #[error("function '{0}' declares gRPC methods but is not named grpc:<service>")]
    UnexpectedGrpcMethods(String),

    #[error("function '{name}' declares {count} gRPC methods (max: 255)")]
    TooManyGrpcMethods { name: String, count: usize },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEntry {
    func_name: String,
    func_id: u16,
    #[serde(default)]
    grpc_methods: Vec<String>,
}

/// A single function entry.
#[derive(Debug)]
pub struct FuncConfigEntry {
    func_name: String,
    func_id: u16,
    grpc_method_ids: HashMap<String, u8>,
}

impl FuncConfigEntry {
    /// Function name as it appears in the document.
    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    /// Numeric function id.
    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Whether this entry is a gRPC service.
    pub fn is_grpc_service(&self) -> bool {
        self.func_name.starts_with(GRPC_FUNC_NAME_PREFIX)
    }

    /// Method id for a gRPC method name, if known.
    pub fn grpc_method_id(&self, method: &str) -> Option<u8> {
        self.grpc_method_ids.get(method).copied()
    }
}

/// The loaded, read-only function configuration.
#[derive(Debug)]
pub struct FuncConfig {
    entries: Vec<FuncConfigEntry>,
    by_id: HashMap<u16, usize>,
    by_name: HashMap<String, usize>,
    raw: Bytes,
}

impl FuncConfig {
    /// Parse and validate a config document.
    pub fn load(raw: impl Into<Bytes>) -> Result<Self, FuncConfigError> {
        let raw = raw.into();
        let raw_entries: Vec<RawEntry> = serde_json::from_slice(&raw)?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for raw_entry in raw_entries {
            if raw_entry.func_id == 0 {
                return Err(FuncConfigError::InvalidFuncId(raw_entry.func_id));
            }
            let is_grpc = raw_entry.func_name.starts_with(GRPC_FUNC_NAME_PREFIX);
            if !raw_entry.grpc_methods.is_empty() && !is_grpc {
                return Err(FuncConfigError::UnexpectedGrpcMethods(raw_entry.func_name));
            }
            if raw_entry.grpc_methods.len() > usize::from(u8::MAX) {
                return Err(FuncConfigError::TooManyGrpcMethods {
                    name: raw_entry.func_name,
                    count: raw_entry.grpc_methods.len(),
                });
            }
            let grpc_method_ids = raw_entry
                .grpc_methods
                .iter()
                .enumerate()
                .map(|(i, method)| (method.clone(), (i + 1) as u8))
                .collect();
            let index = entries.len();
            if by_id.insert(raw_entry.func_id, index).is_some() {
                return Err(FuncConfigError::DuplicateFuncId(raw_entry.func_id));
            }
            if by_name
                .insert(raw_entry.func_name.clone(), index)
                .is_some()
            {
                return Err(FuncConfigError::DuplicateFuncName(raw_entry.func_name));
            }
            entries.push(FuncConfigEntry {
                func_name: raw_entry.func_name,
                func_id: raw_entry.func_id,
                grpc_method_ids,
            });
        }

        Ok(Self {
            entries,
            by_id,
            by_name,
            raw,
        })
    }

    /// Look up an entry by function id.
    pub fn find_by_func_id(&self, func_id: u16) -> Option<&FuncConfigEntry> {
        self.by_id.get(&func_id).map(|&i| &self.entries[i])
    }

    /// Look up an entry by function name.
    pub fn find_by_func_name(&self, func_name: &str) -> Option<&FuncConfigEntry> {
        self.by_name.get(func_name).map(|&i| &self.entries[i])
    }

    /// Number of configured functions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the configuration is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The verbatim document bytes, as shared with workers.
    pub fn raw_bytes(&self) -> &Bytes {
        &self.raw
    }
}
