// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-call context for external invocations.
//!
//! An [`ExternalCallContext`] is created when a request is ingested and
//! lives until exactly one terminal `finish_*` operation has run. It owns
//! the shared-memory regions created for the call: the `input:` region
//! made before dispatch and the `output:` region opened after completion
//! are both unlinked when the context drops.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{error, warn};

use nimbus_protocol::{FuncCall, ShmRegion, input_shm_name, output_shm_name};

/// Reply delivered to an HTTP caller.
#[derive(Debug)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

/// gRPC status codes the gateway produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GrpcStatus {
    /// The call succeeded.
    Ok = 0,
    /// The function reported a failure.
    Unknown = 2,
    /// Unknown service or method.
    NotFound = 5,
    /// No worker could take the call.
    Unimplemented = 12,
}

/// Reply delivered to a gRPC caller.
#[derive(Debug)]
pub struct GrpcReply {
    /// gRPC status code.
    pub status: GrpcStatus,
    /// Response message bytes.
    pub body: Bytes,
}

/// The response sink of an external call. The set of variants is closed:
/// a call enters through exactly one of the two surfaces.
#[derive(Debug)]
pub enum ResponseSink {
    /// Reply channel of an HTTP request handler.
    Http(oneshot::Sender<HttpReply>),
    /// Reply channel of a gRPC call context.
    Grpc(oneshot::Sender<GrpcReply>),
}

/// Context of one external function call.
#[derive(Debug)]
pub struct ExternalCallContext {
    call: FuncCall,
    body: Bytes,
    sink: Mutex<Option<ResponseSink>>,
    input_region: Mutex<Option<ShmRegion>>,
    output_region: Mutex<Option<ShmRegion>>,
    inflight: Arc<AtomicUsize>,
}

impl ExternalCallContext {
    /// Create a context for an HTTP call. Counts as inflight until dropped.
    pub fn http(
        call: FuncCall,
        body: Bytes,
        reply: oneshot::Sender<HttpReply>,
        inflight: Arc<AtomicUsize>,
    ) -> Self {
        Self::new(call, body, ResponseSink::Http(reply), inflight)
    }

    /// Create a context for a gRPC call. Counts as inflight until dropped.
    pub fn grpc(
        call: FuncCall,
        body: Bytes,
        reply: oneshot::Sender<GrpcReply>,
        inflight: Arc<AtomicUsize>,
    ) -> Self {
        Self::new(call, body, ResponseSink::Grpc(reply), inflight)
    }

    fn new(call: FuncCall, body: Bytes, sink: ResponseSink, inflight: Arc<AtomicUsize>) -> Self {
        inflight.fetch_add(1, Ordering::Relaxed);
        Self {
            call,
            body,
            sink: Mutex::new(Some(sink)),
            input_region: Mutex::new(None),
            output_region: Mutex::new(None),
            inflight,
        }
    }

    /// The call identity.
    pub fn call(&self) -> FuncCall {
        self.call
    }

    /// Borrowed view of the request body.
    pub fn input(&self) -> &Bytes {
        &self.body
    }

    /// Create the `input:` region for this call and copy the body into it.
    ///
    /// On failure the call is finished with an error and `false` is
    /// returned; the context is then terminal.
    pub fn create_shm_input(&self) -> bool {
        let name = input_shm_name(self.call.full_call_id());
        let mut region = match ShmRegion::create(&name, self.body.len()) {
            Ok(region) => region,
            Err(e) => {
                error!(call = %self.call, error = %e, "failed to create input shm region");
                self.finish_with_error();
                return false;
            }
        };
        region.enable_remove_on_drop();
        if !self.body.is_empty() {
            region.as_mut_slice().copy_from_slice(&self.body);
        }
        *self.input_region.lock().unwrap() = Some(region);
        true
    }

    /// Finish successfully with an inline output.
    pub fn finish_with_output(&self, output: &[u8]) {
        self.finish(ReplyKind::Success(Bytes::copy_from_slice(output)));
    }

    /// Finish successfully with the output read from the call's `output:`
    /// region, taking ownership of the region for unlink-on-drop.
    pub fn finish_with_shm_output(&self) {
        let name = output_shm_name(self.call.full_call_id());
        let mut region = match ShmRegion::open(&name) {
            Ok(region) => region,
            Err(e) => {
                error!(call = %self.call, error = %e, "failed to open output shm region");
                self.finish_with_error();
                return;
            }
        };
        region.enable_remove_on_drop();
        let output = Bytes::copy_from_slice(region.as_slice());
        *self.output_region.lock().unwrap() = Some(region);
        self.finish(ReplyKind::Success(output));
    }

    /// Finish with a function error (HTTP 500 / gRPC `Unknown`).
    pub fn finish_with_error(&self) {
        self.finish(ReplyKind::Error);
    }

    /// Finish with a dispatch failure (HTTP 404 / gRPC `Unimplemented`).
    pub fn finish_with_dispatch_failure(&self) {
        self.finish(ReplyKind::DispatchFailure);
    }

    fn finish(&self, kind: ReplyKind) {
        let sink = self
            .sink
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("call {} finished twice", self.call));
        let delivered = match sink {
            ResponseSink::Http(reply) => reply.send(kind.into_http(self.call)).is_ok(),
            ResponseSink::Grpc(reply) => reply.send(kind.into_grpc()).is_ok(),
        };
        if !delivered {
            // Caller went away; the call still terminates normally.
            warn!(call = %self.call, "caller disconnected before the reply");
        }
    }
}

impl Drop for ExternalCallContext {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

enum ReplyKind {
    Success(Bytes),
    Error,
    DispatchFailure,
}

impl ReplyKind {
    fn into_http(self, call: FuncCall) -> HttpReply {
        match self {
            ReplyKind::Success(body) => HttpReply { status: 200, body },
            ReplyKind::Error => HttpReply {
                status: 500,
                body: Bytes::from_static(b"Function call failed\n"),
            },
            ReplyKind::DispatchFailure => HttpReply {
                status: 404,
                body: Bytes::from(format!("Dispatch failed for func_id {}\n", call.func_id)),
            },
        }
    }

    fn into_grpc(self) -> GrpcReply {
        match self {
            ReplyKind::Success(body) => GrpcReply {
                status: GrpcStatus::Ok,
                body,
            },
            ReplyKind::Error => GrpcReply {
                status: GrpcStatus::Unknown,
                body: Bytes::new(),
            },
            ReplyKind::DispatchFailure => GrpcReply {
                status: GrpcStatus::Unimplemented,
                body: Bytes::new(),
            },
        }
    }
}
