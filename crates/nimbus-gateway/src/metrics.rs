// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway metrics.
//!
//! Instruments are registered on the global meter provider; embedders pick
//! the exporter. Samples are recorded in the same critical section as the
//! state transition they describe, so readings are consistent with the
//! engine's view.

use opentelemetry::metrics::{Counter, Histogram};

/// Instruments for the invocation lifecycle engine.
#[derive(Debug)]
pub struct GatewayMetrics {
    /// External requests accepted by the HTTP/gRPC surface.
    pub incoming_external_requests: Counter<u64>,
    /// Instantaneous request rate sampled from inter-arrival gaps.
    pub external_requests_instant_rps: Histogram<f64>,
    /// Live external-call contexts at admission time.
    pub inflight_external_requests: Histogram<u64>,
    /// Depth of the admission queue when a call is parked.
    pub pending_external_requests: Histogram<u64>,
    /// Wire delay of worker messages in microseconds.
    pub message_delay: Histogram<u64>,
    /// Inputs routed through shared memory.
    pub input_use_shm: Counter<u64>,
    /// Outputs routed through shared memory.
    pub output_use_shm: Counter<u64>,
    /// Calls given up on (worker loss).
    pub discarded_func_call: Counter<u64>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    /// Register the gateway's instruments on the global meter provider.
    pub fn new() -> GatewayMetrics {
        let meter = opentelemetry::global::meter("nimbus-gateway");
        let incoming_external_requests = meter
            .u64_counter("incoming_external_requests")
            .with_description("number of external function-invocation requests")
            .build();
        let external_requests_instant_rps = meter
            .f64_histogram("external_requests_instant_rps")
            .with_description("instantaneous external request rate")
            .build();
        let inflight_external_requests = meter
            .u64_histogram("inflight_external_requests")
            .with_description("inflight external requests sampled at admission")
            .build();
        let pending_external_requests = meter
            .u64_histogram("pending_external_requests")
            .with_description("admission-queue depth sampled when a request is parked")
            .build();
        let message_delay = meter
            .u64_histogram("message_delay")
            .with_unit("us")
            .with_description("delay of worker messages on the IPC channel")
            .build();
        let input_use_shm = meter
            .u64_counter("input_use_shm")
            .with_description("function inputs passed through shared memory")
            .build();
        let output_use_shm = meter
            .u64_counter("output_use_shm")
            .with_description("function outputs passed through shared memory")
            .build();
        let discarded_func_call = meter
            .u64_counter("discarded_func_call")
            .with_description("function calls discarded after worker loss")
            .build();
        GatewayMetrics {
            incoming_external_requests,
            external_requests_instant_rps,
            inflight_external_requests,
            pending_external_requests,
            message_delay,
            input_use_shm,
            output_use_shm,
            discarded_func_call,
        }
    }
}
