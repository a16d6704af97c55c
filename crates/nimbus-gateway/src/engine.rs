// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The invocation lifecycle engine.
//!
//! One engine instance owns all dispatch state: the set of running
//! external calls, the admission queue, the per-function dispatchers and
//! the discard list. Everything lives behind a single mutex that is held
//! only for map surgery; dispatching, response-sink operations and IPC
//! writes all happen outside the critical section on contexts captured
//! under it. Contexts are `Arc`-shared, so a pointer captured under the
//! lock stays valid after release regardless of who erases the map entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use nimbus_protocol::{
    FuncCall, FuncConfig, GRPC_FUNC_NAME_PREFIX, INLINE_DATA_SIZE, INVALID_FUNC_CALL, Message,
    MessageKind, PIPE_BUF, compute_message_delay, monotonic_micros,
};

use crate::context::{ExternalCallContext, GrpcReply, GrpcStatus, HttpReply};
use crate::dispatcher::{CallInput, Dispatcher};
use crate::ipc::MessageTx;
use crate::metrics::GatewayMetrics;
use crate::registry::WorkerRegistry;

struct EngineState {
    running: HashMap<u64, Arc<ExternalCallContext>>,
    pending: VecDeque<Arc<ExternalCallContext>>,
    discarded: Vec<FuncCall>,
    dispatchers: HashMap<u16, Arc<Dispatcher>>,
    last_external_request_at: Option<i64>,
}

/// The invocation lifecycle engine.
pub struct Engine {
    func_config: Arc<FuncConfig>,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<GatewayMetrics>,
    max_running_external_requests: usize,
    next_call_id: AtomicU32,
    inflight_external_requests: Arc<AtomicUsize>,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Create an engine over the loaded configuration and registry.
    pub fn new(
        func_config: Arc<FuncConfig>,
        registry: Arc<WorkerRegistry>,
        metrics: Arc<GatewayMetrics>,
        max_running_external_requests: usize,
    ) -> Self {
        if max_running_external_requests > 0 {
            info!(max_running_external_requests, "external concurrency cap set");
        }
        Self {
            func_config,
            registry,
            metrics,
            max_running_external_requests,
            next_call_id: AtomicU32::new(1),
            inflight_external_requests: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(EngineState {
                running: HashMap::new(),
                pending: VecDeque::new(),
                discarded: Vec::new(),
                dispatchers: HashMap::new(),
                last_external_request_at: None,
            }),
        }
    }

    /// Ingest an external HTTP call for a known function id.
    pub fn new_http_func_call(
        &self,
        func_id: u16,
        body: Bytes,
        reply: oneshot::Sender<HttpReply>,
    ) {
        let call = FuncCall::new(func_id, 0, self.alloc_call_id());
        let ctx = ExternalCallContext::http(
            call,
            body,
            reply,
            self.inflight_external_requests.clone(),
        );
        self.new_external_func_call(ctx);
    }

    /// Ingest an external gRPC call.
    ///
    /// The service is looked up as `grpc:<service>`; unknown services and
    /// methods are rejected with `NotFound` before any state is created.
    pub fn new_grpc_func_call(
        &self,
        service: &str,
        method: &str,
        body: Bytes,
        reply: oneshot::Sender<GrpcReply>,
    ) {
        let func_name = format!("{}{}", GRPC_FUNC_NAME_PREFIX, service);
        let method_id = self
            .func_config
            .find_by_func_name(&func_name)
            .and_then(|entry| entry.grpc_method_id(method).map(|id| (entry.func_id(), id)));
        let Some((func_id, method_id)) = method_id else {
            let _ = reply.send(GrpcReply {
                status: GrpcStatus::NotFound,
                body: Bytes::new(),
            });
            return;
        };
        let call = FuncCall::with_method(func_id, method_id, 0, self.alloc_call_id());
        let ctx = ExternalCallContext::grpc(
            call,
            body,
            reply,
            self.inflight_external_requests.clone(),
        );
        self.new_external_func_call(ctx);
    }

    fn alloc_call_id(&self) -> u32 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Admit an external call: run it immediately when below the cap,
    /// otherwise park it in the FIFO admission queue.
    fn new_external_func_call(&self, ctx: ExternalCallContext) {
        let ctx = Arc::new(ctx);
        let mut to_dispatch = None;
        {
            let mut state = self.state.lock().unwrap();
            self.metrics.incoming_external_requests.add(1, &[]);
            let now = monotonic_micros();
            if let Some(last) = state.last_external_request_at
                && now > last
            {
                self.metrics
                    .external_requests_instant_rps
                    .record(1e6 / (now - last) as f64, &[]);
            }
            state.last_external_request_at = Some(now);
            self.metrics.inflight_external_requests.record(
                self.inflight_external_requests.load(Ordering::Relaxed) as u64,
                &[],
            );
            if self.below_cap(state.running.len()) {
                state
                    .running
                    .insert(ctx.call().full_call_id(), ctx.clone());
                to_dispatch = Some(ctx.clone());
            } else {
                state.pending.push_back(ctx.clone());
                self.metrics
                    .pending_external_requests
                    .record(state.pending.len() as u64, &[]);
            }
        }
        if let Some(ctx) = to_dispatch
            && !self.dispatch(&ctx)
        {
            self.evict_running(&ctx);
        }
    }

    fn below_cap(&self, running: usize) -> bool {
        self.max_running_external_requests == 0 || running < self.max_running_external_requests
    }

    fn evict_running(&self, ctx: &Arc<ExternalCallContext>) {
        error!(call = %ctx.call(), "dispatch failed, evicting from running set");
        let mut state = self.state.lock().unwrap();
        state.running.remove(&ctx.call().full_call_id());
    }

    /// Dispatch an external call to its function's dispatcher.
    ///
    /// Returns false when the call could not be handed to a worker; the
    /// context has then already been finished (dispatch failure, or error
    /// when the input region could not be created).
    fn dispatch(&self, ctx: &Arc<ExternalCallContext>) -> bool {
        let call = ctx.call();
        let input_size = ctx.input().len();
        let use_shm = input_size > INLINE_DATA_SIZE;
        if use_shm && !ctx.create_shm_input() {
            return false;
        }
        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            if use_shm {
                self.metrics.input_use_shm.add(1, &[]);
            }
            self.get_or_create_dispatcher_locked(&mut state, call.func_id)
        };
        let Some(dispatcher) = dispatcher else {
            ctx.finish_with_dispatch_failure();
            return false;
        };
        let input = if use_shm {
            CallInput::Shm { size: input_size }
        } else {
            CallInput::Inline(ctx.input().clone())
        };
        let accepted = dispatcher.on_new_func_call(call, INVALID_FUNC_CALL, input);
        if !accepted {
            ctx.finish_with_dispatch_failure();
        }
        accepted
    }

    /// A dispatcher exists only for function ids the configuration knows.
    fn get_or_create_dispatcher_locked(
        &self,
        state: &mut EngineState,
        func_id: u16,
    ) -> Option<Arc<Dispatcher>> {
        if let Some(dispatcher) = state.dispatchers.get(&func_id) {
            return Some(dispatcher.clone());
        }
        if self.func_config.find_by_func_id(func_id).is_none() {
            return None;
        }
        let dispatcher = Arc::new(Dispatcher::new(func_id));
        state.dispatchers.insert(func_id, dispatcher.clone());
        Some(dispatcher)
    }

    /// Handle a steady-state message from a worker connection.
    ///
    /// `payload` carries the bytes that trailed the record on the stream
    /// (internal-call outputs relayed through the gateway).
    pub fn on_recv_message(&self, message: &Message, payload: Bytes) {
        let message_delay = compute_message_delay(message);
        match message.kind {
            MessageKind::InvokeFunc => {
                self.on_invoke_func_message(message, message_delay);
            }
            MessageKind::FuncCallComplete | MessageKind::FuncCallFailed => {
                self.on_func_call_settled_message(message, payload, message_delay);
            }
            kind => {
                error!(?kind, "unexpected message kind on worker connection");
            }
        }
        self.process_discarded();
    }

    /// A worker originated an invocation of a sibling function.
    fn on_invoke_func_message(&self, message: &Message, message_delay: i32) {
        let call = message.func_call();
        let parent = FuncCall::from_full_call_id(message.parent_call_id);
        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            if message.payload_size < 0 {
                self.metrics.input_use_shm.add(1, &[]);
            }
            if message_delay >= 0 {
                self.metrics.message_delay.record(message_delay as u64, &[]);
            }
            self.get_or_create_dispatcher_locked(&mut state, call.func_id)
        };
        let accepted = match dispatcher {
            Some(dispatcher) => {
                let input = if message.payload_size < 0 {
                    CallInput::Shm {
                        size: (-message.payload_size) as usize,
                    }
                } else {
                    CallInput::Inline(Bytes::copy_from_slice(message.inline_data()))
                };
                dispatcher.on_new_func_call(call, parent, input)
            }
            None => false,
        };
        if !accepted {
            // The originator applies its own timeout; no synthetic reply.
            error!(call = %call, "dispatch failed for worker-originated call");
        }
    }

    /// A worker reported a call as completed or failed.
    fn on_func_call_settled_message(&self, message: &Message, payload: Bytes, message_delay: i32) {
        let call = message.func_call();
        let completed = message.kind == MessageKind::FuncCallComplete;
        let mut finished_ctx = None;
        let mut promoted = None;
        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            if message_delay >= 0 {
                self.metrics.message_delay.record(message_delay as u64, &[]);
            }
            if completed && output_used_shm(call, message.payload_size) {
                self.metrics.output_use_shm.add(1, &[]);
            }
            if call.is_external() {
                if let Some(ctx) = state.running.remove(&call.full_call_id()) {
                    finished_ctx = Some(ctx);
                    // At most one pending call is promoted per completion;
                    // catch-up promotion happens in process_discarded.
                    if !state.pending.is_empty() && self.below_cap(state.running.len()) {
                        let next = state.pending.pop_front().unwrap();
                        state
                            .running
                            .insert(next.call().full_call_id(), next.clone());
                        promoted = Some(next);
                    }
                }
            }
            self.get_or_create_dispatcher_locked(&mut state, call.func_id)
        };

        if let Some(dispatcher) = dispatcher {
            if completed {
                dispatcher.on_func_call_completed(
                    call,
                    message.processing_time,
                    message.dispatch_delay,
                    message.payload_size.unsigned_abs() as usize,
                );
            } else {
                dispatcher.on_func_call_failed(call, message.dispatch_delay);
            }
        }

        if call.is_external() {
            match finished_ctx {
                Some(ctx) => {
                    if !completed {
                        ctx.finish_with_error();
                    } else if message.payload_size < 0 {
                        ctx.finish_with_shm_output();
                    } else {
                        ctx.finish_with_output(message.inline_data());
                    }
                }
                None => {
                    error!(call = %call, "cannot find external call for settlement");
                }
            }
        } else {
            // Reply to a worker-originated call: relay it to the
            // originator over its own gateway connection.
            self.registry
                .forward_to_worker(call.client_id, message.clone(), payload);
        }

        if let Some(ctx) = promoted
            && !self.dispatch(&ctx)
        {
            self.evict_running(&ctx);
        }
    }

    /// A function worker finished its handshake.
    pub fn on_worker_connected(&self, func_id: u16, client_id: u16, tx: MessageTx) {
        let dispatcher = {
            let mut state = self.state.lock().unwrap();
            self.get_or_create_dispatcher_locked(&mut state, func_id)
        };
        match dispatcher {
            Some(dispatcher) => dispatcher.on_worker_connected(client_id, tx),
            // Unreachable for handshaked workers; the registry validated the id.
            None => warn!(func_id, client_id, "worker connected for unknown func_id"),
        }
        // A new worker may unblock queued dispatches and parked admissions.
        self.process_discarded();
    }

    /// A function worker's connection closed; its outstanding calls are
    /// discarded and surfaced as dispatch failures or failure replies.
    pub fn on_worker_disconnected(&self, func_id: u16, client_id: u16) {
        let dispatcher = {
            let state = self.state.lock().unwrap();
            state.dispatchers.get(&func_id).cloned()
        };
        let Some(dispatcher) = dispatcher else {
            return;
        };
        for call in dispatcher.on_worker_disconnected(client_id) {
            self.discard_func_call(call);
        }
        self.process_discarded();
    }

    /// Record a call the gateway is giving up on.
    pub fn discard_func_call(&self, call: FuncCall) {
        let mut state = self.state.lock().unwrap();
        state.discarded.push(call);
        self.metrics.discarded_func_call.add(1, &[]);
    }

    /// Drain the discard list and top the running set back up.
    ///
    /// External discarded calls still present in `running` are evicted and
    /// finished with a dispatch failure; internal ones get a synthesized
    /// failure reply relayed to their originator. Afterwards pending calls
    /// are promoted up to the cap (several at once, unlike the
    /// one-per-completion steady state).
    pub fn process_discarded(&self) {
        let mut discarded_external = Vec::new();
        let mut discarded_internal = Vec::new();
        let mut to_dispatch = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let discarded = std::mem::take(&mut state.discarded);
            for call in discarded {
                if call.is_external() {
                    if let Some(ctx) = state.running.remove(&call.full_call_id()) {
                        discarded_external.push(ctx);
                    }
                } else {
                    discarded_internal.push(call);
                }
            }
            while !state.pending.is_empty() && self.below_cap(state.running.len()) {
                let ctx = state.pending.pop_front().unwrap();
                state
                    .running
                    .insert(ctx.call().full_call_id(), ctx.clone());
                to_dispatch.push(ctx);
            }
        }

        for ctx in discarded_external {
            ctx.finish_with_dispatch_failure();
        }
        for call in discarded_internal {
            self.registry.forward_to_worker(
                call.client_id,
                Message::func_call_failed(call, 0),
                Bytes::new(),
            );
        }
        for ctx in to_dispatch {
            if !self.dispatch(&ctx) {
                self.evict_running(&ctx);
            }
        }
    }

    /// Number of currently running external calls.
    pub fn running_len(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    /// Depth of the admission queue.
    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Live external-call contexts (running + pending).
    pub fn inflight_external_requests(&self) -> usize {
        self.inflight_external_requests.load(Ordering::Relaxed)
    }

    /// Whether a dispatcher has been created for `func_id`.
    pub fn has_dispatcher(&self, func_id: u16) -> bool {
        self.state.lock().unwrap().dispatchers.contains_key(&func_id)
    }
}

/// Whether a completion's output travelled through shared memory.
///
/// External outputs mark it with a negated size; worker-originated outputs
/// always report a positive size and overflow to shared memory past the
/// channel-relay cap.
fn output_used_shm(call: FuncCall, payload_size: i32) -> bool {
    if call.is_external() {
        payload_size < 0
    } else {
        payload_size.max(0) as usize + size_of::<i32>() > PIPE_BUF
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Outbound;
    use tokio::sync::mpsc;

    const CONFIG: &str = r#"[
        { "funcName": "echo", "funcId": 1 },
        { "funcName": "other", "funcId": 2 },
        { "funcName": "grpc:Greeter", "funcId": 3, "grpcMethods": ["SayHello"] }
    ]"#;

    struct TestEngine {
        engine: Engine,
        registry: Arc<WorkerRegistry>,
    }

    fn test_engine(cap: usize) -> TestEngine {
        let func_config = Arc::new(FuncConfig::load(CONFIG.as_bytes().to_vec()).unwrap());
        let registry = Arc::new(WorkerRegistry::new(func_config.clone(), None));
        let engine = Engine::new(
            func_config,
            registry.clone(),
            Arc::new(GatewayMetrics::new()),
            cap,
        );
        TestEngine { engine, registry }
    }

    /// Attach a fake worker and return its outbound message stream.
    fn attach_worker(
        harness: &TestEngine,
        func_id: u16,
    ) -> (u16, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let accept = harness
            .registry
            .on_new_handshake(&Message::func_worker_handshake(func_id), tx.clone())
            .unwrap();
        let crate::registry::HandshakeRole::FuncWorker { client_id } = accept.role else {
            panic!("expected func worker role");
        };
        harness.engine.on_worker_connected(func_id, client_id, tx);
        (client_id, rx)
    }

    fn http_call(
        engine: &Engine,
        func_id: u16,
        body: &[u8],
    ) -> oneshot::Receiver<HttpReply> {
        let (tx, rx) = oneshot::channel();
        engine.new_http_func_call(func_id, Bytes::copy_from_slice(body), tx);
        rx
    }

    fn complete(engine: &Engine, invoke: &Message, output: &[u8]) {
        let mut reply = Message::func_call_complete(invoke.func_call(), 100, 1);
        reply.set_inline_data(output).unwrap();
        engine.on_recv_message(&reply, Bytes::new());
    }

    #[tokio::test]
    async fn test_round_trip_through_fake_worker() {
        let harness = test_engine(0);
        let (_client_id, mut worker_rx) = attach_worker(&harness, 1);

        let reply_rx = http_call(&harness.engine, 1, b"hi");
        let invoke = worker_rx.recv().await.unwrap().message;
        assert_eq!(invoke.kind, MessageKind::InvokeFunc);
        assert_eq!(invoke.inline_data(), b"hi");
        assert_eq!(harness.engine.running_len(), 1);

        complete(&harness.engine, &invoke, b"hi back");
        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body.as_ref(), b"hi back");
        assert_eq!(harness.engine.running_len(), 0);
        assert_eq!(harness.engine.inflight_external_requests(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_without_worker() {
        let harness = test_engine(0);
        let reply = http_call(&harness.engine, 1, b"x").await.unwrap();
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body.as_ref(), b"Dispatch failed for func_id 1\n");
        assert_eq!(harness.engine.running_len(), 0);
        assert_eq!(harness.engine.inflight_external_requests(), 0);
    }

    #[tokio::test]
    async fn test_function_failure_maps_to_error() {
        let harness = test_engine(0);
        let (_client_id, mut worker_rx) = attach_worker(&harness, 1);

        let reply_rx = http_call(&harness.engine, 1, b"x");
        let invoke = worker_rx.recv().await.unwrap().message;
        let failed = Message::func_call_failed(invoke.func_call(), 3);
        harness.engine.on_recv_message(&failed, Bytes::new());

        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.status, 500);
        assert_eq!(reply.body.as_ref(), b"Function call failed\n");
    }

    #[tokio::test]
    async fn test_admission_cap_and_fifo_promotion() {
        let harness = test_engine(2);
        let (_client_id, mut worker_rx) = attach_worker(&harness, 1);

        let rx1 = http_call(&harness.engine, 1, b"r1");
        let rx2 = http_call(&harness.engine, 1, b"r2");
        let rx3 = http_call(&harness.engine, 1, b"r3");
        assert_eq!(harness.engine.running_len(), 2);
        assert_eq!(harness.engine.pending_len(), 1);
        assert_eq!(harness.engine.inflight_external_requests(), 3);

        // The single worker serializes the calls; settle them in order.
        let invoke1 = worker_rx.recv().await.unwrap().message;
        complete(&harness.engine, &invoke1, b"one");
        assert_eq!(rx1.await.unwrap().body.as_ref(), b"one");
        // r1's completion promoted r3 into the running set.
        assert_eq!(harness.engine.running_len(), 2);
        assert_eq!(harness.engine.pending_len(), 0);

        let invoke2 = worker_rx.recv().await.unwrap().message;
        complete(&harness.engine, &invoke2, b"two");
        assert_eq!(rx2.await.unwrap().body.as_ref(), b"two");

        let invoke3 = worker_rx.recv().await.unwrap().message;
        assert_eq!(invoke3.inline_data(), b"r3");
        complete(&harness.engine, &invoke3, b"three");
        assert_eq!(rx3.await.unwrap().body.as_ref(), b"three");
        assert_eq!(harness.engine.inflight_external_requests(), 0);
    }

    #[tokio::test]
    async fn test_worker_loss_discards_outstanding_call() {
        let harness = test_engine(0);
        let (client_id, mut worker_rx) = attach_worker(&harness, 1);

        let reply_rx = http_call(&harness.engine, 1, b"x");
        let _invoke = worker_rx.recv().await.unwrap();
        assert_eq!(harness.engine.running_len(), 1);

        harness.registry.on_func_worker_disconnected(client_id);
        harness.engine.on_worker_disconnected(1, client_id);

        let reply = reply_rx.await.unwrap();
        assert_eq!(reply.status, 404);
        assert_eq!(harness.engine.running_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_func_id_on_wire_creates_no_state() {
        let harness = test_engine(0);
        let mut invoke = Message::invoke_func(FuncCall::new(99, 5, 1), INVALID_FUNC_CALL);
        invoke.set_inline_data(b"ignored").unwrap();
        harness.engine.on_recv_message(&invoke, Bytes::new());
        assert!(!harness.engine.has_dispatcher(99));
        assert_eq!(harness.engine.running_len(), 0);
    }

    #[tokio::test]
    async fn test_worker_originated_call_and_reply_forwarding() {
        let harness = test_engine(0);
        // Worker A (func 2) originates a call of func 1, served by worker B.
        let (client_a, mut rx_a) = attach_worker(&harness, 2);
        let (_client_b, mut rx_b) = attach_worker(&harness, 1);

        let call = FuncCall::new(1, client_a, 77);
        let mut invoke = Message::invoke_func(call, FuncCall::new(2, 0, 5));
        invoke.set_inline_data(b"internal input").unwrap();
        harness.engine.on_recv_message(&invoke, Bytes::new());

        let delivered = rx_b.recv().await.unwrap().message;
        assert_eq!(delivered.func_call(), call);
        assert_eq!(delivered.inline_data(), b"internal input");

        // Worker B completes; the reply is relayed to worker A.
        let mut reply = Message::func_call_complete(call, 50, 1);
        reply.set_inline_data(b"internal output").unwrap();
        harness.engine.on_recv_message(&reply, Bytes::new());

        let relayed = rx_a.recv().await.unwrap();
        assert_eq!(relayed.message.kind, MessageKind::FuncCallComplete);
        assert_eq!(relayed.message.func_call(), call);
        assert_eq!(relayed.message.inline_data(), b"internal output");
        // Internal settlements never touch the external running set.
        assert_eq!(harness.engine.running_len(), 0);
    }

    #[tokio::test]
    async fn test_internal_discard_synthesizes_failure_reply() {
        let harness = test_engine(0);
        let (client_a, mut rx_a) = attach_worker(&harness, 2);
        let (client_b, mut rx_b) = attach_worker(&harness, 1);

        let call = FuncCall::new(1, client_a, 78);
        harness.engine.on_recv_message(
            &Message::invoke_func(call, INVALID_FUNC_CALL),
            Bytes::new(),
        );
        let _delivered = rx_b.recv().await.unwrap();

        // Worker B dies before replying.
        harness.registry.on_func_worker_disconnected(client_b);
        harness.engine.on_worker_disconnected(1, client_b);

        let relayed = rx_a.recv().await.unwrap();
        assert_eq!(relayed.message.kind, MessageKind::FuncCallFailed);
        assert_eq!(relayed.message.func_call(), call);
    }

    #[tokio::test]
    async fn test_grpc_unknown_service_and_method() {
        let harness = test_engine(0);

        let (tx, rx) = oneshot::channel();
        harness
            .engine
            .new_grpc_func_call("Nope", "SayHello", Bytes::new(), tx);
        assert_eq!(rx.await.unwrap().status, GrpcStatus::NotFound);

        let (tx, rx) = oneshot::channel();
        harness
            .engine
            .new_grpc_func_call("Greeter", "Nope", Bytes::new(), tx);
        assert_eq!(rx.await.unwrap().status, GrpcStatus::NotFound);
        assert_eq!(harness.engine.inflight_external_requests(), 0);
    }

    #[tokio::test]
    async fn test_grpc_dispatch_failure_maps_to_unimplemented() {
        let harness = test_engine(0);
        let (tx, rx) = oneshot::channel();
        harness
            .engine
            .new_grpc_func_call("Greeter", "SayHello", Bytes::new(), tx);
        assert_eq!(rx.await.unwrap().status, GrpcStatus::Unimplemented);
    }

    #[tokio::test]
    async fn test_grpc_round_trip() {
        let harness = test_engine(0);
        let (_client_id, mut worker_rx) = attach_worker(&harness, 3);

        let (tx, rx) = oneshot::channel();
        harness
            .engine
            .new_grpc_func_call("Greeter", "SayHello", Bytes::from_static(b"req"), tx);
        let invoke = worker_rx.recv().await.unwrap().message;
        assert_eq!(invoke.method_id, 1);
        complete(&harness.engine, &invoke, b"resp");

        let reply = rx.await.unwrap();
        assert_eq!(reply.status, GrpcStatus::Ok);
        assert_eq!(reply.body.as_ref(), b"resp");
    }

    #[tokio::test]
    async fn test_call_ids_strictly_increase() {
        let harness = test_engine(0);
        let (_client_id, mut worker_rx) = attach_worker(&harness, 1);

        let _rx1 = http_call(&harness.engine, 1, b"a");
        let first = worker_rx.recv().await.unwrap().message;
        complete(&harness.engine, &first, b"done");
        let _rx2 = http_call(&harness.engine, 1, b"b");
        let second = worker_rx.recv().await.unwrap().message;
        assert!(second.call_id > first.call_id);
    }

    #[tokio::test]
    async fn test_inflight_matches_running_plus_pending() {
        let harness = test_engine(1);
        let (_client_id, _worker_rx) = attach_worker(&harness, 1);

        let _rx1 = http_call(&harness.engine, 1, b"a");
        let _rx2 = http_call(&harness.engine, 1, b"b");
        let _rx3 = http_call(&harness.engine, 1, b"c");
        assert_eq!(
            harness.engine.inflight_external_requests(),
            harness.engine.running_len() + harness.engine.pending_len()
        );
    }
}
