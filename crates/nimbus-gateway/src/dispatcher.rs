// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function dispatch of invocations to workers.
//!
//! Each configured function gets one dispatcher, created lazily and never
//! destroyed. A dispatcher assigns invocations round-robin over its idle
//! workers; when every worker is busy the call waits in an internal FIFO
//! that drains as workers report back. An invocation is refused only when
//! the function has no connected worker at all.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use nimbus_protocol::{FuncCall, Message};

use crate::ipc::{MessageTx, Outbound};

/// Where the input of an invocation lives.
#[derive(Debug, Clone)]
pub enum CallInput {
    /// Inline bytes copied into the dispatch message.
    Inline(Bytes),
    /// An `input:` region of this size, created by the originator.
    Shm {
        /// Size in bytes of the shared-memory region.
        size: usize,
    },
}

impl CallInput {
    /// Input size in bytes.
    pub fn size(&self) -> usize {
        match self {
            CallInput::Inline(bytes) => bytes.len(),
            CallInput::Shm { size } => *size,
        }
    }
}

#[derive(Debug)]
struct WorkerSlot {
    tx: MessageTx,
    idle: bool,
}

#[derive(Debug)]
struct QueuedCall {
    call: FuncCall,
    parent: FuncCall,
    input: CallInput,
}

#[derive(Debug)]
struct Outstanding {
    client_id: u16,
    dispatched_at: Instant,
}

#[derive(Debug, Default)]
struct DispatcherState {
    workers: HashMap<u16, WorkerSlot>,
    idle: VecDeque<u16>,
    queued: VecDeque<QueuedCall>,
    outstanding: HashMap<u64, Outstanding>,
    completed_calls: u64,
    failed_calls: u64,
    total_processing_time_us: u64,
    total_dispatch_delay_us: u64,
    total_turnaround_us: u64,
}

/// Accounting snapshot of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Connected workers.
    pub workers: usize,
    /// Workers with no outstanding assignment.
    pub idle_workers: usize,
    /// Calls waiting for an idle worker.
    pub queued_calls: usize,
    /// Calls dispatched and awaiting settlement.
    pub outstanding_calls: usize,
    /// Calls settled successfully.
    pub completed_calls: u64,
    /// Calls settled as failed.
    pub failed_calls: u64,
    /// Worker-reported execution time, summed.
    pub total_processing_time_us: u64,
    /// Worker-reported dispatch delay, summed.
    pub total_dispatch_delay_us: u64,
    /// Time between dispatch and settlement, summed over settled calls.
    pub total_turnaround_us: u64,
}

/// Dispatcher for one function id.
#[derive(Debug)]
pub struct Dispatcher {
    func_id: u16,
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    /// Create a dispatcher for `func_id` with no workers yet.
    pub fn new(func_id: u16) -> Self {
        Self {
            func_id,
            state: Mutex::new(DispatcherState::default()),
        }
    }

    /// The function this dispatcher serves.
    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// Register a worker endpoint and drain queued calls to it.
    pub fn on_worker_connected(&self, client_id: u16, tx: MessageTx) {
        let mut state = self.state.lock().unwrap();
        if state.workers.contains_key(&client_id) {
            warn!(
                func_id = self.func_id,
                client_id, "worker already registered, replacing"
            );
        }
        state.workers.insert(client_id, WorkerSlot { tx, idle: true });
        state.idle.push_back(client_id);
        info!(
            func_id = self.func_id,
            client_id,
            workers = state.workers.len(),
            "worker connected"
        );
        Self::drain_queue(&mut state);
    }

    /// Remove a worker endpoint, returning the calls outstanding on it.
    pub fn on_worker_disconnected(&self, client_id: u16) -> Vec<FuncCall> {
        let mut state = self.state.lock().unwrap();
        state.workers.remove(&client_id);
        state.idle.retain(|&id| id != client_id);
        let lost: Vec<u64> = state
            .outstanding
            .iter()
            .filter(|(_, entry)| entry.client_id == client_id)
            .map(|(&id, _)| id)
            .collect();
        let mut lost_calls = Vec::with_capacity(lost.len());
        for full_call_id in lost {
            state.outstanding.remove(&full_call_id);
            lost_calls.push(FuncCall::from_full_call_id(full_call_id));
        }
        info!(
            func_id = self.func_id,
            client_id,
            lost_calls = lost_calls.len(),
            "worker disconnected"
        );
        lost_calls
    }

    /// Assign a new invocation to a worker.
    ///
    /// Returns false iff the function has no connected worker; the call is
    /// then the caller's problem (discard or dispatch failure). Otherwise
    /// the call has either been sent to an idle worker or queued.
    pub fn on_new_func_call(&self, call: FuncCall, parent: FuncCall, input: CallInput) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.workers.is_empty() {
            return false;
        }
        match Self::pick_idle_worker(&mut state) {
            Some(client_id) => Self::assign(&mut state, client_id, call, parent, input),
            None => {
                debug!(func_id = self.func_id, call = %call, "all workers busy, queueing");
                state.queued.push_back(QueuedCall { call, parent, input });
            }
        }
        true
    }

    /// A worker finished `call` successfully.
    pub fn on_func_call_completed(
        &self,
        call: FuncCall,
        processing_time: u32,
        dispatch_delay: u32,
        output_size: usize,
    ) {
        let mut state = self.state.lock().unwrap();
        if !Self::settle(&mut state, call) {
            warn!(func_id = self.func_id, call = %call, "completion for unknown call");
            return;
        }
        state.completed_calls += 1;
        state.total_processing_time_us += u64::from(processing_time);
        state.total_dispatch_delay_us += u64::from(dispatch_delay);
        debug!(
            func_id = self.func_id,
            call = %call,
            processing_time,
            output_size,
            "call completed"
        );
    }

    /// A worker reported `call` as failed.
    pub fn on_func_call_failed(&self, call: FuncCall, dispatch_delay: u32) {
        let mut state = self.state.lock().unwrap();
        if !Self::settle(&mut state, call) {
            warn!(func_id = self.func_id, call = %call, "failure for unknown call");
            return;
        }
        state.failed_calls += 1;
        state.total_dispatch_delay_us += u64::from(dispatch_delay);
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> DispatcherStats {
        let state = self.state.lock().unwrap();
        DispatcherStats {
            workers: state.workers.len(),
            idle_workers: state.idle.len(),
            queued_calls: state.queued.len(),
            outstanding_calls: state.outstanding.len(),
            completed_calls: state.completed_calls,
            failed_calls: state.failed_calls,
            total_processing_time_us: state.total_processing_time_us,
            total_dispatch_delay_us: state.total_dispatch_delay_us,
            total_turnaround_us: state.total_turnaround_us,
        }
    }

    /// Remove the call from the outstanding set and return its worker to
    /// the idle pool. False when the call is unknown.
    fn settle(state: &mut DispatcherState, call: FuncCall) -> bool {
        let Some(entry) = state.outstanding.remove(&call.full_call_id()) else {
            return false;
        };
        state.total_turnaround_us += entry.dispatched_at.elapsed().as_micros() as u64;
        if let Some(slot) = state.workers.get_mut(&entry.client_id) {
            slot.idle = true;
            state.idle.push_back(entry.client_id);
        }
        Self::drain_queue(state);
        true
    }

    fn pick_idle_worker(state: &mut DispatcherState) -> Option<u16> {
        while let Some(client_id) = state.idle.pop_front() {
            if state.workers.contains_key(&client_id) {
                return Some(client_id);
            }
        }
        None
    }

    fn drain_queue(state: &mut DispatcherState) {
        while !state.queued.is_empty() {
            let Some(client_id) = Self::pick_idle_worker(state) else {
                return;
            };
            let queued = state.queued.pop_front().unwrap();
            Self::assign(state, client_id, queued.call, queued.parent, queued.input);
        }
    }

    fn assign(
        state: &mut DispatcherState,
        client_id: u16,
        call: FuncCall,
        parent: FuncCall,
        input: CallInput,
    ) {
        let mut message = Message::invoke_func(call, parent);
        match &input {
            CallInput::Inline(bytes) => {
                // Size was validated against the inline area upstream.
                message.set_inline_data(bytes).expect("inline input fits");
            }
            CallInput::Shm { size } => message.set_shm_payload(*size),
        }
        // Record the assignment before the write is enqueued, so the
        // completion can never be observed for an unknown call.
        state.outstanding.insert(
            call.full_call_id(),
            Outstanding {
                client_id,
                dispatched_at: Instant::now(),
            },
        );
        let slot = state.workers.get_mut(&client_id).expect("picked worker exists");
        slot.idle = false;
        if slot.tx.send(Outbound::message(message)).is_err() {
            // The connection is tearing down; its disconnect path will
            // discard this assignment.
            warn!(client_id, call = %call, "worker channel closed during dispatch");
        }
    }
}
