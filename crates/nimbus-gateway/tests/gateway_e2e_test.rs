// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the gateway.
//!
//! Each test boots the real HTTP and IPC servers on ephemeral resources
//! and attaches in-process workers through nimbus-worker, exercising the
//! full path: HTTP ingest → admission → dispatch → worker → settlement →
//! HTTP response.

mod common;

use std::sync::Arc;

use common::*;
use nimbus_protocol::{
    FuncCall, INLINE_DATA_SIZE, INVALID_FUNC_CALL, Message, input_shm_name, output_shm_name,
};
use nimbus_worker::GatewayConnection;
use tokio::sync::Semaphore;

// Distinct func_ids across tests keep /dev/shm names collision-free when
// the test binary runs them in parallel.
fn config_with(func_name: &str, func_id: u16) -> String {
    format!(r#"[{{ "funcName": "{}", "funcId": {} }}]"#, func_name, func_id)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hello() {
    let gateway = TestGateway::start(&config_with("echo", 10), 0).await;
    let response = gateway
        .client
        .get(gateway.url("/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"Hello world\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_route_stops_the_gateway() {
    let gateway = TestGateway::start(&config_with("echo", 11), 0).await;
    let response = gateway
        .client
        .post(gateway.url("/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"Server is shutting down\n"
    );

    wait_until(|| !gateway.runtime.is_running()).await;
    gateway.runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inline_happy_path() {
    let gateway = TestGateway::start(&config_with("echo", 12), 0).await;
    let _worker = gateway.spawn_echo_worker(12).await;

    let (status, body) = gateway.invoke("echo", "hi").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"hi");

    // Small bodies never touch shared memory.
    let full_call_id = FuncCall::new(12, 0, 1).full_call_id();
    assert!(!shm_object_exists(&input_shm_name(full_call_id)));
    assert!(!shm_object_exists(&output_shm_name(full_call_id)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_body_stays_inline() {
    let gateway = TestGateway::start(&config_with("echo", 13), 0).await;
    let _worker = gateway.spawn_echo_worker(13).await;

    let (status, body) = gateway.invoke("echo", "").await;
    assert_eq!(status, 200);
    assert!(body.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_boundary_body_sizes() {
    let gateway = TestGateway::start(&config_with("echo", 14), 0).await;
    let _worker = gateway.spawn_echo_worker(14).await;

    // Exactly the inline capacity stays inline.
    let exact = vec![0x41u8; INLINE_DATA_SIZE];
    let (status, body) = gateway.invoke("echo", exact.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body, exact);

    // One byte more goes through shared memory, invisibly to the caller.
    let over = vec![0x42u8; INLINE_DATA_SIZE + 1];
    let (status, body) = gateway.invoke("echo", over.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body, over);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shm_input_path() {
    let gateway = TestGateway::start(&config_with("echo", 15), 0).await;
    let _worker = gateway.spawn_echo_worker(15).await;

    let input = vec![0x41u8; 4096];
    let (status, body) = gateway.invoke("echo", input.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(body, input);

    // The input region is unlinked with the call context.
    let full_call_id = FuncCall::new(15, 0, 1).full_call_id();
    wait_until(|| !shm_object_exists(&input_shm_name(full_call_id))).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shm_output_path() {
    let gateway = TestGateway::start(&config_with("bigout", 16), 0).await;
    let _worker = gateway
        .spawn_worker(16, |_invocation| async move { Some(vec![0x5au8; 8192]) })
        .await;

    let (status, body) = gateway.invoke("bigout", "x").await;
    assert_eq!(status, 200);
    assert_eq!(body, vec![0x5au8; 8192]);

    // The worker's output region is opened, drained and unlinked.
    let full_call_id = FuncCall::new(16, 0, 1).full_call_id();
    wait_until(|| !shm_object_exists(&output_shm_name(full_call_id))).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_admission_backpressure() {
    let gateway = TestGateway::start(&config_with("gated", 17), 2).await;
    let gate = Arc::new(Semaphore::new(0));
    let worker_gate = gate.clone();
    let _worker = gateway
        .spawn_worker(17, move |invocation| {
            let gate = worker_gate.clone();
            async move {
                gate.acquire().await.unwrap().forget();
                Some(invocation.input)
            }
        })
        .await;

    let engine = gateway.runtime.engine().clone();
    let mut requests = Vec::new();
    for name in ["r1", "r2", "r3"] {
        // Issue strictly in order so admission order is deterministic.
        let client = gateway.client.clone();
        let url = gateway.url("/function/gated");
        let before = engine.inflight_external_requests();
        requests.push(tokio::spawn(async move {
            client.post(url).body(name).send().await.unwrap()
        }));
        wait_until(|| engine.inflight_external_requests() > before).await;
    }

    // Two running under the cap, the third parked.
    wait_until(|| engine.running_len() == 2).await;
    assert_eq!(engine.pending_len(), 1);

    // Finishing calls one by one keeps |running| at the cap while the
    // queue drains in admission order.
    let mut bodies = Vec::new();
    for request in requests {
        gate.add_permits(1);
        let response = request.await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        bodies.push(response.bytes().await.unwrap().to_vec());
    }
    assert_eq!(bodies, vec![b"r1".to_vec(), b"r2".to_vec(), b"r3".to_vec()]);
    wait_until(|| engine.inflight_external_requests() == 0).await;
    assert_eq!(engine.pending_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatch_failure_without_workers() {
    let gateway = TestGateway::start(&config_with("f", 18), 0).await;

    let (status, body) = gateway.invoke("f", "x").await;
    assert_eq!(status, 404);
    assert_eq!(body, b"Dispatch failed for func_id 18\n");
    assert_eq!(gateway.runtime.engine().running_len(), 0);
    assert_eq!(gateway.runtime.engine().inflight_external_requests(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_function_is_rejected_without_state() {
    let gateway = TestGateway::start(&config_with("echo", 19), 0).await;

    let (status, _body) = gateway.invoke("nope", "x").await;
    assert_eq!(status, 404);
    assert_eq!(gateway.runtime.engine().inflight_external_requests(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_function_failure_returns_500() {
    let gateway = TestGateway::start(&config_with("fails", 20), 0).await;
    let _worker = gateway.spawn_worker(20, |_invocation| async move { None }).await;

    let (status, body) = gateway.invoke("fails", "x").await;
    assert_eq!(status, 500);
    assert_eq!(body, b"Function call failed\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_loss_mid_flight() {
    let gateway = TestGateway::start(&config_with("flaky", 21), 0).await;

    // A worker that takes one invocation and dies without replying.
    let mut conn = GatewayConnection::connect_func_worker(gateway.runtime.ipc_path(), 21)
        .await
        .unwrap();
    gateway.wait_for_workers(1).await;
    let worker = tokio::spawn(async move {
        let _ = conn.recv().await;
        // Dropping the connection here is the crash.
    });

    let (status, body) = gateway.invoke("flaky", "x").await;
    assert_eq!(status, 404);
    assert_eq!(body, b"Dispatch failed for func_id 21\n");
    worker.await.unwrap();
    assert_eq!(gateway.runtime.engine().running_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_func_id_on_wire_is_dropped() {
    let gateway = TestGateway::start(&config_with("echo", 22), 0).await;
    let _worker = gateway.spawn_echo_worker(22).await;

    // A connected worker sends an InvokeFunc for a func_id the config
    // does not know.
    let mut rogue = GatewayConnection::connect_func_worker(gateway.runtime.ipc_path(), 22)
        .await
        .unwrap();
    gateway.wait_for_workers(2).await;
    let call = FuncCall::new(999, rogue.client_id(), 1);
    rogue
        .send(&Message::invoke_func(call, INVALID_FUNC_CALL), &[])
        .await
        .unwrap();

    // No dispatcher materializes, and the gateway keeps serving.
    let (status, body) = gateway.invoke("echo", "still alive").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"still alive");
    assert!(!gateway.runtime.engine().has_dispatcher(999));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_worker_unblocks_parked_admissions() {
    let gateway = TestGateway::start(&config_with("late", 23), 1).await;

    // Without a worker the first call fails dispatch and is evicted, but a
    // call parked behind the cap survives until a worker shows up.
    let engine = gateway.runtime.engine().clone();
    let first = {
        let client = gateway.client.clone();
        let url = gateway.url("/function/late");
        tokio::spawn(async move { client.post(url).body("early").send().await.unwrap() })
    };
    // The first call fails dispatch immediately (no worker yet).
    assert_eq!(first.await.unwrap().status().as_u16(), 404);

    // Park one call behind a running one.
    let gate = Arc::new(Semaphore::new(0));
    let worker_gate = gate.clone();
    let _worker = gateway
        .spawn_worker(23, move |invocation| {
            let gate = worker_gate.clone();
            async move {
                gate.acquire().await.unwrap().forget();
                Some(invocation.input)
            }
        })
        .await;

    let blocked = {
        let client = gateway.client.clone();
        let url = gateway.url("/function/late");
        tokio::spawn(async move { client.post(url).body("a").send().await.unwrap() })
    };
    wait_until(|| engine.running_len() == 1).await;
    let parked = {
        let client = gateway.client.clone();
        let url = gateway.url("/function/late");
        tokio::spawn(async move { client.post(url).body("b").send().await.unwrap() })
    };
    wait_until(|| engine.pending_len() == 1).await;

    gate.add_permits(2);
    assert_eq!(blocked.await.unwrap().status().as_u16(), 200);
    assert_eq!(parked.await.unwrap().status().as_u16(), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_internal_call_round_trip() {
    let gateway = TestGateway::start(&config_with("echo", 24), 0).await;
    let _worker = gateway.spawn_echo_worker(24).await;

    // A second worker originates a call of `echo` and reads the reply off
    // its own connection.
    let mut originator = GatewayConnection::connect_func_worker(gateway.runtime.ipc_path(), 24)
        .await
        .unwrap();
    gateway.wait_for_workers(2).await;

    let call = originator.new_call(24);
    let _input_region = originator
        .invoke(call, INVALID_FUNC_CALL, b"sibling input")
        .await
        .unwrap();

    let (reply, _payload) = originator.recv().await.unwrap();
    assert_eq!(reply.func_call(), call);
    assert_eq!(reply.inline_data(), b"sibling input");
}
