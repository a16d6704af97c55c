// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gateway E2E tests.
//!
//! Provides a TestGateway that boots the real HTTP and IPC servers on
//! ephemeral resources, plus helpers to attach in-process workers.

#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use nimbus_gateway::config::Config;
use nimbus_gateway::runtime::GatewayRuntime;
use nimbus_worker::{GatewayConnection, Invocation};

/// A running gateway on ephemeral port, socket path and config file.
pub struct TestGateway {
    pub runtime: GatewayRuntime,
    pub client: reqwest::Client,
    http_base: String,
    _tmp: TempDir,
}

impl TestGateway {
    /// Boot a gateway for the given function-config document.
    pub async fn start(config_json: &str, max_running_external_requests: usize) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let func_config_file = tmp.path().join("func_config.json");
        std::fs::write(&func_config_file, config_json).expect("write func config");

        let config = Config {
            http_addr: "127.0.0.1:0".parse().unwrap(),
            ipc_path: tmp.path().join("gateway.sock"),
            func_config_file,
            max_running_external_requests,
            disable_monitor: true,
            listen_backlog: 64,
        };
        let runtime = GatewayRuntime::start(config).await.expect("start gateway");
        let http_base = format!("http://{}", runtime.http_addr());
        Self {
            runtime,
            client: reqwest::Client::new(),
            http_base,
            _tmp: tmp,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.http_base, path)
    }

    /// POST a function invocation and return (status, body).
    pub async fn invoke(&self, func_name: &str, body: impl Into<reqwest::Body>) -> (u16, Vec<u8>) {
        let response = self
            .client
            .post(self.url(&format!("/function/{}", func_name)))
            .body(body)
            .send()
            .await
            .expect("http request");
        let status = response.status().as_u16();
        let body = response.bytes().await.expect("response body").to_vec();
        (status, body)
    }

    /// Attach a worker that runs `handler` for every invocation.
    pub async fn spawn_worker<F, Fut>(&self, func_id: u16, handler: F) -> JoinHandle<()>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Vec<u8>>> + Send,
    {
        let workers_before = self.runtime.registry().worker_count();
        let conn = GatewayConnection::connect_func_worker(self.runtime.ipc_path(), func_id)
            .await
            .expect("worker connect");
        let handle = tokio::spawn(async move {
            let _ = conn.serve(handler).await;
        });
        self.wait_for_workers(workers_before + 1).await;
        handle
    }

    /// Attach a worker that echoes its input.
    pub async fn spawn_echo_worker(&self, func_id: u16) -> JoinHandle<()> {
        self.spawn_worker(func_id, |invocation| async move { Some(invocation.input) })
            .await
    }

    /// Wait until `count` workers have finished their handshake.
    pub async fn wait_for_workers(&self, count: usize) {
        wait_until(|| self.runtime.registry().worker_count() >= count).await;
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// Whether a shared-memory object with this logical name exists.
pub fn shm_object_exists(name: &str) -> bool {
    std::path::Path::new("/dev/shm").join(name).exists()
}
