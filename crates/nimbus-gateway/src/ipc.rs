// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! UNIX-domain socket server for worker and launcher connections.
//!
//! Each accepted connection is handled by one reader task plus one writer
//! task. The writer drains a per-connection channel, which makes every
//! enqueue ordered with respect to the others: an `InvokeFunc` queued for
//! a worker is on the wire before anything the gateway sends afterwards.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use nimbus_protocol::{Message, MessageError, read_message};

use crate::engine::Engine;
use crate::registry::{HandshakeRole, WorkerRegistry};

/// A message queued for a connection, with the bytes (if any) that trail
/// the record on the stream.
#[derive(Debug)]
pub struct Outbound {
    /// The control message to write.
    pub message: Message,
    /// Bytes that follow the record on the stream (may be empty).
    pub payload: Bytes,
}

impl Outbound {
    /// An outbound record with no stream payload.
    pub fn message(message: Message) -> Self {
        Self {
            message,
            payload: Bytes::new(),
        }
    }
}

/// Sending side of a connection's outbound channel.
pub type MessageTx = mpsc::UnboundedSender<Outbound>;

/// Run the IPC accept loop until shutdown.
pub async fn run_ipc_server(
    listener: UnixListener,
    engine: Arc<Engine>,
    registry: Arc<WorkerRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("IPC server running");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("IPC server received shutdown signal");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let engine = engine.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, engine, registry).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept IPC connection");
                    }
                }
            }
        }
    }
    info!("IPC server stopped");
}

/// Handle one worker/launcher connection from handshake to disconnect.
async fn handle_connection(
    stream: UnixStream,
    engine: Arc<Engine>,
    registry: Arc<WorkerRegistry>,
) {
    debug!("new IPC connection");
    let (mut reader, writer) = stream.into_split();

    let first = match read_message(&mut reader).await {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "connection closed before handshake");
            return;
        }
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let accept = match registry.on_new_handshake(&first, tx.clone()) {
        Ok(accept) => accept,
        Err(e) => {
            // Protocol error: close the connection, no engine state touched.
            error!(error = %e, "handshake rejected");
            return;
        }
    };
    let writer_task = tokio::spawn(write_loop(writer, rx));

    // The response must be on the wire before any dispatch reaches this
    // worker; both go through the same channel, so enqueue it first.
    let func_id = accept.func_id;
    let role = accept.role;
    let _ = tx.send(accept.response);
    if let HandshakeRole::FuncWorker { client_id } = role {
        engine.on_worker_connected(func_id, client_id, tx.clone());
    }

    if let Err(e) = read_loop(&mut reader, &engine).await {
        warn!(error = %e, "IPC connection read error");
    }

    match role {
        HandshakeRole::Launcher => registry.on_launcher_disconnected(func_id),
        HandshakeRole::FuncWorker { client_id } => {
            registry.on_func_worker_disconnected(client_id);
            engine.on_worker_disconnected(func_id, client_id);
        }
    }
    drop(tx);
    let _ = writer_task.await;
    debug!("IPC connection closed");
}

/// Read steady-state messages until the peer disconnects.
async fn read_loop(reader: &mut OwnedReadHalf, engine: &Engine) -> Result<(), MessageError> {
    loop {
        let message = match read_message(reader).await {
            Ok(message) => message,
            Err(MessageError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let payload_len = message.stream_payload_len();
        let payload = if payload_len > 0 {
            let mut buf = vec![0u8; payload_len];
            reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };
        engine.on_recv_message(&message, payload);
    }
}

/// Drain the outbound channel onto the socket, stamping send timestamps.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(mut outbound) = rx.recv().await {
        outbound.message.stamp_send_timestamp();
        if let Err(e) = writer.write_all(&outbound.message.encode()).await {
            warn!(error = %e, "IPC write failed");
            return;
        }
        if !outbound.payload.is_empty()
            && let Err(e) = writer.write_all(&outbound.payload).await
        {
            warn!(error = %e, "IPC payload write failed");
            return;
        }
    }
}
