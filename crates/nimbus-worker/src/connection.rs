// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gateway connection for workers and launchers.
//!
//! The connection handshakes on creation: it writes a launcher or
//! function-worker handshake, then reads the gateway's response carrying
//! the assigned client id and the function-config document. After that it
//! exchanges fixed-size control messages, resolving oversize payloads
//! through shared memory per the protocol's size policy.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use nimbus_protocol::{
    FuncCall, FuncConfig, INLINE_DATA_SIZE, INTERNAL_OUTPUT_INLINE_CAP, Message, MessageError,
    MessageKind, ShmRegion, compute_message_delay, input_shm_name, output_shm_name, read_message,
    write_message,
};

use crate::error::WorkerError;

/// A function invocation delivered to this worker.
#[derive(Debug)]
pub struct Invocation {
    pub call: FuncCall,
    pub parent: FuncCall,
    pub input: Vec<u8>,
    /// Delay between the gateway's dispatch and this worker picking the
    /// call up, in microseconds.
    pub dispatch_delay: u32,
}

/// Worker-side connection to the gateway's IPC socket.
pub struct GatewayConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    func_id: u16,
    client_id: u16,
    func_config: FuncConfig,
    next_call_id: AtomicU32,
}

impl GatewayConnection {
    /// Connect as a function worker for `func_id`.
    pub async fn connect_func_worker(
        ipc_path: impl AsRef<Path>,
        func_id: u16,
    ) -> Result<Self, WorkerError> {
        Self::connect(ipc_path, Message::func_worker_handshake(func_id), func_id).await
    }

    /// Connect as a launcher for `func_id`, announcing its container ID.
    pub async fn connect_launcher(
        ipc_path: impl AsRef<Path>,
        func_id: u16,
        container_id: &[u8],
    ) -> Result<Self, WorkerError> {
        let handshake = Message::launcher_handshake(func_id, container_id)?;
        Self::connect(ipc_path, handshake, func_id).await
    }

    async fn connect(
        ipc_path: impl AsRef<Path>,
        handshake: Message,
        func_id: u16,
    ) -> Result<Self, WorkerError> {
        let stream = UnixStream::connect(ipc_path.as_ref()).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, &handshake).await?;

        let response = match read_message(&mut reader).await {
            Ok(response) => response,
            Err(MessageError::ConnectionClosed) => return Err(WorkerError::HandshakeRejected),
            Err(e) => return Err(e.into()),
        };
        if response.kind != MessageKind::HandshakeResponse {
            return Err(WorkerError::Protocol(format!(
                "expected handshake response, got {:?}",
                response.kind
            )));
        }
        let mut config_bytes = vec![0u8; response.stream_payload_len()];
        reader.read_exact(&mut config_bytes).await?;
        let func_config = FuncConfig::load(config_bytes)?;

        info!(
            func_id,
            client_id = response.client_id,
            functions = func_config.len(),
            "handshake done"
        );
        Ok(Self {
            reader,
            writer,
            func_id,
            client_id: response.client_id,
            func_config,
            next_call_id: AtomicU32::new(1),
        })
    }

    /// The function id this connection registered for.
    pub fn func_id(&self) -> u16 {
        self.func_id
    }

    /// The client id the gateway assigned (0 for launchers).
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// The function configuration shared by the gateway.
    pub fn func_config(&self) -> &FuncConfig {
        &self.func_config
    }

    /// Allocate the identity for a call this worker originates.
    pub fn new_call(&self, func_id: u16) -> FuncCall {
        FuncCall::new(
            func_id,
            self.client_id,
            self.next_call_id.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Read the next message and any stream payload that trails it.
    pub async fn recv(&mut self) -> Result<(Message, Bytes), WorkerError> {
        let message = read_message(&mut self.reader).await?;
        let payload_len = message.stream_payload_len();
        let payload = if payload_len > 0 {
            let mut buf = vec![0u8; payload_len];
            self.reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };
        Ok((message, payload))
    }

    /// Write a message with its trailing stream payload, stamping the send
    /// timestamp.
    pub async fn send(&mut self, message: &Message, payload: &[u8]) -> Result<(), WorkerError> {
        let mut message = message.clone();
        message.stamp_send_timestamp();
        write_message(&mut self.writer, &message).await?;
        if !payload.is_empty() {
            use tokio::io::AsyncWriteExt;
            self.writer.write_all(payload).await?;
        }
        Ok(())
    }

    /// Originate an invocation of another function.
    ///
    /// Creates the `input:` region when the input exceeds the inline area;
    /// the returned region (if any) is owned by the caller and must outlive
    /// the call.
    pub async fn invoke(
        &mut self,
        call: FuncCall,
        parent: FuncCall,
        input: &[u8],
    ) -> Result<Option<ShmRegion>, WorkerError> {
        let mut message = Message::invoke_func(call, parent);
        let region = if input.len() <= INLINE_DATA_SIZE {
            message.set_inline_data(input)?;
            None
        } else {
            let mut region = ShmRegion::create(&input_shm_name(call.full_call_id()), input.len())?;
            region.as_mut_slice().copy_from_slice(input);
            region.enable_remove_on_drop();
            message.set_shm_payload(input.len());
            Some(region)
        };
        self.send(&message, &[]).await?;
        Ok(region)
    }

    /// Serve invocations until the gateway closes the connection.
    ///
    /// The handler returns `Some(output)` on success and `None` to report
    /// a function failure. Messages other than `InvokeFunc` are logged and
    /// ignored.
    pub async fn serve<F, Fut>(mut self, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(Invocation) -> Fut,
        Fut: Future<Output = Option<Vec<u8>>>,
    {
        loop {
            let (message, _payload) = match self.recv().await {
                Ok(inbound) => inbound,
                Err(WorkerError::Message(MessageError::ConnectionClosed)) => {
                    debug!("gateway closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if message.kind != MessageKind::InvokeFunc {
                warn!(kind = ?message.kind, "ignoring unexpected message");
                continue;
            }
            let invocation = read_invocation(&message)?;
            let call = invocation.call;
            let dispatch_delay = invocation.dispatch_delay;

            let started = Instant::now();
            let result = handler(invocation).await;
            let processing_time = started.elapsed().as_micros().min(u128::from(u32::MAX)) as u32;

            match result {
                Some(output) => {
                    let (reply, trailing, _region) =
                        build_completion(call, &output, processing_time, dispatch_delay)?;
                    self.send(&reply, &trailing).await?;
                }
                None => {
                    let reply = Message::func_call_failed(call, dispatch_delay);
                    self.send(&reply, &[]).await?;
                }
            }
        }
    }
}

/// Materialize the invocation carried by an `InvokeFunc` message, pulling
/// shared-memory input when the size policy moved it out of band.
pub fn read_invocation(message: &Message) -> Result<Invocation, WorkerError> {
    let input = if message.payload_size < 0 {
        let call_id = message.func_call().full_call_id();
        let region = ShmRegion::open(&input_shm_name(call_id))?;
        region.as_slice().to_vec()
    } else {
        message.inline_data().to_vec()
    };
    let delay = compute_message_delay(message);
    Ok(Invocation {
        call: message.func_call(),
        parent: FuncCall::from_full_call_id(message.parent_call_id),
        input,
        dispatch_delay: delay.max(0) as u32,
    })
}

/// Build the completion reply for `call`, applying the output size policy.
///
/// Returns the message, the bytes to trail it on the stream, and the
/// `output:` region when one was created. The region is intentionally not
/// unlink-on-drop: the reader of the output owns the unlink.
pub fn build_completion(
    call: FuncCall,
    output: &[u8],
    processing_time: u32,
    dispatch_delay: u32,
) -> Result<(Message, Vec<u8>, Option<ShmRegion>), WorkerError> {
    let mut reply = Message::func_call_complete(call, processing_time, dispatch_delay);
    if output.len() <= INLINE_DATA_SIZE {
        reply.set_inline_data(output)?;
        return Ok((reply, Vec::new(), None));
    }
    if call.client_id > 0 && output.len() <= INTERNAL_OUTPUT_INLINE_CAP {
        // Relayed to the originator over its message channel.
        reply.payload_size = output.len() as i32;
        return Ok((reply, output.to_vec(), None));
    }
    let mut region = ShmRegion::create(&output_shm_name(call.full_call_id()), output.len())?;
    region.as_mut_slice().copy_from_slice(output);
    if call.client_id == 0 {
        reply.set_shm_payload(output.len());
    } else {
        // Worker-originated calls signal shared memory by size alone.
        reply.payload_size = output.len() as i32;
    }
    Ok((reply, Vec::new(), Some(region)))
}
