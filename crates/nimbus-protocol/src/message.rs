// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for gateway IPC messages.
//!
//! Every control message is a fixed-size record:
//! - 40 bytes: header (kind, call identity, payload metadata, timing)
//! - `INLINE_DATA_SIZE` bytes: inline data area
//!
//! Payloads that do not fit the inline area travel out of band through a
//! named shared-memory region (see [`crate::shm`]); the header's
//! `payload_size` is then negated to signal the switch. A
//! [`MessageKind::HandshakeResponse`] is the one exception where bytes
//! follow the record on the stream itself: `payload_size` counts the
//! function-config document written right after the fixed record.
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 40;

/// Capacity of the inline data area.
pub const INLINE_DATA_SIZE: usize = 1024;

/// Total size of a control message on the wire.
pub const MESSAGE_SIZE: usize = HEADER_SIZE + INLINE_DATA_SIZE;

/// Atomic pipe-write limit assumed for worker-side output pipes.
///
/// Worker-originated calls keep their output inline only while
/// `output_size + 4 <= PIPE_BUF`; larger outputs go through shared memory.
pub const PIPE_BUF: usize = 4096;

/// Largest output of a worker-originated call that stays on the message
/// channel. Replies to such calls are relayed over the originator's
/// connection, whose writes must fit one atomic pipe write together with a
/// length word; anything larger goes through an `output:` region.
pub const INTERNAL_OUTPUT_INLINE_CAP: usize = PIPE_BUF - size_of::<i32>();

/// Length of the container ID carried by a launcher handshake.
pub const CONTAINER_ID_LENGTH: usize = 64;

/// Container ID value meaning "not running inside a container".
pub const INVALID_CONTAINER_ID: [u8; CONTAINER_ID_LENGTH] = [b'0'; CONTAINER_ID_LENGTH];

/// Message kinds understood by the gateway and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    /// First message on a launcher connection; inline data is the container ID.
    LauncherHandshake = 1,
    /// First message on a function-worker connection.
    FuncWorkerHandshake = 2,
    /// Gateway's reply to either handshake; carries the function config.
    HandshakeResponse = 3,
    /// Dispatch a function call to a worker.
    InvokeFunc = 4,
    /// A function call finished successfully.
    FuncCallComplete = 5,
    /// A function call failed.
    FuncCallFailed = 6,
}

impl TryFrom<u16> for MessageKind {
    type Error = MessageError;

    fn try_from(value: u16) -> Result<Self, MessageError> {
        match value {
            1 => Ok(MessageKind::LauncherHandshake),
            2 => Ok(MessageKind::FuncWorkerHandshake),
            3 => Ok(MessageKind::HandshakeResponse),
            4 => Ok(MessageKind::InvokeFunc),
            5 => Ok(MessageKind::FuncCallComplete),
            6 => Ok(MessageKind::FuncCallFailed),
            _ => Err(MessageError::InvalidKind(value)),
        }
    }
}

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message kind: {0}")]
    InvalidKind(u16),

    #[error("message truncated: {0} bytes (expected {MESSAGE_SIZE})")]
    Truncated(usize),

    #[error("inline data too large: {0} bytes (max: {INLINE_DATA_SIZE})")]
    InlineTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// Identity of a function call.
///
/// `(func_id, client_id, call_id)` uniquely identifies a call for its
/// lifetime. `client_id == 0` marks a call that entered through the
/// external HTTP/gRPC surface; a nonzero `client_id` names the worker
/// that originated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncCall {
    pub func_id: u16,
    pub method_id: u8,
    pub client_id: u16,
    pub call_id: u32,
}

/// Sentinel used where no parent call exists.
pub const INVALID_FUNC_CALL: FuncCall = FuncCall {
    func_id: 0,
    method_id: 0,
    client_id: 0,
    call_id: 0,
};

const CALL_ID_MASK: u32 = (1 << 24) - 1;

impl FuncCall {
    /// Create a call identity for a plain (non-gRPC) invocation.
    pub fn new(func_id: u16, client_id: u16, call_id: u32) -> Self {
        Self::with_method(func_id, 0, client_id, call_id)
    }

    /// Create a call identity for a gRPC invocation.
    pub fn with_method(func_id: u16, method_id: u8, client_id: u16, call_id: u32) -> Self {
        Self {
            func_id,
            method_id,
            client_id,
            call_id: call_id & CALL_ID_MASK,
        }
    }

    /// Pack into the 64-bit wire identity:
    /// bits 0-15 `func_id`, 16-23 `method_id`, 24-39 `client_id`,
    /// 40-63 `call_id`.
    pub fn full_call_id(&self) -> u64 {
        u64::from(self.func_id)
            | (u64::from(self.method_id) << 16)
            | (u64::from(self.client_id) << 24)
            | (u64::from(self.call_id & CALL_ID_MASK) << 40)
    }

    /// Unpack a 64-bit wire identity.
    pub fn from_full_call_id(id: u64) -> Self {
        Self {
            func_id: (id & 0xffff) as u16,
            method_id: ((id >> 16) & 0xff) as u8,
            client_id: ((id >> 24) & 0xffff) as u16,
            call_id: ((id >> 40) & u64::from(CALL_ID_MASK)) as u32,
        }
    }

    /// Whether this call entered through the external surface.
    pub fn is_external(&self) -> bool {
        self.client_id == 0
    }
}

impl std::fmt::Display for FuncCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "func_id={} method_id={} client_id={} call_id={}",
            self.func_id, self.method_id, self.client_id, self.call_id
        )
    }
}

/// A fixed-size control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub func_id: u16,
    pub method_id: u8,
    pub client_id: u16,
    pub call_id: u32,
    pub parent_call_id: u64,
    /// Inline payload length; negative means the payload of `-payload_size`
    /// bytes lives in a shared-memory region instead.
    pub payload_size: i32,
    /// Function execution time in microseconds, reported on completion.
    pub processing_time: u32,
    /// Queueing delay before the worker picked the call up, in microseconds.
    pub dispatch_delay: u32,
    /// Monotonic send time in microseconds; 0 means the sender did not
    /// fill it.
    pub send_timestamp: i64,
    inline_data: [u8; INLINE_DATA_SIZE],
}

impl Message {
    /// Create a message of the given kind addressed by `call`.
    pub fn new(kind: MessageKind, call: FuncCall) -> Self {
        Self {
            kind,
            func_id: call.func_id,
            method_id: call.method_id,
            client_id: call.client_id,
            call_id: call.call_id,
            parent_call_id: 0,
            payload_size: 0,
            processing_time: 0,
            dispatch_delay: 0,
            send_timestamp: 0,
            inline_data: [0u8; INLINE_DATA_SIZE],
        }
    }

    /// Handshake sent by a launcher; inline data carries the container ID.
    pub fn launcher_handshake(func_id: u16, container_id: &[u8]) -> Result<Self, MessageError> {
        let mut msg = Self::new(MessageKind::LauncherHandshake, FuncCall::new(func_id, 0, 0));
        msg.set_inline_data(container_id)?;
        Ok(msg)
    }

    /// Handshake sent by a function worker.
    pub fn func_worker_handshake(func_id: u16) -> Self {
        Self::new(MessageKind::FuncWorkerHandshake, FuncCall::new(func_id, 0, 0))
    }

    /// Gateway reply to a handshake. `client_id` is the identity assigned
    /// to a function worker (0 for launchers); `config_size` is the length
    /// of the function-config document that follows the record.
    pub fn handshake_response(client_id: u16, config_size: usize) -> Self {
        let mut msg = Self::new(
            MessageKind::HandshakeResponse,
            FuncCall::new(0, client_id, 0),
        );
        msg.payload_size = config_size as i32;
        msg
    }

    /// Dispatch message for `call`, originated under `parent`.
    pub fn invoke_func(call: FuncCall, parent: FuncCall) -> Self {
        let mut msg = Self::new(MessageKind::InvokeFunc, call);
        msg.parent_call_id = parent.full_call_id();
        msg
    }

    /// Successful completion of `call`.
    pub fn func_call_complete(call: FuncCall, processing_time: u32, dispatch_delay: u32) -> Self {
        let mut msg = Self::new(MessageKind::FuncCallComplete, call);
        msg.processing_time = processing_time;
        msg.dispatch_delay = dispatch_delay;
        msg
    }

    /// Failure of `call`.
    pub fn func_call_failed(call: FuncCall, dispatch_delay: u32) -> Self {
        let mut msg = Self::new(MessageKind::FuncCallFailed, call);
        msg.dispatch_delay = dispatch_delay;
        msg
    }

    /// The call identity carried by this message.
    pub fn func_call(&self) -> FuncCall {
        FuncCall {
            func_id: self.func_id,
            method_id: self.method_id,
            client_id: self.client_id,
            call_id: self.call_id & CALL_ID_MASK,
        }
    }

    /// Borrowed view of the inline payload. Empty when the payload went
    /// through shared memory (`payload_size < 0`) or out of band.
    pub fn inline_data(&self) -> &[u8] {
        if self.payload_size <= 0 {
            return &[];
        }
        let len = (self.payload_size as usize).min(INLINE_DATA_SIZE);
        &self.inline_data[..len]
    }

    /// Copy `data` into the inline area and set `payload_size` accordingly.
    pub fn set_inline_data(&mut self, data: &[u8]) -> Result<(), MessageError> {
        if data.len() > INLINE_DATA_SIZE {
            return Err(MessageError::InlineTooLarge(data.len()));
        }
        self.inline_data[..data.len()].copy_from_slice(data);
        self.payload_size = data.len() as i32;
        Ok(())
    }

    /// Mark the payload as living in a shared-memory region of `size` bytes.
    pub fn set_shm_payload(&mut self, size: usize) {
        self.payload_size = -(size as i32);
    }

    /// Record the current monotonic time as the send timestamp.
    pub fn stamp_send_timestamp(&mut self) {
        self.send_timestamp = monotonic_micros();
    }

    /// Number of payload bytes that follow this record on the stream.
    ///
    /// Two message shapes carry out-of-band stream payloads:
    /// a [`MessageKind::HandshakeResponse`] is followed by the
    /// function-config document, and a completion of a worker-originated
    /// call whose output exceeds the inline area (but still fits
    /// [`INTERNAL_OUTPUT_INLINE_CAP`]) is followed by the output bytes.
    pub fn stream_payload_len(&self) -> usize {
        match self.kind {
            MessageKind::HandshakeResponse => self.payload_size.max(0) as usize,
            MessageKind::FuncCallComplete if self.client_id > 0 => {
                let size = self.payload_size.max(0) as usize;
                if size > INLINE_DATA_SIZE && size <= INTERNAL_OUTPUT_INLINE_CAP {
                    size
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /// Encode into a `MESSAGE_SIZE` byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_SIZE);
        buf.put_u16_le(self.kind as u16);
        buf.put_u16_le(self.func_id);
        buf.put_u8(self.method_id);
        buf.put_u8(0); // reserved
        buf.put_u16_le(self.client_id);
        buf.put_u32_le(self.call_id);
        buf.put_u64_le(self.parent_call_id);
        buf.put_i32_le(self.payload_size);
        buf.put_u32_le(self.processing_time);
        buf.put_u32_le(self.dispatch_delay);
        buf.put_i64_le(self.send_timestamp);
        debug_assert_eq!(buf.len(), HEADER_SIZE);
        buf.put_slice(&self.inline_data);
        buf.freeze()
    }

    /// Decode from a `MESSAGE_SIZE` byte buffer.
    pub fn decode(mut bytes: Bytes) -> Result<Self, MessageError> {
        if bytes.len() < MESSAGE_SIZE {
            return Err(MessageError::Truncated(bytes.len()));
        }
        let kind = MessageKind::try_from(bytes.get_u16_le())?;
        let func_id = bytes.get_u16_le();
        let method_id = bytes.get_u8();
        let _reserved = bytes.get_u8();
        let client_id = bytes.get_u16_le();
        let call_id = bytes.get_u32_le();
        let parent_call_id = bytes.get_u64_le();
        let payload_size = bytes.get_i32_le();
        let processing_time = bytes.get_u32_le();
        let dispatch_delay = bytes.get_u32_le();
        let send_timestamp = bytes.get_i64_le();
        let mut inline_data = [0u8; INLINE_DATA_SIZE];
        bytes.copy_to_slice(&mut inline_data);
        Ok(Self {
            kind,
            func_id,
            method_id,
            client_id,
            call_id,
            parent_call_id,
            payload_size,
            processing_time,
            dispatch_delay,
            send_timestamp,
            inline_data,
        })
    }
}

/// Delay between the message's send timestamp and now, in microseconds.
/// Returns -1 when the sender did not fill the timestamp.
pub fn compute_message_delay(message: &Message) -> i32 {
    if message.send_timestamp <= 0 {
        return -1;
    }
    let delta = monotonic_micros() - message.send_timestamp;
    i32::try_from(delta).unwrap_or(i32::MAX)
}

/// Monotonic clock reading in microseconds (`CLOCK_MONOTONIC`), comparable
/// across processes on the same host.
pub fn monotonic_micros() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * 1_000_000 + ts.tv_nsec() / 1_000,
        Err(_) => 0,
    }
}

/// Write a message to an async writer.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), MessageError> {
    writer.write_all(&message.encode()).await?;
    Ok(())
}

/// Read the next message from an async reader.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, MessageError> {
    let mut buf = vec![0u8; MESSAGE_SIZE];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(MessageError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }
    Message::decode(Bytes::from(buf))
}
