//! IPC protocol messages between the broker and its worker process.
//!
//! Uses length-prefixed rkyv messages over the worker's stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//!
//! Call arguments and return values are opaque JSON bytes inside the frame.

use std::io::{ErrorKind, Read, Write};

use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::{CallArgs, CallEnvelope, CallKey, Failure, FailureKind, ResultEnvelope};
use crate::error::{Error, Result};

/// Largest frame body accepted from the peer (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Command sent from the broker to the worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Construct the processor. Always the first message.
    Init {
        /// Name of the factory registered in the worker.
        factory: String,
        /// Factory arguments as JSON.
        args_json: Vec<u8>,
    },

    /// Invoke one operation on the processor.
    Call {
        /// Correlation key, as text.
        key: String,
        /// Operation name.
        operation: String,
        /// `CallArgs` as JSON.
        args_json: Vec<u8>,
    },

    /// Ping to check if worker is alive.
    Ping,

    /// Shutdown the worker process gracefully.
    Shutdown,
}

/// Outcome of one call on the wire.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WireOutcome {
    /// Return value as JSON.
    Value { json: Vec<u8> },
    /// Captured failure.
    Failure { kind: FailureKind, message: String },
}

/// Response sent from worker to broker.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Processor constructed; the worker is serving calls.
    Ready,

    /// Processor construction failed. The worker exits after sending this.
    InitFailed {
        /// Error message.
        message: String,
    },

    /// Result of one call.
    Result {
        /// Correlation key of the call.
        key: String,
        outcome: WireOutcome,
    },

    /// Response to Ping command.
    Pong,

    /// Acknowledgement of shutdown request.
    ShuttingDown,
}

impl WorkerCommand {
    /// Build the `Call` frame for an envelope.
    pub fn call(call: CallEnvelope) -> Result<Self> {
        let (key, operation, args) = call.into_parts();
        let args_json = serde_json::to_vec(&args)
            .map_err(|e| Error::Serialization(format!("Failed to encode call arguments: {}", e)))?;
        Ok(Self::Call {
            key: key.to_string(),
            operation,
            args_json,
        })
    }

    /// Build the `Init` frame for a factory and its arguments.
    pub fn init(factory: impl Into<String>, args: &serde_json::Value) -> Result<Self> {
        let args_json = serde_json::to_vec(args).map_err(|e| {
            Error::Serialization(format!("Failed to encode factory arguments: {}", e))
        })?;
        Ok(Self::Init {
            factory: factory.into(),
            args_json,
        })
    }
}

/// Decode the fields of a `Call` frame back into an envelope.
///
/// On failure the error carries the key (when it parsed) so the worker can
/// still answer the call.
pub fn decode_call(
    key: &str,
    operation: String,
    args_json: &[u8],
) -> std::result::Result<CallEnvelope, (Option<CallKey>, Failure)> {
    let key: CallKey = key.parse().map_err(|e| {
        (
            None,
            Failure::new(FailureKind::InvalidArguments, format!("invalid call key: {}", e)),
        )
    })?;
    let args: CallArgs = serde_json::from_slice(args_json).map_err(|e| {
        (
            Some(key),
            Failure::new(
                FailureKind::InvalidArguments,
                format!("undecodable arguments: {}", e),
            ),
        )
    })?;
    Ok(CallEnvelope::from_parts(key, operation, args))
}

impl From<ResultEnvelope> for WorkerResponse {
    fn from(result: ResultEnvelope) -> Self {
        let outcome = match result.outcome {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(json) => WireOutcome::Value { json },
                Err(e) => WireOutcome::Failure {
                    kind: FailureKind::Encoding,
                    message: format!("return value could not be encoded: {}", e),
                },
            },
            Err(failure) => WireOutcome::Failure {
                kind: failure.kind,
                message: failure.message,
            },
        };
        Self::Result {
            key: result.key.to_string(),
            outcome,
        }
    }
}

/// Decode the fields of a `Result` frame into an envelope.
pub fn decode_result(key: &str, outcome: WireOutcome) -> Result<ResultEnvelope> {
    let key: CallKey = key
        .parse()
        .map_err(|e| Error::Serialization(format!("Invalid result key '{}': {}", key, e)))?;
    let outcome = match outcome {
        WireOutcome::Value { json } => match serde_json::from_slice(&json) {
            Ok(value) => Ok(value),
            Err(e) => Err(Failure::new(
                FailureKind::Encoding,
                format!("return value could not be decoded: {}", e),
            )),
        },
        WireOutcome::Failure { kind, message } => Err(Failure::new(kind, message)),
    };
    Ok(ResultEnvelope { key, outcome })
}

/// Encode a message into its rkyv bytes.
fn encode(
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<rkyv::util::AlignedVec> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(Error::Serialization(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decode rkyv bytes into a message.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when reading from trusted
/// sources (our own broker or worker process).
fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    // SAFETY: both ends of the channel are processes we spawned with our own
    // protocol types, and `bytes` comes from an AlignedVec.
    unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

fn check_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    // Sanity check: reject absurdly large messages
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }
    Ok(len)
}

fn body_buffer(len: usize) -> rkyv::util::AlignedVec {
    let mut bytes = rkyv::util::AlignedVec::with_capacity(len);
    bytes.resize(len, 0);
    bytes
}

fn map_read_error(e: std::io::Error, what: &str) -> Error {
    if e.kind() == ErrorKind::UnexpectedEof {
        Error::ChannelClosed
    } else {
        Error::Ipc(format!("Failed to read IPC message {}: {}", what, e))
    }
}

/// A message encoded and length-prefixed, ready to be written.
///
/// Encoding up front lets the sender learn about oversized or unencodable
/// messages before anything touches the stream.
#[derive(Debug, Clone)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Encode `message` into a frame no larger than [`MAX_FRAME_LEN`].
    pub fn encode(
        message: &impl for<'a> Serialize<
            rkyv::rancor::Strategy<
                rkyv::ser::Serializer<
                    rkyv::util::AlignedVec,
                    rkyv::ser::allocator::ArenaHandle<'a>,
                    rkyv::ser::sharing::Share,
                >,
                rkyv::rancor::Error,
            >,
        >,
    ) -> Result<Self> {
        let body = encode(message)?;
        let mut bytes = Vec::with_capacity(4 + body.len());
        bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Write an encoded frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer
        .write_all(frame.as_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    write_frame(writer, &Frame::encode(message)?)
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// Returns [`Error::ChannelClosed`] when the peer closed the stream.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| map_read_error(e, "length"))?;
    let len = check_len(len_bytes)?;

    let mut bytes = body_buffer(len);
    reader
        .read_exact(bytes.as_mut_slice())
        .map_err(|e| map_read_error(e, "body"))?;

    decode(&bytes)
}

/// Async counterpart of [`write_frame`].
pub async fn write_frame_async<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))
}

/// Async counterpart of [`write_message`].
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let frame = Frame::encode(message)?;
    write_frame_async(writer, &frame).await
}

/// Async counterpart of [`read_message`].
pub async fn read_message_async<R: AsyncRead + Unpin, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| map_read_error(e, "length"))?;
    let len = check_len(len_bytes)?;

    let mut bytes = body_buffer(len);
    reader
        .read_exact(bytes.as_mut_slice())
        .await
        .map_err(|e| map_read_error(e, "body"))?;

    decode(&bytes)
}
