//! The receive-execute-send loop running inside the worker process.

use std::io::{BufReader, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};

use serde_json::Value;

use crate::envelope::{CallArgs, Failure, FailureKind, ResultEnvelope};
use crate::error::{Error, Result};
use crate::ipc::protocol::{
    Frame, WorkerCommand, WorkerResponse, decode_call, read_message, write_frame, write_message,
};

use super::dispatch::Dispatch;
use super::registry::WorkerRegistry;

/// Run the worker loop on this process's stdin/stdout.
///
/// Returns once the broker asks for shutdown or closes the channel. An error
/// means the processor could not be built or the channel broke.
pub fn run_worker(registry: &WorkerRegistry) -> Result<()> {
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    WorkerLoop::new(BufReader::new(stdin), BufWriter::new(stdout)).run(registry)
}

/// Sequential call executor.
///
/// Starts in the initializing state, waiting for `Init`, then serves calls
/// one at a time: the next message is read only after the previous result
/// has been written.
pub struct WorkerLoop<R, W> {
    reader: R,
    writer: W,
    served: u64,
}

impl<R: Read, W: Write> WorkerLoop<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            served: 0,
        }
    }

    /// Initialize the processor, then serve until shutdown or end of input.
    pub fn run(mut self, registry: &WorkerRegistry) -> Result<()> {
        let Some(mut processor) = self.initialize(registry)? else {
            return Ok(());
        };
        tracing::info!("processor initialized");
        self.serve(processor.as_mut())
    }

    /// Wait for `Init` and build the processor.
    ///
    /// Returns `None` when the broker went away or asked for shutdown first.
    fn initialize(&mut self, registry: &WorkerRegistry) -> Result<Option<Box<dyn Dispatch>>> {
        loop {
            let command = match read_message::<_, WorkerCommand>(&mut self.reader) {
                Ok(command) => command,
                Err(Error::ChannelClosed) => return Ok(None),
                Err(e) => return Err(e),
            };

            match command {
                WorkerCommand::Init { factory, args_json } => {
                    match Self::build(registry, &factory, &args_json) {
                        Ok(processor) => {
                            write_message(&mut self.writer, &WorkerResponse::Ready)?;
                            return Ok(Some(processor));
                        }
                        Err(message) => {
                            tracing::error!(
                                factory = %factory,
                                "processor initialization failed: {}",
                                message
                            );
                            write_message(
                                &mut self.writer,
                                &WorkerResponse::InitFailed {
                                    message: message.clone(),
                                },
                            )?;
                            return Err(Error::InitFailed(message));
                        }
                    }
                }
                WorkerCommand::Ping => write_message(&mut self.writer, &WorkerResponse::Pong)?,
                WorkerCommand::Shutdown => {
                    write_message(&mut self.writer, &WorkerResponse::ShuttingDown)?;
                    return Ok(None);
                }
                WorkerCommand::Call { .. } => {
                    return Err(Error::Handshake(
                        "call received before the processor was initialized".to_string(),
                    ));
                }
            }
        }
    }

    fn build(
        registry: &WorkerRegistry,
        factory: &str,
        args_json: &[u8],
    ) -> std::result::Result<Box<dyn Dispatch>, String> {
        let args: Value = serde_json::from_slice(args_json)
            .map_err(|e| format!("undecodable factory arguments: {}", e))?;
        match panic::catch_unwind(AssertUnwindSafe(|| registry.build(factory, args))) {
            Ok(Ok(processor)) => Ok(processor),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(payload) => Err(format!("factory panicked: {}", panic_message(&*payload))),
        }
    }

    fn serve(&mut self, processor: &mut dyn Dispatch) -> Result<()> {
        loop {
            let command = match read_message::<_, WorkerCommand>(&mut self.reader) {
                Ok(command) => command,
                Err(Error::ChannelClosed) => {
                    tracing::info!(served = self.served, "broker closed the channel");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match command {
                WorkerCommand::Call {
                    key,
                    operation,
                    args_json,
                } => {
                    let result = match decode_call(&key, operation, &args_json) {
                        Ok(call) => {
                            let key = call.key();
                            tracing::debug!(%key, operation = call.operation(), "processing");
                            let outcome = execute(processor, call.operation(), call.args());
                            ResultEnvelope { key, outcome }
                        }
                        Err((Some(key), failure)) => ResultEnvelope::failure(key, failure),
                        Err((None, failure)) => {
                            // Nothing to correlate the answer with.
                            tracing::warn!(key = %key, "dropping call: {}", failure);
                            continue;
                        }
                    };
                    write_frame(&mut self.writer, &result_frame(result)?)?;
                    self.served += 1;
                }
                WorkerCommand::Ping => write_message(&mut self.writer, &WorkerResponse::Pong)?,
                WorkerCommand::Shutdown => {
                    tracing::info!(served = self.served, "shutting down");
                    write_message(&mut self.writer, &WorkerResponse::ShuttingDown)?;
                    return Ok(());
                }
                WorkerCommand::Init { factory, .. } => {
                    tracing::warn!(%factory, "ignoring Init: processor already initialized");
                }
            }
        }
    }
}

/// Invoke one operation, turning panics into failures.
fn execute(
    processor: &mut dyn Dispatch,
    operation: &str,
    args: &CallArgs,
) -> std::result::Result<Value, Failure> {
    match panic::catch_unwind(AssertUnwindSafe(|| processor.dispatch(operation, args))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(Failure::new(
            FailureKind::Panicked,
            format!("'{}' panicked: {}", operation, panic_message(&*payload)),
        )),
    }
}

/// Frame a call result. A value too large for the channel is replaced by an
/// `Encoding` failure for the same key.
fn result_frame(result: ResultEnvelope) -> Result<Frame> {
    let key = result.key;
    match Frame::encode(&WorkerResponse::from(result)) {
        Err(Error::Serialization(message)) => {
            tracing::warn!(%key, "result cannot be sent: {}", message);
            let failure = Failure::new(
                FailureKind::Encoding,
                format!("return value could not be encoded: {}", message),
            );
            Frame::encode(&WorkerResponse::from(ResultEnvelope::failure(key, failure)))
        }
        other => other,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallEnvelope;
    use crate::ipc::MAX_FRAME_LEN;
    use crate::ipc::protocol::decode_result;
    use crate::worker::{Operations, Processor};
    use serde_json::json;
    use std::io::Cursor;

    struct Tally {
        count: u64,
    }

    impl Processor for Tally {
        fn operations() -> Operations<Self> {
            Operations::new()
                .register("incr", |t: &mut Self, _: &CallArgs| {
                    t.count += 1;
                    Ok(t.count)
                })
                .register("echo", |_: &mut Self, args: &CallArgs| {
                    let x: Value = args.get(0, "x")?;
                    Ok(x)
                })
                .register("explode", |_: &mut Self, _: &CallArgs| -> anyhow::Result<()> {
                    panic!("kaboom")
                })
                .register("huge", |_: &mut Self, _: &CallArgs| {
                    Ok("x".repeat(MAX_FRAME_LEN + 1))
                })
        }
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new().register("tally", |start: u64| Ok(Tally { count: start }))
    }

    fn script(commands: Vec<WorkerCommand>) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for command in &commands {
            write_message(&mut buf, command).unwrap();
        }
        Cursor::new(buf)
    }

    fn responses(bytes: Vec<u8>) -> Vec<WorkerResponse> {
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        loop {
            match read_message::<_, WorkerResponse>(&mut cursor) {
                Ok(resp) => out.push(resp),
                Err(Error::ChannelClosed) => return out,
                Err(e) => panic!("bad response stream: {}", e),
            }
        }
    }

    fn result_of(resp: &WorkerResponse) -> ResultEnvelope {
        match resp.clone() {
            WorkerResponse::Result { key, outcome } => decode_result(&key, outcome).unwrap(),
            other => panic!("expected result, got {:?}", other),
        }
    }

    fn init(start: u64) -> WorkerCommand {
        WorkerCommand::init("tally", &json!(start)).unwrap()
    }

    #[test]
    fn test_serves_calls_in_order() {
        let calls: Vec<CallEnvelope> = (0..3).map(|_| CallEnvelope::new("incr")).collect();
        let keys: Vec<_> = calls.iter().map(|c| c.key()).collect();

        let mut commands = vec![init(10)];
        commands.extend(calls.into_iter().map(|c| WorkerCommand::call(c).unwrap()));

        let mut out = Vec::new();
        WorkerLoop::new(script(commands), &mut out)
            .run(&registry())
            .unwrap();

        let resps = responses(out);
        assert!(matches!(resps[0], WorkerResponse::Ready));
        assert_eq!(resps.len(), 4);
        for (i, key) in keys.iter().enumerate() {
            let result = result_of(&resps[i + 1]);
            assert_eq!(&result.key, key);
            assert_eq!(result.value(), Some(&json!(11 + i as u64)));
        }
    }

    #[test]
    fn test_failures_do_not_stop_the_loop() {
        let missing = CallEnvelope::new("missing_method");
        let explode = CallEnvelope::new("explode");
        let echo = CallEnvelope::new("echo").arg("hi");

        let commands = vec![
            init(0),
            WorkerCommand::call(missing).unwrap(),
            WorkerCommand::call(explode).unwrap(),
            WorkerCommand::call(echo).unwrap(),
        ];

        let mut out = Vec::new();
        WorkerLoop::new(script(commands), &mut out)
            .run(&registry())
            .unwrap();
        let resps = responses(out);

        let missing = result_of(&resps[1]);
        let failure = missing.failure_detail().unwrap();
        assert_eq!(failure.kind, FailureKind::OperationNotFound);
        assert!(failure.message.contains("missing_method"));

        let explode = result_of(&resps[2]);
        let failure = explode.failure_detail().unwrap();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("kaboom"));

        assert_eq!(result_of(&resps[3]).value(), Some(&json!("hi")));
    }

    #[test]
    fn test_unsendable_result_becomes_encoding_failure() {
        let huge = CallEnvelope::new("huge");
        let huge_key = huge.key();
        let commands = vec![
            init(0),
            WorkerCommand::call(huge).unwrap(),
            WorkerCommand::call(CallEnvelope::new("incr")).unwrap(),
        ];

        let mut out = Vec::new();
        WorkerLoop::new(script(commands), &mut out)
            .run(&registry())
            .unwrap();
        let resps = responses(out);
        assert_eq!(resps.len(), 3);

        let huge = result_of(&resps[1]);
        assert_eq!(huge.key, huge_key);
        let failure = huge.failure_detail().unwrap();
        assert_eq!(failure.kind, FailureKind::Encoding);
        assert!(failure.message.contains("too large"));

        // The loop kept serving.
        assert_eq!(result_of(&resps[2]).value(), Some(&json!(1)));
    }

    #[test]
    fn test_init_failure_is_reported_and_fatal() {
        let commands = vec![WorkerCommand::init("nope", &Value::Null).unwrap()];

        let mut out = Vec::new();
        let err = WorkerLoop::new(script(commands), &mut out)
            .run(&registry())
            .unwrap_err();
        assert!(matches!(err, Error::InitFailed(ref msg) if msg.contains("nope")));

        let resps = responses(out);
        assert!(matches!(
            &resps[0],
            WorkerResponse::InitFailed { message } if message.contains("nope")
        ));
    }

    #[test]
    fn test_ping_and_shutdown() {
        let after_shutdown = CallEnvelope::new("incr");
        let commands = vec![
            WorkerCommand::Ping,
            init(0),
            WorkerCommand::Ping,
            WorkerCommand::Shutdown,
            WorkerCommand::call(after_shutdown).unwrap(),
        ];

        let mut out = Vec::new();
        WorkerLoop::new(script(commands), &mut out)
            .run(&registry())
            .unwrap();
        let resps = responses(out);

        assert_eq!(resps.len(), 4);
        assert!(matches!(resps[0], WorkerResponse::Pong));
        assert!(matches!(resps[1], WorkerResponse::Ready));
        assert!(matches!(resps[2], WorkerResponse::Pong));
        assert!(matches!(resps[3], WorkerResponse::ShuttingDown));
    }

    #[test]
    fn test_call_before_init_is_rejected() {
        let commands = vec![WorkerCommand::call(CallEnvelope::new("incr")).unwrap()];
        let mut out = Vec::new();
        let err = WorkerLoop::new(script(commands), &mut out)
            .run(&registry())
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic payload");
    }
}
