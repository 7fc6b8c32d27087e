//! Controller-side dispatch of calls to a worker process.
//!
//! A [`Broker`] owns one worker process. Any number of tasks may submit calls
//! and wait for their results concurrently; the worker executes them one at
//! a time in submission order.

mod listener;
mod table;

use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::envelope::{CallArgs, CallEnvelope, CallKey, ResultEnvelope};
use crate::error::{Error, Result};
use crate::ipc::protocol::{
    Frame, WorkerCommand, WorkerResponse, read_message_async, write_frame_async,
};
use crate::ipc::{WorkerConfig, WorkerProcess};

use listener::{Shared, channel_writer, completion_listener};
use table::KeyState;

/// Time the worker gets to exit after a shutdown request before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to a worker process running one processor.
///
/// Share it between tasks with an `Arc`. Dropping the broker closes the
/// channel and kills the worker process.
pub struct Broker {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Frame>,
    process: Option<WorkerProcess>,
    pid: Option<u32>,
    listener: JoinHandle<()>,
}

impl Broker {
    /// Spawn the worker process and build its processor.
    ///
    /// Returns once the worker reports that the processor is ready. Any
    /// failure along the way is returned here; there is no partially started
    /// broker.
    pub async fn start(config: WorkerConfig) -> Result<Self> {
        let (process, stdin, stdout) = WorkerProcess::spawn(&config)?;
        let pid = process.pid();

        // On error `process` is dropped here, which kills the child.
        let mut broker = Self::connect(stdout, stdin, &config).await?;
        broker.process = Some(process);
        broker.pid = pid;

        tracing::info!(?pid, factory = %config.factory, "worker ready");
        Ok(broker)
    }

    /// Run the handshake over an existing byte stream pair and start the
    /// background tasks.
    ///
    /// `reader` carries worker responses, `writer` carries commands. Only the
    /// factory and handshake settings of `config` are used.
    pub async fn connect<R, W>(
        mut reader: R,
        mut writer: W,
        config: &WorkerConfig,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let init = Frame::encode(&WorkerCommand::init(&config.factory, &config.factory_args)?)?;

        // A worker that never reads stdin can stall the write too.
        let handshake = async {
            write_frame_async(&mut writer, &init).await?;
            read_message_async::<_, WorkerResponse>(&mut reader).await
        };
        let response = tokio::time::timeout(config.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                Error::Handshake(format!(
                    "worker did not become ready within {:?}",
                    config.handshake_timeout
                ))
            })?;

        match response {
            Ok(WorkerResponse::Ready) => {}
            Ok(WorkerResponse::InitFailed { message }) => return Err(Error::InitFailed(message)),
            Ok(other) => {
                return Err(Error::Handshake(format!(
                    "unexpected response to Init: {:?}",
                    other
                )));
            }
            Err(Error::ChannelClosed) => {
                return Err(Error::Handshake(
                    "worker exited during initialization".to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        let shared = Arc::new(Shared::new());
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(channel_writer(writer, queue, Arc::clone(&shared)));
        let listener = tokio::spawn(completion_listener(reader, Arc::clone(&shared)));

        Ok(Self {
            shared,
            outbound,
            process: None,
            pid: None,
            listener,
        })
    }

    /// Queue a call for the worker and return its key immediately.
    ///
    /// Never waits for the worker. Fails with [`Error::WorkerGone`] once the
    /// channel is known to be closed, with [`Error::DuplicateKey`] if this
    /// envelope's key was submitted before, and with
    /// [`Error::Serialization`] if the call cannot be framed. A call that
    /// fails here leaves no trace in the broker.
    pub fn submit(&self, call: CallEnvelope) -> Result<CallKey> {
        if !self.shared.is_alive() {
            return Err(Error::WorkerGone);
        }

        let key = call.key();
        let operation = call.operation().to_string();
        let frame = Frame::encode(&WorkerCommand::call(call)?)?;

        // The key must be outstanding before the worker can possibly answer.
        if !self.shared.table().submit(key) {
            return Err(Error::DuplicateKey(key));
        }
        if self.outbound.send(frame).is_err() {
            self.shared.table().retract(&key);
            return Err(Error::WorkerGone);
        }
        tracing::info!(%key, %operation, "scheduled");
        Ok(key)
    }

    /// Submit a call to `operation` with `args`.
    pub fn call(&self, operation: impl Into<String>, args: CallArgs) -> Result<CallKey> {
        self.submit(CallEnvelope::with_args(operation, args))
    }

    /// Wait until the call with `key` has completed and claim its result.
    ///
    /// Returns `Ok(None)` for keys that were never submitted or whose result
    /// was already claimed; each key should be waited on once. Returns
    /// [`Error::WorkerGone`] if the worker died while the call was
    /// outstanding.
    ///
    /// There is no built-in timeout. Wrap the future in
    /// `tokio::time::timeout` if needed; an abandoned result stays stored
    /// until the broker is dropped.
    pub async fn wait(&self, key: &CallKey) -> Result<Option<ResultEnvelope>> {
        loop {
            // Register before checking so a completion between the check
            // and the await still wakes us.
            let mut notified = pin!(self.shared.completion().notified());
            notified.as_mut().enable();

            let state = self.shared.table().claim(key);
            match state {
                KeyState::Claimed(result) => return Ok(Some(result)),
                KeyState::Absent => return Ok(None),
                KeyState::Outstanding => {}
            }
            if !self.shared.is_alive() {
                return Err(Error::WorkerGone);
            }

            notified.await;
        }
    }

    /// Submit a call and wait for its result.
    pub async fn submit_and_wait(&self, call: CallEnvelope) -> Result<Option<ResultEnvelope>> {
        let key = self.submit(call)?;
        self.wait(&key).await
    }

    /// Round trip a ping through the worker and return how long it took.
    ///
    /// The ping is queued behind every call already submitted, so the time
    /// includes running those. Fails with [`Error::WorkerGone`] if the
    /// channel closes first.
    pub async fn ping(&self) -> Result<Duration> {
        let frame = Frame::encode(&WorkerCommand::Ping)?;
        let started = Instant::now();
        let seq = {
            // Numbering and queueing under one lock keeps them in the same order.
            let mut table = self.shared.table();
            if !self.shared.is_alive() || self.outbound.send(frame).is_err() {
                return Err(Error::WorkerGone);
            }
            table.record_ping()
        };

        loop {
            let mut notified = pin!(self.shared.completion().notified());
            notified.as_mut().enable();

            if self.shared.table().is_answered(seq) {
                let elapsed = started.elapsed();
                tracing::debug!(?elapsed, "pong");
                return Ok(elapsed);
            }
            if !self.shared.is_alive() {
                return Err(Error::WorkerGone);
            }

            notified.await;
        }
    }

    /// False once the channel to the worker has closed.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Process ID of the worker, if this broker spawned one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Number of calls submitted but not yet completed.
    pub fn outstanding_count(&self) -> usize {
        self.shared.table().outstanding_len()
    }

    /// Number of completed results nobody has claimed yet.
    pub fn unclaimed_count(&self) -> usize {
        self.shared.table().completed_len()
    }

    /// Ask the worker to exit after finishing the calls already queued.
    ///
    /// Waits for the worker process to exit, killing it if it does not do so
    /// within a few seconds.
    pub async fn shutdown(mut self) -> Result<()> {
        // A closed queue means the worker is already gone.
        let _ = self.outbound.send(Frame::encode(&WorkerCommand::Shutdown)?);

        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, process.wait()).await {
            Ok(status) => {
                let status = status?;
                if status.success() {
                    tracing::info!(pid = ?self.pid, "worker exited");
                    Ok(())
                } else {
                    Err(Error::Ipc(format!("Worker exited with status: {}", status)))
                }
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "worker ignored shutdown, killing it");
                process.kill().await
            }
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.listener.abort();
        self.shared.mark_dead();
    }
}
