//! Background tasks attached to a broker: the channel writer and the
//! completion listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};

use crate::envelope::ResultEnvelope;
use crate::error::Error;
use crate::ipc::protocol::{
    Frame, WorkerResponse, decode_result, read_message_async, write_frame_async,
};

use super::table::PendingTable;

/// State shared between the broker, its waiters and its background tasks.
#[derive(Debug)]
pub(crate) struct Shared {
    table: Mutex<PendingTable>,
    /// Signalled after every completion and when the channel dies.
    completion: Notify,
    alive: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            completion: Notify::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Lock the pending table. Critical sections never panic, so a poisoned
    /// lock still holds a consistent table.
    pub(crate) fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn completion(&self) -> &Notify {
        &self.completion
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the channel dead and release every waiter.
    pub(crate) fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let outstanding = self.table().outstanding_len();
            if outstanding > 0 {
                tracing::error!(outstanding, "worker channel closed with calls still outstanding");
            } else {
                tracing::debug!("worker channel closed");
            }
        }
        self.completion.notify_waiters();
    }

    /// Store an arrived result and wake waiters.
    fn complete(&self, result: ResultEnvelope) {
        let key = result.key;
        match &result.outcome {
            Ok(_) => tracing::info!(%key, "completed"),
            Err(failure) => tracing::warn!(%key, "failed: {}", failure),
        }
        if self.table().complete(result).is_err() {
            tracing::warn!(%key, "dropping result for a key that is not outstanding");
        }
        self.completion.notify_waiters();
    }

    fn pong(&self) {
        self.table().record_pong();
        self.completion.notify_waiters();
    }
}

/// Drain results from the worker until the channel closes.
///
/// This is the only reader of the worker's output.
pub(crate) async fn completion_listener<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message_async::<_, WorkerResponse>(&mut reader).await {
            Ok(WorkerResponse::Result { key, outcome }) => match decode_result(&key, outcome) {
                Ok(result) => shared.complete(result),
                Err(e) => tracing::warn!("discarding undecodable result: {}", e),
            },
            Ok(WorkerResponse::ShuttingDown) => tracing::debug!("worker acknowledged shutdown"),
            Ok(WorkerResponse::Pong) => shared.pong(),
            Ok(other) => tracing::warn!("unexpected message from worker: {:?}", other),
            Err(Error::ChannelClosed) => break,
            Err(e) => {
                tracing::error!("worker channel failed: {}", e);
                break;
            }
        }
    }
    shared.mark_dead();
}

/// Forward queued frames to the worker in submission order.
///
/// Frames are encoded by the submitter, so only a broken stream ends this
/// early. Ends when every sender is gone or a write fails.
pub(crate) async fn channel_writer<W>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if let Err(e) = write_frame_async(&mut writer, &frame).await {
            tracing::error!("failed to send to worker: {}", e);
            shared.mark_dead();
            return;
        }
    }
    tracing::debug!("command queue closed");
}
