//! The update pipeline and its queue-consumer harness.
//!
//! A consumer is a single logical worker draining a queue in batches: the
//! first receive blocks, everything else already queued is drained into
//! the same batch. [`run_consumer`] owns that loop; implementations only
//! provide [`QueueConsumer::process_batch`]. A shutdown sentinel stops the
//! worker after the messages queued ahead of it are processed; messages
//! queued behind it are discarded.

use std::future::Future;
use tokio::sync::mpsc::{self, error::TryRecvError};

pub mod config;
pub mod extract;
pub mod recalculate;
pub mod remap;
mod updater;

pub use updater::{Updater, UpdaterMessage};

/// A queue item: a payload for the consumer, or the shutdown sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Envelope<M> {
    Message(M),
    Shutdown,
}

/// A batch-oriented queue consumer driven by [`run_consumer`].
pub trait QueueConsumer {
    type Message: Send + 'static;

    /// Process one drained batch. Batches are never empty.
    ///
    /// An error is logged by the drive loop and does not stop the worker;
    /// implementations are expected to leave durable state untouched on
    /// failure so the work is safely redone on a later notification.
    fn process_batch(
        &mut self,
        messages: Vec<Self::Message>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Sending half of a consumer queue.
#[derive(Debug)]
pub struct ConsumerHandle<M> {
    tx: mpsc::UnboundedSender<Envelope<M>>,
}

// Manual impl: `M` itself need not be `Clone` for the handle to be.
impl<M> Clone for ConsumerHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> ConsumerHandle<M> {
    /// Enqueue one message. Dropped with a warning if the worker is gone.
    pub fn send(&self, message: M) {
        if self.tx.send(Envelope::Message(message)).is_err() {
            tracing::warn!("consumer has shut down; dropping message");
        }
    }

    /// Enqueue the shutdown sentinel.
    pub fn stop(&self) {
        let _ = self.tx.send(Envelope::Shutdown);
    }
}

/// Create the queue for one consumer worker.
pub fn channel<M>() -> (ConsumerHandle<M>, mpsc::UnboundedReceiver<Envelope<M>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConsumerHandle { tx }, rx)
}

/// Drive `consumer` until the shutdown sentinel (or until every handle is
/// dropped).
pub async fn run_consumer<C: QueueConsumer>(
    mut consumer: C,
    mut rx: mpsc::UnboundedReceiver<Envelope<C::Message>>,
) {
    loop {
        let Some(first) = rx.recv().await else {
            tracing::debug!("all consumer handles dropped; worker exiting");
            return;
        };

        let mut batch = Vec::new();
        let mut done = false;
        match first {
            Envelope::Message(message) => batch.push(message),
            Envelope::Shutdown => done = true,
        }
        while !done {
            match rx.try_recv() {
                Ok(Envelope::Message(message)) => batch.push(message),
                Ok(Envelope::Shutdown) => done = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if !batch.is_empty() {
            if let Err(err) = consumer.process_batch(batch).await {
                tracing::error!("failed to process batch: {err:#}");
            }
        }
        if done {
            tracing::info!("consumer received shutdown sentinel; worker exiting");
            return;
        }
    }
}
