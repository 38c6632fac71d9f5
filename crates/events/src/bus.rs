//! Real-time event distribution.
//!
//! The bus carries events *after* they were pushed to the event store. It is
//! best-effort: the store stays the source of truth, and the scheduler picks up
//! anything a subscriber missed. Subscribers must be idempotent.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TryRecvError};

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every message published after it was
/// created. Messages arrive in publish order.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait for one message, then drain everything already queued behind it.
    ///
    /// Returns an empty batch once the bus is gone.
    pub async fn recv_batch(&mut self) -> Vec<M> {
        let Some(first) = self.recv().await else {
            return Vec::new();
        };
        let mut batch = vec![first];
        while let Ok(next) = self.try_recv() {
            batch.push(next);
        }
        batch
    }
}

/// Pub/sub abstraction for distributing events to consumers.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
