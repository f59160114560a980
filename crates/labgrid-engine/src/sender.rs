//! Outbound half of an edge connection as seen by the engines.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use labgrid_core::{Outbound, epoch_secs_f64};

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait EdgeSender: Send + Sync {
    /// Queue a message for the lab. Fails with `ConnectionClosed` once the
    /// session's writer is gone.
    async fn send(&self, msg: Outbound) -> EngineResult<()>;

    fn is_closed(&self) -> bool;
}

/// Sender backed by the session's single-writer channel.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// A sender plus the receiving end the writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EdgeSender for ChannelSender {
    async fn send(&self, msg: Outbound) -> EngineResult<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| EngineError::ConnectionClosed)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Wall-clock send timestamps that never repeat or go backwards.
#[derive(Debug, Default)]
pub struct SendClock {
    last_micros: AtomicU64,
}

impl SendClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp in fractional unix seconds.
    pub fn next(&self) -> f64 {
        let now = (epoch_secs_f64() * 1_000_000.0) as u64;
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last_micros.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate as f64 / 1_000_000.0,
                Err(actual) => prev = actual,
            }
        }
    }
}
