//! Broker link bookkeeping shared between the receive side and the publishing
//! side of the network context.
//!
//! The receive side only records what happened. Subscribing and publishing run
//! on the publishing side, outside any broker event callback.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct LinkMonitor {
    connected: AtomicBool,
    subscribe_pending: AtomicBool,
}

impl LinkMonitor {
    /// Records a (re)connect. The control subscription must be reissued.
    pub fn mark_connected(&self) {
        self.subscribe_pending.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Claims the pending subscription while connected. Returns `true` at most
    /// once per connect unless [`LinkMonitor::retry_subscribe`] is called.
    pub fn take_subscribe(&self) -> bool {
        self.is_connected() && self.subscribe_pending.swap(false, Ordering::SeqCst)
    }

    pub fn retry_subscribe(&self) {
        self.subscribe_pending.store(true, Ordering::SeqCst);
    }
}

/// Doubling retry delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    next_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        let initial_ms = initial_ms.max(1);
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            next_ms: initial_ms,
        }
    }

    pub fn next_delay_ms(&mut self) -> u64 {
        let delay = self.next_ms;
        self.next_ms = self.next_ms.saturating_mul(2).min(self.max_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.next_ms = self.initial_ms;
    }
}
