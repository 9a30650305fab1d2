//! Metrics module for the processing queue
//!
//! Read-only snapshots for observability; nothing in the queue's behavior
//! depends on them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of the processing queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Items waiting in the intake buffer
    pub queue_length: usize,
    /// True while at least one worker is converting
    pub is_processing: bool,
    /// Size of the worker pool
    pub max_concurrency: usize,
    /// Workers busy right now
    pub in_flight: usize,
    /// Items converted since start
    pub converted: u64,
    /// Items that reached a terminal failure since start
    pub failed: u64,
}

/// Live counters shared by the dispatch loop and workers.
#[derive(Debug, Default)]
pub struct QueueCounters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    converted: AtomicU64,
    failed: AtomicU64,
}

impl QueueCounters {
    pub fn item_queued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn item_dequeued(&self) {
        // saturating: never wraps if a pop races a snapshot
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn worker_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_finished(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn record_converted(&self) {
        self.converted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self, max_concurrency: usize) -> QueueStats {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        QueueStats {
            queue_length: self.queued.load(Ordering::SeqCst),
            is_processing: in_flight > 0,
            max_concurrency,
            in_flight,
            converted: self.converted.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}
