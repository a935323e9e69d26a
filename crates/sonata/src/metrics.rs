// src/metrics.rs
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters, shared by the reactor and the workers.
#[repr(C, align(64))]
pub struct ServerMetrics {
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub timed_out: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub bytes_sent: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub timed_out: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            timed_out: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
