// src/slab.rs
use crate::conn::Connection;
use crate::syscalls::Epoll;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Fixed table of connection slots indexed by socket descriptor.
///
/// Slots are created once at startup and reused for every TCP connection that
/// lands on the same descriptor value. Each slot sits behind its own mutex;
/// one-shot re-arming already keeps two threads off the same connection, so
/// the lock is uncontended in steady state and only orders the handoff between
/// the reactor and a worker.
///
/// The table also owns the live-connection counter. Only the reactor thread
/// changes it (through [`Connection::init`] and [`Connection::close_conn`]).
pub struct ConnectionTable {
    slots: Box<[Mutex<Connection>]>,
    live: AtomicUsize,
    max_connections: usize,
}

impl ConnectionTable {
    /// Allocate `max_fd` slots. Buffers are allocated lazily on first use.
    pub fn new(max_fd: usize, max_connections: usize) -> Self {
        let slots = (0..max_fd)
            .map(|_| Mutex::new(Connection::empty()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            live: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Lock the slot for `fd`. A poisoned slot is recovered: the panic that
    /// poisoned it has already been turned into a close request.
    pub fn get(&self, fd: RawFd) -> Option<MutexGuard<'_, Connection>> {
        let slot = self.slots.get(usize::try_from(fd).ok()?)?;
        Some(slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Whether a freshly accepted `fd` can be admitted.
    pub fn admits(&self, fd: RawFd) -> bool {
        let fits = usize::try_from(fd).is_ok_and(|i| i < self.slots.len());
        fits && self.live() < self.max_connections
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn live_counter(&self) -> &AtomicUsize {
        &self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Close every open connection. Used on shutdown.
    pub fn close_all(&self, epoll: &Epoll) -> usize {
        let mut closed = 0;
        for slot in self.slots.iter() {
            let mut conn = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if conn.close_conn(epoll, &self.live) {
                closed += 1;
            }
        }
        closed
    }
}
