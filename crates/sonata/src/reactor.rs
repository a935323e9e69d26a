// src/reactor.rs
//! The single event-loop thread.
//!
//! The reactor owns every registration change, the idle-timer list and the
//! live-connection count. Workers only ever see a connection between the
//! reactor handing it over and the one-shot re-arm at the end of `process`.

use crate::error::SonataResult;
use crate::server::ServerContext;
use crate::signal::{self, SignalPipe};
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};
use crate::timer::{TimerId, TimerList};
use crate::worker::{Task, WorkerPool};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_EVENTS: usize = 10_000;

/// Idle connections are evicted after this many ticks without traffic.
pub const IDLE_TICKS: u32 = 3;

/// How long a connection may stay silent before it is evicted.
pub fn idle_timeout(tick_secs: u32) -> Duration {
    Duration::from_secs(u64::from(tick_secs).saturating_mul(u64::from(IDLE_TICKS)))
}

pub struct Reactor {
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
    listen_fd: RawFd,
    signals: SignalPipe,
    timers: TimerList,
    /// Timer handle per descriptor, for the connections that are open.
    conn_timers: Vec<Option<TimerId>>,
    tick_secs: u32,
    idle: Duration,
    events: Vec<epoll_event>,
}

impl Reactor {
    /// Register the listening socket and the signal pipe with the context's epoll.
    pub fn new(
        ctx: Arc<ServerContext>,
        pool: WorkerPool,
        listen_fd: RawFd,
        signals: SignalPipe,
        tick_secs: u32,
    ) -> SonataResult<Self> {
        ctx.epoll.add(listen_fd, listen_fd as u64, EPOLLIN)?;
        ctx.epoll
            .add(signals.read_fd(), signals.read_fd() as u64, EPOLLIN)?;

        let tick_secs = tick_secs.max(1);
        let conn_timers = vec![None; ctx.table.capacity()];
        Ok(Self {
            ctx,
            pool,
            listen_fd,
            signals,
            timers: TimerList::new(),
            conn_timers,
            tick_secs,
            idle: idle_timeout(tick_secs),
            events: vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    /// Dispatch events until a terminate marker arrives.
    ///
    /// Idle expiry runs after each batch of I/O events, so a tick never
    /// delays reads and writes that are already ready.
    pub fn run(&mut self) -> SonataResult<()> {
        signal::schedule_alarm(self.tick_secs);
        let mut stop = false;

        while !stop {
            let n = self.ctx.epoll.wait(&mut self.events, -1)?;
            let mut timeout = false;

            for i in 0..n {
                let event = self.events[i];
                let fd = event.u64 as RawFd;
                let flags = event.events;

                if fd == self.listen_fd {
                    self.accept_all();
                } else if fd == self.signals.read_fd() {
                    let pending = self.signals.drain();
                    timeout |= pending.timeout;
                    stop |= pending.stop;
                } else if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.close(fd);
                } else if flags & EPOLLIN as u32 != 0 {
                    self.on_readable(fd);
                } else if flags & EPOLLOUT as u32 != 0 {
                    self.on_writable(fd);
                }
            }

            if timeout {
                self.timer_handler();
            }
        }

        tracing::info!("stop requested, leaving event loop");
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, fd: RawFd, peer: Option<SocketAddr>) {
        if !self.ctx.table.admits(fd) {
            tracing::warn!(
                fd,
                live = self.ctx.table.live(),
                max = self.ctx.table.max_connections(),
                "server busy, rejecting connection"
            );
            syscalls::close_fd(fd);
            self.ctx.metrics.inc_rejected();
            return;
        }

        let Some(mut conn) = self.ctx.table.get(fd) else {
            syscalls::close_fd(fd);
            return;
        };
        if let Err(e) = conn.init(fd, peer, &self.ctx.epoll, self.ctx.table.live_counter()) {
            tracing::warn!(fd, error = %e, "failed to register connection");
            syscalls::close_fd(fd);
            return;
        }
        drop(conn);

        self.ctx.metrics.inc_accepted();
        let id = self.timers.add(Instant::now() + self.idle, fd);
        self.conn_timers[fd as usize] = Some(id);
        tracing::debug!(fd, peer = ?peer, "connection accepted");
    }

    fn on_readable(&mut self, fd: RawFd) {
        let task = match self.ctx.table.get(fd) {
            Some(mut conn) if conn.is_open() => conn.read().then(|| Task {
                fd,
                generation: conn.generation(),
            }),
            _ => return,
        };

        match task {
            Some(task) => {
                self.refresh(fd);
                self.pool.append(task);
            }
            None => self.close(fd),
        }
    }

    fn on_writable(&mut self, fd: RawFd) {
        let keep = match self.ctx.table.get(fd) {
            Some(mut conn) if conn.is_open() => conn.write(&self.ctx.epoll, &self.ctx.metrics),
            _ => return,
        };

        if keep {
            self.refresh(fd);
        } else {
            self.close(fd);
        }
    }

    fn refresh(&mut self, fd: RawFd) {
        if let Some(Some(id)) = self.conn_timers.get(fd as usize) {
            self.timers.adjust(*id, Instant::now() + self.idle);
        }
    }

    fn close(&mut self, fd: RawFd) {
        if let Some(id) = self.conn_timers.get_mut(fd as usize).and_then(Option::take) {
            self.timers.delete(id);
        }
        if let Some(mut conn) = self.ctx.table.get(fd) {
            conn.close_conn(&self.ctx.epoll, self.ctx.table.live_counter());
        }
    }

    /// Evict idle connections and schedule the next alarm.
    fn timer_handler(&mut self) {
        let mut expired = Vec::new();
        self.timers.tick(Instant::now(), |fd| expired.push(fd));

        for fd in expired {
            if let Some(slot) = self.conn_timers.get_mut(fd as usize) {
                *slot = None;
            }
            if let Some(mut conn) = self.ctx.table.get(fd) {
                if conn.close_conn(&self.ctx.epoll, self.ctx.table.live_counter()) {
                    self.ctx.metrics.inc_timed_out();
                    tracing::debug!(fd, "idle connection evicted");
                }
            }
        }

        signal::schedule_alarm(self.tick_secs);
        tracing::debug!(
            live = self.ctx.table.live(),
            timers = self.timers.len(),
            queued = self.pool.queued(),
            metrics = ?self.ctx.metrics.snapshot(),
            "tick"
        );
    }

    /// Stop the workers, close every remaining connection and cancel the alarm.
    pub fn shutdown(mut self) -> usize {
        signal::cancel_alarm();
        self.pool.shutdown();

        for slot in self.conn_timers.iter_mut() {
            if let Some(id) = slot.take() {
                self.timers.delete(id);
            }
        }
        let closed = self.ctx.table.close_all(&self.ctx.epoll);

        if let Err(e) = self.ctx.epoll.delete(self.listen_fd) {
            tracing::debug!(error = %e, "failed to deregister listener");
        }
        closed
    }
}
