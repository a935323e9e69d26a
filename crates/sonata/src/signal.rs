// src/signal.rs
//! Bridge from asynchronous signals to the reactor's event stream.
//!
//! Signal handlers only write a one-byte marker (the signal number) into a
//! non-blocking pipe. The reactor watches the read end like any other socket
//! and decides what the markers mean once the current batch of I/O is done.

use crate::error::{SonataError, SonataResult};
use crate::syscalls;
use libc::c_int;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

/// Write end the handlers post to; -1 when no bridge is installed.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// What a marker byte read from the pipe means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Periodic alarm: run the idle-timer tick.
    Alarm,
    /// Termination request: leave the event loop.
    Terminate,
    Unknown(u8),
}

impl Marker {
    pub fn from_byte(b: u8) -> Self {
        match b as c_int {
            libc::SIGALRM => Marker::Alarm,
            libc::SIGTERM | libc::SIGINT => Marker::Terminate,
            _ => Marker::Unknown(b),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Marker::Alarm => libc::SIGALRM as u8,
            Marker::Terminate => libc::SIGTERM as u8,
            Marker::Unknown(b) => b,
        }
    }
}

/// Summary of one drain of the signal pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub timeout: bool,
    pub stop: bool,
}

pub struct SignalPipe {
    read: OwnedFd,
    write: Arc<OwnedFd>,
}

impl SignalPipe {
    pub fn new() -> SonataResult<Self> {
        let (r, w) = syscalls::create_pipe()?;
        // create_pipe hands over two fresh descriptors we now own.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) };
        Ok(Self {
            read,
            write: Arc::new(write),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Route SIGALRM, SIGINT and SIGTERM into this pipe and ignore SIGPIPE.
    ///
    /// Only one pipe can be installed per process; installing a second one
    /// redirects the markers to it.
    pub fn install(&self) -> SonataResult<()> {
        WAKE_FD.store(self.write.as_raw_fd(), Ordering::Release);

        unsafe {
            if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
                return Err(SonataError::Signal(std::io::Error::last_os_error().to_string()));
            }

            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigfillset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGALRM, &sa, std::ptr::null_mut()) < 0 {
                return Err(SonataError::Signal(std::io::Error::last_os_error().to_string()));
            }
        }

        // ctrlc runs its handler on a dedicated thread, so a plain write is fine.
        match ctrlc::set_handler(|| post(Marker::Terminate)) {
            Ok(()) => {}
            Err(ctrlc::Error::MultipleHandlers) => {
                tracing::debug!("termination handler already installed");
            }
            Err(e) => return Err(SonataError::Signal(e.to_string())),
        }
        Ok(())
    }

    /// Read every queued marker and fold them into a [`Pending`] summary.
    pub fn drain(&self) -> Pending {
        let mut pending = Pending::default();
        let mut buf = [0u8; 1024];
        loop {
            match syscalls::read_nonblocking(self.read_fd(), &mut buf) {
                Ok(Some(n)) if n > 0 => {
                    for &b in &buf[..n] {
                        match Marker::from_byte(b) {
                            Marker::Alarm => pending.timeout = true,
                            Marker::Terminate => pending.stop = true,
                            Marker::Unknown(b) => {
                                tracing::debug!(marker = b, "ignoring unknown signal marker");
                            }
                        }
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "signal pipe read failed");
                    break;
                }
            }
        }
        pending
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            write: Arc::clone(&self.write),
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        let _ = WAKE_FD.compare_exchange(
            self.write.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Asks a running server to stop, from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    write: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        write_marker(self.write.as_raw_fd(), Marker::Terminate);
    }
}

/// Post a marker to the installed pipe. Async-signal-safe.
pub fn post(marker: Marker) {
    let fd = WAKE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        write_marker(fd, marker);
    }
}

fn write_marker(fd: RawFd, marker: Marker) {
    let byte = marker.as_byte();
    // A full pipe already holds enough markers to wake the reactor.
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

extern "C" fn on_signal(sig: c_int) {
    let saved = unsafe { *libc::__errno_location() };
    post(Marker::from_byte(sig as u8));
    unsafe {
        *libc::__errno_location() = saved;
    }
}

/// Arrange for SIGALRM in `secs` seconds, replacing any pending alarm.
pub fn schedule_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

pub fn cancel_alarm() {
    unsafe {
        libc::alarm(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_round_trip_signal_numbers() {
        assert_eq!(Marker::from_byte(Marker::Alarm.as_byte()), Marker::Alarm);
        assert_eq!(Marker::from_byte(libc::SIGINT as u8), Marker::Terminate);
        assert_eq!(Marker::from_byte(0), Marker::Unknown(0));
    }

    #[test]
    fn drain_classifies_and_empties_the_pipe() {
        let pipe = SignalPipe::new().unwrap();
        assert_eq!(pipe.drain(), Pending::default());

        let w = pipe.write.as_raw_fd();
        write_marker(w, Marker::Alarm);
        write_marker(w, Marker::Alarm);
        write_marker(w, Marker::Unknown(99));
        assert_eq!(
            pipe.drain(),
            Pending {
                timeout: true,
                stop: false
            }
        );

        pipe.shutdown_handle().shutdown();
        assert_eq!(
            pipe.drain(),
            Pending {
                timeout: false,
                stop: true
            }
        );
        assert_eq!(pipe.drain(), Pending::default());
    }
}
