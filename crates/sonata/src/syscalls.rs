// src/syscalls.rs
use crate::error::SonataResult;
use libc::{c_int, c_void, socklen_t};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;
use std::ptr;

pub use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: SocketAddr, backlog: c_int) -> SonataResult<c_int> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // Restarts must not wait out TIME_WAIT on the old listener.
        let optval: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let (storage, len) = socket_addr_to_raw(&addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Address a socket is bound to. Used to discover ephemeral ports.
pub fn local_addr(fd: c_int) -> SonataResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let res = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    raw_to_socket_addr(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unsupported address family").into())
}

/// Accept a non-blocking connection, returning the descriptor and peer address.
/// `Ok(None)` means the accept queue is drained.
pub fn accept_connection(listen_fd: c_int) -> SonataResult<Option<(c_int, Option<SocketAddr>)>> {
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd >= 0 {
            return Ok(Some((fd, raw_to_socket_addr(&storage))));
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            // The peer gave up between SYN and accept; try the next one.
            io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

/// Thin owner of an epoll instance. Every registration is edge-triggered;
/// callers add `EPOLLONESHOT` where a descriptor must be re-armed explicitly.
///
/// `epoll_ctl` is safe to call from several threads, so one instance is shared
/// between the reactor and the workers behind an `Arc`.
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> SonataResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> SonataResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> SonataResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> SonataResult<()> {
        let mut event = epoll_event {
            events: (interests | EPOLLET) as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> SonataResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Block for readiness. A signal interrupting the wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> SonataResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// `Ok(None)` means the call would block; `Ok(Some(0))` is end of stream.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> SonataResult<Option<usize>> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored write: write multiple buffers in a single syscall (scatter-gather I/O).
/// `Ok(None)` means the socket buffer is full.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> SonataResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 4] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(iovecs.len());

    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter()) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

// ---- Self-pipe ----

/// Create a Unix pipe with both ends non-blocking. Returns (read_fd, write_fd).
///
/// The write end is used from signal handlers, which must never block.
pub fn create_pipe() -> SonataResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

// ---- Memory mapping ----

/// Read-only, shared mapping of a whole file. Unmapped on drop.
pub struct Mmap {
    ptr: *mut c_void,
    len: usize,
}

// The mapping is immutable for its whole lifetime.
unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Map the first `len` bytes of `file`. `len` must be non-zero.
    pub fn map_readonly(file: &File, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn listen_on_ephemeral_port_reports_address() {
        let fd = create_listen_socket("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = local_addr(fd).unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
        assert!(accept_connection(fd).unwrap().is_none());
        close_fd(fd);
    }

    #[test]
    fn pipe_read_end_never_blocks() {
        let (r, w) = create_pipe().unwrap();
        let mut buf = [0u8; 8];
        assert!(read_nonblocking(r, &mut buf).unwrap().is_none());
        let n = unsafe { libc::write(w, b"xy".as_ptr() as *const c_void, 2) };
        assert_eq!(n, 2);
        assert_eq!(read_nonblocking(r, &mut buf).unwrap(), Some(2));
        assert_eq!(&buf[..2], b"xy");
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn mmap_exposes_file_bytes() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello mapped world").unwrap();
        let map = Mmap::map_readonly(&file, 18).unwrap();
        assert_eq!(map.len(), 18);
        assert_eq!(map.as_slice(), b"hello mapped world");
        assert!(Mmap::map_readonly(&file, 0).is_err());
    }
}
