// src/conn.rs
use crate::error::SonataResult;
use crate::http::{self, HttpCode};
use crate::metrics::ServerMetrics;
use crate::parser::RequestParser;
use crate::syscalls::{self, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, Mmap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

const SERVER_NAME: &str = concat!("sonata/", env!("CARGO_PKG_VERSION"));

/// One client socket and everything needed to answer it.
///
/// A slot is built once and reused for every connection that lands on the
/// same descriptor. `init` resets it on accept and `close_conn` releases it.
pub struct Connection {
    fd: RawFd,
    peer: Option<SocketAddr>,
    /// Bumped on every `init` so stale work for a previous occupant is ignored.
    generation: u64,

    read_buf: Vec<u8>,
    read_index: usize,
    parser: RequestParser,

    real_file: PathBuf,
    content_type: &'static str,
    mapping: Option<Mmap>,

    write_buf: Vec<u8>,
    /// Bytes of response head (and canned body) in `write_buf`.
    write_index: usize,
    /// Segments in the scatter list: head only, or head + mapped file.
    iv_count: usize,
    bytes_to_send: usize,
    bytes_have_send: usize,

    linger: bool,
    /// Set when the response could not be produced; the reactor closes on the next write event.
    close_requested: bool,
}

impl Connection {
    /// A fresh unused slot. No buffers are allocated until the first `init`.
    pub fn empty() -> Self {
        Self {
            fd: -1,
            peer: None,
            generation: 0,
            read_buf: Vec::new(),
            read_index: 0,
            parser: RequestParser::with_body_limit(READ_BUF_SIZE),
            real_file: PathBuf::new(),
            content_type: http::DEFAULT_CONTENT_TYPE,
            mapping: None,
            write_buf: Vec::new(),
            write_index: 0,
            iv_count: 0,
            bytes_to_send: 0,
            bytes_have_send: 0,
            linger: false,
            close_requested: false,
        }
    }

    /// Take ownership of a newly accepted socket and arm it for reading.
    pub fn init(
        &mut self,
        fd: RawFd,
        peer: Option<SocketAddr>,
        epoll: &Epoll,
        live: &AtomicUsize,
    ) -> SonataResult<()> {
        if self.read_buf.len() != READ_BUF_SIZE {
            self.read_buf = vec![0; READ_BUF_SIZE];
        }
        if self.write_buf.len() != WRITE_BUF_SIZE {
            self.write_buf = vec![0; WRITE_BUF_SIZE];
        }
        self.reset();

        epoll.add(fd, fd as u64, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT)?;

        self.fd = fd;
        self.peer = peer;
        self.generation = self.generation.wrapping_add(1);
        live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Clear all per-request state, keeping the socket.
    fn reset(&mut self) {
        self.read_index = 0;
        self.parser.reset();
        self.real_file.clear();
        self.content_type = http::DEFAULT_CONTENT_TYPE;
        self.mapping = None;
        self.write_index = 0;
        self.iv_count = 0;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
        self.linger = false;
        self.close_requested = false;
    }

    /// Deregister and close the socket. Returns false if it was already closed.
    pub fn close_conn(&mut self, epoll: &Epoll, live: &AtomicUsize) -> bool {
        if self.fd < 0 {
            return false;
        }
        if let Err(e) = epoll.delete(self.fd) {
            tracing::debug!(fd = self.fd, error = %e, "epoll delete failed on close");
        }
        syscalls::close_fd(self.fd);
        tracing::debug!(fd = self.fd, peer = ?self.peer, "connection closed");

        self.fd = -1;
        self.peer = None;
        self.mapping = None;
        live.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Drain the socket into the read buffer until it would block or the
    /// buffer is full. Edge-triggered readiness fires once per transition, so
    /// stopping early would strand bytes in the kernel.
    ///
    /// Returns false when the peer closed, on a socket error, or when the
    /// buffer had no room left.
    pub fn read(&mut self) -> bool {
        if self.fd < 0 || self.read_index >= READ_BUF_SIZE {
            return false;
        }

        loop {
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_index..]) {
                Ok(None) => break,
                Ok(Some(0)) => return false,
                Ok(Some(n)) => {
                    self.read_index += n;
                    if self.read_index >= READ_BUF_SIZE {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
        true
    }

    /// Parse what has been read and prepare the response. Runs on a worker.
    ///
    /// Ends by re-arming the socket: for read when the request is still
    /// incomplete, for write otherwise.
    pub fn process(&mut self, epoll: &Epoll, doc_root: &Path) -> HttpCode {
        if self.fd < 0 {
            return HttpCode::NoRequest;
        }

        let mut code = self.parser.parse(&self.read_buf[..self.read_index]);
        if code == HttpCode::NoRequest {
            if self.read_index < READ_BUF_SIZE {
                self.rearm(epoll, EPOLLIN);
                return HttpCode::NoRequest;
            }
            // The head does not fit in the buffer and never will.
            code = HttpCode::BadRequest;
        }

        if code == HttpCode::GetRequest {
            code = self.do_request(doc_root);
        }

        let request = self.parser.request();
        self.linger = request.keep_alive
            && !matches!(code, HttpCode::BadRequest | HttpCode::NotImplemented);

        tracing::debug!(
            fd = self.fd,
            method = request.method.map(|m| m.as_str()),
            target = %request.target,
            status = code.status().0,
            keep_alive = self.linger,
            "request processed"
        );

        if let Err(e) = self.process_write(code) {
            tracing::warn!(fd = self.fd, error = %e, "failed to build response, closing");
            self.close_requested = true;
        }
        self.rearm(epoll, EPOLLOUT);
        code
    }

    /// Worker-side failure: have the reactor close this connection on its next write event.
    pub fn abort(&mut self, epoll: &Epoll) {
        if self.fd < 0 {
            return;
        }
        self.mapping = None;
        self.close_requested = true;
        self.rearm(epoll, EPOLLOUT);
    }

    /// Resolve the parsed target against `doc_root` and map the file.
    pub fn do_request(&mut self, doc_root: &Path) -> HttpCode {
        let Some(path) = resolve_target(doc_root, &self.parser.request().target) else {
            return HttpCode::ForbiddenRequest;
        };

        match is_within_root(doc_root, &path) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(path = %path.display(), "target resolves outside the document root");
                return HttpCode::ForbiddenRequest;
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return HttpCode::ForbiddenRequest;
            }
            Err(_) => return HttpCode::NoResource,
        }

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return HttpCode::ForbiddenRequest;
            }
            Err(_) => return HttpCode::NoResource,
        };

        if meta.is_dir() || meta.permissions().mode() & 0o004 == 0 {
            return HttpCode::ForbiddenRequest;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return HttpCode::ForbiddenRequest;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "open failed");
                return HttpCode::InternalError;
            }
        };

        let Ok(len) = usize::try_from(meta.len()) else {
            return HttpCode::InternalError;
        };
        self.mapping = if len == 0 {
            None
        } else {
            match Mmap::map_readonly(&file, len) {
                Ok(map) => Some(map),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "mmap failed");
                    return HttpCode::InternalError;
                }
            }
        };

        self.content_type = path
            .to_str()
            .map_or(http::DEFAULT_CONTENT_TYPE, http::content_type_for);
        self.real_file = path;
        HttpCode::FileRequest
    }

    /// Lay out the response head (and canned body for errors) in the write buffer.
    fn process_write(&mut self, code: HttpCode) -> io::Result<()> {
        self.write_index = 0;
        self.bytes_have_send = 0;
        let (status, reason) = code.status();

        if code == HttpCode::FileRequest {
            let file_len = self.mapping.as_ref().map_or(0, Mmap::len);
            self.add_status_line(status, reason)?;
            self.add_headers(file_len, self.content_type)?;
            self.iv_count = if file_len > 0 { 2 } else { 1 };
            self.bytes_to_send = self.write_index + file_len;
        } else {
            self.mapping = None;
            let page = code.error_page();
            self.add_status_line(status, reason)?;
            self.add_headers(page.len(), http::HTML_CONTENT_TYPE)?;
            self.add_response(format_args!("{page}"))?;
            self.iv_count = 1;
            self.bytes_to_send = self.write_index;
        }
        Ok(())
    }

    fn add_response(&mut self, args: std::fmt::Arguments<'_>) -> io::Result<()> {
        let mut cursor = &mut self.write_buf[self.write_index..];
        let room = cursor.len();
        cursor.write_fmt(args)?;
        self.write_index += room - cursor.len();
        Ok(())
    }

    fn add_status_line(&mut self, status: u16, reason: &str) -> io::Result<()> {
        self.add_response(format_args!("HTTP/1.1 {status} {reason}\r\n"))
    }

    fn add_headers(&mut self, content_len: usize, content_type: &str) -> io::Result<()> {
        self.add_response(format_args!("Content-Length: {content_len}\r\n"))?;
        self.add_response(format_args!("Content-Type: {content_type}\r\n"))?;
        let connection = if self.linger { "keep-alive" } else { "close" };
        self.add_response(format_args!("Connection: {connection}\r\n"))?;
        let date = httpdate::fmt_http_date(SystemTime::now());
        self.add_response(format_args!("Date: {date}\r\nServer: {SERVER_NAME}\r\n\r\n"))
    }

    /// Send as much of the pending response as the socket takes.
    ///
    /// Returns true while the connection should stay open: either the socket
    /// filled up (re-armed for write) or the response is complete on a
    /// keep-alive connection (reset and re-armed for read). Returns false when
    /// the caller must close it.
    pub fn write(&mut self, epoll: &Epoll, metrics: &ServerMetrics) -> bool {
        if self.fd < 0 || self.close_requested {
            return false;
        }

        if self.bytes_to_send == 0 {
            self.reset();
            self.rearm(epoll, EPOLLIN);
            return true;
        }

        loop {
            let head_sent = self.bytes_have_send.min(self.write_index);
            let head = &self.write_buf[head_sent..self.write_index];
            let body: &[u8] = match (&self.mapping, self.iv_count) {
                (Some(map), 2) => {
                    let file_sent = self.bytes_have_send.saturating_sub(self.write_index);
                    &map.as_slice()[file_sent..]
                }
                _ => &[],
            };

            let result = match (head.is_empty(), body.is_empty()) {
                (false, false) => syscalls::writev_nonblocking(self.fd, &[head, body]),
                (false, true) => syscalls::writev_nonblocking(self.fd, &[head]),
                (true, _) => syscalls::writev_nonblocking(self.fd, &[body]),
            };

            match result {
                Ok(None) | Ok(Some(0)) => {
                    self.rearm(epoll, EPOLLOUT);
                    return true;
                }
                Ok(Some(n)) => {
                    metrics.add_bytes(n);
                    self.bytes_have_send += n;
                    self.bytes_to_send = self.bytes_to_send.saturating_sub(n);

                    if self.bytes_to_send == 0 {
                        self.mapping = None;
                        if !self.linger {
                            return false;
                        }
                        self.reset();
                        self.rearm(epoll, EPOLLIN);
                        return true;
                    }
                }
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "write failed");
                    self.mapping = None;
                    return false;
                }
            }
        }
    }

    fn rearm(&self, epoll: &Epoll, interest: i32) {
        if let Err(e) = epoll.modify(self.fd, self.fd as u64, interest | EPOLLRDHUP | EPOLLONESHOT) {
            tracing::warn!(fd = self.fd, error = %e, "failed to re-arm connection");
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn keep_alive(&self) -> bool {
        self.linger
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn real_file(&self) -> &Path {
        &self.real_file
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes_to_send
    }

    /// The response head currently staged for sending.
    pub fn response_head(&self) -> &[u8] {
        &self.write_buf[..self.write_index]
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::empty()
    }
}

/// Join a request target onto `doc_root`, refusing anything that could step
/// outside it. Query strings and fragments are dropped.
pub fn resolve_target(doc_root: &Path, target: &str) -> Option<PathBuf> {
    let path = target.split(['?', '#']).next().unwrap_or(target);
    if path.contains('\0') {
        return None;
    }

    let mut resolved = doc_root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

/// Whether `path`, with every symlink followed, still lies under `doc_root`.
fn is_within_root(doc_root: &Path, path: &Path) -> io::Result<bool> {
    let root = fs::canonicalize(doc_root)?;
    Ok(fs::canonicalize(path)?.starts_with(root))
}
