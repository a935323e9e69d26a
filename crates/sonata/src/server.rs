// src/server.rs
use crate::config::Config;
use crate::error::{SonataError, SonataResult};
use crate::metrics::ServerMetrics;
use crate::reactor::Reactor;
use crate::signal::{ShutdownHandle, SignalPipe};
use crate::slab::ConnectionTable;
use crate::syscalls::{self, Epoll};
use crate::worker::WorkerPool;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State shared by the reactor and every worker.
pub struct ServerContext {
    pub epoll: Epoll,
    pub table: ConnectionTable,
    pub doc_root: PathBuf,
    pub metrics: ServerMetrics,
}

impl ServerContext {
    pub fn new(doc_root: PathBuf, max_fd: usize, max_connections: usize) -> SonataResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            table: ConnectionTable::new(max_fd, max_connections),
            doc_root,
            metrics: ServerMetrics::new(),
        })
    }
}

/// A bound, not yet running, static file server.
///
/// ```rust,no_run
/// use sonata::Server;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     Server::bind("127.0.0.1:9006")?
///         .doc_root("./www")
///         .workers(4)
///         .serve()?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: OwnedFd,
    local_addr: SocketAddr,
    signals: SignalPipe,
    config: Config,
}

impl Server {
    /// Bind the listening socket. Everything else uses [`Config::default`].
    pub fn bind(host_port: &str) -> SonataResult<Self> {
        Self::bind_with(host_port, Config::default())
    }

    /// Bind to `config.host:config.port` and keep the rest of `config`.
    pub fn from_config(config: Config) -> SonataResult<Self> {
        config.validate()?;
        let addr = config.server_addr();
        Self::bind_with(&addr, config)
    }

    fn bind_with(host_port: &str, config: Config) -> SonataResult<Self> {
        let addr = host_port
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SonataError::Config(format!("{host_port}: no address to bind")))?;

        let fd = syscalls::create_listen_socket(addr, libc::SOMAXCONN)?;
        // create_listen_socket returns a descriptor nobody else owns.
        let listener = unsafe { OwnedFd::from_raw_fd(fd) };
        let local_addr = syscalls::local_addr(listener.as_raw_fd())?;

        Ok(Self {
            listener,
            local_addr,
            signals: SignalPipe::new()?,
            config,
        })
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn doc_root(mut self, doc_root: impl AsRef<Path>) -> Self {
        self.config.doc_root = doc_root.as_ref().to_path_buf();
        self
    }

    /// Idle-timer period in seconds.
    pub fn tick(mut self, secs: u32) -> Self {
        self.config.tick_secs = secs;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn max_fd(mut self, max_fd: usize) -> Self {
        self.config.max_fd = max_fd;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.config.pin_workers = pin;
        self
    }

    /// The address actually bound; resolves port 0 to the ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A handle that stops [`Server::serve`] from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.signals.shutdown_handle()
    }

    /// Run until SIGINT, SIGTERM or a [`ShutdownHandle`] asks to stop.
    ///
    /// On the way out every open connection is closed and the workers are joined.
    pub fn serve(self) -> SonataResult<()> {
        let Server {
            listener,
            local_addr,
            signals,
            config,
        } = self;
        config.validate()?;

        let doc_root = std::fs::canonicalize(&config.doc_root).map_err(|e| {
            SonataError::Config(format!("doc_root {}: {e}", config.doc_root.display()))
        })?;
        if !doc_root.is_dir() {
            return Err(SonataError::Config(format!(
                "doc_root {} is not a directory",
                doc_root.display()
            )));
        }

        let ctx = Arc::new(ServerContext::new(
            doc_root,
            config.max_fd,
            config.max_connections,
        )?);
        signals.install()?;

        let pool = WorkerPool::new(config.workers, config.pin_workers, Arc::clone(&ctx))?;
        let mut reactor = Reactor::new(
            Arc::clone(&ctx),
            pool,
            listener.as_raw_fd(),
            signals,
            config.tick_secs,
        )?;

        tracing::info!(
            addr = %local_addr,
            doc_root = %ctx.doc_root.display(),
            workers = config.workers,
            tick_secs = config.tick_secs,
            max_connections = config.max_connections,
            "sonata listening"
        );

        let result = reactor.run();
        let closed = reactor.shutdown();
        drop(listener);

        let metrics = serde_json::to_string(&ctx.metrics.snapshot()).unwrap_or_default();
        tracing::info!(closed, %metrics, "sonata shut down");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_resolves_ephemeral_port() {
        let server = Server::bind("127.0.0.1:0").unwrap().workers(2).tick(1);
        let addr = server.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.config().workers, 2);
        assert_eq!(server.config().tick_secs, 1);
    }

    #[test]
    fn bind_rejects_unparseable_address() {
        assert!(Server::bind("not an address").is_err());
    }

    #[test]
    fn from_config_validates_first() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(matches!(
            Server::from_config(config),
            Err(SonataError::Config(_))
        ));
    }

    #[test]
    fn serve_fails_fast_on_missing_doc_root() {
        let server = Server::bind("127.0.0.1:0")
            .unwrap()
            .doc_root("/definitely/not/a/sonata/root")
            .workers(1);
        assert!(matches!(server.serve(), Err(SonataError::Config(_))));
    }
}
