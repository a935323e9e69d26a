use anyhow::Context;
use clap::Parser;
use sonata::{Config, Server};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sonata")]
#[command(about = "Multi-threaded epoll HTTP/1.1 static file server")]
#[command(version)]
struct Cli {
    /// JSON configuration file; otherwise SONATA_* environment variables are used
    #[arg(short, long, env = "SONATA_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory to serve
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds between idle-timer ticks
    #[arg(long)]
    tick: Option<u32>,

    /// Maximum simultaneously open connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Size of the connection table
    #[arg(long)]
    max_fd: Option<usize>,

    /// Pin worker threads to CPU cores
    #[arg(long)]
    pin_workers: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::from_env().context("reading SONATA_* environment")?,
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(tick) = self.tick {
            config.tick_secs = tick;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(max_fd) = self.max_fd {
            config.max_fd = max_fd;
        }
        config.pin_workers |= self.pin_workers;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    sonata::init_logging();
    let config = Cli::parse().into_config()?;

    let addr = config.server_addr();
    let server = Server::from_config(config).with_context(|| format!("binding {addr}"))?;
    server.serve().context("server stopped with an error")?;
    Ok(())
}
