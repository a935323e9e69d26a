// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod reactor;
pub mod server;
pub mod signal;
pub mod slab;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use config::Config;
pub use error::{SonataError, SonataResult};
pub use http::{HttpCode, Method, Version};
pub use logging::{init_logging, try_init_logging};
pub use metrics::MetricsSnapshot;
pub use parser::{Request, RequestParser};
pub use server::Server;
pub use signal::ShutdownHandle;
