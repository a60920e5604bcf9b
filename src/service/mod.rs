pub use app_error::{AppError, AppResult};
pub use client::Client;
pub use config::{
    GeneralConfig, HambleConfig, HeartbeatConfig, NetworkConfig, TlsConfig, WorkerPoolConfig,
    DEFAULT_HEARTBEAT_MSG_ID,
};
pub use context::{ConnectionHook, DispatchContext};
pub use server::Server;
pub use shutdown::Shutdown;
#[cfg(feature = "tls")]
pub use tls::{generate_crt_and_key_file, load_tls_acceptor};
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod client;
mod config;
mod context;
mod server;
mod shutdown;
#[cfg(feature = "tls")]
mod tls;
mod tracing_config;
