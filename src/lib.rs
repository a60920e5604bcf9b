pub mod network;
pub mod router;
pub mod service;

pub use network::{
    CheckerOptions, Connection, ConnectionRegistry, DataPack, HeartbeatChecker, Message,
    PacketCodec, Request,
};
pub use router::{BaseHandler, Handler, HandlerFuture, Router};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, HambleConfig, Server,
    Shutdown, DEFAULT_HEARTBEAT_MSG_ID,
};
