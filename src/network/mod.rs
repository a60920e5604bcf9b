//! Connection layer
//!
//! Everything between the socket and the router:
//!
//! - `DataPack`: the length-prefixed frame codec, replaceable through `PacketCodec`
//! - `Message` / `Request`: a decoded frame, and a frame paired with its connection
//! - `Connection`: one reader and two writer tasks per stream, teardown and liveness
//! - `ConnectionRegistry`: the set of live connections
//! - `HeartbeatChecker`: periodic probing of a connection's peer

pub use connection::{Connection, PropertyValue};
pub use frame::{DataPack, PacketCodec, PacketDecoder, HEADER_LEN};
pub use heartbeat::{
    CheckerOptions, CheckerState, DefaultHeartbeatHandler, HeartbeatChecker, HeartbeatFn,
    HeartbeatMsgFn, OnRemoteNotAlive, ProbeFuture,
};
pub use message::{Message, Request};
pub use registry::ConnectionRegistry;

mod connection;
mod frame;
mod heartbeat;
mod message;
mod registry;

/// An unstarted connection over an in-memory stream, for unit tests.
#[cfg(test)]
pub(crate) fn test_connection() -> std::sync::Arc<Connection> {
    use crate::service::{DispatchContext, HambleConfig};

    let mut config = HambleConfig::default();
    config.worker_pool.size = 0;
    let (local, _peer) = tokio::io::duplex(1024);
    Connection::new(
        local,
        "test-local",
        "test-remote",
        std::sync::Arc::new(DispatchContext::new(config)),
    )
}
