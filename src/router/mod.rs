//! Routing of decoded requests to their handlers.
//!
//! A `Router` maps message ids to `Handler`s. Requests reach it either directly, one
//! spawned task per request, or through the worker pool, where the worker is picked by
//! `msg_id % pool_size`. Messages of one id therefore always land on the same worker and
//! are handled in the order they were queued.

pub use handler::{BaseHandler, Handler, HandlerFuture};
pub use routes::Router;

mod handler;
mod routes;
