// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Periodic liveness probing of a single connection.
//!
//! A configured checker acts as a template: every started connection gets its own clone,
//! bound to that connection only. On each tick the checker first asks the connection
//! whether the peer was heard from recently. A silent peer triggers the not-alive
//! callback and ends the checker; otherwise a probe goes out, either the user supplied
//! one or a heartbeat message built by the message factory.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use super::{Connection, Request};
use crate::router::{Handler, HandlerFuture};
use crate::service::DEFAULT_HEARTBEAT_MSG_ID;
use crate::{AppError, AppResult};

pub type ProbeFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;

/// Called with a connection whose peer went silent for too long.
pub type OnRemoteNotAlive = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
/// Builds the payload of a heartbeat message.
pub type HeartbeatMsgFn = Arc<dyn Fn(&Connection) -> Bytes + Send + Sync>;
/// Replaces the default heartbeat message with a custom probe.
pub type HeartbeatFn = Arc<dyn Fn(Arc<Connection>) -> ProbeFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerState {
    Idle,
    Running,
    Stopped,
}

/// Full heartbeat setup. Unset callbacks fall back to the defaults.
#[derive(Clone)]
pub struct CheckerOptions {
    pub interval: Duration,
    pub msg_id: u32,
    pub on_remote_not_alive: Option<OnRemoteNotAlive>,
    pub heartbeat_msg_fn: Option<HeartbeatMsgFn>,
    pub heartbeat_fn: Option<HeartbeatFn>,
    /// handles inbound heartbeat messages, a logging handler when unset
    pub handler: Option<Arc<dyn Handler>>,
}

impl CheckerOptions {
    pub fn new(interval: Duration) -> CheckerOptions {
        CheckerOptions {
            interval,
            msg_id: DEFAULT_HEARTBEAT_MSG_ID,
            on_remote_not_alive: None,
            heartbeat_msg_fn: None,
            heartbeat_fn: None,
            handler: None,
        }
    }

    pub fn with_msg_id(mut self, msg_id: u32) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn with_on_remote_not_alive<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_remote_not_alive = Some(Arc::new(f));
        self
    }

    pub fn with_heartbeat_msg_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) -> Bytes + Send + Sync + 'static,
    {
        self.heartbeat_msg_fn = Some(Arc::new(f));
        self
    }

    pub fn with_heartbeat_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Connection>) -> ProbeFuture + Send + Sync + 'static,
    {
        self.heartbeat_fn = Some(Arc::new(f));
        self
    }

    pub fn with_handler<H: Handler>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn validate(&self) -> AppResult<()> {
        if self.interval.is_zero() {
            return Err(AppError::InvalidValue(
                "heartbeat interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CheckerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckerOptions")
            .field("interval", &self.interval)
            .field("msg_id", &self.msg_id)
            .field("custom_probe", &self.heartbeat_fn.is_some())
            .finish()
    }
}

pub struct HeartbeatChecker {
    interval: Duration,
    msg_id: u32,
    on_remote_not_alive: OnRemoteNotAlive,
    heartbeat_msg_fn: HeartbeatMsgFn,
    heartbeat_fn: Option<HeartbeatFn>,

    connection: Weak<Connection>,
    state: Mutex<CheckerState>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl HeartbeatChecker {
    pub fn new(interval: Duration) -> HeartbeatChecker {
        HeartbeatChecker::from_options(&CheckerOptions::new(interval))
    }

    pub fn from_options(options: &CheckerOptions) -> HeartbeatChecker {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        HeartbeatChecker {
            interval: options.interval,
            msg_id: options.msg_id,
            on_remote_not_alive: options
                .on_remote_not_alive
                .clone()
                .unwrap_or_else(|| Arc::new(default_on_remote_not_alive) as OnRemoteNotAlive),
            heartbeat_msg_fn: options
                .heartbeat_msg_fn
                .clone()
                .unwrap_or_else(|| Arc::new(default_heartbeat_msg) as HeartbeatMsgFn),
            heartbeat_fn: options.heartbeat_fn.clone(),
            connection: Weak::new(),
            state: Mutex::new(CheckerState::Idle),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }

    pub fn set_on_remote_not_alive(&mut self, f: OnRemoteNotAlive) {
        self.on_remote_not_alive = f;
    }

    pub fn set_heartbeat_msg_fn(&mut self, f: HeartbeatMsgFn) {
        self.heartbeat_msg_fn = f;
    }

    pub fn set_heartbeat_fn(&mut self, f: HeartbeatFn) {
        self.heartbeat_fn = Some(f);
    }

    pub fn bind_conn(&mut self, conn: &Arc<Connection>) {
        self.connection = Arc::downgrade(conn);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn state(&self) -> CheckerState {
        *self.state.lock()
    }

    /// Begins ticking. Only an idle checker starts; a stopped one stays stopped.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != CheckerState::Idle {
                warn!("heartbeat checker cannot start from {:?}", *state);
                return;
            }
            *state = CheckerState::Running;
        }
        let Some(mut stop_rx) = self.stop_rx.lock().take() else {
            return;
        };

        let checker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + checker.interval, checker.interval);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        if !checker.check().await {
                            break;
                        }
                    }
                }
            }
            *checker.state.lock() = CheckerState::Stopped;
            debug!("heartbeat checker exited");
        });
    }

    /// Never blocks, however often it is called.
    pub fn stop(&self) {
        info!("heartbeat checker stop");
        *self.state.lock() = CheckerState::Stopped;
        let _ = self.stop_tx.try_send(());
    }

    /// Sends one heartbeat message to the bound connection.
    pub async fn send_heartbeat_msg(&self) -> AppResult<()> {
        let conn = self.connection.upgrade().ok_or_else(|| {
            AppError::IllegalStateError("heartbeat checker not bound to a connection".to_string())
        })?;
        self.send_heartbeat_msg_to(&conn).await
    }

    async fn send_heartbeat_msg_to(&self, conn: &Connection) -> AppResult<()> {
        let payload = (self.heartbeat_msg_fn)(conn);
        conn.send_msg(self.msg_id, payload).await
    }

    /// One tick. Returns false once the checker has nothing left to watch.
    async fn check(&self) -> bool {
        let Some(conn) = self.connection.upgrade() else {
            return false;
        };

        if !conn.is_alive() {
            (self.on_remote_not_alive)(&conn);
            self.stop();
            return false;
        }

        // a failed or timed out probe is only logged, eviction is left to the liveness
        // check of a later tick
        let probe = async {
            match &self.heartbeat_fn {
                Some(probe) => probe(Arc::clone(&conn)).await,
                None => self.send_heartbeat_msg_to(&conn).await,
            }
        };
        match time::timeout(self.interval, probe).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("send heartbeat to {} failed: {}", conn.remote_addr(), e),
            Err(_) => error!(
                "send heartbeat to {} timed out after {:?}",
                conn.remote_addr(),
                self.interval
            ),
        }
        true
    }
}

/// A clone shares the callbacks but nothing else: it starts idle, unbound, and with a
/// stop channel of its own.
impl Clone for HeartbeatChecker {
    fn clone(&self) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        HeartbeatChecker {
            interval: self.interval,
            msg_id: self.msg_id,
            on_remote_not_alive: self.on_remote_not_alive.clone(),
            heartbeat_msg_fn: self.heartbeat_msg_fn.clone(),
            heartbeat_fn: self.heartbeat_fn.clone(),
            connection: Weak::new(),
            state: Mutex::new(CheckerState::Idle),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }
}

impl fmt::Debug for HeartbeatChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatChecker")
            .field("interval", &self.interval)
            .field("msg_id", &self.msg_id)
            .field("state", &self.state())
            .finish()
    }
}

fn default_heartbeat_msg(conn: &Connection) -> Bytes {
    Bytes::from(format!(
        "heartbeat [{}->{}]",
        conn.local_addr(),
        conn.remote_addr()
    ))
}

fn default_on_remote_not_alive(conn: &Arc<Connection>) {
    info!("remote connection {} is not alive, stop it", conn.remote_addr());
    conn.stop();
}

/// Logs inbound heartbeats. Receiving them already refreshes liveness.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHeartbeatHandler;

impl Handler for DefaultHeartbeatHandler {
    fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            debug!(
                "receive heartbeat from {}, msg_id = {}, data = {}",
                request.connection().remote_addr(),
                request.msg_id(),
                String::from_utf8_lossy(request.data())
            );
        })
    }
}
