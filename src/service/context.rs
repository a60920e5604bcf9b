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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::info;

use super::HambleConfig;
use crate::network::{
    CheckerOptions, Connection, ConnectionRegistry, DataPack, DefaultHeartbeatHandler,
    HeartbeatChecker, PacketCodec,
};
use crate::router::{Handler, Router};
use crate::AppResult;

pub type ConnectionHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// State shared by a server or client and every connection it owns.
pub struct DispatchContext {
    config: Arc<HambleConfig>,
    data_pack: RwLock<Arc<dyn PacketCodec>>,
    router: Arc<Router>,
    registry: Arc<ConnectionRegistry>,
    on_conn_start: RwLock<Option<ConnectionHook>>,
    on_conn_stop: RwLock<Option<ConnectionHook>>,
    heartbeat_checker: RwLock<Option<HeartbeatChecker>>,
}

impl DispatchContext {
    pub fn new(config: HambleConfig) -> DispatchContext {
        let data_pack: Arc<dyn PacketCodec> = Arc::new(DataPack::new(config.network.max_packet_size));
        let router = Arc::new(Router::new(config.worker_pool.clone()));
        DispatchContext {
            config: Arc::new(config),
            data_pack: RwLock::new(data_pack),
            router,
            registry: Arc::new(ConnectionRegistry::new()),
            on_conn_start: RwLock::new(None),
            on_conn_stop: RwLock::new(None),
            heartbeat_checker: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HambleConfig {
        &self.config
    }

    /// The codec connections started from now on frame their traffic with.
    pub fn data_pack(&self) -> Arc<dyn PacketCodec> {
        self.data_pack.read().clone()
    }

    /// Replaces the default `DataPack`. Running connections keep the codec they started with.
    pub fn set_data_pack<P: PacketCodec>(&self, data_pack: P) {
        *self.data_pack.write() = Arc::new(data_pack);
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn register_handler<H: Handler>(&self, msg_id: u32, handler: H) -> AppResult<()> {
        self.router.add_router(msg_id, Arc::new(handler))
    }

    pub fn set_on_conn_start<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *self.on_conn_start.write() = Some(Arc::new(hook));
    }

    pub fn set_on_conn_stop<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *self.on_conn_stop.write() = Some(Arc::new(hook));
    }

    pub(crate) fn call_on_conn_start(&self, conn: &Arc<Connection>) {
        // cloned out so the hook runs without the lock
        let hook = self.on_conn_start.read().clone();
        if let Some(hook) = hook {
            hook(conn);
        }
    }

    pub(crate) fn call_on_conn_stop(&self, conn: &Arc<Connection>) {
        let hook = self.on_conn_stop.read().clone();
        if let Some(hook) = hook {
            hook(conn);
        }
    }

    /// Probes every connection started from now on with the default heartbeat message.
    pub fn start_heartbeat(&self, interval: Duration) -> AppResult<()> {
        self.start_heartbeat_with_options(CheckerOptions::new(interval))
    }

    /// Installs the heartbeat template and registers the handler for inbound heartbeats.
    pub fn start_heartbeat_with_options(&self, options: CheckerOptions) -> AppResult<()> {
        options.validate()?;
        let handler = options
            .handler
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultHeartbeatHandler) as Arc<dyn Handler>);
        self.router.add_router(options.msg_id, handler)?;

        *self.heartbeat_checker.write() = Some(HeartbeatChecker::from_options(&options));
        info!(
            "heartbeat enabled, interval = {:?}, msg_id = {}",
            options.interval, options.msg_id
        );
        Ok(())
    }

    /// A fresh, unbound copy of the heartbeat template, if one is configured.
    pub fn heartbeat_checker(&self) -> Option<HeartbeatChecker> {
        self.heartbeat_checker.read().clone()
    }
}

impl fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchContext")
            .field("name", &self.config.general.name)
            .field("connections", &self.registry.len())
            .field("heartbeat", &self.heartbeat_checker.read().is_some())
            .finish()
    }
}
