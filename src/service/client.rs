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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::info;

use super::{DispatchContext, HambleConfig};
use crate::network::{CheckerOptions, Connection, ConnectionRegistry, PacketCodec};
use crate::router::{Handler, Router};
use crate::AppResult;

/// One dialed connection with the same routing and hooks a server offers.
///
/// Replies are handled on a task per message; a client never runs a worker pool.
#[derive(Debug)]
pub struct Client {
    context: Arc<DispatchContext>,
    connection: Arc<Connection>,
}

impl Client {
    /// Dials the host and port of `config.network`.
    pub async fn connect(config: HambleConfig) -> AppResult<Client> {
        let addr = config.resolve_address().await?;
        Client::connect_to(config, addr).await
    }

    pub async fn connect_to(mut config: HambleConfig, addr: SocketAddr) -> AppResult<Client> {
        config.worker_pool.size = 0;
        let socket = TcpStream::connect(addr).await?;
        let context = Arc::new(DispatchContext::new(config));
        let connection = Connection::from_tcp(socket, context.clone());
        info!("client connected to {}", addr);
        Ok(Client {
            context,
            connection,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.context
    }

    pub fn router(&self) -> &Arc<Router> {
        self.context.router()
    }

    pub fn connection_registry(&self) -> &Arc<ConnectionRegistry> {
        self.context.registry()
    }

    pub fn register_handler<H: Handler>(&self, msg_id: u32, handler: H) -> AppResult<()> {
        self.context.register_handler(msg_id, handler)
    }

    pub fn set_data_pack<P: PacketCodec>(&self, data_pack: P) {
        self.context.set_data_pack(data_pack)
    }

    pub fn set_on_conn_start<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.context.set_on_conn_start(hook)
    }

    pub fn set_on_conn_stop<F>(&self, hook: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.context.set_on_conn_stop(hook)
    }

    pub fn start_heartbeat(&self, interval: Duration) -> AppResult<()> {
        self.context.start_heartbeat(interval)
    }

    pub fn start_heartbeat_with_options(&self, options: CheckerOptions) -> AppResult<()> {
        self.context.start_heartbeat_with_options(options)
    }

    /// Runs the connection until it is stopped by either side.
    pub async fn start(&self) {
        info!("client start");
        self.connection.clone().start().await;
    }

    pub fn stop(&self) {
        info!("client stop");
        self.connection.stop();
    }
}
