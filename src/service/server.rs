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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::{DispatchContext, HambleConfig, Shutdown};
use crate::network::{CheckerOptions, Connection, ConnectionRegistry, PacketCodec};
use crate::router::{Handler, Router};
use crate::{AppError, AppResult};

const BANNER: &str = r"
  _                     _     _
 | |__   __ _ _ __ ___ | |__ | | ___
 | '_ \ / _` | '_ ` _ \| '_ \| |/ _ \
 | | | | (_| | | | | | | |_) | |  __/
 |_| |_|\__,_|_| |_| |_|_.__/|_|\___|
";

#[cfg(feature = "tls")]
type Acceptor = Option<tokio_rustls::TlsAcceptor>;
#[cfg(not(feature = "tls"))]
type Acceptor = Option<()>;

/// Accepts sockets and turns each one into a running `Connection`.
#[derive(Debug)]
pub struct Server {
    context: Arc<DispatchContext>,
    notify_shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl Server {
    pub fn new(config: HambleConfig) -> Server {
        let (notify_shutdown, _) = broadcast::channel(1);
        Server {
            context: Arc::new(DispatchContext::new(config)),
            notify_shutdown,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.context
    }

    pub fn config(&self) -> &HambleConfig {
        self.context.config()
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

    /// Binds the configured address and serves until stopped or signalled.
    pub async fn start(&self) -> AppResult<()> {
        let config = self.config();
        if config.general.print_banner {
            println!("{}", BANNER);
        }
        info!("\n{}", config.print());

        if let Some(interval) = config.heartbeat_interval() {
            if self.context.heartbeat_checker().is_none() {
                self.start_heartbeat_with_options(
                    CheckerOptions::new(interval).with_msg_id(config.heartbeat.msg_id),
                )?;
            }
        }

        let addr = config.resolve_address().await?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on `listener`.
    ///
    /// Returns once `stop` was called, a termination signal arrived, or accepting failed
    /// for good, and only after every connection task has finished.
    pub async fn serve(&self, listener: TcpListener) -> AppResult<()> {
        let acceptor = self.tls_acceptor()?;
        let mut shutdown = Shutdown::new(&self.notify_shutdown);
        if self.stopped.load(Ordering::Acquire) {
            return Err(AppError::IllegalStateError(
                "server already stopped".to_string(),
            ));
        }

        self.context.router().start_worker_pool(&self.notify_shutdown);

        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
        let max_conn = self.config().network.max_conn;
        info!(
            "[START] server {} listening on {}",
            self.config().general.name,
            listener.local_addr()?
        );

        let signal = wait_for_signal();
        tokio::pin!(signal);

        let result = loop {
            let (socket, peer) = tokio::select! {
                res = accept(&listener) => match res {
                    Ok(accepted) => accepted,
                    Err(e) => break Err(e),
                },
                _ = shutdown.recv() => break Ok(()),
                _ = &mut signal => break Ok(()),
            };

            if self.connection_registry().len() >= max_conn {
                warn!(
                    "too many connections, max_conn = {}, reject {}",
                    max_conn, peer
                );
                drop(socket);
                continue;
            }

            self.handle_socket(socket, &acceptor, shutdown_complete_tx.clone());
        };

        self.stop().await;

        // every connection task holds a sender, recv returns None once all are gone
        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;
        info!("server {} exited", self.config().general.name);
        result
    }

    /// Closes every connection, then halts the accept loop and the worker pool.
    pub async fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("[STOP] server {}", self.config().general.name);
        self.connection_registry().clear().await;
        let _ = self.notify_shutdown.send(());
    }

    fn handle_socket(&self, socket: TcpStream, acceptor: &Acceptor, shutdown_complete_tx: mpsc::Sender<()>) {
        let context = self.context.clone();
        let mut shutdown = Shutdown::new(&self.notify_shutdown);
        // subscribed first: a stop racing with this accept is either seen here or
        // delivered to `shutdown`
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete_tx;

            let conn = match acceptor {
                #[cfg(feature = "tls")]
                Some(acceptor) => {
                    let local_addr = socket.local_addr().map(|a| a.to_string()).unwrap_or_default();
                    let remote_addr = socket.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                    let handshake = tokio::select! {
                        res = acceptor.accept(socket) => res,
                        _ = shutdown.recv() => return,
                    };
                    match handshake {
                        Ok(stream) => Connection::new(stream, local_addr, remote_addr, context),
                        Err(e) => {
                            warn!("tls handshake with {} failed: {}", remote_addr, e);
                            return;
                        }
                    }
                }
                _ => Connection::from_tcp(socket, context),
            };

            let run = conn.clone().start();
            tokio::pin!(run);
            tokio::select! {
                _ = &mut run => return,
                _ = shutdown.recv() => conn.stop(),
            }
            run.await;
        });
    }

    #[cfg(feature = "tls")]
    fn tls_acceptor(&self) -> AppResult<Acceptor> {
        if !self.config().tls.enabled {
            return Ok(None);
        }
        super::tls::load_tls_acceptor(&self.config().tls).map(Some)
    }

    #[cfg(not(feature = "tls"))]
    fn tls_acceptor(&self) -> AppResult<Acceptor> {
        if self.config().tls.enabled {
            return Err(AppError::TlsError(
                "tls is enabled but hamble was built without the tls feature".to_string(),
            ));
        }
        Ok(None)
    }
}

/// Accepts one socket, retrying transient failures with exponential backoff.
async fn accept(listener: &TcpListener) -> AppResult<(TcpStream, std::net::SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(accepted) => return Ok(accepted),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::Accept(err.to_string()));
                }
                error!("accept failed, retry in {}s: {}", backoff, err);
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    async fn recv(kind: SignalKind) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                debug!("cannot listen for {:?}: {}", kind, e);
                std::future::pending::<()>().await;
            }
        }
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("received ctrl-c"),
            Err(_) => std::future::pending::<()>().await,
        },
        _ = recv(SignalKind::terminate()) => info!("received SIGTERM"),
        _ = recv(SignalKind::hangup()) => info!("received SIGHUP"),
        _ = recv(SignalKind::quit()) => info!("received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received ctrl-c");
    } else {
        std::future::pending::<()>().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("server dropped");
    }
}
