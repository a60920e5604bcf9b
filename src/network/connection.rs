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

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HeartbeatChecker, Message, PacketDecoder, Request};
use crate::service::DispatchContext;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound for flushing and closing the write side during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<BufWriter<BoxedWriter>>>;

pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// Owns one byte stream end-to-end.
///
/// A started connection runs three tasks: a reader that decodes frames and dispatches
/// them through the router, and two writers that drain the outbound queues. The plain
/// queue holds a single message, so `send_msg` returns only once the previous message was
/// picked up; the buffered queue holds `max_msg_chan_len` messages for callers that
/// prefer throughput over latency.
///
/// Any read, decode or write failure ends the connection. Nothing is retried.
pub struct Connection {
    conn_id: u64,
    context: Arc<DispatchContext>,
    local_addr: String,
    remote_addr: String,

    /// taken by `start`
    socket: Mutex<Option<(BoxedReader, BoxedWriter)>>,

    msg_tx: async_channel::Sender<Message>,
    msg_rx: async_channel::Receiver<Message>,
    buf_msg_tx: async_channel::Sender<Message>,
    buf_msg_rx: async_channel::Receiver<Message>,

    /// fired by any loop that fails, and by `stop`
    exit: CancellationToken,
    /// fired once the socket has been closed
    released: CancellationToken,
    is_closed: AtomicBool,

    properties: Mutex<Option<HashMap<String, PropertyValue>>>,
    last_alive_time: Mutex<Instant>,
    heartbeat_checker: Mutex<Option<Arc<HeartbeatChecker>>>,
}

impl Connection {
    /// Wraps any bidirectional byte stream, plain TCP or TLS alike.
    pub fn new<S>(
        stream: S,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        context: Arc<DispatchContext>,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let (msg_tx, msg_rx) = async_channel::bounded(1);
        let (buf_msg_tx, buf_msg_rx) =
            async_channel::bounded(context.config().network.max_msg_chan_len.max(1));

        Arc::new(Connection {
            conn_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            context,
            local_addr: local_addr.into(),
            remote_addr: remote_addr.into(),
            socket: Mutex::new(Some((reader, writer))),
            msg_tx,
            msg_rx,
            buf_msg_tx,
            buf_msg_rx,
            exit: CancellationToken::new(),
            released: CancellationToken::new(),
            is_closed: AtomicBool::new(false),
            properties: Mutex::new(None),
            last_alive_time: Mutex::new(Instant::now()),
            heartbeat_checker: Mutex::new(None),
        })
    }

    pub fn from_tcp(socket: TcpStream, context: Arc<DispatchContext>) -> Arc<Connection> {
        let local_addr = socket
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let remote_addr = socket
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        if let Err(e) = socket.set_nodelay(true) {
            debug!("set nodelay for {} failed: {}", remote_addr, e);
        }
        Connection::new(socket, local_addr, remote_addr, context)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Runs the connection and resolves once it has been stopped and its socket closed.
    pub async fn start(self: Arc<Self>) {
        let Some((reader, writer)) = self.socket.lock().take() else {
            warn!("connection {} started twice", self.conn_id);
            return;
        };
        if self.is_closed() {
            // stopped before it ever ran
            self.released.cancel();
            return;
        }
        info!("accept a connection from {}", self.remote_addr);

        self.register();

        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(BufWriter::new(writer)));
        let reader_task = tokio::spawn(Arc::clone(&self).read_loop(reader));
        let writer_task = tokio::spawn(Arc::clone(&self).write_loop(self.msg_rx.clone(), writer.clone()));
        let buf_writer_task =
            tokio::spawn(Arc::clone(&self).write_loop(self.buf_msg_rx.clone(), writer.clone()));

        if let Some(mut checker) = self.context.heartbeat_checker() {
            checker.bind_conn(&self);
            let checker = Arc::new(checker);
            checker.start();
            *self.heartbeat_checker.lock() = Some(checker.clone());
            if self.is_closed() {
                // stop ran before the checker was stored
                checker.stop();
            }
        }

        self.context.call_on_conn_start(&self);

        self.exit.cancelled().await;
        self.stop();

        let _ = tokio::join!(reader_task, writer_task, buf_writer_task);
        let mut writer = writer.lock().await;
        match time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("close socket of {} failed: {}", self.remote_addr, e),
            Err(_) => debug!("close socket of {} timed out", self.remote_addr),
        }
        drop(writer);
        self.released.cancel();
        info!("close a connection from {}", self.remote_addr);
    }

    fn register(self: &Arc<Self>) {
        self.context.registry().add(Arc::clone(self));
        if self.is_closed() {
            // stop ran between the check in `start` and the add, its removal came first
            self.context.registry().remove(self);
        }
    }

    /// Tears the connection down. Only the first call has any effect.
    pub fn stop(self: &Arc<Self>) {
        if self
            .is_closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.context.call_on_conn_stop(self);

        // closing the queues ends the write loops, the exit token ends the read loop and
        // makes `start` close the socket
        self.msg_tx.close();
        self.buf_msg_tx.close();
        self.exit.cancel();
        if self.socket.lock().take().is_some() {
            // never started, the socket is dropped right here
            self.released.cancel();
        }

        self.context.registry().remove(self);

        if let Some(checker) = self.heartbeat_checker.lock().take() {
            checker.stop();
        }
        debug!("connection {} from {} stopped", self.conn_id, self.remote_addr);
    }

    /// Resolves once the socket of a stopped connection has been released.
    pub async fn wait_closed(&self) {
        self.released.cancelled().await;
    }

    /// Queues a message on the unbuffered channel, waiting while the previous one is
    /// still pending.
    pub async fn send_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> AppResult<()> {
        self.enqueue(&self.msg_tx, Message::new(msg_id, data)).await
    }

    /// Queues a message on the buffered channel.
    pub async fn send_buf_msg(&self, msg_id: u32, data: impl Into<Bytes>) -> AppResult<()> {
        self.enqueue(&self.buf_msg_tx, Message::new(msg_id, data)).await
    }

    async fn enqueue(&self, queue: &async_channel::Sender<Message>, msg: Message) -> AppResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        queue.send(msg).await.map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> AppError {
        AppError::ConnectionClosed(format!("{} when send msg", self.remote_addr))
    }

    pub fn set_property<V>(&self, key: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        self.properties
            .lock()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Arc::new(value));
    }

    pub fn get_property(&self, key: &str) -> Option<PropertyValue> {
        self.properties.lock().as_ref()?.get(key).cloned()
    }

    /// Typed lookup; `None` when the key is absent or holds another type.
    pub fn get_property_as<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_property(key)?.downcast::<T>().ok()
    }

    pub fn remove_property(&self, key: &str) {
        if let Some(properties) = self.properties.lock().as_mut() {
            properties.remove(key);
        }
    }

    /// False once stopped. Otherwise true unless a max heartbeat time is configured and
    /// nothing arrived within it.
    pub fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.context.config().max_heartbeat_time() {
            None => true,
            Some(max_silence) => Instant::now() < *self.last_alive_time.lock() + max_silence,
        }
    }

    pub(crate) fn update_last_alive_time(&self) {
        *self.last_alive_time.lock() = Instant::now();
    }

    async fn read_loop(self: Arc<Self>, reader: BoxedReader) {
        let mut frames = FramedRead::new(reader, PacketDecoder::new(self.context.data_pack()));

        loop {
            let next = tokio::select! {
                _ = self.exit.cancelled() => break,
                next = frames.next() => next,
            };

            let msg = match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    if e.is_protocol_error() {
                        warn!("bad frame from {}: {}", self.remote_addr, e);
                    } else {
                        debug!("read from {} failed: {}", self.remote_addr, e);
                    }
                    break;
                }
                None => {
                    debug!("{} closed the connection", self.remote_addr);
                    break;
                }
            };

            self.update_last_alive_time();

            let request = Request::new(Arc::clone(&self), msg);
            // a full worker queue parks the reader, throttling this peer
            let dispatched = tokio::select! {
                _ = self.exit.cancelled() => break,
                res = self.context.router().dispatch(request) => res,
            };
            if let Err(e) = dispatched {
                warn!("dispatch request from {} failed: {}", self.remote_addr, e);
                break;
            }
        }

        self.exit.cancel();
    }

    async fn write_loop(self: Arc<Self>, queue: async_channel::Receiver<Message>, writer: SharedWriter) {
        let data_pack = self.context.data_pack();

        loop {
            let msg = tokio::select! {
                _ = self.exit.cancelled() => break,
                msg = queue.recv() => match msg {
                    Ok(msg) => msg,
                    // queue closed by stop
                    Err(_) => break,
                },
            };

            let packet = match data_pack.encode(&msg) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("encode msg {} for {} failed: {}", msg.msg_id(), self.remote_addr, e);
                    break;
                }
            };

            let written = tokio::select! {
                _ = self.exit.cancelled() => break,
                res = write_packet(&writer, &packet) => res,
            };
            if let Err(e) = written {
                debug!("write to {} failed: {}", self.remote_addr, e);
                break;
            }
        }

        self.exit.cancel();
    }
}

async fn write_packet(writer: &SharedWriter, packet: &[u8]) -> io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(packet).await?;
    writer.flush().await
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("connection {} dropped", self.conn_id);
    }
}
