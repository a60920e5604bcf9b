use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hamble::router::HandlerFuture;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hamble::{
    setup_local_tracing, AppError, AppResult, BaseHandler, Client, DataPack, Handler,
    HambleConfig, Message, PacketCodec, Request, Server,
};
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

#[fixture]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

struct Pong;

impl Handler for Pong {
    fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            let _ = request.connection().send_buf_msg(0, "PONG").await;
        })
    }
}

/// Forwards every reply to the test body.
struct Forward(mpsc::UnboundedSender<Message>);

impl Handler for Forward {
    fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            let _ = self.0.send(request.message().clone());
        })
    }
}

fn test_config() -> HambleConfig {
    let mut config = HambleConfig::default();
    config.general.name = "hamble-test".to_string();
    config.general.print_banner = false;
    config.worker_pool.size = 2;
    config.worker_pool.max_task_len = 16;
    config
}

async fn spawn_server(server: Server) -> (Arc<Server>, SocketAddr, JoinHandle<AppResult<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    (server, addr, handle)
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn send_frame(socket: &mut TcpStream, msg_id: u32, payload: &str) {
    let packet = DataPack::default()
        .encode(&Message::new(msg_id, payload.to_string()))
        .unwrap();
    socket.write_all(&packet).await.unwrap();
}

/// True once the peer closed, false if it is still sending or the wait timed out.
async fn closed_by_server(socket: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        _ => false,
    }
}

#[rstest]
#[tokio::test]
async fn test_ping_pong(_setup: ()) {
    let server = Server::new(test_config());
    server.register_handler(0, Pong).unwrap();
    let (server, addr, handle) = spawn_server(server).await;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    send_frame(&mut socket, 0, "PING").await;

    let (reader, _writer) = socket.into_split();
    let mut frames = FramedRead::new(reader, DataPack::default());
    let reply = time::timeout(Duration::from_secs(5), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.msg_id(), 0);
    assert_eq!(reply.data_len(), 4);
    assert_eq!(reply.data().as_ref(), b"PONG");

    server.stop().await;
    handle.await.unwrap().unwrap();
    assert!(server.connection_registry().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_round_trip(_setup: ()) {
    let server = Server::new(test_config());
    server.register_handler(0, Pong).unwrap();
    let (server, addr, handle) = spawn_server(server).await;

    let (tx, mut replies) = mpsc::unbounded_channel();
    let client = Arc::new(Client::connect_to(test_config(), addr).await.unwrap());
    client.register_handler(0, Forward(tx)).unwrap();
    let running = {
        let client = client.clone();
        tokio::spawn(async move { client.start().await })
    };

    for _ in 0..3 {
        client.connection().send_msg(0, "PING").await.unwrap();
        let reply = time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::new(0, "PONG"));
    }

    client.stop();
    running.await.unwrap();
    assert!(client.connection().is_closed());
    wait_until(|| server.connection_registry().is_empty()).await;

    server.stop().await;
    handle.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_clear_closes_all_connections(_setup: ()) {
    let (server, addr, handle) = spawn_server(Server::new(test_config())).await;

    let mut sockets = Vec::new();
    for _ in 0..3 {
        sockets.push(TcpStream::connect(addr).await.unwrap());
    }
    wait_until(|| server.connection_registry().len() == 3).await;

    server.connection_registry().clear().await;
    assert_eq!(server.connection_registry().len(), 0);
    for socket in &mut sockets {
        assert!(closed_by_server(socket).await);
    }

    server.stop().await;
    handle.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_connections_over_limit_are_dropped(_setup: ()) {
    let mut config = test_config();
    config.network.max_conn = 1;
    let (server, addr, handle) = spawn_server(Server::new(config)).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.connection_registry().len() == 1).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    assert!(closed_by_server(&mut second).await);
    assert_eq!(server.connection_registry().len(), 1);

    // the first one still works
    send_frame(&mut first, 99, "still here").await;
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_registry().len(), 1);

    server.stop().await;
    handle.await.unwrap().unwrap();
    assert!(closed_by_server(&mut first).await);
}

#[rstest]
#[tokio::test]
async fn test_oversize_packet_closes_connection(_setup: ()) {
    let stops = Arc::new(AtomicUsize::new(0));
    let mut config = test_config();
    config.network.max_packet_size = 8;
    let server = Server::new(config);
    let counter = stops.clone();
    server.set_on_conn_stop(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (server, addr, handle) = spawn_server(server).await;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.connection_registry().len() == 1).await;
    // header announcing 100 bytes, body never sent
    socket.write_all(&[0, 0, 0, 100, 0, 0, 0, 1]).await.unwrap();

    assert!(closed_by_server(&mut socket).await);
    wait_until(|| server.connection_registry().is_empty()).await;
    assert_eq!(stops.load(Ordering::SeqCst), 1);

    server.stop().await;
    handle.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_start_hook_and_properties(_setup: ()) {
    let server = Server::new(test_config());
    server.set_on_conn_start(|conn| {
        conn.set_property("greeting", "hi".to_string());
    });
    let (server, addr, handle) = spawn_server(server).await;

    let _socket = TcpStream::connect(addr).await.unwrap();
    wait_until(|| {
        server
            .connection_registry()
            .connections()
            .iter()
            .any(|conn| conn.get_property_as::<String>("greeting").is_some())
    })
    .await;

    server.stop().await;
    handle.await.unwrap().unwrap();
}

#[rstest]
#[tokio::test]
async fn test_heartbeat_reaches_client(_setup: ()) {
    let server = Server::new(test_config());
    server.start_heartbeat(Duration::from_secs(1)).unwrap();
    let (server, addr, handle) = spawn_server(server).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let mut frames = FramedRead::new(socket, DataPack::default());
    let heartbeat = time::timeout(Duration::from_secs(5), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(heartbeat.msg_id(), hamble::DEFAULT_HEARTBEAT_MSG_ID);
    assert!(heartbeat.data().starts_with(b"heartbeat ["));

    server.stop().await;
    handle.await.unwrap().unwrap();
}

/// msg id (u16) then length (u32), both big endian
#[derive(Debug)]
struct CompactPack;

impl PacketCodec for CompactPack {
    fn head_len(&self) -> usize {
        6
    }

    fn encode(&self, msg: &Message) -> AppResult<Bytes> {
        let mut dst = BytesMut::with_capacity(6 + msg.data().len());
        dst.put_u16(msg.msg_id() as u16);
        dst.put_u32(msg.data().len() as u32);
        dst.put_slice(msg.data());
        Ok(dst.freeze())
    }

    fn decode_header(&self, header: &[u8]) -> AppResult<Message> {
        let mut header = &header[..6];
        let msg_id = header.get_u16() as u32;
        let mut msg = Message::new(msg_id, Bytes::new());
        msg.set_data_len(header.get_u32());
        Ok(msg)
    }
}

#[rstest]
#[tokio::test]
async fn test_server_with_custom_codec(_setup: ()) {
    let server = Server::new(test_config());
    server.set_data_pack(CompactPack);
    server.register_handler(0, Pong).unwrap();
    let (server, addr, handle) = spawn_server(server).await;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    let ping = CompactPack.encode(&Message::new(0, "PING")).unwrap();
    socket.write_all(&ping).await.unwrap();

    let mut reply = [0u8; 10];
    time::timeout(Duration::from_secs(5), socket.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0, 0, 0, 0, 0, 4, b'P', b'O', b'N', b'G']);

    server.stop().await;
    handle.await.unwrap().unwrap();
}

#[test]
fn test_duplicate_route_is_fatal() {
    let server = Server::new(test_config());
    server.register_handler(5, BaseHandler).unwrap();
    let err = server.register_handler(5, BaseHandler).unwrap_err();
    assert!(matches!(err, AppError::DuplicateRoute(5)));
}

#[rstest]
#[tokio::test]
async fn test_serve_after_stop_is_rejected(_setup: ()) {
    let server = Server::new(test_config());
    server.stop().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let err = server.serve(listener).await.unwrap_err();
    assert!(matches!(err, AppError::IllegalStateError(_)));
}
