use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use hamble::router::HandlerFuture;
use hamble::{setup_local_tracing, AppResult, Client, Handler, HambleConfig, Request};
use tokio::time;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// server address
    #[arg(short, long, default_value = "127.0.0.1:6177")]
    pub addr: SocketAddr,
    /// number of messages to send
    #[arg(short, long, default_value_t = 10)]
    pub count: usize,
}

/// Prints whatever the server sends back.
struct PrintReply;

impl Handler for PrintReply {
    fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            println!(
                "receive from server: msg_id = {}, data = {}",
                request.msg_id(),
                String::from_utf8_lossy(request.data())
            );
        })
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    setup_local_tracing()?;
    let commandline = CommandLine::parse();

    let client = Client::connect_to(HambleConfig::default(), commandline.addr).await?;
    client.register_handler(0, PrintReply)?;
    client.register_handler(1, PrintReply)?;

    let conn = client.connection().clone();
    let sender = tokio::spawn(async move {
        for i in 0..commandline.count {
            let sent = if i % 2 == 0 {
                conn.send_msg(0, "PING").await
            } else {
                conn.send_msg(1, "Hello").await
            };
            if let Err(e) = sent {
                error!("send failed: {}", e);
                break;
            }
            time::sleep(Duration::from_secs(1)).await;
        }
        conn.stop();
    });

    client.start().await;
    let _ = sender.await;
    info!("client exited");
    Ok(())
}
