use std::path::PathBuf;

use clap::Parser;
use hamble::router::HandlerFuture;
use hamble::{setup_tracing, AppResult, Handler, HambleConfig, Request, Server};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Answers every `PING` with a `PONG` on the buffered queue.
struct PingHandler;

impl Handler for PingHandler {
    fn pre_handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(
                "ping from {}: {}",
                request.connection().remote_addr(),
                String::from_utf8_lossy(request.data())
            );
        })
    }

    fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Err(e) = request.connection().send_buf_msg(0, "PONG").await {
                error!("reply PONG failed: {}", e);
            }
        })
    }
}

/// Sends the payload straight back.
struct EchoHandler;

impl Handler for EchoHandler {
    fn handle<'a>(&'a self, request: &'a Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            let conn = request.connection();
            if let Err(e) = conn.send_msg(request.msg_id(), request.data().clone()).await {
                error!("echo to {} failed: {}", conn.remote_addr(), e);
            }
        })
    }
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);

    let config = if config_path.exists() {
        HambleConfig::set_up_config(&config_path)?
    } else {
        HambleConfig::default()
    };

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{}", config.print());
        return Ok(());
    }

    let level = match commandline.verbose {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let log_file = config.general.log_file_name.clone();

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async move {
        let _guard = setup_tracing(Some(log_file.as_str()), level)?;

        let server = Server::new(config);
        server.register_handler(0, PingHandler)?;
        server.register_handler(1, EchoHandler)?;
        server.set_on_conn_start(|conn| {
            conn.set_property("name", "hamble".to_string());
            info!("connection {} from {} is online", conn.conn_id(), conn.remote_addr());
        });
        server.set_on_conn_stop(|conn| {
            info!("connection {} from {} is offline", conn.conn_id(), conn.remote_addr());
        });

        server.start().await
    })
}
