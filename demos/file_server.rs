use clap::Parser;
use clap_derive::{Parser, ValueEnum};
use filexfer::config::ServerConfig;
use filexfer::reliable_udp::ReliableUdpSocket;
use filexfer::server::{serve_tcp, serve_udp};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Tcp,
    Udp,
}

#[derive(Parser)]
struct Args {
    #[clap(value_enum)]
    mode: Mode,
    address: String,

    #[clap(long, default_value = "download")]
    download_dir: PathBuf,
    #[clap(long, default_value = "upload")]
    upload_dir: PathBuf,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let addr: SocketAddr = args.address.parse()?;

    let config = Arc::new(ServerConfig {
        download_dir: args.download_dir,
        upload_dir: args.upload_dir,
        ..ServerConfig::new()
    });
    config.validate()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                shutdown.cancel();
            }
        });
    }

    match args.mode {
        Mode::Tcp => {
            let listener = TcpListener::bind(addr).await?;
            serve_tcp(listener, config, shutdown).await
        }
        Mode::Udp => {
            let listener = ReliableUdpSocket::bind(addr, Arc::new(config.udp.clone())).await?;
            serve_udp(listener, config, shutdown).await
        }
    }
}
