mod config;
mod server;

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use server::SimServer;

#[derive(Parser)]
#[command(name = "simgate-server")]
#[command(about = "Virtual world region session server")]
struct Args {
    #[arg(short, long, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<IpAddr>,

    #[arg(short, long, help = "UDP circuit port")]
    port: Option<u16>,

    #[arg(long, help = "Capability HTTP port")]
    http_port: Option<u16>,

    #[arg(short, long)]
    max_circuits: Option<usize>,

    #[arg(long, help = "Public base URL for capability links")]
    public_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.udp_bind.set_ip(bind);
        config.http_bind.set_ip(bind);
    }
    if let Some(port) = args.port {
        config.udp_bind.set_port(port);
    }
    if let Some(port) = args.http_port {
        config.http_bind.set_port(port);
    }
    if let Some(max_circuits) = args.max_circuits {
        config.max_circuits = max_circuits;
    }
    if let Some(url) = args.public_url {
        config.caps.http_base = url;
    }

    let server = SimServer::start(config).await?;
    log::info!(
        "Server started on udp {} / http {}",
        server.udp_addr(),
        server.http_addr()
    );

    tokio::signal::ctrl_c().await?;
    log::info!("Server shutting down");
    server.shutdown().await;
    Ok(())
}
