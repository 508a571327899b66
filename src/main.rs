use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gearmand_lite::config::ServerConfig;
use gearmand_lite::server::GearmanServer;

#[derive(Parser, Debug)]
#[command(name = "gearmand-lite")]
#[command(about = "A Gearman-compatible job queue broker")]
struct Args {
    /// Address to listen on for the Gearman protocol
    #[arg(long, default_value = "0.0.0.0:4730")]
    addr: SocketAddr,

    /// Address for the admin/monitoring HTTP endpoint
    #[arg(long, default_value = "0.0.0.0:1374")]
    mon: SocketAddr,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    verbose: String,

    /// How many sleeping workers to wake per submitted job (0 wakes all)
    #[arg(long = "trytime", default_value = "2")]
    try_times: usize,

    /// Session idle timeout in minutes (0 disables it)
    #[arg(long, default_value = "3")]
    keepalive: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.verbose.clone())),
        )
        .init();

    let config = ServerConfig::new(args.addr)
        .with_admin_addr(Some(args.mon))
        .with_try_times(args.try_times)
        .with_keepalive_ms(args.keepalive * 60 * 1000);

    tracing::info!(
        addr = %config.listen_addr,
        mon = ?config.admin_addr,
        try_times = config.try_times,
        keepalive_mins = args.keepalive,
        "starting gearmand-lite"
    );

    let server = GearmanServer::bind(config).await?;
    server.run_until_signalled().await;

    Ok(())
}
