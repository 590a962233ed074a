use std::time::Duration;

use clap::Parser;
use reliable_datagram::config::{PortRange, ServerConfig};
use reliable_datagram::server::server_driver::DatagramServer;
use reliable_datagram::server::session_aggregator::SessionAggregator;
use reliable_datagram::util::cli::Verbosity;
use tracing::info;

/// Sums up the values clients send in multi-operation sessions
#[derive(Parser)]
struct Args {
    /// a single port like `7777`, or a range like `7777-7780`
    ports: PortRange,

    /// evict sessions without operations for this many seconds (default: keep them)
    #[clap(long)]
    session_idle_secs: Option<u64>,

    #[clap(long)]
    max_ops_per_session: Option<u64>,

    #[clap(flatten)]
    verbosity: Verbosity,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.ports.validate_unprivileged()?;
    args.verbosity.init_logging();

    let mut config = ServerConfig::new(args.ports);
    config.session_idle_timeout = args.session_idle_secs.map(Duration::from_secs);
    if let Some(max) = args.max_ops_per_session {
        config.max_ops_per_session = max;
    }
    config.validate()?;

    let aggregator = SessionAggregator::new(config.max_ops_per_session, config.session_idle_timeout);
    let mut server = DatagramServer::bind(&config, aggregator).await?;

    server.serve_until(async {
        tokio::signal::ctrl_c().await.ok();
    }).await?;

    info!("server stopped with {} sessions", server.service().num_sessions());
    Ok(())
}
