use clap::Parser;
use reliable_datagram::config::{PortRange, ServerConfig};
use reliable_datagram::server::id_upper_case::IdTaggedService;
use reliable_datagram::server::server_driver::DatagramServer;
use reliable_datagram::util::cli::Verbosity;
use tracing::info;

/// Replies to id-tagged requests with their upper-cased payload
#[derive(Parser)]
struct Args {
    /// a single port like `7777`, or a range like `7777-7780`
    ports: PortRange,

    #[clap(flatten)]
    verbosity: Verbosity,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.ports.validate_unprivileged()?;
    args.verbosity.init_logging();

    let config = ServerConfig::new(args.ports);
    let mut server = DatagramServer::bind(&config, IdTaggedService::upper_case()).await?;

    server.serve_until(async {
        tokio::signal::ctrl_c().await.ok();
    }).await?;

    info!("server stopped");
    Ok(())
}
