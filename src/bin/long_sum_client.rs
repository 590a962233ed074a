use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use reliable_datagram::client::long_sum;
use reliable_datagram::config::ClientConfig;
use reliable_datagram::util::cli::Verbosity;

/// Has a long-sum server add up the given values
#[derive(Parser)]
struct Args {
    host: String,
    port: u16,
    /// retransmission timeout in milliseconds
    timeout: u64,

    #[clap(allow_negative_numbers = true)]
    values: Vec<i64>,

    /// give up after this many retransmissions without progress (default: retry forever)
    #[clap(long)]
    max_retransmissions: Option<u32>,

    #[clap(flatten)]
    verbosity: Verbosity,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.verbosity.init_logging();

    let server_addr = tokio::net::lookup_host((args.host.as_str(), args.port)).await?
        .next()
        .ok_or_else(|| anyhow!("could not resolve {}", args.host))?;

    let mut config = ClientConfig::new(server_addr);
    config.retransmit_timeout = Duration::from_millis(args.timeout);
    config.max_retransmissions = args.max_retransmissions;

    let total = long_sum(&config, args.values).await?;
    println!("{}", total);
    Ok(())
}
