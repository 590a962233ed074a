use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use clap::Parser;
use reliable_datagram::client::exchange;
use reliable_datagram::config::{ClientConfig, Discipline};
use reliable_datagram::util::cli::Verbosity;
use tracing::info;

/// Sends every line of a file to an upper-case server, and writes the replies to another file
#[derive(Parser)]
struct Args {
    in_file: String,
    out_file: String,
    /// retransmission timeout in milliseconds
    timeout: u64,
    host: String,
    port: u16,

    /// send all requests at once rather than one at a time
    #[clap(long, default_value_t = false)]
    burst: bool,

    /// give up after this many retransmissions without progress (default: retry forever)
    #[clap(long)]
    max_retransmissions: Option<u32>,

    #[clap(flatten)]
    verbosity: Verbosity,
}

async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port)).await?
        .next()
        .ok_or_else(|| anyhow!("could not resolve {}", host))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.verbosity.init_logging();

    let content = tokio::fs::read_to_string(&args.in_file).await
        .with_context(|| format!("reading {}", args.in_file))?;
    let requests = content.lines()
        .map(|line| Bytes::copy_from_slice(line.as_bytes()))
        .collect::<Vec<_>>();

    let mut config = ClientConfig::new(resolve(&args.host, args.port).await?);
    config.retransmit_timeout = Duration::from_millis(args.timeout);
    config.max_retransmissions = args.max_retransmissions;
    config.discipline = if args.burst { Discipline::Burst } else { Discipline::OneByOne };

    let responses = exchange(&config, requests).await?;

    let mut output = String::new();
    for response in responses {
        output.push_str(&String::from_utf8_lossy(&response));
        output.push('\n');
    }
    tokio::fs::write(&args.out_file, output).await
        .with_context(|| format!("writing {}", args.out_file))?;

    info!("wrote {} lines to {}", content.lines().count(), args.out_file);
    Ok(())
}
