use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Fault model of a [LossyRelay]. Probabilities are in the range `[0.0, 1.0]`, and apply to
///  datagrams in both directions.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// probability that a datagram is silently dropped
    pub loss_rate: f64,
    /// probability that a datagram is delivered twice
    pub duplicate_rate: f64,
    /// this number of replies from the upstream server is dropped before any fault model applies
    pub drop_first_replies: usize,
}

/// A UDP relay between a single client and an upstream server that loses and duplicates
///  datagrams. Clients send to the relay's [LossyRelay::local_addr] instead of the server, and
///  replies reach them from that same address.
///
/// The relay's task is stopped when the relay is dropped.
pub struct LossyRelay {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl LossyRelay {
    pub async fn start(upstream: SocketAddr, config: RelayConfig) -> anyhow::Result<LossyRelay> {
        let client_side = UdpSocket::bind(SocketAddr::new(upstream.ip(), 0)).await?;
        let server_side = UdpSocket::bind(SocketAddr::new(upstream.ip(), 0)).await?;
        let local_addr = client_side.local_addr()?;
        debug!("relaying {:?} -> {:?} with {:?}", local_addr, upstream, config);

        let handle = tokio::spawn(relay_loop(client_side, server_side, upstream, config));
        Ok(LossyRelay {
            local_addr,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn relay_loop(client_side: UdpSocket, server_side: UdpSocket, upstream: SocketAddr, config: RelayConfig) {
    let mut client_addr = None;
    let mut num_replies_dropped = 0;

    let mut request_buf = vec![0u8; 65536];
    let mut reply_buf = vec![0u8; 65536];

    loop {
        select! {
            received = client_side.recv_from(&mut request_buf) => {
                let Ok((len, from)) = received else {
                    continue;
                };
                client_addr = Some(from);
                forward(&server_side, &request_buf[..len], upstream, &config).await;
            }
            received = server_side.recv_from(&mut reply_buf) => {
                let Ok((len, _)) = received else {
                    continue;
                };
                if num_replies_dropped < config.drop_first_replies {
                    num_replies_dropped += 1;
                    trace!("relay: dropping reply #{}", num_replies_dropped);
                    continue;
                }
                if let Some(client_addr) = client_addr {
                    forward(&client_side, &reply_buf[..len], client_addr, &config).await;
                }
            }
        }
    }
}

async fn forward(socket: &UdpSocket, buf: &[u8], to: SocketAddr, config: &RelayConfig) {
    if rand::random::<f64>() < config.loss_rate {
        trace!("relay: losing datagram to {:?}", to);
        return;
    }

    let copies = if rand::random::<f64>() < config.duplicate_rate { 2 } else { 1 };
    for _ in 0..copies {
        if let Err(e) = socket.send_to(buf, to).await {
            debug!("relay: error sending to {:?}: {}", to, e);
        }
    }
}
