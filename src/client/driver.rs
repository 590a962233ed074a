use std::io::ErrorKind;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::BytesMut;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::DeliveryStateMachine;
use crate::config::ClientConfig;
use crate::multiplexer::{Multiplexer, SocketKey};

/// Runs a [DeliveryStateMachine] on a single non-blocking UDP socket.
///
/// Each iteration of the loop lets the state machine check its retransmission deadline, registers
///  the socket for the state machine's current interest, and waits until the socket is ready or
///  the deadline is due. Writable sockets get all datagrams the state machine has to send, and
///  readable sockets are drained into the state machine.
///
/// Only datagrams whose source is exactly the configured server address are accepted. A server
///  on a multi-homed host must therefore reply from the address the client sends to (e.g. by
///  binding to that address rather than to the unspecified address), or the client keeps
///  retransmitting.
///
/// Datagrams longer than the configured maximum datagram size are dropped rather than
///  truncated.
pub struct ClientDriver {
    multiplexer: Multiplexer,
    key: SocketKey,
    server_addr: SocketAddr,
    send_buf: BytesMut,
    /// `send_buf` holds a datagram that could not be sent because the socket was not writable
    send_buf_pending: bool,
    max_datagram_size: usize,
    /// one byte longer than `max_datagram_size` so oversized datagrams can be recognized
    recv_buf: Vec<u8>,
}

impl ClientDriver {
    pub async fn bind(config: &ClientConfig) -> anyhow::Result<ClientDriver> {
        let socket = UdpSocket::bind(config.local_bind_addr()).await
            .with_context(|| format!("binding client socket to {:?}", config.local_bind_addr()))?;
        debug!("bound client socket to {:?}", socket.local_addr()?);
        Ok(Self::new(socket, config.server_addr, config.max_datagram_size))
    }

    pub fn new(socket: UdpSocket, server_addr: SocketAddr, max_datagram_size: usize) -> ClientDriver {
        let mut multiplexer = Multiplexer::new();
        let key = multiplexer.register(socket, Interest::WRITABLE);

        ClientDriver {
            multiplexer,
            key,
            server_addr,
            send_buf: BytesMut::with_capacity(max_datagram_size),
            send_buf_pending: false,
            max_datagram_size,
            recv_buf: vec![0u8; max_datagram_size + 1],
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.multiplexer.local_addr(self.key)?)
    }

    /// Runs the state machine until it finishes. The only error is a
    ///  [crate::client::DeliveryFailed] when the state machine gives up.
    pub async fn run<M: DeliveryStateMachine>(&mut self, machine: &mut M) -> anyhow::Result<()> {
        while !machine.is_finished() {
            let now = Instant::now();
            machine.on_tick(now)?;

            let interest = if self.send_buf_pending {
                Interest::WRITABLE
            }
            else {
                machine.interest()
            };
            self.multiplexer.set_interest(self.key, interest);

            // while there is something to send, there is no deadline to wake up for
            let max_wait = if interest.is_writable() {
                None
            }
            else {
                Some(machine.next_wait(now))
            };

            for event in self.multiplexer.wait(max_wait).await {
                if let Some(e) = event.error {
                    error!("error on client socket: {}", e);
                    continue;
                }
                if event.writable {
                    self.do_write(machine);
                }
                if event.readable {
                    self.do_read(machine);
                }
            }
        }

        info!("client finished");
        Ok(())
    }

    fn do_write<M: DeliveryStateMachine>(&mut self, machine: &mut M) {
        let socket = self.multiplexer.socket(self.key);

        loop {
            if !self.send_buf_pending {
                self.send_buf.clear();
                if !machine.next_datagram(Instant::now(), &mut self.send_buf) {
                    return;
                }
            }

            match socket.try_send_to(&self.send_buf, self.server_addr) {
                Ok(n) => {
                    trace!("sent {} bytes to {:?}", n, self.server_addr);
                    self.send_buf_pending = false;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!("socket not writable - keeping datagram for later");
                    self.send_buf_pending = true;
                    return;
                }
                Err(e) => {
                    // the datagram counts as lost, and retransmission takes care of it
                    error!("error sending datagram to {:?}: {}", self.server_addr, e);
                    self.send_buf_pending = false;
                }
            }
        }
    }

    fn do_read<M: DeliveryStateMachine>(&mut self, machine: &mut M) {
        let socket = self.multiplexer.socket(self.key);

        while !machine.is_finished() {
            match socket.try_recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    if from != self.server_addr {
                        debug!("received datagram from {:?}, expecting replies from {:?} only - dropping", from, self.server_addr);
                        continue;
                    }
                    if len > self.max_datagram_size {
                        warn!("received datagram of more than {} bytes from {:?} - dropping", self.max_datagram_size, from);
                        continue;
                    }
                    trace!("received {} bytes from {:?}", len, from);
                    machine.on_datagram(&self.recv_buf[..len]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return;
                }
                Err(e) => {
                    error!("error receiving datagram: {}", e);
                    return;
                }
            }
        }
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use crate::client::burst::BurstClient;
    use crate::client::one_by_one::OneByOneClient;
    use crate::client::{exchange, long_sum, DeliveryFailed};
    use crate::config::{ClientConfig, Discipline, PortRange, ServerConfig};
    use crate::server::id_upper_case::IdTaggedService;
    use crate::server::server_driver::DatagramServer;
    use crate::server::session_aggregator::SessionAggregator;
    use crate::server::DatagramService;
    use crate::test_util::lossy_relay::{LossyRelay, RelayConfig};
    use crate::wire::id_tagged::IdTaggedMessage;

    use super::*;

    async fn start_server<S: DatagramService>(service: S) -> SocketAddr {
        let mut config = ServerConfig::new(PortRange::single(0));
        config.bind_ip = [127, 0, 0, 1].into();
        let mut server = DatagramServer::bind(&config, service).await.unwrap();
        let addr = server.local_addrs()[0];
        tokio::spawn(async move {
            server.serve().await
        });
        addr
    }

    fn lines(lines: &[&'static str]) -> Vec<Bytes> {
        lines.iter()
            .map(|l| Bytes::from_static(l.as_bytes()))
            .collect()
    }

    fn client_config(server_addr: SocketAddr, discipline: Discipline) -> ClientConfig {
        ClientConfig {
            retransmit_timeout: Duration::from_millis(200),
            discipline,
            ..ClientConfig::new(server_addr)
        }
    }

    #[rstest::rstest]
    #[case::one_by_one(Discipline::OneByOne)]
    #[case::burst(Discipline::Burst)]
    #[tokio::test]
    async fn test_round_trip(#[case] discipline: Discipline) {
        let server_addr = start_server(IdTaggedService::upper_case()).await;

        let responses = timeout(Duration::from_secs(10), exchange(&client_config(server_addr, discipline), lines(&["abc", "de"])))
            .await.unwrap().unwrap();
        assert_eq!(responses, lines(&["ABC", "DE"]));
    }

    #[rstest::rstest]
    #[case::one_by_one(Discipline::OneByOne)]
    #[case::burst(Discipline::Burst)]
    #[tokio::test]
    async fn test_round_trip_with_lost_and_duplicated_replies(#[case] discipline: Discipline) {
        let server_addr = start_server(IdTaggedService::upper_case()).await;
        let relay = LossyRelay::start(server_addr, RelayConfig {
            drop_first_replies: 2,
            duplicate_rate: 1.0,
            ..RelayConfig::default()
        }).await.unwrap();

        let requests = (0..20)
            .map(|i| Bytes::from(format!("line {}", i)))
            .collect::<Vec<_>>();
        let expected = (0..20)
            .map(|i| Bytes::from(format!("LINE {}", i)))
            .collect::<Vec<_>>();

        let mut config = client_config(relay.local_addr(), discipline);
        config.retransmit_timeout = Duration::from_millis(50);
        let responses = timeout(Duration::from_secs(20), exchange(&config, requests))
            .await.unwrap().unwrap();
        assert_eq!(responses, expected);
    }

    #[tokio::test]
    async fn test_round_trip_with_random_loss() {
        let server_addr = start_server(IdTaggedService::upper_case()).await;
        let relay = LossyRelay::start(server_addr, RelayConfig {
            loss_rate: 0.3,
            ..RelayConfig::default()
        }).await.unwrap();

        let requests = (0..50)
            .map(|i| Bytes::from(format!("abc{}", i)))
            .collect::<Vec<_>>();

        let mut config = client_config(relay.local_addr(), Discipline::Burst);
        config.retransmit_timeout = Duration::from_millis(30);
        let responses = timeout(Duration::from_secs(30), exchange(&config, requests))
            .await.unwrap().unwrap();
        assert_eq!(responses.len(), 50);
        assert_eq!(responses[17], Bytes::from_static(b"ABC17"));
    }

    #[tokio::test]
    async fn test_long_sum() {
        let server_addr = start_server(SessionAggregator::new(1024, None)).await;
        let relay = LossyRelay::start(server_addr, RelayConfig {
            drop_first_replies: 3,
            duplicate_rate: 0.5,
            ..RelayConfig::default()
        }).await.unwrap();

        let mut config = client_config(relay.local_addr(), Discipline::Burst);
        config.retransmit_timeout = Duration::from_millis(50);
        let values = (1..=100).collect::<Vec<i64>>();

        let total = timeout(Duration::from_secs(20), long_sum(&config, values))
            .await.unwrap().unwrap();
        assert_eq!(total, 5050);
    }

    #[rstest::rstest]
    #[case::one_by_one(Discipline::OneByOne)]
    #[case::burst(Discipline::Burst)]
    #[tokio::test]
    async fn test_give_up_without_server(#[case] discipline: Discipline) {
        // a socket that never replies
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut config = client_config(silent.local_addr().unwrap(), discipline);
        config.retransmit_timeout = Duration::from_millis(20);
        config.max_retransmissions = Some(2);

        let err = timeout(Duration::from_secs(10), exchange(&config, lines(&["abc", "de"])))
            .await.unwrap().unwrap_err();
        let failed = err.downcast_ref::<DeliveryFailed>().unwrap();
        assert_eq!(failed.pending_ids, vec![0, 1]);
        assert_eq!(failed.retransmissions, 2);
    }

    #[tokio::test]
    async fn test_retransmits_until_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut driver = ClientDriver::new(socket, server_addr, 1024);
        let mut client = OneByOneClient::new(lines(&["abc"]), Duration::from_millis(30), None);

        let fake_server = async move {
            let mut buf = [0u8; 64];
            // the first three copies of the request get a malformed reply
            for _ in 0..3 {
                let (len, from) = server.recv_from(&mut buf).await.unwrap();
                assert_eq!(&buf[..len], b"\0\0\0\0\0\0\0\0abc");
                server.send_to(b"\0\0\0", from).await.unwrap();
            }
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(b"\0\0\0\0\0\0\0\0ABC", from).await.unwrap();
        };

        let (result, _) = tokio::join!(
            timeout(Duration::from_secs(10), driver.run(&mut client)),
            fake_server,
        );
        result.unwrap().unwrap();
        assert_eq!(client.into_responses(), lines(&["ABC"]));
    }

    #[tokio::test]
    async fn test_replies_from_strangers_are_ignored() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = socket.local_addr().unwrap();
        let mut driver = ClientDriver::new(socket, server.local_addr().unwrap(), 1024);
        let mut client = BurstClient::new(lines(&["x"]), Duration::from_millis(500), None);

        let fake_server = async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(from, client_addr);
            stranger.send_to(b"\0\0\0\0\0\0\0\0FAKE", client_addr).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.send_to(b"\0\0\0\0\0\0\0\0X", client_addr).await.unwrap();
        };

        let (result, _) = tokio::join!(
            timeout(Duration::from_secs(10), driver.run(&mut client)),
            fake_server,
        );
        result.unwrap().unwrap();
        assert_eq!(client.into_responses(), lines(&["X"]));
    }

    #[rstest::rstest]
    #[case::one_by_one(Discipline::OneByOne)]
    #[case::burst(Discipline::Burst)]
    #[tokio::test]
    async fn test_reply_growing_beyond_datagram_size(#[case] discipline: Discipline) {
        let server_addr = start_server(IdTaggedService::upper_case()).await;

        // U+0250 has two bytes in UTF-8, its upper case U+2C6F has three
        let request = Bytes::from("\u{0250}".repeat(508));
        assert_eq!(IdTaggedMessage::serialized_len(request.len()), 1024);

        let mut config = client_config(server_addr, discipline);
        config.retransmit_timeout = Duration::from_millis(20);
        config.max_retransmissions = Some(1);

        let err = timeout(Duration::from_secs(10), exchange(&config, vec![request]))
            .await.unwrap().unwrap_err();
        let failed = err.downcast_ref::<DeliveryFailed>().unwrap();
        assert_eq!(failed.pending_ids, vec![0]);
    }

    #[tokio::test]
    async fn test_oversized_reply_is_dropped() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut driver = ClientDriver::new(socket, server.local_addr().unwrap(), 16);
        let mut client = OneByOneClient::new(lines(&["ab"]), Duration::from_millis(500), None);

        let fake_server = async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();

            // a reply with a valid id, one byte too long
            let mut oversized = b"\0\0\0\0\0\0\0\0".to_vec();
            oversized.extend_from_slice(b"ABCDEFGHI");
            assert_eq!(oversized.len(), 17);
            server.send_to(&oversized, from).await.unwrap();

            tokio::time::sleep(Duration::from_millis(20)).await;
            server.send_to(b"\0\0\0\0\0\0\0\0AB", from).await.unwrap();
        };

        let (result, _) = tokio::join!(
            timeout(Duration::from_secs(10), driver.run(&mut client)),
            fake_server,
        );
        result.unwrap().unwrap();
        assert_eq!(client.into_responses(), lines(&["AB"]));
    }

    #[tokio::test]
    async fn test_request_too_big() {
        let mut config = ClientConfig::new(SocketAddr::from(([127, 0, 0, 1], 9)));
        config.max_datagram_size = 16;
        let result = exchange(&config, vec![Bytes::from_static(b"123456789")]).await;
        assert!(result.is_err());
    }
}
