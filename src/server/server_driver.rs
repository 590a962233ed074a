use std::collections::VecDeque;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::multiplexer::{Multiplexer, SocketKey};
use crate::server::DatagramService;

/// upper bound for datagrams read from one socket per readiness event, so a flood on one port
///  can not starve the others
const READ_BUDGET_PER_EVENT: usize = 64;

type Outbox = VecDeque<(SocketAddr, Bytes)>;

/// A single-task server loop on one or more UDP sockets. Every received datagram is passed to the
///  [DatagramService], and its reply is sent back through the socket the datagram arrived on.
///
/// Datagrams and replies longer than the maximum datagram size are dropped.
///
/// Replies are sent right away if possible. If a socket is not writable, they are queued per
///  socket, and the socket is registered for writability until the queue is drained.
pub struct DatagramServer<S: DatagramService> {
    multiplexer: Multiplexer,
    outboxes: FxHashMap<SocketKey, Outbox>,
    service: S,
    max_datagram_size: usize,
    /// one byte longer than `max_datagram_size` so oversized datagrams can be recognized
    recv_buf: Vec<u8>,
    max_pending_replies: usize,
}

impl <S: DatagramService> DatagramServer<S> {
    pub async fn bind(config: &ServerConfig, service: S) -> anyhow::Result<DatagramServer<S>> {
        config.validate()?;

        let mut sockets = Vec::with_capacity(config.ports.len());
        for addr in config.bind_addrs() {
            let socket = UdpSocket::bind(addr).await
                .with_context(|| format!("could not bind to {:?} - another server is probably running on that port", addr))?;
            info!("listening on {:?}", socket.local_addr()?);
            sockets.push(socket);
        }

        Ok(Self::from_sockets(sockets, service, config.max_datagram_size, config.max_pending_replies_per_socket))
    }

    pub fn from_sockets(sockets: Vec<UdpSocket>, service: S, max_datagram_size: usize, max_pending_replies: usize) -> DatagramServer<S> {
        let mut multiplexer = Multiplexer::new();
        let mut outboxes = FxHashMap::default();
        for socket in sockets {
            let key = multiplexer.register(socket, Interest::READABLE);
            outboxes.insert(key, Outbox::new());
        }

        DatagramServer {
            multiplexer,
            outboxes,
            service,
            max_datagram_size,
            recv_buf: vec![0u8; max_datagram_size + 1],
            max_pending_replies,
        }
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.multiplexer.keys()
            .filter_map(|key| self.multiplexer.local_addr(key).ok())
            .collect()
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Serves until the process terminates
    pub async fn serve(&mut self) -> anyhow::Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes. Replies that are still queued at that point are dropped.
    pub async fn serve_until(&mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);

        let tick_interval = self.service.tick_interval();
        let mut next_tick = tick_interval.map(|interval| Instant::now() + interval);

        info!("serving on {} sockets", self.multiplexer.len());

        loop {
            for (key, outbox) in &self.outboxes {
                let interest = if outbox.is_empty() {
                    Interest::READABLE
                }
                else {
                    Interest::READABLE.add(Interest::WRITABLE)
                };
                self.multiplexer.set_interest(*key, interest);
            }

            let max_wait = next_tick.map(|t| t.saturating_duration_since(Instant::now()));

            let events = select! {
                _ = &mut shutdown => {
                    let num_dropped: usize = self.outboxes.values().map(|o| o.len()).sum();
                    info!("shutting down, dropping {} queued replies", num_dropped);
                    return Ok(());
                }
                events = self.multiplexer.wait(max_wait) => events,
            };

            for event in events {
                if let Some(e) = event.error {
                    error!("error on socket {:?}: {}", event.key, e);
                    continue;
                }
                if event.readable {
                    self.do_read(event.key);
                }
                if event.writable {
                    self.do_flush(event.key);
                }
            }

            if let (Some(t), Some(interval)) = (next_tick, tick_interval) {
                let now = Instant::now();
                if now >= t {
                    self.service.on_tick(now);
                    next_tick = Some(now + interval);
                }
            }
        }
    }

    fn do_read(&mut self, key: SocketKey) {
        let socket = self.multiplexer.socket(key);
        let Some(outbox) = self.outboxes.get_mut(&key) else {
            return;
        };

        for _ in 0..READ_BUDGET_PER_EVENT {
            let (len, from) = match socket.try_recv_from(&mut self.recv_buf) {
                Ok(x) => x,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("error receiving on socket {:?}: {}", key, e);
                    break;
                }
            };
            if len > self.max_datagram_size {
                warn!("received datagram of more than {} bytes from {:?} on socket {:?} - dropping", self.max_datagram_size, from, key);
                continue;
            }
            trace!("received {} bytes from {:?} on socket {:?}", len, from, key);

            let Some(reply) = self.service.on_datagram(from, &self.recv_buf[..len], Instant::now()) else {
                continue;
            };
            if reply.len() > self.max_datagram_size {
                warn!("reply to {:?} has {} bytes, exceeding the maximum datagram size of {} - dropping", from, reply.len(), self.max_datagram_size);
                continue;
            }
            if outbox.len() >= self.max_pending_replies {
                warn!("{} replies queued on socket {:?} - dropping reply to {:?}", outbox.len(), key, from);
                continue;
            }
            outbox.push_back((from, reply));
        }

        flush(socket, key, outbox);
    }

    fn do_flush(&mut self, key: SocketKey) {
        let socket = self.multiplexer.socket(key);
        if let Some(outbox) = self.outboxes.get_mut(&key) {
            flush(socket, key, outbox);
        }
    }
}

/// sends queued replies until the socket would block
fn flush(socket: &UdpSocket, key: SocketKey, outbox: &mut Outbox) {
    while let Some((to, reply)) = outbox.front() {
        match socket.try_send_to(reply, *to) {
            Ok(_) => {
                trace!("sent reply to {:?} from socket {:?}", to, key);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("socket {:?} not writable, {} replies queued", key, outbox.len());
                return;
            }
            Err(e) => {
                // the client recovers from a lost reply by retransmitting
                error!("error sending reply to {:?} from socket {:?}: {}", to, key, e);
            }
        }
        outbox.pop_front();
    }
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    use crate::config::PortRange;
    use crate::server::MockDatagramService;

    use super::*;

    fn echo_service() -> MockDatagramService {
        let mut service = MockDatagramService::new();
        service.expect_tick_interval()
            .return_const(None::<Duration>);
        service.expect_on_datagram()
            .returning(|_, buf, _| Some(Bytes::copy_from_slice(buf)));
        service
    }

    async fn loopback_sockets(n: usize) -> Vec<UdpSocket> {
        let mut result = Vec::new();
        for _ in 0..n {
            result.push(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        }
        result
    }

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await.unwrap().unwrap();
        (buf[..len].to_vec(), from)
    }

    #[tokio::test]
    async fn test_replies_through_receiving_socket() {
        let mut server = DatagramServer::from_sockets(loopback_sockets(2).await, echo_service(), 1024, 16);
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 2);

        let (shutdown_send, shutdown_recv) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server.serve_until(async { shutdown_recv.await.ok(); }).await
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"to first", addrs[0]).await.unwrap();
        assert_eq!(recv(&client).await, (b"to first".to_vec(), addrs[0]));

        client.send_to(b"to second", addrs[1]).await.unwrap();
        assert_eq!(recv(&client).await, (b"to second".to_vec(), addrs[1]));

        shutdown_send.send(()).unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_reply() {
        let mut service = MockDatagramService::new();
        service.expect_tick_interval()
            .return_const(None::<Duration>);
        service.expect_on_datagram()
            .withf(|_, buf, _| buf == b"ignore me")
            .times(1)
            .return_const(None::<Bytes>);
        service.expect_on_datagram()
            .withf(|_, buf, _| buf == b"reply")
            .times(1)
            .returning(|_, _, _| Some(Bytes::from_static(b"REPLY")));

        let mut server = DatagramServer::from_sockets(loopback_sockets(1).await, service, 1024, 16);
        let addr = server.local_addrs()[0];
        tokio::spawn(async move {
            server.serve().await
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ignore me", addr).await.unwrap();
        client.send_to(b"reply", addr).await.unwrap();
        assert_eq!(recv(&client).await.0, b"REPLY".to_vec());
    }

    #[tokio::test]
    async fn test_oversized_datagrams_are_dropped() {
        let mut service = MockDatagramService::new();
        service.expect_tick_interval()
            .return_const(None::<Duration>);
        service.expect_on_datagram()
            .withf(|_, buf, _| buf == b"grow")
            .times(1)
            .returning(|_, _, _| Some(Bytes::from_static(b"0123456789abcdefg")));
        service.expect_on_datagram()
            .withf(|_, buf, _| buf == b"fits")
            .times(1)
            .returning(|_, _, _| Some(Bytes::from_static(b"0123456789abcdef")));

        let mut server = DatagramServer::from_sockets(loopback_sockets(1).await, service, 16, 16);
        let addr = server.local_addrs()[0];
        tokio::spawn(async move {
            server.serve().await
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // a request that is too long never reaches the service
        client.send_to(b"0123456789abcdefg", addr).await.unwrap();
        client.send_to(b"grow", addr).await.unwrap();
        client.send_to(b"fits", addr).await.unwrap();
        assert_eq!(recv(&client).await.0, b"0123456789abcdef".to_vec());
    }

    #[tokio::test]
    async fn test_service_sees_sender_address() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let mut service = MockDatagramService::new();
        service.expect_tick_interval()
            .return_const(None::<Duration>);
        service.expect_on_datagram()
            .withf(move |from, _, _| from == &client_addr)
            .returning(|_, _, _| Some(Bytes::from_static(b"ok")));

        let mut server = DatagramServer::from_sockets(loopback_sockets(1).await, service, 1024, 16);
        let addr = server.local_addrs()[0];
        tokio::spawn(async move {
            server.serve().await
        });

        client.send_to(b"x", addr).await.unwrap();
        assert_eq!(recv(&client).await.0, b"ok".to_vec());
    }

    #[tokio::test]
    async fn test_tick() {
        let (tick_send, mut tick_recv) = mpsc::unbounded_channel();

        let mut service = MockDatagramService::new();
        service.expect_tick_interval()
            .return_const(Some(Duration::from_millis(10)));
        service.expect_on_tick()
            .returning(move |_| { tick_send.send(()).ok(); });

        let mut server = DatagramServer::from_sockets(loopback_sockets(1).await, service, 1024, 16);
        tokio::spawn(async move {
            server.serve().await
        });

        for _ in 0..3 {
            timeout(Duration::from_secs(5), tick_recv.recv()).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_bind_port_range() {
        let mut config = ServerConfig::new(PortRange::single(0));
        config.bind_ip = [127, 0, 0, 1].into();

        let server = DatagramServer::bind(&config, echo_service()).await.unwrap();
        assert_eq!(server.local_addrs().len(), 1);
        assert_ne!(server.local_addrs()[0].port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let existing = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut config = ServerConfig::new(PortRange::single(existing.local_addr().unwrap().port()));
        config.bind_ip = [127, 0, 0, 1].into();

        let err = DatagramServer::bind(&config, echo_service()).await.err().unwrap();
        assert!(format!("{}", err).contains("another server is probably running"));
    }

    #[tokio::test]
    async fn test_outbox_flush() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let mut outbox = Outbox::new();
        outbox.push_back((client_addr, Bytes::from_static(b"a")));
        outbox.push_back((client_addr, Bytes::from_static(b"b")));

        let mut multiplexer = Multiplexer::new();
        let key = multiplexer.register(socket, Interest::WRITABLE);
        assert_eq!(multiplexer.wait(None).await.len(), 1);

        flush(multiplexer.socket(key), key, &mut outbox);
        assert!(outbox.is_empty());
        assert_eq!(recv(&client).await.0, b"a".to_vec());
        assert_eq!(recv(&client).await.0, b"b".to_vec());
    }
}
