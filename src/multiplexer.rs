use std::fmt::{Debug, Formatter};
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;


/// Identifies a socket registered with a [Multiplexer]. Keys are only handed out by
///  [Multiplexer::register] and are never reused.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketKey(usize);

impl Debug for SocketKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Readiness of a single socket as reported by [Multiplexer::wait]
#[derive(Debug)]
pub struct ReadyEvent {
    pub key: SocketKey,
    pub readable: bool,
    pub writable: bool,
    /// An I/O error reported for this socket while waiting for readiness. It concerns only this
    ///  socket, other sockets' events are reported regardless.
    pub error: Option<io::Error>,
}

struct Registration {
    socket: UdpSocket,
    interest: Interest,
}

/// This is a single-task event loop primitive over any number of non-blocking UDP sockets: each
///  socket has an interest set (readable and / or writable) that its owner updates after handling
///  an event, and [Multiplexer::wait] suspends until at least one socket is ready for something
///  it is interested in, or until the maximum wait time elapses.
///
/// Readiness is taken from tokio's reactor, and actual I/O is expected to happen through the
///  sockets' non-blocking `try_*` operations. Those clear a socket's readiness when they run into
///  `WouldBlock`, so handlers should drain a socket until that happens (or accept that the next
///  wait returns immediately).
pub struct Multiplexer {
    registrations: Vec<Registration>,
}

impl Debug for Multiplexer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Multiplexer{{{} sockets}}", self.registrations.len())
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    pub fn new() -> Multiplexer {
        Multiplexer {
            registrations: Vec::new(),
        }
    }

    pub fn register(&mut self, socket: UdpSocket, interest: Interest) -> SocketKey {
        self.registrations.push(Registration { socket, interest });
        SocketKey(self.registrations.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item=SocketKey> {
        (0..self.registrations.len()).map(SocketKey)
    }

    pub fn socket(&self, key: SocketKey) -> &UdpSocket {
        &self.registrations[key.0].socket
    }

    pub fn local_addr(&self, key: SocketKey) -> io::Result<SocketAddr> {
        self.socket(key).local_addr()
    }

    pub fn interest(&self, key: SocketKey) -> Interest {
        self.registrations[key.0].interest
    }

    pub fn set_interest(&mut self, key: SocketKey, interest: Interest) {
        self.registrations[key.0].interest = interest;
    }

    /// Waits until at least one socket is ready for its current interest, returning an event for
    ///  every ready socket. An empty result means that `max_wait` elapsed.
    ///
    /// `max_wait` of `Some(Duration::ZERO)` does not suspend but returns whatever is ready right
    ///  now, `None` waits without a time limit.
    pub async fn wait(&self, max_wait: Option<Duration>) -> Vec<ReadyEvent> {
        let ready = poll_fn(|cx| self.poll_ready(cx));

        match max_wait {
            None => ready.await,
            Some(max_wait) => {
                // NB: tokio's timeout polls the inner future before checking the deadline, so a
                //  zero timeout still reports sockets that are ready already
                timeout(max_wait, ready).await
                    .unwrap_or_default()
            }
        }
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Vec<ReadyEvent>> {
        let mut events = Vec::new();

        for (idx, registration) in self.registrations.iter().enumerate() {
            let mut event = ReadyEvent {
                key: SocketKey(idx),
                readable: false,
                writable: false,
                error: None,
            };

            if registration.interest.is_readable() {
                match registration.socket.poll_recv_ready(cx) {
                    Poll::Ready(Ok(())) => event.readable = true,
                    Poll::Ready(Err(e)) => event.error = Some(e),
                    Poll::Pending => {}
                }
            }
            if registration.interest.is_writable() && event.error.is_none() {
                match registration.socket.poll_send_ready(cx) {
                    Poll::Ready(Ok(())) => event.writable = true,
                    Poll::Ready(Err(e)) => event.error = Some(e),
                    Poll::Pending => {}
                }
            }

            if event.readable || event.writable || event.error.is_some() {
                trace!("socket {:?} ready: r={} w={} err={:?}", event.key, event.readable, event.writable, event.error);
                events.push(event);
            }
        }

        if events.is_empty() {
            Poll::Pending
        }
        else {
            Poll::Ready(events)
        }
    }
}
