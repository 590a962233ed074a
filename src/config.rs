use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::wire::id_tagged::IdTaggedMessage;

/// Datagram size used by all peers unless configured otherwise
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;

/// The largest payload that fits into a single UDP datagram over IPv4
const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Discipline {
    /// only one request is in flight at any time, and requests complete strictly in order
    OneByOne,
    /// all outstanding requests are sent in rounds, replies are accepted in any order
    Burst,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,

    /// time to wait for a reply before a request (or a burst round) is sent again
    pub retransmit_timeout: Duration,

    /// `None` means that the client keeps retransmitting until a reply arrives, however long that
    ///  takes. With `Some(n)`, the client gives up after `n` consecutive retransmissions without
    ///  progress and reports a [crate::client::DeliveryFailed] error.
    pub max_retransmissions: Option<u32>,

    pub discipline: Discipline,

    pub max_datagram_size: usize,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr,
            retransmit_timeout: Duration::from_millis(300),
            max_retransmissions: None,
            discipline: Discipline::OneByOne,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be positive");
        }
        if self.max_datagram_size <= IdTaggedMessage::ID_LEN || self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("max datagram size must be in {}..={}, was {}", IdTaggedMessage::ID_LEN + 1, MAX_UDP_PAYLOAD, self.max_datagram_size);
        }
        Ok(())
    }

    /// the (unspecified) local address a client socket binds to, matching the server's address family
    pub fn local_bind_addr(&self) -> SocketAddr {
        if self.server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        }
        else {
            SocketAddr::from(([0u16; 8], 0))
        }
    }
}


#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,

    /// The server binds one socket per port in this range, all served by the same loop
    pub ports: PortRange,

    pub max_datagram_size: usize,

    /// `None` keeps session state for the lifetime of the process. With `Some(t)`, sessions
    ///  that did not receive an operation for `t` are evicted.
    pub session_idle_timeout: Option<Duration>,

    /// upper bound for the number of operations a session may declare
    pub max_ops_per_session: u64,

    /// replies waiting for a socket to become writable; replies in excess of this are dropped
    ///  (and recovered by the client's retransmission)
    pub max_pending_replies_per_socket: usize,
}

impl ServerConfig {
    /// A session's received operations are tracked in a bit set indexed by operation index, so
    ///  this bounds the memory a single operation can make a session allocate (2 MiB)
    pub const MAX_OPS_PER_SESSION_LIMIT: u64 = 1 << 24;

    pub fn new(ports: PortRange) -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            session_idle_timeout: None,
            max_ops_per_session: 1 << 20,
            max_pending_replies_per_socket: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= IdTaggedMessage::ID_LEN || self.max_datagram_size > MAX_UDP_PAYLOAD {
            bail!("max datagram size must be in {}..={}, was {}", IdTaggedMessage::ID_LEN + 1, MAX_UDP_PAYLOAD, self.max_datagram_size);
        }
        if self.max_ops_per_session == 0 || self.max_ops_per_session > Self::MAX_OPS_PER_SESSION_LIMIT {
            bail!("max ops per session must be in 1..={}, was {}", Self::MAX_OPS_PER_SESSION_LIMIT, self.max_ops_per_session);
        }
        if self.max_pending_replies_per_socket == 0 {
            bail!("max pending replies per socket must be positive");
        }
        if let Some(timeout) = self.session_idle_timeout {
            if timeout.is_zero() {
                bail!("session idle timeout must be positive");
            }
        }
        Ok(())
    }

    pub fn bind_addrs(&self) -> impl Iterator<Item=SocketAddr> + '_ {
        self.ports.iter()
            .map(|port| SocketAddr::new(self.bind_ip, port))
    }
}


/// A non-empty, inclusive range of ports, written as `7777` or `7777-7780`
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PortRange {
    first: u16,
    last: u16,
}

impl Debug for PortRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        }
        else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

impl PortRange {
    pub const UNPRIVILEGED: RangeInclusive<u16> = 1024..=65535;

    pub fn new(first: u16, last: u16) -> anyhow::Result<PortRange> {
        if first > last {
            bail!("invalid port range {}-{}: first port is greater than last port", first, last);
        }
        Ok(PortRange { first, last })
    }

    pub fn single(port: u16) -> PortRange {
        PortRange { first: port, last: port }
    }

    pub fn first(&self) -> u16 {
        self.first
    }

    pub fn last(&self) -> u16 {
        self.last
    }

    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    pub fn iter(&self) -> impl Iterator<Item=u16> {
        self.first..=self.last
    }

    /// Servers started from the command line only listen on unprivileged ports
    pub fn validate_unprivileged(&self) -> anyhow::Result<()> {
        if !Self::UNPRIVILEGED.contains(&self.first) || !Self::UNPRIVILEGED.contains(&self.last) {
            bail!("port numbers must be between {} and {}, was {}", Self::UNPRIVILEGED.start(), Self::UNPRIVILEGED.end(), self);
        }
        Ok(())
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| p.trim().parse::<u16>()
            .map_err(|e| anyhow!("invalid port {:?}: {}", p, e));

        match s.split_once('-') {
            None => Ok(PortRange::single(parse_port(s)?)),
            Some((first, last)) => PortRange::new(parse_port(first)?, parse_port(last)?),
        }
    }
}
