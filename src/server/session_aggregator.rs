use std::net::SocketAddr;
use std::time::Duration;

use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::server::DatagramService;
use crate::wire::session_message::{AckData, OperationData, ResultData, SessionMessage};

/// Accumulation state of a single session
#[derive(Debug)]
pub struct SessionState {
    received: BitSet,
    total: i64,
    expected_count: u64,
    last_activity: Instant,
}

impl SessionState {
    fn new(expected_count: u64, now: Instant) -> SessionState {
        SessionState {
            // grows with the operations actually received, not with the declared count
            received: BitSet::new(),
            total: 0,
            expected_count,
            last_activity: now,
        }
    }

    /// the sum of the values of all operations received so far
    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn expected_count(&self) -> u64 {
        self.expected_count
    }

    pub fn num_received(&self) -> u64 {
        self.received.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.num_received() == self.expected_count
    }

    /// Adds the operation's value unless an operation with the same index was applied before.
    ///  Returns `true` if the operation was new.
    fn apply(&mut self, op_index: u64, value: i64) -> bool {
        if !self.received.insert(op_index as usize) {
            return false;
        }
        self.total = self.total.wrapping_add(value);
        true
    }
}


/// Sums up the values of multi-operation sessions. Sessions are identified by the sender's address
///  together with the client-chosen session id, so different clients can not interfere even if
///  they happen to pick the same session id.
///
/// Every operation is replied to, including duplicates: with `ACK` while operations are missing,
///  and with `RESULT` once all of the session's operations were received. A client that lost a
///  reply retransmits the operation and gets the reply again, while the session's total is not
///  affected by the duplicate.
pub struct SessionAggregator {
    sessions: FxHashMap<(SocketAddr, u64), SessionState>,
    max_ops_per_session: u64,
    idle_timeout: Option<Duration>,
}

impl SessionAggregator {
    pub fn new(max_ops_per_session: u64, idle_timeout: Option<Duration>) -> SessionAggregator {
        match idle_timeout {
            None => info!("sessions are kept for the server's lifetime"),
            Some(t) => info!("sessions are evicted after {:?} without operations", t),
        }

        SessionAggregator {
            sessions: FxHashMap::default(),
            max_ops_per_session,
            idle_timeout,
        }
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, sender: SocketAddr, session_id: u64) -> Option<&SessionState> {
        self.sessions.get(&(sender, session_id))
    }

    /// Applies an operation and returns the reply to send, or `None` if the operation is invalid
    pub fn on_operation(&mut self, sender: SocketAddr, op: &OperationData, now: Instant) -> Option<SessionMessage> {
        if op.op_count == 0 || op.op_count > self.max_ops_per_session {
            warn!("operation from {:?} for session {} declares {} operations, permitted are 1 to {} - dropping", sender, op.session_id, op.op_count, self.max_ops_per_session);
            return None;
        }

        let session = self.sessions.entry((sender, op.session_id))
            .or_insert_with(|| {
                debug!("new session {} from {:?} with {} operations", op.session_id, sender, op.op_count);
                SessionState::new(op.op_count, now)
            });

        // the first operation determines a session's size
        if op.op_count != session.expected_count {
            debug!("operation {} of session {} from {:?} declares {} operations, session was started with {}", op.op_index, op.session_id, sender, op.op_count, session.expected_count);
        }
        if op.op_index >= session.expected_count {
            warn!("operation index {} out of range for session {} from {:?} with {} operations - dropping", op.op_index, op.session_id, sender, session.expected_count);
            return None;
        }

        session.last_activity = now;
        if session.apply(op.op_index, op.value) {
            trace!("session {} from {:?}: applied operation {}", op.session_id, sender, op.op_index);
        }
        else {
            debug!("session {} from {:?}: operation {} was applied before - replying again", op.session_id, sender, op.op_index);
        }

        let reply = if session.is_complete() {
            SessionMessage::Result(ResultData {
                session_id: op.session_id,
                total: session.total,
            })
        }
        else {
            SessionMessage::Ack(AckData {
                session_id: op.session_id,
                op_index: op.op_index,
            })
        };
        Some(reply)
    }

    /// Removes all sessions without operations for longer than the idle timeout, returning the
    ///  number of removed sessions. Sessions are never evicted if no idle timeout is configured.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let Some(idle_timeout) = self.idle_timeout else {
            return 0;
        };

        let before = self.sessions.len();
        self.sessions.retain(|(sender, session_id), session| {
            let keep = now.saturating_duration_since(session.last_activity) <= idle_timeout;
            if !keep {
                debug!("evicting idle session {} from {:?} ({} of {} operations received)", session_id, sender, session.num_received(), session.expected_count);
            }
            keep
        });

        let evicted = before - self.sessions.len();
        if evicted > 0 {
            info!("evicted {} idle sessions, {} remaining", evicted, self.sessions.len());
        }
        evicted
    }
}

impl DatagramService for SessionAggregator {
    fn on_datagram(&mut self, from: SocketAddr, buf: &[u8], now: Instant) -> Option<Bytes> {
        let op = match SessionMessage::try_deser(buf) {
            Ok(SessionMessage::Operation(op)) => op,
            Ok(other) => {
                debug!("received {:?} from {:?}, only operations are handled by the server - dropping", other.opcode(), from);
                return None;
            }
            Err(e) => {
                debug!("dropping malformed datagram from {:?}: {}", from, e);
                return None;
            }
        };

        let reply = self.on_operation(from, &op, now)?;
        let mut buf = BytesMut::with_capacity(reply.serialized_len());
        reply.ser(&mut buf);
        Some(buf.freeze())
    }

    fn on_tick(&mut self, now: Instant) {
        self.evict_idle(now);
    }

    fn tick_interval(&self) -> Option<Duration> {
        self.idle_timeout
    }
}
