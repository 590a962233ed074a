use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::server::DatagramService;
use crate::wire::id_tagged::IdTaggedMessage;

/// A pure function from a request's payload to its reply's payload. `None` means the request
///  can not be handled, and it is dropped without reply.
pub trait PayloadTransform: Send + 'static {
    fn apply(&self, payload: &[u8]) -> Option<Bytes>;
}

impl <F> PayloadTransform for F
where F: Fn(&[u8]) -> Option<Bytes> + Send + 'static
{
    fn apply(&self, payload: &[u8]) -> Option<Bytes> {
        self(payload)
    }
}

/// Converts UTF-8 text to upper case. Payloads that are not valid UTF-8 are dropped.
pub struct UpperCase;

impl PayloadTransform for UpperCase {
    fn apply(&self, payload: &[u8]) -> Option<Bytes> {
        match std::str::from_utf8(payload) {
            Ok(s) => Some(Bytes::from(s.to_uppercase())),
            Err(e) => {
                debug!("payload is not valid UTF-8: {}", e);
                None
            }
        }
    }
}

/// Replies to every id-tagged request with the transformed payload, tagged with the request's id.
///
/// There is no state across requests: a retransmitted request is just transformed again, which
///  yields the same reply since the transformation is a pure function.
pub struct IdTaggedService<T: PayloadTransform> {
    transform: T,
}

impl IdTaggedService<UpperCase> {
    pub fn upper_case() -> IdTaggedService<UpperCase> {
        IdTaggedService::new(UpperCase)
    }
}

impl <T: PayloadTransform> IdTaggedService<T> {
    pub fn new(transform: T) -> IdTaggedService<T> {
        IdTaggedService { transform }
    }
}

impl <T: PayloadTransform> DatagramService for IdTaggedService<T> {
    fn on_datagram(&mut self, from: SocketAddr, buf: &[u8], _now: Instant) -> Option<Bytes> {
        let request = match IdTaggedMessage::try_deser(buf) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping malformed request from {:?}: {}", from, e);
                return None;
            }
        };
        trace!("request {} from {:?}", request.id, from);

        let Some(payload) = self.transform.apply(&request.payload) else {
            debug!("dropping request {} from {:?}: payload could not be transformed", request.id, from);
            return None;
        };

        let mut reply = BytesMut::with_capacity(IdTaggedMessage::serialized_len(payload.len()));
        IdTaggedMessage::ser_parts(request.id, &payload, &mut reply);
        Some(reply.freeze())
    }
}
