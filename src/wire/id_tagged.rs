use std::fmt::{Debug, Formatter};
use std::mem::size_of;

use bytes::{BufMut, Bytes};

use crate::util::buf_ext::BufExt;

/// A request or a response of the id-tagged exchange: an 8 byte id correlating a reply with its
///  request, followed by an opaque payload that extends to the end of the datagram.
#[derive(Clone, Eq, PartialEq)]
pub struct IdTaggedMessage {
    pub id: u64,
    pub payload: Bytes,
}

impl Debug for IdTaggedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ID{{{}:{} bytes}}", self.id, self.payload.len())
    }
}

impl IdTaggedMessage {
    pub const ID_LEN: usize = size_of::<u64>();

    pub fn new(id: u64, payload: impl Into<Bytes>) -> IdTaggedMessage {
        IdTaggedMessage {
            id,
            payload: payload.into(),
        }
    }

    pub fn serialized_len(payload_len: usize) -> usize {
        Self::ID_LEN + payload_len
    }

    /// writes a message without requiring an owned payload
    pub fn ser_parts(id: u64, payload: &[u8], buf: &mut impl BufMut) {
        buf.put_u64(id);
        buf.put_slice(payload);
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        Self::ser_parts(self.id, &self.payload, buf);
    }

    /// NB: fails only if the datagram is too short to hold an id - the payload may be empty
    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<IdTaggedMessage> {
        let id = buf.checked_get_u64()?;
        Ok(IdTaggedMessage {
            id,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
