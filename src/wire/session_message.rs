use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::BufExt;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Opcode {
    /// client -> server: one contribution to a session's sum
    Op = 1,
    /// server -> client: an operation was received, but the session is incomplete
    Ack = 2,
    /// server -> client: all operations were received, this is the session's sum
    Result = 3,
}

/// The messages of the session protocol. Every message starts with its [Opcode] and the session
///  id, followed by opcode specific fields.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum SessionMessage {
    Operation(OperationData),
    Ack(AckData),
    Result(ResultData),
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct OperationData {
    pub session_id: u64,
    pub op_index: u64,
    /// total number of operations in the session, repeated in every operation
    pub op_count: u64,
    pub value: i64,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct AckData {
    pub session_id: u64,
    pub op_index: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct ResultData {
    pub session_id: u64,
    pub total: i64,
}

impl SessionMessage {
    pub const OPERATION_LEN: usize = 1 + 4*8;
    pub const ACK_LEN: usize = 1 + 2*8;
    pub const RESULT_LEN: usize = 1 + 2*8;

    pub fn opcode(&self) -> Opcode {
        match self {
            SessionMessage::Operation(_) => Opcode::Op,
            SessionMessage::Ack(_) => Opcode::Ack,
            SessionMessage::Result(_) => Opcode::Result,
        }
    }

    pub fn session_id(&self) -> u64 {
        match self {
            SessionMessage::Operation(data) => data.session_id,
            SessionMessage::Ack(data) => data.session_id,
            SessionMessage::Result(data) => data.session_id,
        }
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            SessionMessage::Operation(_) => Self::OPERATION_LEN,
            SessionMessage::Ack(_) => Self::ACK_LEN,
            SessionMessage::Result(_) => Self::RESULT_LEN,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.opcode().into());
        buf.put_u64(self.session_id());
        match self {
            SessionMessage::Operation(data) => {
                buf.put_u64(data.op_index);
                buf.put_u64(data.op_count);
                buf.put_i64(data.value);
            }
            SessionMessage::Ack(data) => {
                buf.put_u64(data.op_index);
            }
            SessionMessage::Result(data) => {
                buf.put_i64(data.total);
            }
        }
    }

    /// Truncated datagrams and unknown opcodes are rejected. Trailing bytes after the last field
    ///  are ignored.
    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<SessionMessage> {
        let opcode = Opcode::try_from_primitive(buf.checked_get_u8()?)?;
        let session_id = buf.checked_get_u64()?;

        let msg = match opcode {
            Opcode::Op => {
                let op_index = buf.checked_get_u64()?;
                let op_count = buf.checked_get_u64()?;
                let value = buf.checked_get_i64()?;
                SessionMessage::Operation(OperationData { session_id, op_index, op_count, value })
            }
            Opcode::Ack => {
                let op_index = buf.checked_get_u64()?;
                SessionMessage::Ack(AckData { session_id, op_index })
            }
            Opcode::Result => {
                let total = buf.checked_get_i64()?;
                SessionMessage::Result(ResultData { session_id, total })
            }
        };
        Ok(msg)
    }
}
