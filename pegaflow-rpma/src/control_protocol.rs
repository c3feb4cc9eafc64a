//! Framed messages carried over the TCP side channel.
//!
//! ```text
//! [frame_len: u32 LE][type: u8][body]
//! ```

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::completion::WcStatus;

/// Payload cap of a single Write request or Read ack.
pub(crate) const MAX_TRANSFER_BYTES: u32 = 64 * 1024 * 1024;
pub(crate) const MAX_FRAME_BYTES: usize = MAX_TRANSFER_BYTES as usize + 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RcEndpoint {
    pub(crate) gid: [u8; 16],
    pub(crate) lid: u16,
    pub(crate) qp_num: u32,
    pub(crate) psn: u32,
}

impl RcEndpoint {
    const BYTES: usize = 26;

    fn to_bytes(self) -> [u8; Self::BYTES] {
        let mut bytes = [0_u8; Self::BYTES];
        bytes[..16].copy_from_slice(&self.gid);
        bytes[16..18].copy_from_slice(&self.lid.to_le_bytes());
        bytes[18..22].copy_from_slice(&self.qp_num.to_le_bytes());
        bytes[22..26].copy_from_slice(&self.psn.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BYTES {
            return None;
        }
        let mut gid = [0_u8; 16];
        gid.copy_from_slice(&bytes[..16]);
        Some(Self {
            gid,
            lid: u16::from_le_bytes(bytes[16..18].try_into().ok()?),
            qp_num: u32::from_le_bytes(bytes[18..22].try_into().ok()?),
            psn: u32::from_le_bytes(bytes[22..26].try_into().ok()?),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    ConnectReq = 1,
    ConnectResp = 2,
    ConnectReject = 3,
    Write = 4,
    Read = 5,
    Flush = 6,
    Ack = 7,
    Disconnect = 8,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::ConnectReq),
            2 => Some(Self::ConnectResp),
            3 => Some(Self::ConnectReject),
            4 => Some(Self::Write),
            5 => Some(Self::Read),
            6 => Some(Self::Flush),
            7 => Some(Self::Ack),
            8 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    ConnectReq {
        private_data: Bytes,
        rc: Option<RcEndpoint>,
    },
    ConnectResp {
        private_data: Bytes,
        rc: Option<RcEndpoint>,
    },
    ConnectReject,
    Write {
        seq: u64,
        rkey: u32,
        addr: u64,
        payload: Bytes,
    },
    Read {
        seq: u64,
        rkey: u32,
        addr: u64,
        len: u32,
    },
    Flush {
        seq: u64,
        rkey: u32,
        addr: u64,
        len: u64,
        persistent: bool,
    },
    Ack {
        seq: u64,
        status: WcStatus,
        payload: Bytes,
    },
    Disconnect,
}

impl ControlMessage {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ConnectReq { .. } => "connect_req",
            ControlMessage::ConnectResp { .. } => "connect_resp",
            ControlMessage::ConnectReject => "connect_reject",
            ControlMessage::Write { .. } => "write",
            ControlMessage::Read { .. } => "read",
            ControlMessage::Flush { .. } => "flush",
            ControlMessage::Ack { .. } => "ack",
            ControlMessage::Disconnect => "disconnect",
        }
    }
}

fn push_connect(bytes: &mut Vec<u8>, private_data: &Bytes, rc: &Option<RcEndpoint>) {
    match rc {
        Some(rc) => {
            bytes.push(1);
            bytes.extend_from_slice(&rc.to_bytes());
        }
        None => bytes.push(0),
    }
    bytes.push(private_data.len() as u8);
    bytes.extend_from_slice(private_data);
}

fn parse_connect(payload: &[u8]) -> Option<(Bytes, Option<RcEndpoint>)> {
    let (&has_rc, rest) = payload.split_first()?;
    let (rc, rest) = match has_rc {
        0 => (None, rest),
        1 => {
            if rest.len() < RcEndpoint::BYTES {
                return None;
            }
            let (rc, rest) = rest.split_at(RcEndpoint::BYTES);
            (Some(RcEndpoint::from_bytes(rc)?), rest)
        }
        _ => return None,
    };
    let (&len, rest) = rest.split_first()?;
    if rest.len() != len as usize {
        return None;
    }
    Some((Bytes::copy_from_slice(rest), rc))
}

pub(crate) fn encode_message(message: &ControlMessage) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    match message {
        ControlMessage::ConnectReq { private_data, rc } => {
            bytes.push(MessageType::ConnectReq as u8);
            push_connect(&mut bytes, private_data, rc);
        }
        ControlMessage::ConnectResp { private_data, rc } => {
            bytes.push(MessageType::ConnectResp as u8);
            push_connect(&mut bytes, private_data, rc);
        }
        ControlMessage::ConnectReject => bytes.push(MessageType::ConnectReject as u8),
        ControlMessage::Write {
            seq,
            rkey,
            addr,
            payload,
        } => {
            bytes.reserve(payload.len() + 24);
            bytes.push(MessageType::Write as u8);
            bytes.extend_from_slice(&seq.to_le_bytes());
            bytes.extend_from_slice(&rkey.to_le_bytes());
            bytes.extend_from_slice(&addr.to_le_bytes());
            bytes.extend_from_slice(payload);
        }
        ControlMessage::Read {
            seq,
            rkey,
            addr,
            len,
        } => {
            bytes.push(MessageType::Read as u8);
            bytes.extend_from_slice(&seq.to_le_bytes());
            bytes.extend_from_slice(&rkey.to_le_bytes());
            bytes.extend_from_slice(&addr.to_le_bytes());
            bytes.extend_from_slice(&len.to_le_bytes());
        }
        ControlMessage::Flush {
            seq,
            rkey,
            addr,
            len,
            persistent,
        } => {
            bytes.push(MessageType::Flush as u8);
            bytes.extend_from_slice(&seq.to_le_bytes());
            bytes.extend_from_slice(&rkey.to_le_bytes());
            bytes.extend_from_slice(&addr.to_le_bytes());
            bytes.extend_from_slice(&len.to_le_bytes());
            bytes.push(u8::from(*persistent));
        }
        ControlMessage::Ack {
            seq,
            status,
            payload,
        } => {
            bytes.reserve(payload.len() + 16);
            bytes.push(MessageType::Ack as u8);
            bytes.extend_from_slice(&seq.to_le_bytes());
            bytes.extend_from_slice(&status.code().to_le_bytes());
            bytes.extend_from_slice(payload);
        }
        ControlMessage::Disconnect => bytes.push(MessageType::Disconnect as u8),
    }
    bytes
}

pub(crate) fn decode_message(bytes: &[u8]) -> Option<ControlMessage> {
    let (&raw_kind, payload) = bytes.split_first()?;
    let kind = MessageType::from_u8(raw_kind)?;

    match kind {
        MessageType::ConnectReq => {
            let (private_data, rc) = parse_connect(payload)?;
            Some(ControlMessage::ConnectReq { private_data, rc })
        }
        MessageType::ConnectResp => {
            let (private_data, rc) = parse_connect(payload)?;
            Some(ControlMessage::ConnectResp { private_data, rc })
        }
        MessageType::ConnectReject => payload
            .is_empty()
            .then_some(ControlMessage::ConnectReject),
        MessageType::Write => {
            if payload.len() < 20 {
                return None;
            }
            Some(ControlMessage::Write {
                seq: u64::from_le_bytes(payload[..8].try_into().ok()?),
                rkey: u32::from_le_bytes(payload[8..12].try_into().ok()?),
                addr: u64::from_le_bytes(payload[12..20].try_into().ok()?),
                payload: Bytes::copy_from_slice(&payload[20..]),
            })
        }
        MessageType::Read => {
            if payload.len() != 24 {
                return None;
            }
            Some(ControlMessage::Read {
                seq: u64::from_le_bytes(payload[..8].try_into().ok()?),
                rkey: u32::from_le_bytes(payload[8..12].try_into().ok()?),
                addr: u64::from_le_bytes(payload[12..20].try_into().ok()?),
                len: u32::from_le_bytes(payload[20..24].try_into().ok()?),
            })
        }
        MessageType::Flush => {
            if payload.len() != 29 {
                return None;
            }
            Some(ControlMessage::Flush {
                seq: u64::from_le_bytes(payload[..8].try_into().ok()?),
                rkey: u32::from_le_bytes(payload[8..12].try_into().ok()?),
                addr: u64::from_le_bytes(payload[12..20].try_into().ok()?),
                len: u64::from_le_bytes(payload[20..28].try_into().ok()?),
                persistent: payload[28] != 0,
            })
        }
        MessageType::Ack => {
            if payload.len() < 12 {
                return None;
            }
            Some(ControlMessage::Ack {
                seq: u64::from_le_bytes(payload[..8].try_into().ok()?),
                status: WcStatus::from_u32(u32::from_le_bytes(payload[8..12].try_into().ok()?)),
                payload: Bytes::copy_from_slice(&payload[12..]),
            })
        }
        MessageType::Disconnect => payload.is_empty().then_some(ControlMessage::Disconnect),
    }
}

pub(crate) fn write_frame<W: Write>(writer: &mut W, message: &ControlMessage) -> io::Result<()> {
    let body = encode_message(message);
    if body.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

/// Reads one frame. A clean end of stream between frames yields `None`.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<ControlMessage>> {
    let mut len_bytes = [0_u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    decode_message(&body).map(Some).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("undecodable frame of type {}", body[0]),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::Bytes;

    use super::{
        ControlMessage, RcEndpoint, decode_message, encode_message, read_frame, write_frame,
    };
    use crate::completion::WcStatus;

    fn sample_rc(seed: u8) -> RcEndpoint {
        RcEndpoint {
            gid: [seed; 16],
            lid: 300 + seed as u16,
            qp_num: 400 + seed as u32,
            psn: 500 + seed as u32,
        }
    }

    fn assert_roundtrip(message: ControlMessage) {
        let encoded = encode_message(&message);
        let decoded = decode_message(&encoded).expect("decode");
        assert_eq!(decoded, message, "kind={}", message.kind());
    }

    #[test]
    fn roundtrip_connect_with_and_without_rc() {
        assert_roundtrip(ControlMessage::ConnectReq {
            private_data: Bytes::from_static(b"pdata"),
            rc: Some(sample_rc(1)),
        });
        assert_roundtrip(ControlMessage::ConnectResp {
            private_data: Bytes::new(),
            rc: None,
        });
        assert_roundtrip(ControlMessage::ConnectReject);
    }

    #[test]
    fn roundtrip_data_path_messages() {
        assert_roundtrip(ControlMessage::Write {
            seq: 9,
            rkey: 0x22,
            addr: 0x1000,
            payload: Bytes::from_static(b"hello"),
        });
        assert_roundtrip(ControlMessage::Flush {
            seq: 10,
            rkey: 0x22,
            addr: 0x1000,
            len: 1024,
            persistent: true,
        });
        assert_roundtrip(ControlMessage::Ack {
            seq: 11,
            status: WcStatus::RemoteAccess,
            payload: Bytes::new(),
        });
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        assert!(decode_message(&[99, 0, 0]).is_none());
        assert!(decode_message(&[]).is_none());
    }

    #[test]
    fn decode_rejects_bad_payload_len() {
        let mut bytes = encode_message(&ControlMessage::Read {
            seq: 5,
            rkey: 1,
            addr: 10,
            len: 20,
        });
        bytes.pop();
        assert!(decode_message(&bytes).is_none());

        let mut connect = encode_message(&ControlMessage::ConnectReq {
            private_data: Bytes::from_static(b"abc"),
            rc: None,
        });
        connect.pop();
        assert!(decode_message(&connect).is_none());
    }

    #[test]
    fn frames_survive_a_byte_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &ControlMessage::Disconnect).expect("write");
        write_frame(
            &mut wire,
            &ControlMessage::Read {
                seq: 1,
                rkey: 2,
                addr: 3,
                len: 4,
            },
        )
        .expect("write");

        let mut cursor = Cursor::new(wire);
        assert_eq!(
            read_frame(&mut cursor).expect("frame"),
            Some(ControlMessage::Disconnect)
        );
        assert!(matches!(
            read_frame(&mut cursor).expect("frame"),
            Some(ControlMessage::Read { seq: 1, .. })
        ));
        assert_eq!(read_frame(&mut cursor).expect("eof"), None);
    }

    #[test]
    fn read_frame_rejects_torn_header() {
        let mut cursor = Cursor::new(vec![3_u8, 0]);
        assert!(read_frame(&mut cursor).is_err());
    }
}
