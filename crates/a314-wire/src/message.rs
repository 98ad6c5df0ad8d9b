//! Messages exchanged with local clients.
//!
//! Every message starts with a packed 9-byte little-endian header
//! (`length:u32, stream_id:u32, type:u8`) followed by `length` payload
//! bytes. Service names travel as raw bytes; `stream_id` is zero for the
//! registry and memory-access messages.

use crate::WireError;

pub const MSG_REGISTER_REQ: u8 = 1;
pub const MSG_REGISTER_RES: u8 = 2;
pub const MSG_DEREGISTER_REQ: u8 = 3;
pub const MSG_DEREGISTER_RES: u8 = 4;
pub const MSG_READ_MEM_REQ: u8 = 5;
pub const MSG_READ_MEM_RES: u8 = 6;
pub const MSG_WRITE_MEM_REQ: u8 = 7;
pub const MSG_WRITE_MEM_RES: u8 = 8;
pub const MSG_CONNECT: u8 = 9;
pub const MSG_CONNECT_RESPONSE: u8 = 10;
pub const MSG_DATA: u8 = 11;
pub const MSG_EOS: u8 = 12;
pub const MSG_RESET: u8 = 13;

/// Result byte in register/deregister responses.
pub const MSG_SUCCESS: u8 = 1;
pub const MSG_FAIL: u8 = 0;

/// Size of the packed message header.
pub const HEADER_LEN: usize = 9;

/// One client protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RegisterReq { name: Vec<u8> },
    RegisterRes { ok: bool },
    DeregisterReq { name: Vec<u8> },
    DeregisterRes { ok: bool },
    ReadMemReq { address: u32, length: u32 },
    ReadMemRes { data: Vec<u8> },
    WriteMemReq { address: u32, data: Vec<u8> },
    WriteMemRes,
    Connect { stream_id: u32, service: Vec<u8> },
    ConnectResponse { stream_id: u32, payload: Vec<u8> },
    Data { stream_id: u32, payload: Vec<u8> },
    Eos { stream_id: u32 },
    Reset { stream_id: u32 },
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::RegisterReq { .. } => MSG_REGISTER_REQ,
            Message::RegisterRes { .. } => MSG_REGISTER_RES,
            Message::DeregisterReq { .. } => MSG_DEREGISTER_REQ,
            Message::DeregisterRes { .. } => MSG_DEREGISTER_RES,
            Message::ReadMemReq { .. } => MSG_READ_MEM_REQ,
            Message::ReadMemRes { .. } => MSG_READ_MEM_RES,
            Message::WriteMemReq { .. } => MSG_WRITE_MEM_REQ,
            Message::WriteMemRes => MSG_WRITE_MEM_RES,
            Message::Connect { .. } => MSG_CONNECT,
            Message::ConnectResponse { .. } => MSG_CONNECT_RESPONSE,
            Message::Data { .. } => MSG_DATA,
            Message::Eos { .. } => MSG_EOS,
            Message::Reset { .. } => MSG_RESET,
        }
    }

    /// Stream id carried in the header; zero outside the stream messages.
    pub fn stream_id(&self) -> u32 {
        match self {
            Message::Connect { stream_id, .. }
            | Message::ConnectResponse { stream_id, .. }
            | Message::Data { stream_id, .. }
            | Message::Eos { stream_id }
            | Message::Reset { stream_id } => *stream_id,
            _ => 0,
        }
    }

    fn payload(&self) -> MessagePayload<'_> {
        match self {
            Message::RegisterReq { name } | Message::DeregisterReq { name } => {
                MessagePayload::Bytes(name)
            }
            Message::RegisterRes { ok } | Message::DeregisterRes { ok } => {
                MessagePayload::Result(if *ok { MSG_SUCCESS } else { MSG_FAIL })
            }
            Message::ReadMemReq { address, length } => MessagePayload::ReadMem {
                address: *address,
                length: *length,
            },
            Message::ReadMemRes { data } => MessagePayload::Bytes(data),
            Message::WriteMemReq { address, data } => MessagePayload::WriteMem {
                address: *address,
                data,
            },
            Message::WriteMemRes | Message::Eos { .. } | Message::Reset { .. } => {
                MessagePayload::Empty
            }
            Message::Connect { service, .. } => MessagePayload::Bytes(service),
            Message::ConnectResponse { payload, .. } | Message::Data { payload, .. } => {
                MessagePayload::Bytes(payload)
            }
        }
    }

    /// Append the wire encoding of this message, header included.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let payload_len = match self.payload() {
            MessagePayload::Empty => 0,
            MessagePayload::Result(_) => 1,
            MessagePayload::Bytes(b) => b.len(),
            MessagePayload::ReadMem { .. } => 8,
            MessagePayload::WriteMem { data, .. } => 4 + data.len(),
        };

        out.extend_from_slice(&(payload_len as u32).to_le_bytes());
        out.extend_from_slice(&self.stream_id().to_le_bytes());
        out.push(self.type_byte());

        match self.payload() {
            MessagePayload::Empty => {}
            MessagePayload::Result(b) => out.push(b),
            MessagePayload::Bytes(b) => out.extend_from_slice(b),
            MessagePayload::ReadMem { address, length } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
            }
            MessagePayload::WriteMem { address, data } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(data);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Interpret a raw frame. Messages too short for their type's fixed
    /// fields are rejected rather than read out of bounds; the EOS and
    /// RESET bodies are ignored if present.
    pub fn decode(kind: u8, stream_id: u32, payload: &[u8]) -> Result<Message, WireError> {
        let short = || WireError::ShortMessage {
            kind,
            length: payload.len(),
        };

        let msg = match kind {
            MSG_REGISTER_REQ => Message::RegisterReq {
                name: payload.to_vec(),
            },
            MSG_REGISTER_RES => Message::RegisterRes {
                ok: *payload.first().ok_or_else(short)? == MSG_SUCCESS,
            },
            MSG_DEREGISTER_REQ => Message::DeregisterReq {
                name: payload.to_vec(),
            },
            MSG_DEREGISTER_RES => Message::DeregisterRes {
                ok: *payload.first().ok_or_else(short)? == MSG_SUCCESS,
            },
            MSG_READ_MEM_REQ => {
                if payload.len() < 8 {
                    return Err(short());
                }
                Message::ReadMemReq {
                    address: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                    length: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
                }
            }
            MSG_READ_MEM_RES => Message::ReadMemRes {
                data: payload.to_vec(),
            },
            MSG_WRITE_MEM_REQ => {
                if payload.len() < 4 {
                    return Err(short());
                }
                Message::WriteMemReq {
                    address: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                    data: payload[4..].to_vec(),
                }
            }
            MSG_WRITE_MEM_RES => Message::WriteMemRes,
            MSG_CONNECT => Message::Connect {
                stream_id,
                service: payload.to_vec(),
            },
            MSG_CONNECT_RESPONSE => {
                if payload.is_empty() {
                    return Err(short());
                }
                Message::ConnectResponse {
                    stream_id,
                    payload: payload.to_vec(),
                }
            }
            MSG_DATA => Message::Data {
                stream_id,
                payload: payload.to_vec(),
            },
            MSG_EOS => Message::Eos { stream_id },
            MSG_RESET => Message::Reset { stream_id },
            other => return Err(WireError::UnknownMessageType(other)),
        };

        Ok(msg)
    }
}

enum MessagePayload<'a> {
    Empty,
    Result(u8),
    Bytes(&'a [u8]),
    ReadMem { address: u32, length: u32 },
    WriteMem { address: u32, data: &'a [u8] },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.encode();
        assert!(bytes.len() >= HEADER_LEN);
        let length = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let stream_id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let kind = bytes[8];
        assert_eq!(bytes.len(), HEADER_LEN + length);
        let decoded = Message::decode(kind, stream_id, &bytes[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn all_variants_roundtrip() {
        roundtrip(Message::RegisterReq {
            name: b"echo".to_vec(),
        });
        roundtrip(Message::RegisterRes { ok: true });
        roundtrip(Message::DeregisterReq {
            name: b"echo".to_vec(),
        });
        roundtrip(Message::DeregisterRes { ok: false });
        roundtrip(Message::ReadMemReq {
            address: 0xDEAD_BEEF,
            length: 0x1234_5678,
        });
        roundtrip(Message::ReadMemRes {
            data: vec![1, 2, 3, 4],
        });
        roundtrip(Message::WriteMemReq {
            address: 0x000F_4240,
            data: vec![9, 8, 7],
        });
        roundtrip(Message::WriteMemRes);
        roundtrip(Message::Connect {
            stream_id: 1,
            service: b"disk".to_vec(),
        });
        roundtrip(Message::ConnectResponse {
            stream_id: 1,
            payload: vec![0],
        });
        roundtrip(Message::Data {
            stream_id: 3,
            payload: b"hello".to_vec(),
        });
        roundtrip(Message::Eos { stream_id: 5 });
        roundtrip(Message::Reset { stream_id: 7 });
    }

    #[test]
    fn header_fields_are_little_endian() {
        let bytes = Message::Data {
            stream_id: 0x0102_0304,
            payload: vec![0xAA, 0xBB],
        }
        .encode();
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes[8], MSG_DATA);
        assert_eq!(&bytes[9..], &[0xAA, 0xBB]);
    }

    #[test]
    fn registry_messages_carry_stream_id_zero() {
        for msg in [
            Message::RegisterReq { name: vec![b'x'] },
            Message::DeregisterRes { ok: true },
            Message::ReadMemReq {
                address: 0,
                length: 4,
            },
            Message::WriteMemRes,
        ] {
            assert_eq!(msg.stream_id(), 0);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert_eq!(
            Message::decode(200, 0, &[]),
            Err(WireError::UnknownMessageType(200))
        );
    }

    #[test]
    fn short_fixed_fields_are_rejected() {
        assert!(matches!(
            Message::decode(MSG_READ_MEM_REQ, 0, &[1, 2, 3]),
            Err(WireError::ShortMessage { .. })
        ));
        assert!(matches!(
            Message::decode(MSG_WRITE_MEM_REQ, 0, &[1]),
            Err(WireError::ShortMessage { .. })
        ));
        assert!(matches!(
            Message::decode(MSG_CONNECT_RESPONSE, 1, &[]),
            Err(WireError::ShortMessage { .. })
        ));
    }

    #[test]
    fn eos_ignores_stray_payload() {
        assert_eq!(
            Message::decode(MSG_EOS, 9, &[1, 2, 3]).unwrap(),
            Message::Eos { stream_id: 9 }
        );
    }
}
