//! Packets carried across the A2R and R2A rings.
//!
//! On the wire a packet is `length:u8, type:u8, channel_id:u8` followed by
//! `length` payload bytes. Any number of packets are concatenated inside a
//! ring; a drained ring image decodes back into the same sequence.

use crate::WireError;

pub const PKT_CONNECT: u8 = 4;
pub const PKT_CONNECT_RESPONSE: u8 = 5;
pub const PKT_DATA: u8 = 6;
pub const PKT_EOS: u8 = 7;
pub const PKT_RESET: u8 = 8;

/// First status byte of a connect response.
pub const CONNECT_OK: u8 = 0;
pub const CONNECT_UNKNOWN_SERVICE: u8 = 3;

/// Largest payload expressible with the one-byte length prefix.
pub const MAX_PAYLOAD: usize = 255;

/// Fixed bytes in front of every packet's payload.
pub const PACKET_HEADER_LEN: usize = 3;

/// Typed packet body. Connect carries the target service name, Data a slice
/// of the stream, ConnectResponse the bytes the answering side produced
/// (first byte is the status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Connect(Vec<u8>),
    ConnectResponse(Vec<u8>),
    Data(Vec<u8>),
    Eos,
    Reset,
}

impl PacketBody {
    pub fn type_byte(&self) -> u8 {
        match self {
            PacketBody::Connect(_) => PKT_CONNECT,
            PacketBody::ConnectResponse(_) => PKT_CONNECT_RESPONSE,
            PacketBody::Data(_) => PKT_DATA,
            PacketBody::Eos => PKT_EOS,
            PacketBody::Reset => PKT_RESET,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            PacketBody::Connect(p) | PacketBody::ConnectResponse(p) | PacketBody::Data(p) => p,
            PacketBody::Eos | PacketBody::Reset => &[],
        }
    }
}

/// One packet addressed to a logical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel_id: u8,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(channel_id: u8, body: PacketBody) -> Self {
        debug_assert!(body.payload().len() <= MAX_PAYLOAD);
        Packet { channel_id, body }
    }

    /// Bytes this packet occupies on the ring.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN + self.body.payload().len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let payload = self.body.payload();
        out.push(payload.len() as u8);
        out.push(self.body.type_byte());
        out.push(self.channel_id);
        out.extend_from_slice(payload);
    }
}

/// Decode a drained ring image into the packets it holds.
///
/// The rings are lossless, so anything that does not parse means the two
/// sides disagree about the protocol; the caller treats that as fatal.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Packet>, WireError> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        if buf.len() - pos < PACKET_HEADER_LEN {
            return Err(WireError::TruncatedPacket);
        }
        let plen = buf[pos] as usize;
        let ptype = buf[pos + 1];
        let channel_id = buf[pos + 2];
        pos += PACKET_HEADER_LEN;

        if buf.len() - pos < plen {
            return Err(WireError::TruncatedPacket);
        }
        let payload = &buf[pos..pos + plen];
        pos += plen;

        let body = match ptype {
            PKT_CONNECT => PacketBody::Connect(payload.to_vec()),
            PKT_CONNECT_RESPONSE => PacketBody::ConnectResponse(payload.to_vec()),
            PKT_DATA => PacketBody::Data(payload.to_vec()),
            PKT_EOS => {
                if plen != 0 {
                    return Err(WireError::UnexpectedPayload(ptype));
                }
                PacketBody::Eos
            }
            PKT_RESET => {
                if plen != 0 {
                    return Err(WireError::UnexpectedPayload(ptype));
                }
                PacketBody::Reset
            }
            other => return Err(WireError::UnknownPacketType(other)),
        };

        packets.push(Packet { channel_id, body });
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packets: &[Packet]) {
        let mut buf = Vec::new();
        for p in packets {
            p.encode_into(&mut buf);
        }
        let decoded = decode_all(&buf).unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn empty_ring_decodes_to_nothing() {
        assert_eq!(decode_all(&[]).unwrap(), Vec::new());
    }

    #[test]
    fn single_packet_roundtrip() {
        roundtrip(&[Packet::new(7, PacketBody::Connect(b"echo".to_vec()))]);
    }

    #[test]
    fn mixed_sequence_roundtrip() {
        roundtrip(&[
            Packet::new(7, PacketBody::Connect(b"echo".to_vec())),
            Packet::new(7, PacketBody::ConnectResponse(vec![CONNECT_OK])),
            Packet::new(7, PacketBody::Data(b"hello".to_vec())),
            Packet::new(9, PacketBody::Eos),
            Packet::new(7, PacketBody::Reset),
        ]);
    }

    #[test]
    fn zero_length_data_roundtrip() {
        roundtrip(&[Packet::new(1, PacketBody::Data(Vec::new()))]);
    }

    #[test]
    fn max_length_payload_roundtrip() {
        roundtrip(&[Packet::new(3, PacketBody::Data(vec![0xA5; MAX_PAYLOAD]))]);
    }

    #[test]
    fn arbitrary_lengths_roundtrip() {
        // A deterministic spread of payload lengths across the whole range.
        let packets: Vec<Packet> = (0..=255u16)
            .step_by(17)
            .map(|len| {
                let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
                Packet::new((len % 251) as u8, PacketBody::Data(payload))
            })
            .collect();
        roundtrip(&packets);
    }

    #[test]
    fn truncated_header_is_an_error() {
        assert_eq!(decode_all(&[4, 6]), Err(WireError::TruncatedPacket));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        // Claims 4 payload bytes, provides 2.
        assert_eq!(decode_all(&[4, 6, 1, 0xAA, 0xBB]), Err(WireError::TruncatedPacket));
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert_eq!(decode_all(&[0, 99, 1]), Err(WireError::UnknownPacketType(99)));
    }

    #[test]
    fn eos_with_payload_is_an_error() {
        assert_eq!(
            decode_all(&[1, PKT_EOS, 1, 0xFF]),
            Err(WireError::UnexpectedPayload(PKT_EOS))
        );
    }

    #[test]
    fn encoded_len_matches_wire_bytes() {
        let p = Packet::new(2, PacketBody::Data(vec![1, 2, 3]));
        let mut buf = Vec::new();
        p.encode_into(&mut buf);
        assert_eq!(buf.len(), p.encoded_len());
        assert_eq!(buf, vec![3, PKT_DATA, 2, 1, 2, 3]);
    }
}
