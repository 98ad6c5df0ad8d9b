//! Header-prefixed framing for the client protocol.
//!
//! Generic over the transport type: works with any `AsyncRead + AsyncWrite +
//! Unpin` stream, so the same framing drives accepted TCP connections and
//! the socketpair ends handed to on-demand services.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, HEADER_LEN};

/// Upper bound on a frame's payload, checked before any allocation. The
/// largest legitimate frame is a memory write of one bus transfer, far
/// below this.
pub const MAX_FRAME_PAYLOAD: usize = 256 * 1024;

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

/// A frame as read off the stream: header fields plus payload, not yet
/// interpreted. Interpretation (and the tolerant handling of unknown
/// types) happens in the dispatcher via [`Message::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn parse(&self) -> Result<Message, crate::WireError> {
        Message::decode(self.kind, self.stream_id, &self.payload)
    }
}

/// A framed client connection.
///
/// Buffers partial frames across reads, so a header split over two TCP
/// segments is reassembled transparently.
pub struct MessageFramed<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
    encode_buf: Vec<u8>,
}

impl<S> MessageFramed<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
            encode_buf: Vec::with_capacity(1024),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn try_decode(&mut self) -> io::Result<Option<Frame>> {
        let avail = &self.buf[self.unread_start..];
        if avail.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_le_bytes(avail[0..4].try_into().unwrap()) as usize;
        if length > MAX_FRAME_PAYLOAD {
            // A length like this means the stream is desynchronized; there
            // is no way to find the next frame boundary.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload of {length} bytes exceeds {MAX_FRAME_PAYLOAD}"),
            ));
        }
        if avail.len() < HEADER_LEN + length {
            return Ok(None);
        }

        let stream_id = u32::from_le_bytes(avail[4..8].try_into().unwrap());
        let kind = avail[8];
        let payload = avail[HEADER_LEN..HEADER_LEN + length].to_vec();

        self.unread_start += HEADER_LEN + length;
        self.compact();

        Ok(Some(Frame {
            kind,
            stream_id,
            payload,
        }))
    }

    fn compact(&mut self) {
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
        } else if self.unread_start >= RECV_BUF_COMPACT_THRESHOLD {
            self.buf.drain(..self.unread_start);
            self.unread_start = 0;
        }
    }
}

impl<S> MessageFramed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Receive the next frame. Returns `None` on a clean end of stream;
    /// an end of stream in the middle of a frame is an error.
    pub async fn recv(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(Some(frame));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len() - self.unread_start;
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} bytes of a partial frame"),
                    ));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Encode and send one message.
    pub async fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.encode_buf.clear();
        msg.encode_into(&mut self.encode_buf);
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (left, right) = duplex(4096);
        let mut sender = MessageFramed::new(left);
        let mut receiver = MessageFramed::new(right);

        let msg = Message::Data {
            stream_id: 1,
            payload: b"hello".to_vec(),
        };
        sender.send(&msg).await.unwrap();

        let frame = receiver.recv().await.unwrap().unwrap();
        assert_eq!(frame.parse().unwrap(), msg);
    }

    #[tokio::test]
    async fn reassembles_split_header_and_payload() {
        let bytes = Message::Data {
            stream_id: 42,
            payload: vec![0xAB; 32],
        }
        .encode();

        let (mut writer, reader) = duplex(4096);
        let mut framed = MessageFramed::new(reader);

        // Drip the frame in three pieces, splitting inside the header.
        let recv = tokio::spawn(async move { framed.recv().await });
        writer.write_all(&bytes[..5]).await.unwrap();
        writer.flush().await.unwrap();
        tokio::task::yield_now().await;
        writer.write_all(&bytes[5..HEADER_LEN + 3]).await.unwrap();
        writer.flush().await.unwrap();
        tokio::task::yield_now().await;
        writer.write_all(&bytes[HEADER_LEN + 3..]).await.unwrap();
        writer.shutdown().await.unwrap();

        let frame = recv.await.unwrap().unwrap().unwrap();
        assert_eq!(frame.stream_id, 42);
        assert_eq!(frame.payload.len(), 32);
    }

    #[tokio::test]
    async fn multiple_frames_in_one_read() {
        let mut bytes = Message::Eos { stream_id: 1 }.encode();
        bytes.extend(Message::Reset { stream_id: 2 }.encode());

        let (mut writer, reader) = duplex(4096);
        writer.write_all(&bytes).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut framed = MessageFramed::new(reader);
        let first = framed.recv().await.unwrap().unwrap();
        let second = framed.recv().await.unwrap().unwrap();
        assert_eq!(first.parse().unwrap(), Message::Eos { stream_id: 1 });
        assert_eq!(second.parse().unwrap(), Message::Reset { stream_id: 2 });
        assert!(framed.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (writer, reader) = duplex(64);
        drop(writer);
        let mut framed = MessageFramed::new(reader);
        assert!(framed.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let bytes = Message::Data {
            stream_id: 1,
            payload: vec![1, 2, 3, 4],
        }
        .encode();

        let (mut writer, reader) = duplex(64);
        writer.write_all(&bytes[..6]).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut framed = MessageFramed::new(reader);
        let err = framed.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn absurd_length_prefix_is_rejected_before_allocation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.push(11);

        let (mut writer, reader) = duplex(64);
        writer.write_all(&bytes).await.unwrap();

        let mut framed = MessageFramed::new(reader);
        let err = framed.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
