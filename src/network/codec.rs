//! Wire codec for PeerLink
//!
//! Frames JSON messages over a byte stream. Peer connections use a 4-byte
//! big-endian length prefix; a newline-delimited variant exists for
//! line-oriented transports. A connection uses exactly one discipline for
//! its whole lifetime, and callers never observe a partial frame.

use bytes::{Buf, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{CodecError, CodecResult};

/// Maximum frame payload size (1 MiB)
const MAX_FRAME_SIZE_BYTES: usize = 1024 * 1024;

/// Length prefix size (4 bytes for u32)
const LENGTH_PREFIX_SIZE: usize = 4;

/// Initial read buffer capacity
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

const NEWLINE: u8 = b'\n';

/// Default maximum frame size
pub const MAX_FRAME_SIZE: usize = MAX_FRAME_SIZE_BYTES;

/// Framing discipline for a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// 4-byte big-endian length header followed by the payload
    #[default]
    LengthPrefixed,
    /// Payload terminated by a single `\n`
    Newline,
}

/// Stateless frame encoder/decoder
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Framing::LengthPrefixed)
    }
}

impl FrameCodec {
    /// Creates a codec with the default maximum frame size
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Sets the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Returns the framing discipline
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Returns the maximum frame size
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encodes a payload into a single frame
    pub fn encode(&self, payload: &[u8]) -> CodecResult<Vec<u8>> {
        self.check_size(payload.len())?;

        match self.framing {
            Framing::LengthPrefixed => {
                let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                frame.extend_from_slice(payload);
                Ok(frame)
            }
            Framing::Newline => {
                if payload.contains(&NEWLINE) {
                    return Err(CodecError::Serialization(
                        "payload contains the newline delimiter".to_string(),
                    ));
                }
                let mut frame = Vec::with_capacity(payload.len() + 1);
                frame.extend_from_slice(payload);
                frame.push(NEWLINE);
                Ok(frame)
            }
        }
    }

    /// Extracts one complete frame from the front of `buffer`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from the buffer only when a whole frame is available.
    pub fn decode(&self, buffer: &mut BytesMut) -> CodecResult<Option<Bytes>> {
        match self.framing {
            Framing::LengthPrefixed => {
                if buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
                len_bytes.copy_from_slice(&buffer[..LENGTH_PREFIX_SIZE]);
                let len = u32::from_be_bytes(len_bytes) as usize;
                self.check_size(len)?;

                if buffer.len() < LENGTH_PREFIX_SIZE + len {
                    buffer.reserve(LENGTH_PREFIX_SIZE + len - buffer.len());
                    return Ok(None);
                }
                buffer.advance(LENGTH_PREFIX_SIZE);
                Ok(Some(buffer.split_to(len).freeze()))
            }
            Framing::Newline => match buffer.iter().position(|b| *b == NEWLINE) {
                Some(pos) => {
                    self.check_size(pos)?;
                    let frame = buffer.split_to(pos).freeze();
                    buffer.advance(1);
                    Ok(Some(frame))
                }
                None => {
                    self.check_size(buffer.len())?;
                    Ok(None)
                }
            },
        }
    }

    /// Number of bytes a complete frame needs given what is buffered
    fn expected_len(&self, buffer: &BytesMut) -> usize {
        match self.framing {
            Framing::LengthPrefixed if buffer.len() >= LENGTH_PREFIX_SIZE => {
                let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
                len_bytes.copy_from_slice(&buffer[..LENGTH_PREFIX_SIZE]);
                LENGTH_PREFIX_SIZE + u32::from_be_bytes(len_bytes) as usize
            }
            Framing::LengthPrefixed => LENGTH_PREFIX_SIZE,
            Framing::Newline => buffer.len() + 1,
        }
    }

    fn check_size(&self, size: usize) -> CodecResult<()> {
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

/// Encodes a payload with the default length-prefixed codec
pub fn encode_frame(payload: &[u8]) -> CodecResult<Vec<u8>> {
    FrameCodec::default().encode(payload)
}

/// Serializes a message to JSON bytes
pub fn to_json<T: Serialize>(msg: &T) -> CodecResult<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Reads whole frames from an async byte stream
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a new frame reader
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            codec,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Reads the next complete frame
    ///
    /// Fails with `Closed` on a clean end of stream between frames and with
    /// `Truncated` when the stream ends inside a frame.
    pub async fn read_frame(&mut self) -> CodecResult<Bytes> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                trace!("Read frame: {} bytes", frame.len());
                return Ok(frame);
            }

            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Err(CodecError::Closed);
                }
                return Err(CodecError::Truncated {
                    expected: self.codec.expected_len(&self.buffer),
                    received: self.buffer.len(),
                });
            }
        }
    }

    /// Reads and deserializes the next JSON frame
    pub async fn recv<T: DeserializeOwned>(&mut self) -> CodecResult<T> {
        let frame = self.read_frame().await?;
        serde_json::from_slice(&frame).map_err(|e| CodecError::Deserialization(e.to_string()))
    }

    /// Returns the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes whole frames to an async byte stream
pub struct FrameWriter<W> {
    inner: W,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a new frame writer
    pub fn new(inner: W, codec: FrameCodec) -> Self {
        Self { inner, codec }
    }

    /// Writes one frame and flushes it
    ///
    /// The frame is assembled in memory first so a single `write_all`
    /// carries header and payload together.
    pub async fn write_frame(&mut self, payload: &[u8]) -> CodecResult<usize> {
        let frame = self.codec.encode(payload)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        trace!("Wrote frame: {} bytes", payload.len());
        Ok(frame.len())
    }

    /// Serializes a message to JSON and writes it as one frame
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> CodecResult<usize> {
        let payload = to_json(msg)?;
        self.write_frame(&payload).await
    }

    /// Shuts down the write side of the stream
    pub async fn shutdown(&mut self) -> CodecResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[test]
    fn test_length_prefixed_round_trip() {
        let codec = FrameCodec::default();
        for payload in [&b""[..], &b"x"[..], &b"{\"type\":\"heartbeat\"}"[..]] {
            let frame = codec.encode(payload).unwrap();
            assert_eq!(&frame[..4], &(payload.len() as u32).to_be_bytes());

            let mut buffer = BytesMut::from(&frame[..]);
            let decoded = codec.decode(&mut buffer).unwrap().unwrap();
            assert_eq!(&decoded[..], payload);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_max_size_frame_accepted() {
        let codec = FrameCodec::default().with_max_frame_size(2048);
        let payload = vec![7u8; 2048];
        let mut buffer = BytesMut::from(&codec.encode(&payload).unwrap()[..]);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().len(), 2048);
    }

    #[test]
    fn test_oversize_rejected_on_encode() {
        let codec = FrameCodec::default().with_max_frame_size(16);
        let result = codec.encode(&[0u8; 17]);
        assert!(matches!(
            result,
            Err(CodecError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_oversize_rejected_on_decode() {
        let codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        buffer.extend_from_slice(b"partial");
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let codec = FrameCodec::default();
        let frame = codec.encode(b"hello world").unwrap();

        let mut buffer = BytesMut::from(&frame[..6]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 6);

        buffer.extend_from_slice(&frame[6..]);
        assert_eq!(&codec.decode(&mut buffer).unwrap().unwrap()[..], b"hello world");
    }

    #[test]
    fn test_newline_framing() {
        let codec = FrameCodec::new(Framing::Newline);
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&codec.encode(b"{\"a\":1}").unwrap());
        buffer.extend_from_slice(&codec.encode(b"{\"b\":2}").unwrap());

        assert_eq!(&codec.decode(&mut buffer).unwrap().unwrap()[..], b"{\"a\":1}");
        assert_eq!(&codec.decode(&mut buffer).unwrap().unwrap()[..], b"{\"b\":2}");
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        assert!(codec.encode(b"two\nlines").is_err());
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client, FrameCodec::default());
        let mut reader = FrameReader::new(server, FrameCodec::default());

        let sent = Ping {
            seq: 1,
            note: "a message larger than the duplex buffer ".repeat(4),
        };
        let send_task = tokio::spawn(async move {
            writer.send(&sent).await.unwrap();
            writer.send(&Ping { seq: 2, note: String::new() }).await.unwrap();
        });

        let first: Ping = reader.recv().await.unwrap();
        let second: Ping = reader.recv().await.unwrap();
        send_task.await.unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second, Ping { seq: 2, note: String::new() });
        assert!(matches!(reader.read_frame().await, Err(CodecError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let frame = encode_frame(b"0123456789").unwrap();
        client.write_all(&frame[..8]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, FrameCodec::default());
        match reader.read_frame().await {
            Err(CodecError::Truncated { expected, received }) => {
                assert_eq!(expected, 14);
                assert_eq!(received, 8);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_reassembles_split_reads() {
        let frame = encode_frame(br#"{"type":"heartbeat"}"#).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..5])
            .read(&frame[5..])
            .build();

        let mut reader = FrameReader::new(mock, FrameCodec::default());
        let payload = reader.read_frame().await.unwrap();
        assert_eq!(&payload[..], br#"{"type":"heartbeat"}"#);
        assert!(matches!(reader.read_frame().await, Err(CodecError::Closed)));
    }

    #[tokio::test]
    async fn test_writer_emits_header_and_payload_together() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode_frame(b"ping").unwrap())
            .build();

        let mut writer = FrameWriter::new(mock, FrameCodec::default());
        assert_eq!(writer.write_frame(b"ping").await.unwrap(), 8);
    }
}
