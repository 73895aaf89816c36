// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for TCP stream framing.
//!
//! Every message on every link of the fabric has the same shape:
//! - 4 bytes: payload length (big-endian, unsigned)
//! - N bytes: UTF-8 JSON document
//!
//! There is no message type in the header; the JSON document itself carries
//! whatever discriminator the link needs (`request`, `function`, `type`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (2 GB - 1), the largest length a peer may announce.
pub const MAX_FRAME_SIZE: usize = i32::MAX as usize;

/// Frame header size (4 bytes length)
pub const HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed JSON document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from any serializable value
    pub fn new<T: Serialize + ?Sized>(msg: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload into a typed message
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the payload as an untyped JSON value
    pub fn to_value(&self) -> Result<Value, FrameError> {
        self.decode()
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Truncated {
                expected: length,
                received: bytes.len(),
            });
        }

        Ok(Self {
            payload: bytes.split_to(length),
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader.
///
/// The payload buffer grows with the bytes actually received, so a bogus
/// length announced by a peer does not allocate up front.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = Vec::with_capacity(length.min(64 * 1024));
    let received = (&mut *reader)
        .take(length as u64)
        .read_to_end(&mut payload)
        .await?;
    if received < length {
        return Err(FrameError::Truncated {
            expected: length,
            received,
        });
    }

    Ok(Frame {
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read the next frame and decode it as a JSON value
    pub async fn read_value(&mut self) -> Result<Value, FrameError> {
        self.read_frame().await?.to_value()
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Encode a value and write it as one frame
    pub async fn write_value<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), FrameError> {
        let frame = Frame::new(msg)?;
        self.write_frame(&frame).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Send a request and wait for a response
    pub async fn request<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, FrameError> {
        self.write_value(request).await?;
        self.read_frame().await?.decode()
    }

    /// Send a response
    pub async fn respond<Resp: Serialize + ?Sized>(
        &mut self,
        response: &Resp,
    ) -> Result<(), FrameError> {
        self.write_value(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========== Constants Tests ==========

    #[test]
    fn test_max_frame_size_constant() {
        // Largest value a signed 32-bit length can carry
        assert_eq!(MAX_FRAME_SIZE, 2_147_483_647);
    }

    #[test]
    fn test_header_size_constant() {
        assert_eq!(HEADER_SIZE, 4);
    }

    // ========== FrameError Tests ==========

    #[test]
    fn test_frame_error_display_frame_too_large() {
        let err = FrameError::FrameTooLarge(3_000_000_000);
        let msg = format!("{}", err);
        assert!(msg.contains("frame too large"));
        assert!(msg.contains("3000000000"));
        assert!(msg.contains(&MAX_FRAME_SIZE.to_string()));
    }

    #[test]
    fn test_frame_error_display_truncated() {
        let err = FrameError::Truncated {
            expected: 10,
            received: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expected 10"));
        assert!(msg.contains("received 3"));
    }

    #[test]
    fn test_frame_error_display_connection_closed() {
        let err = FrameError::ConnectionClosed;
        assert!(format!("{}", err).contains("connection closed"));
    }

    #[test]
    fn test_frame_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let frame_err: FrameError = io_err.into();
        match frame_err {
            FrameError::Io(_) => {}
            _ => panic!("Expected FrameError::Io"),
        }
    }

    // ========== Frame Tests ==========

    #[test]
    fn test_frame_new_serializes_json() {
        let frame = Frame::new(&json!({"function": "add_version", "work_env_id": 42})).unwrap();
        let value: Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(value["function"], "add_version");
        assert_eq!(value["work_env_id"], 42);
    }

    #[test]
    fn test_frame_encode_structure() {
        let frame = Frame::new(&json!([1, "two"])).unwrap();
        let encoded = frame.encode();

        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(length, frame.payload.len());
        assert_eq!(&encoded[HEADER_SIZE..], b"[1,\"two\"]");
        assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
    }

    #[test]
    fn test_frame_null_payload() {
        let frame = Frame::new(&Value::Null).unwrap();
        assert_eq!(&frame.payload[..], b"null");
        assert_eq!(frame.to_value().unwrap(), Value::Null);
    }

    #[test]
    fn test_frame_unicode_payload() {
        let frame = Frame::new(&json!({"comment": "rétro éclairage ✓ @léa"})).unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();
        assert_eq!(
            decoded.to_value().unwrap()["comment"],
            "rétro éclairage ✓ @léa"
        );
    }

    #[test]
    fn test_frame_decode_typed() {
        #[derive(serde::Deserialize)]
        struct Probe {
            level: String,
            fetch: u8,
        }
        let frame = Frame::new(&json!({"level": "project", "fetch": 2})).unwrap();
        let probe: Probe = frame.decode().unwrap();
        assert_eq!(probe.level, "project");
        assert_eq!(probe.fetch, 2);
    }

    #[test]
    fn test_frame_decode_malformed_json() {
        let frame = Frame {
            payload: Bytes::from_static(b"{\"broken\": "),
        };
        assert!(matches!(frame.to_value(), Err(FrameError::Json(_))));
    }

    // ========== decode_from_bytes Tests ==========

    #[test]
    fn test_decode_from_bytes_incomplete_header() {
        let bytes = Bytes::from_static(&[0, 0, 0]);
        match Frame::decode_from_bytes(bytes).unwrap_err() {
            FrameError::Io(e) => assert!(e.to_string().contains("incomplete frame header")),
            _ => panic!("Expected Io error with incomplete header message"),
        }
    }

    #[test]
    fn test_decode_from_bytes_incomplete_payload() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(100);
        bytes.put(&[b' '; 10][..]);

        match Frame::decode_from_bytes(bytes.freeze()).unwrap_err() {
            FrameError::Truncated { expected, received } => {
                assert_eq!(expected, 100);
                assert_eq!(received, 10);
            }
            _ => panic!("Expected Truncated error"),
        }
    }

    #[test]
    fn test_decode_from_bytes_frame_too_large() {
        let mut bytes = BytesMut::new();
        bytes.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match Frame::decode_from_bytes(bytes.freeze()).unwrap_err() {
            FrameError::FrameTooLarge(size) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            _ => panic!("Expected FrameTooLarge error"),
        }
    }

    #[test]
    fn test_decode_from_bytes_with_extra_data() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(4);
        bytes.put(&b"true"[..]);
        bytes.put(&[99, 99, 99][..]);

        let frame = Frame::decode_from_bytes(bytes.freeze()).unwrap();
        assert_eq!(frame.to_value().unwrap(), Value::Bool(true));
    }

    // ========== Async read/write frame tests ==========

    #[tokio::test]
    async fn test_read_write_frame() {
        use tokio::io::duplex;

        let frame = Frame::new(&json!({"type": "test_conn"})).unwrap();
        let (mut writer, mut reader) = duplex(1024);

        write_frame(&mut writer, &frame).await.unwrap();
        let read_back = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame, read_back);
    }

    #[tokio::test]
    async fn test_read_frame_connection_closed() {
        use tokio::io::duplex;

        let (_, mut reader) = duplex(1024);
        match read_frame(&mut reader).await.unwrap_err() {
            FrameError::ConnectionClosed => {}
            e => panic!("Expected ConnectionClosed, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_read_frame_peer_closes_mid_payload() {
        use tokio::io::duplex;

        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(&[0, 0, 0, 20]).await.unwrap();
        writer.write_all(b"{\"half\":").await.unwrap();
        drop(writer);

        match read_frame(&mut reader).await.unwrap_err() {
            FrameError::Truncated { expected, received } => {
                assert_eq!(expected, 20);
                assert_eq!(received, 8);
            }
            e => panic!("Expected Truncated, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_header() {
        use tokio::io::duplex;

        let (mut writer, mut reader) = duplex(1024);
        writer.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        match read_frame(&mut reader).await.unwrap_err() {
            FrameError::FrameTooLarge(size) => assert_eq!(size, u32::MAX as usize),
            e => panic!("Expected FrameTooLarge, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_write_read_multiple_frames() {
        use tokio::io::duplex;

        let (client, server) = duplex(4096);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        for i in 0..5 {
            client.write_value(&json!({"seq": i})).await.unwrap();
        }
        for i in 0..5 {
            let value = server.read_value().await.unwrap();
            assert_eq!(value["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_framed_stream_request_respond() {
        use tokio::io::duplex;

        let (client, server) = duplex(4096);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        let responder = tokio::spawn(async move {
            let request = server.read_value().await.unwrap();
            server
                .respond(&json!({"echo": request["function"]}))
                .await
                .unwrap();
        });

        let response: Value = client
            .request(&json!({"function": "get_frame_rate"}))
            .await
            .unwrap();
        assert_eq!(response["echo"], "get_frame_rate");
        responder.await.unwrap();
    }
}
