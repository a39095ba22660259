//! Local IPC fabric between the supervisor and its workers.
//!
//! Wire format: a 4-byte little-endian length prefix followed by the
//! payload bytes. Both ends refuse frames larger than
//! [`MAX_MESSAGE_SIZE`], and the length is validated before any
//! allocation. Payloads are serde-tagged JSON ([`IpcMessage`]).
//!
//! The carrier is a Unix domain socket; endpoint names are sanitised to
//! `[A-Za-z0-9_-]+` before they become filesystem paths.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::defence::BehaviourSignal;

/// Hard limit on a single IPC message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Fallback endpoint name when sanitisation leaves nothing.
pub const DEFAULT_ENDPOINT_NAME: &str = "aegis_agent_ipc";

/// IPC protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    /// Declared or submitted frame exceeds [`MAX_MESSAGE_SIZE`].
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Offending size.
        size: usize,
        /// The enforced limit.
        max: usize,
    },

    /// The stream ended mid-frame.
    #[error("truncated frame")]
    Truncated,

    /// Payload was not a valid message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Underlying stream failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Messages exchanged between the supervisor and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcMessage {
    /// A worker announcing itself after connecting.
    Hello {
        /// Worker name.
        worker: String,
        /// Worker process id.
        pid: u32,
    },
    /// Periodic worker liveness/status line.
    Status {
        /// Worker name.
        worker: String,
        /// Free-form status detail.
        detail: String,
    },
    /// A behaviour signal from the sensor boundary, routed to the
    /// defence engine.
    Signal(BehaviourSignal),
    /// Supervisor asks workers to re-read configuration.
    Reload,
    /// Supervisor asks workers to stop.
    Shutdown,
}

/// Sanitise an endpoint name to `[A-Za-z0-9_-]+`; anything else becomes
/// `_`, and an empty result falls back to [`DEFAULT_ENDPOINT_NAME`].
#[must_use]
pub fn sanitise_name(name: &str) -> String {
    let sanitised: String = name
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || character == '_' || character == '-' {
                character
            } else {
                '_'
            }
        })
        .collect();
    if sanitised.is_empty() {
        DEFAULT_ENDPOINT_NAME.to_string()
    } else {
        sanitised
    }
}

/// Build the socket path for an endpoint name under a runtime directory.
#[must_use]
pub fn endpoint_path(runtime_dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    runtime_dir.join(format!("{}.sock", sanitise_name(name)))
}

/// Length-prefixed frame codec for [`tokio_util::codec::Framed`] streams.
///
/// The prefix is little-endian; frame length is validated before any
/// allocation so an oversized prefix cannot exhaust memory. Empty frames
/// are valid.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Create a codec enforcing [`MAX_MESSAGE_SIZE`].
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, IpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(IpcError::FrameTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), IpcError> {
        if item.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::FrameTooLarge {
                size: item.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // validated against MAX_MESSAGE_SIZE
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Read one length-prefixed message from a stream.
///
/// Returns `Ok(None)` on clean end-of-stream at a frame boundary.
///
/// # Errors
///
/// [`IpcError::FrameTooLarge`] for oversized declarations,
/// [`IpcError::Truncated`] when the stream ends mid-frame, and I/O
/// errors from the carrier.
pub async fn read_message<S>(stream: &mut S) -> Result<Option<Vec<u8>>, IpcError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {},
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }

    let length = u32::from_le_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(IpcError::FrameTooLarge {
            size: length,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; length];
    match stream.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(IpcError::Truncated)
        },
        Err(error) => Err(error.into()),
    }
}

/// Write one length-prefixed message to a stream.
///
/// # Errors
///
/// [`IpcError::FrameTooLarge`] for oversized payloads and I/O errors
/// from the carrier.
pub async fn write_message<S>(stream: &mut S, payload: &[u8]) -> Result<(), IpcError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::FrameTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    #[allow(clippy::cast_possible_truncation)] // validated above
    let header = (payload.len() as u32).to_le_bytes();
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Serialize and send a typed message.
///
/// # Errors
///
/// See [`write_message`]; serialisation failures surface as
/// [`IpcError::Malformed`].
pub async fn write_typed<S>(stream: &mut S, message: &IpcMessage) -> Result<(), IpcError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)
        .map_err(|error| IpcError::Malformed(error.to_string()))?;
    write_message(stream, &payload).await
}

/// Receive and deserialize a typed message. `Ok(None)` on clean
/// end-of-stream.
///
/// # Errors
///
/// See [`read_message`]; undecodable payloads surface as
/// [`IpcError::Malformed`].
pub async fn read_typed<S>(stream: &mut S) -> Result<Option<IpcMessage>, IpcError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let Some(payload) = read_message(stream).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|error| IpcError::Malformed(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitise_name() {
        assert_eq!(sanitise_name("agent-core_1"), "agent-core_1");
        assert_eq!(sanitise_name("agent core/1"), "agent_core_1");
        assert_eq!(sanitise_name("../../etc"), "______etc");
        assert_eq!(sanitise_name(""), DEFAULT_ENDPOINT_NAME);
    }

    #[test]
    fn test_endpoint_path_uses_sanitised_name() {
        let path = endpoint_path(std::path::Path::new("/run/aegis"), "core pipe");
        assert_eq!(path, std::path::PathBuf::from("/run/aegis/core_pipe.sock"));
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = FrameCodec::new();
        let payload = Bytes::from_static(b"hello workers");

        let mut buffer = BytesMut::new();
        codec.encode(payload.clone(), &mut buffer).unwrap();

        assert_eq!(buffer.len(), HEADER_LEN + payload.len());
        // Little-endian 13.
        assert_eq!(&buffer[..4], &[13, 0, 0, 0]);

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_codec_partial_frames() {
        let mut codec = FrameCodec::new();

        let mut buffer = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        let mut buffer = BytesMut::from(&[5u8, 0, 0, 0, 1, 2][..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_codec_rejects_oversized_declaration() {
        let mut codec = FrameCodec::new();
        let oversized = (MAX_MESSAGE_SIZE as u32) + 1;
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(oversized);

        let result = codec.decode(&mut buffer);
        assert!(matches!(result, Err(IpcError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_codec_rejects_oversized_payload() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        let result = codec.encode(Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]), &mut buffer);
        assert!(matches!(result, Err(IpcError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_codec_empty_frame() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();
        codec.encode(Bytes::new(), &mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0, 0, 0, 0]);
        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_typed(
            &mut client,
            &IpcMessage::Hello {
                worker: "heartbeat".to_string(),
                pid: 4242,
            },
        )
        .await
        .unwrap();

        let message = read_typed(&mut server).await.unwrap().unwrap();
        match message {
            IpcMessage::Hello { worker, pid } => {
                assert_eq!(worker, "heartbeat");
                assert_eq!(pid, 4242);
            },
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_clean_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Declare 10 bytes but deliver 3, then hang up.
        client.write_all(&[10, 0, 0, 0, 1, 2, 3]).await.unwrap();
        drop(client);

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(IpcError::Truncated)));
    }

    #[tokio::test]
    async fn test_stream_oversized_declaration_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let declared = (MAX_MESSAGE_SIZE as u32) + 7;
        client.write_all(&declared.to_le_bytes()).await.unwrap();

        let result = read_message(&mut server).await;
        assert!(matches!(result, Err(IpcError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_message_wire_tags() {
        let encoded = serde_json::to_string(&IpcMessage::Reload).unwrap();
        assert_eq!(encoded, r#"{"type":"reload"}"#);
    }
}
