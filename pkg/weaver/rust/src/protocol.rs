// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Codec for the kernel's legacy framed protocol.
//!
//! Every frame is an 8-byte header (message type, payload length; both
//! little-endian u32) followed by exactly `length` payload bytes. There is no
//! checksum, version field or status flag: a kernel-side failure arrives as an
//! ordinary frame and only its text says so.

use std::fmt;
use std::io::ErrorKind;

use log::warn;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Error, Result};

pub const HEADER_LEN: usize = 8;

/// Upper bound on a declared payload length, checked before allocating.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MessageType {
    StartProcess = 1,
    StopProcess = 2,
    GetProcess = 3,
    ListProcesses = 4,
    HealthCheck = 5,
}

impl TryFrom<u32> for MessageType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::StartProcess),
            2 => Ok(Self::StopProcess),
            3 => Ok(Self::GetProcess),
            4 => Ok(Self::ListProcesses),
            5 => Ok(Self::HealthCheck),
            other => Err(Error::decode(format!("unknown message type {other}"))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartProcess => write!(f, "StartProcess"),
            Self::StopProcess => write!(f, "StopProcess"),
            Self::GetProcess => write!(f, "GetProcess"),
            Self::ListProcesses => write!(f, "ListProcesses"),
            Self::HealthCheck => write!(f, "HealthCheck"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProtocolMessage {
    pub message_type: MessageType,
    pub payload: String,
}

impl ProtocolMessage {
    pub fn new(message_type: MessageType, payload: impl Into<String>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// Header followed by the payload bytes, nothing else.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                Error::framing(format!(
                    "payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
                    self.payload.len()
                ))
            })?;

        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len());
        frame.extend_from_slice(&(self.message_type as u32).to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(self.payload.as_bytes());
        Ok(frame)
    }

    /// Decode one complete frame held in memory. Bytes beyond the declared
    /// payload are a framing error.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let Some((header, rest)) = frame.split_first_chunk::<HEADER_LEN>() else {
            return Err(Error::framing(format!(
                "short header: {} of {HEADER_LEN} bytes",
                frame.len()
            )));
        };
        let (raw_type, len) = parse_header(header);
        check_len(len)?;

        let len = len as usize;
        if rest.len() < len {
            return Err(Error::framing(format!(
                "short payload: {} of {len} bytes",
                rest.len()
            )));
        }
        if rest.len() > len {
            return Err(Error::framing(format!(
                "{} trailing bytes after payload",
                rest.len() - len
            )));
        }
        from_parts(raw_type, rest.to_vec())
    }
}

/// Read exactly one frame: the header, then the declared payload.
pub async fn read_message<R>(reader: &mut R) -> Result<ProtocolMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| read_error("header", e))?;
    let (raw_type, len) = parse_header(&header);
    check_len(len)?;

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| read_error("payload", e))?;
    }
    from_parts(raw_type, payload)
}

/// Write one frame and flush it.
pub async fn write_message<W>(writer: &mut W, message: &ProtocolMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::io(format!("writing {}", message.message_type), e))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::io(format!("flushing {}", message.message_type), e))
}

fn parse_header(header: &[u8; HEADER_LEN]) -> (u32, u32) {
    let [t0, t1, t2, t3, l0, l1, l2, l3] = *header;
    (
        u32::from_le_bytes([t0, t1, t2, t3]),
        u32::from_le_bytes([l0, l1, l2, l3]),
    )
}

fn check_len(len: u32) -> Result<()> {
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::framing(format!(
            "declared payload length {len} exceeds {MAX_PAYLOAD_LEN}"
        )));
    }
    Ok(())
}

fn from_parts(raw_type: u32, payload: Vec<u8>) -> Result<ProtocolMessage> {
    let message_type = MessageType::try_from(raw_type)?;
    let payload = String::from_utf8(payload)
        .map_err(|e| Error::decode(format!("{message_type} payload is not UTF-8: {e}")))?;
    Ok(ProtocolMessage {
        message_type,
        payload,
    })
}

fn read_error(part: &str, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::UnexpectedEof => Error::framing(format!("peer closed before full {part}")),
        _ => Error::io(format!("reading {part}"), e),
    }
}

/// Typed view of the space-delimited request payloads.
///
/// Fields are joined with single spaces and nothing is escaped, so a
/// `process_id` or `process_name` containing whitespace cannot be told apart
/// from the fields that follow it. Encoding keeps that behavior and only logs
/// it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum KernelRequest {
    StartProcess {
        process_id: String,
        process_name: String,
        /// Literal command line, never split or re-quoted.
        command: String,
    },
    StopProcess {
        process_id: String,
    },
    GetProcess {
        process_id: String,
    },
    ListProcesses,
    HealthCheck,
}

impl KernelRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::StartProcess { .. } => MessageType::StartProcess,
            Self::StopProcess { .. } => MessageType::StopProcess,
            Self::GetProcess { .. } => MessageType::GetProcess,
            Self::ListProcesses => MessageType::ListProcesses,
            Self::HealthCheck => MessageType::HealthCheck,
        }
    }

    pub fn to_message(&self) -> ProtocolMessage {
        let payload = match self {
            Self::StartProcess {
                process_id,
                process_name,
                command,
            } => {
                warn_ambiguous("process id", process_id);
                warn_ambiguous("process name", process_name);
                format!("{process_id} {process_name} {command}")
            }
            Self::StopProcess { process_id } | Self::GetProcess { process_id } => {
                warn_ambiguous("process id", process_id);
                process_id.clone()
            }
            Self::ListProcesses | Self::HealthCheck => String::new(),
        };
        ProtocolMessage::new(self.message_type(), payload)
    }

    pub fn from_message(message: &ProtocolMessage) -> Result<Self> {
        match message.message_type {
            MessageType::StartProcess => {
                let mut fields = message.payload.splitn(3, ' ');
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(id), Some(name), Some(command)) => Ok(Self::StartProcess {
                        process_id: id.to_string(),
                        process_name: name.to_string(),
                        command: command.to_string(),
                    }),
                    _ => Err(Error::decode(format!(
                        "StartProcess payload needs '<id> <name> <command>', got {:?}",
                        message.payload
                    ))),
                }
            }
            MessageType::StopProcess => Ok(Self::StopProcess {
                process_id: process_id(message)?,
            }),
            MessageType::GetProcess => Ok(Self::GetProcess {
                process_id: process_id(message)?,
            }),
            MessageType::ListProcesses => Ok(Self::ListProcesses),
            MessageType::HealthCheck => Ok(Self::HealthCheck),
        }
    }
}

fn process_id(message: &ProtocolMessage) -> Result<String> {
    let id = message.payload.trim();
    if id.is_empty() {
        return Err(Error::decode(format!(
            "{} payload is missing the process id",
            message.message_type
        )));
    }
    Ok(id.to_string())
}

fn warn_ambiguous(field: &str, value: &str) {
    if value.contains(char::is_whitespace) {
        warn!("{field} {value:?} contains whitespace; the kernel will split it");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    fn framing(result: Result<ProtocolMessage>) -> String {
        match result {
            Err(Error::Framing { context }) => context,
            other => panic!("expected framing error, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_layout() {
        let msg = ProtocolMessage::new(MessageType::StopProcess, "p1");
        assert_eq!(
            msg.encode().unwrap(),
            vec![2, 0, 0, 0, 2, 0, 0, 0, b'p', b'1']
        );
    }

    #[test]
    fn test_encode_empty_payload_is_header_only() {
        let bytes = KernelRequest::HealthCheck.to_message().encode().unwrap();
        assert_eq!(bytes, vec![5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_list_round_trip() {
        let msg = ProtocolMessage::new(MessageType::ListProcesses, "");
        let decoded = ProtocolMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_type, MessageType::ListProcesses);
        assert_eq!(decoded.payload, "");
    }

    #[test]
    fn test_frame_length_is_header_plus_payload() {
        let msg = ProtocolMessage::new(MessageType::StartProcess, "p1 svc-a python app.py");
        assert_eq!(msg.encode().unwrap().len(), HEADER_LEN + msg.payload.len());
    }

    #[test]
    fn test_multibyte_payload_length_counts_bytes() {
        let msg = ProtocolMessage::new(MessageType::GetProcess, "prozeß");
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(ProtocolMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_start_command_keeps_embedded_spaces() {
        let msg = ProtocolMessage::new(MessageType::StartProcess, "p1 svc-a python app.py --flag");
        let decoded = ProtocolMessage::decode(&msg.encode().unwrap()).unwrap();
        match KernelRequest::from_message(&decoded).unwrap() {
            KernelRequest::StartProcess {
                process_id,
                process_name,
                command,
            } => {
                assert_eq!(process_id, "p1");
                assert_eq!(process_name, "svc-a");
                assert_eq!(command, "python app.py --flag");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_start_payload_is_not_requoted() {
        let req = KernelRequest::StartProcess {
            process_id: "p1".into(),
            process_name: "svc".into(),
            command: "sh -c 'echo  hi'".into(),
        };
        assert_eq!(req.to_message().payload, "p1 svc sh -c 'echo  hi'");
        assert_eq!(KernelRequest::from_message(&req.to_message()).unwrap(), req);
    }

    #[test]
    fn test_whitespace_in_name_is_reproduced() {
        // The grammar cannot carry a space in the name; the command absorbs it.
        let req = KernelRequest::StartProcess {
            process_id: "p1".into(),
            process_name: "my svc".into(),
            command: "run".into(),
        };
        let parsed = KernelRequest::from_message(&req.to_message()).unwrap();
        assert_eq!(
            parsed,
            KernelRequest::StartProcess {
                process_id: "p1".into(),
                process_name: "my".into(),
                command: "svc run".into(),
            }
        );
    }

    #[test]
    fn test_start_payload_too_few_fields() {
        let msg = ProtocolMessage::new(MessageType::StartProcess, "p1 svc");
        assert!(matches!(
            KernelRequest::from_message(&msg),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn test_stop_and_get_payloads() {
        let stop = KernelRequest::StopProcess {
            process_id: "abc".into(),
        };
        assert_eq!(stop.to_message(), ProtocolMessage::new(MessageType::StopProcess, "abc"));

        let get = ProtocolMessage::new(MessageType::GetProcess, " abc\n");
        assert_eq!(
            KernelRequest::from_message(&get).unwrap(),
            KernelRequest::GetProcess {
                process_id: "abc".into()
            }
        );
        let empty = ProtocolMessage::new(MessageType::StopProcess, "");
        assert!(KernelRequest::from_message(&empty).is_err());
    }

    #[test]
    fn test_decode_short_header() {
        let context = framing(ProtocolMessage::decode(&[4, 0, 0]));
        assert!(context.contains("short header"), "{context}");
    }

    #[test]
    fn test_decode_short_payload() {
        let context = framing(ProtocolMessage::decode(&[3, 0, 0, 0, 5, 0, 0, 0, b'a']));
        assert!(context.contains("short payload"), "{context}");
    }

    #[test]
    fn test_decode_trailing_bytes() {
        framing(ProtocolMessage::decode(&[4, 0, 0, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn test_decode_oversized_length() {
        let mut frame = vec![1, 0, 0, 0];
        frame.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        framing(ProtocolMessage::decode(&frame));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let result = ProtocolMessage::decode(&[3, 0, 0, 0, 2, 0, 0, 0, 0xff, 0xfe]);
        assert!(matches!(result, Err(Error::Decode { .. })));
    }

    #[test]
    fn test_decode_unknown_type() {
        let result = ProtocolMessage::decode(&[9, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(result, Err(Error::Decode { .. })));
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let frame = ProtocolMessage::new(MessageType::HealthCheck, "OK: Kernel is healthy")
            .encode()
            .unwrap();
        let mut reader = frame.as_slice();
        let msg = read_message(&mut reader).await.unwrap();
        assert_eq!(msg.message_type, MessageType::HealthCheck);
        assert_eq!(msg.payload, "OK: Kernel is healthy");
        assert!(reader.is_empty(), "reader should stop at the frame boundary");
    }

    #[tokio::test]
    async fn test_read_message_truncated_header() {
        let mut reader: &[u8] = &[5, 0, 0, 0, 0];
        let context = framing(read_message(&mut reader).await);
        assert!(context.contains("header"), "{context}");
    }

    #[tokio::test]
    async fn test_read_message_empty_stream_is_framing_error() {
        let mut reader: &[u8] = &[];
        framing(read_message(&mut reader).await);
    }

    #[tokio::test]
    async fn test_read_message_truncated_payload() {
        let mut reader: &[u8] = &[4, 0, 0, 0, 10, 0, 0, 0, b'a', b'b'];
        let context = framing(read_message(&mut reader).await);
        assert!(context.contains("payload"), "{context}");
    }

    #[tokio::test]
    async fn test_write_then_read_two_frames() {
        let mut buf: Vec<u8> = Vec::new();
        let stop = ProtocolMessage::new(MessageType::StopProcess, "p1");
        let list = ProtocolMessage::new(MessageType::ListProcesses, "");
        write_message(&mut buf, &stop).await.unwrap();
        write_message(&mut buf, &list).await.unwrap();
        assert_eq!(buf.len(), HEADER_LEN * 2 + 2);

        let mut reader = buf.as_slice();
        assert_eq!(read_message(&mut reader).await.unwrap(), stop);
        assert_eq!(read_message(&mut reader).await.unwrap(), list);
    }

    /// Stream whose reads reset and whose writes hit a broken pipe.
    struct BrokenSocket;

    impl AsyncRead for BrokenSocket {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for BrokenSocket {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Err(ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_reset_while_reading_is_io_error() {
        match read_message(&mut BrokenSocket).await {
            Err(Error::Io { context, source }) => {
                assert_eq!(context, "reading header");
                assert_eq!(source.kind(), ErrorKind::ConnectionReset);
            }
            other => panic!("expected I/O error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_io_error() {
        let msg = ProtocolMessage::new(MessageType::HealthCheck, "");
        match write_message(&mut BrokenSocket, &msg).await {
            Err(Error::Io { context, source }) => {
                assert_eq!(context, "writing HealthCheck");
                assert_eq!(source.kind(), ErrorKind::BrokenPipe);
            }
            other => panic!("expected I/O error, got {other:?}"),
        }
    }
}
