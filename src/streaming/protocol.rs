//! DCap mover protocol frames used for pool-to-pool transfers.
//!
//! The destination pool drives the conversation: it sends requests and the
//! source mover answers with acknowledgements and a chain of data blocks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::types::SessionId;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Preamble: session:u32 | challenge_len:i32 | challenge
/// Frame format: following:u32 | type:u32 | payload
/// Data block: len:i32 | bytes (negative len ends the chain)

/// Largest control frame we accept (data blocks are not framed)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Largest challenge a source may send before the first request
pub const MAX_CHALLENGE_SIZE: i32 = 64 * 1024;

/// type + mode + return code
pub const ACK_MIN_LEN: u32 = 12;

/// Ack plus file size and position
pub const LOCATE_ACK_MIN_LEN: u32 = 28;

pub const DATA_HEADER_MIN_LEN: u32 = 4;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Write = 1,
    Read = 2,
    Seek = 3,
    Close = 4,
    Interrupt = 5,
    Ack = 6,
    Fin = 7,
    Data = 8,
    Locate = 9,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Write),
            2 => Some(Self::Read),
            3 => Some(Self::Seek),
            4 => Some(Self::Close),
            5 => Some(Self::Interrupt),
            6 => Some(Self::Ack),
            7 => Some(Self::Fin),
            8 => Some(Self::Data),
            9 => Some(Self::Locate),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::Seek => "SEEK",
            Self::Close => "CLOSE",
            Self::Interrupt => "INTERRUPT",
            Self::Ack => "ACK",
            Self::Fin => "FIN",
            Self::Data => "DATA",
            Self::Locate => "LOCATE",
        }
    }
}

// =============================================================================
// Strings
// =============================================================================

fn put_utf(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn get_utf(payload: &mut Bytes) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(ProtocolError::Malformed("error message length truncated".into()).into());
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(ProtocolError::Malformed(format!(
            "error message truncated: expected {} bytes, got {}",
            len,
            payload.remaining()
        ))
        .into());
    }
    Ok(String::from_utf8_lossy(&payload.copy_to_bytes(len)).into_owned())
}

// =============================================================================
// Preamble
// =============================================================================

/// Session id and (empty) challenge sent by the source right after connecting.
pub fn encode_preamble(session: SessionId, challenge: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + challenge.len());
    buf.put_u32(session.0);
    buf.put_i32(challenge.len() as i32);
    buf.put_slice(challenge);
    buf.freeze()
}

pub async fn read_session_id<R: AsyncRead + Unpin>(r: &mut R) -> Result<SessionId> {
    Ok(SessionId(r.read_u32().await?))
}

/// Drain the legacy challenge field.
pub async fn skip_challenge<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    let len = r.read_i32().await?;
    if !(0..=MAX_CHALLENGE_SIZE).contains(&len) {
        return Err(ProtocolError::Malformed(format!("invalid challenge size {len}")).into());
    }
    let mut challenge = vec![0u8; len as usize];
    r.read_exact(&mut challenge).await?;
    Ok(())
}

// =============================================================================
// Requests (destination -> source)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Locate,
    Read { length: u64 },
    Close,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Locate => MessageType::Locate,
            Request::Read { .. } => MessageType::Read,
            Request::Close => MessageType::Close,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Request::Read { length } => {
                buf.put_u32(12);
                buf.put_u32(MessageType::Read as u32);
                buf.put_u64(*length);
            }
            Request::Locate | Request::Close => {
                buf.put_u32(4);
                buf.put_u32(self.message_type() as u32);
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let mut payload = frame.payload;
        match MessageType::from_u32(frame.msg_type) {
            Some(MessageType::Locate) => Ok(Request::Locate),
            Some(MessageType::Close) => Ok(Request::Close),
            Some(MessageType::Read) => {
                if payload.remaining() < 8 {
                    return Err(ProtocolError::Malformed("READ length truncated".into()).into());
                }
                Ok(Request::Read {
                    length: payload.get_u64(),
                })
            }
            _ => Err(ProtocolError::UnexpectedType {
                expected: "request",
                actual: frame.msg_type,
            }
            .into()),
        }
    }
}

// =============================================================================
// Acknowledgements (source -> destination)
// =============================================================================

/// Generic ACK or FIN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub kind: MessageType,
    pub mode: u32,
    pub return_code: i32,
    pub message: Option<String>,
    /// Type specific trailer (e.g. LOCATE size and position)
    pub body: Bytes,
}

impl Ack {
    pub fn ok(kind: MessageType, mode: MessageType) -> Self {
        Self {
            kind,
            mode: mode as u32,
            return_code: 0,
            message: None,
            body: Bytes::new(),
        }
    }

    pub fn error(kind: MessageType, mode: MessageType, code: i32, message: &str) -> Self {
        Self {
            kind,
            mode: mode as u32,
            return_code: code,
            message: Some(message.to_string()),
            body: Bytes::new(),
        }
    }

    pub fn located(size: u64, position: u64) -> Self {
        let mut body = BytesMut::with_capacity(16);
        body.put_u64(size);
        body.put_u64(position);
        Self {
            body: body.freeze(),
            ..Self::ok(MessageType::Ack, MessageType::Locate)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == 0
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(8 + self.body.len());
        payload.put_u32(self.mode);
        payload.put_i32(self.return_code);
        if let Some(message) = &self.message {
            put_utf(&mut payload, message);
        }
        payload.put_slice(&self.body);

        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u32(4 + payload.len() as u32);
        buf.put_u32(self.kind as u32);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Decode the payload of an ACK/FIN frame (after the type field).
    pub fn decode(kind: MessageType, mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            return Err(ProtocolError::Malformed("ack payload too short".into()).into());
        }
        let mode = payload.get_u32();
        let return_code = payload.get_i32();
        let message = if return_code != 0 {
            Some(get_utf(&mut payload)?)
        } else {
            None
        };
        Ok(Self {
            kind,
            mode,
            return_code,
            message,
            body: payload,
        })
    }
}

/// Trailer of a successful LOCATE acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateReply {
    pub size: u64,
    /// Current file position, unused by pool-to-pool transfers
    pub position: u64,
}

impl LocateReply {
    pub fn decode(ack: &Ack) -> Result<Self> {
        let mut body = ack.body.clone();
        if body.remaining() < 16 {
            return Err(ProtocolError::Malformed("LOCATE reply truncated".into()).into());
        }
        Ok(Self {
            size: body.get_u64(),
            position: body.get_u64(),
        })
    }
}

// =============================================================================
// Data chain
// =============================================================================

pub fn encode_data_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(4);
    buf.put_u32(MessageType::Data as u32);
    buf.freeze()
}

pub fn encode_data_block(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
    buf.freeze()
}

pub fn encode_data_trailer() -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32(-1);
    buf.freeze()
}

// =============================================================================
// Frame I/O
// =============================================================================

/// A raw control frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Bytes following the length field, type included
    pub following: u32,
    pub msg_type: u32,
    pub payload: Bytes,
}

/// Read a single control frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let following = r.read_u32().await?;

    // Validate frame size before allocation
    if following > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(following).into());
    }
    if following < 4 {
        return Err(ProtocolError::FrameTooSmall { following, min: 4 }.into());
    }

    let msg_type = r.read_u32().await?;
    let mut payload = vec![0u8; following as usize - 4];
    r.read_exact(&mut payload).await?;

    Ok(Frame {
        following,
        msg_type,
        payload: Bytes::from(payload),
    })
}

/// Read an ACK/FIN for `mode`, rejecting anything else.
///
/// A non-zero return code is reported as a remote failure carrying the
/// mover's message.
pub async fn read_ack<R: AsyncRead + Unpin>(
    r: &mut R,
    kind: MessageType,
    mode: MessageType,
    min_len: u32,
) -> Result<Ack> {
    let frame = read_frame(r).await?;
    if frame.following < ACK_MIN_LEN {
        return Err(ProtocolError::FrameTooSmall {
            following: frame.following,
            min: ACK_MIN_LEN,
        }
        .into());
    }
    if frame.msg_type != kind as u32 {
        return Err(ProtocolError::UnexpectedType {
            expected: kind.name(),
            actual: frame.msg_type,
        }
        .into());
    }

    let ack = Ack::decode(kind, frame.payload)?;
    if ack.mode != mode as u32 {
        return Err(ProtocolError::UnexpectedMode {
            expected: mode.name(),
            actual: ack.mode,
        }
        .into());
    }
    if !ack.is_ok() {
        return Err(ProtocolError::Remote {
            request: mode.name(),
            code: ack.return_code,
            message: ack.message.unwrap_or_default(),
        }
        .into());
    }
    if frame.following < min_len {
        return Err(ProtocolError::FrameTooSmall {
            following: frame.following,
            min: min_len,
        }
        .into());
    }
    Ok(ack)
}

/// Read the frame announcing the start of the data chain.
pub async fn read_data_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    let frame = read_frame(r).await?;
    if frame.following < DATA_HEADER_MIN_LEN {
        return Err(ProtocolError::FrameTooSmall {
            following: frame.following,
            min: DATA_HEADER_MIN_LEN,
        }
        .into());
    }
    if frame.msg_type != MessageType::Data as u32 {
        return Err(ProtocolError::UnexpectedType {
            expected: MessageType::Data.name(),
            actual: frame.msg_type,
        }
        .into());
    }
    Ok(())
}

pub async fn write_request<W: AsyncWrite + Unpin>(w: &mut W, request: Request) -> Result<()> {
    w.write_all(&request.encode()).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use proptest::prelude::*;

    async fn ack_from(bytes: Bytes, kind: MessageType, mode: MessageType, min: u32) -> Result<Ack> {
        let mut reader: &[u8] = &bytes;
        read_ack(&mut reader, kind, mode, min).await
    }

    #[test]
    fn test_request_wire_layout() {
        assert_eq!(&Request::Locate.encode()[..], &[0, 0, 0, 4, 0, 0, 0, 9]);
        assert_eq!(&Request::Close.encode()[..], &[0, 0, 0, 4, 0, 0, 0, 4]);

        let read = Request::Read { length: 0x0102 }.encode();
        assert_eq!(read.len(), 16);
        assert_eq!(&read[..8], &[0, 0, 0, 12, 0, 0, 0, 2]);
        assert_eq!(&read[8..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_request_decode() {
        let bytes = Request::Read { length: 4096 }.encode();
        let mut reader: &[u8] = &bytes;
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(
            Request::decode(frame).unwrap(),
            Request::Read { length: 4096 }
        );
    }

    #[tokio::test]
    async fn test_locate_ack() {
        let bytes = Ack::located(1 << 40, 0).encode();
        // following = type + mode + rc + size + position
        assert_eq!(&bytes[..4], &28u32.to_be_bytes());

        let ack = ack_from(bytes, MessageType::Ack, MessageType::Locate, LOCATE_ACK_MIN_LEN)
            .await
            .unwrap();
        assert_eq!(LocateReply::decode(&ack).unwrap().size, 1 << 40);
    }

    #[tokio::test]
    async fn test_short_locate_ack_rejected() {
        let bytes = Ack::ok(MessageType::Ack, MessageType::Locate).encode();
        let err = ack_from(bytes, MessageType::Ack, MessageType::Locate, LOCATE_ACK_MIN_LEN)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::FrameTooSmall { following: 12, min: 28 })
        ));
    }

    #[tokio::test]
    async fn test_remote_error_carries_message() {
        let bytes = Ack::error(MessageType::Ack, MessageType::Read, 204, "disk read failed").encode();
        let err = ack_from(bytes, MessageType::Ack, MessageType::Read, ACK_MIN_LEN)
            .await
            .unwrap_err();
        match err {
            TransferError::Protocol(ProtocolError::Remote {
                request,
                code,
                message,
            }) => {
                assert_eq!(request, "READ");
                assert_eq!(code, 204);
                assert_eq!(message, "disk read failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_type_and_mode() {
        let fin = Ack::ok(MessageType::Fin, MessageType::Read).encode();
        let err = ack_from(fin, MessageType::Ack, MessageType::Read, ACK_MIN_LEN)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::UnexpectedType { actual: 7, .. })
        ));

        let close = Ack::ok(MessageType::Ack, MessageType::Close).encode();
        let err = ack_from(close, MessageType::Ack, MessageType::Read, ACK_MIN_LEN)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::UnexpectedMode { actual: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_allocation() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(MAX_FRAME_SIZE + 1);
        let mut reader: &[u8] = &bytes;
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Protocol(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let bytes = Ack::ok(MessageType::Ack, MessageType::Close).encode();
        let mut reader: &[u8] = &bytes[..6];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransferError::Transport(_)));
    }

    #[tokio::test]
    async fn test_preamble() {
        let bytes = encode_preamble(SessionId(4711), b"xyz");
        let mut reader: &[u8] = &bytes;
        assert_eq!(read_session_id(&mut reader).await.unwrap(), SessionId(4711));
        skip_challenge(&mut reader).await.unwrap();
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_negative_challenge_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_i32(-5);
        let mut reader: &[u8] = &bytes;
        assert!(skip_challenge(&mut reader).await.is_err());
    }

    proptest! {
        #[test]
        fn prop_ack_decode_never_panics(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Ack::decode(MessageType::Ack, Bytes::from(payload));
        }

        #[test]
        fn prop_ack_round_trips_error_text(code in 1i32.., message in "[a-zA-Z0-9 ]{0,40}") {
            let encoded = Ack::error(MessageType::Ack, MessageType::Read, code, &message).encode();
            let decoded = Ack::decode(MessageType::Ack, encoded.slice(8..)).unwrap();
            prop_assert_eq!(decoded.return_code, code);
            prop_assert_eq!(decoded.message.as_deref(), Some(message.as_str()));
        }
    }
}
