//! Wire framing.
//!
//! # Layout
//! ```text
//! ┌────────┬─────────┬──────┬────────────┬──────────┐
//! │ "RPCD" │ version │ kind │ request id │ body len │  14-byte header
//! │ 4 B    │ u8      │ u8   │ u32 BE     │ u32 BE   │
//! └────────┴─────────┴──────┴────────────┴──────────┘
//! Request body: u16 identity len, identity, u16 operation len, operation, payload
//! Reply body:   u8 status, payload (message text for failures)
//! ```
//!
//! Payloads are opaque bytes; marshaling them is the caller's business.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, RpcResult};
use crate::resilience::Timeout;

pub const MAGIC: [u8; 4] = *b"RPCD";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request = 0,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = RpcError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Reply),
            3 => Ok(FrameKind::ValidateConnection),
            4 => Ok(FrameKind::CloseConnection),
            other => Err(RpcError::Protocol(format!("unknown frame kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub request_id: u32,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, request_id: u32, body_len: usize) -> Self {
        Self {
            kind,
            request_id,
            body_len: body_len as u32,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&MAGIC);
        out[4] = VERSION;
        out[5] = self.kind as u8;
        out[6..10].copy_from_slice(&self.request_id.to_be_bytes());
        out[10..14].copy_from_slice(&self.body_len.to_be_bytes());
        out
    }

    /// Decode and check a header against the largest body we accept.
    pub fn decode(raw: &[u8; HEADER_LEN], max_body: usize) -> RpcResult<Self> {
        if raw[..4] != MAGIC {
            return Err(RpcError::Protocol("bad magic".into()));
        }
        if raw[4] != VERSION {
            return Err(RpcError::Protocol(format!("unsupported protocol version {}", raw[4])));
        }
        let kind = FrameKind::try_from(raw[5])?;
        let request_id = u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]);
        let body_len = u32::from_be_bytes([raw[10], raw[11], raw[12], raw[13]]);
        check_body_len(body_len as usize, max_body)?;
        Ok(Self {
            kind,
            request_id,
            body_len,
        })
    }
}

/// Reject a body the header cannot describe or the peer will not accept.
pub fn check_body_len(len: usize, max_body: usize) -> RpcResult<()> {
    if len > max_body || u32::try_from(len).is_err() {
        return Err(RpcError::Protocol(format!(
            "frame body of {} bytes exceeds the {} byte limit",
            len, max_body
        )));
    }
    Ok(())
}

/// Header followed by body, ready to hand to the writer.
///
/// `body` must already have passed [`check_body_len`].
pub fn encode_frame(kind: FrameKind, request_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&FrameHeader::new(kind, request_id, body.len()).encode());
    out.extend_from_slice(body);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub identity: String,
    pub operation: String,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn encode_body(&self) -> RpcResult<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + self.identity.len() + self.operation.len() + self.payload.len());
        put_str(&mut out, &self.identity)?;
        put_str(&mut out, &self.operation)?;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode_body(body: Vec<u8>) -> RpcResult<Self> {
        let mut pos = 0;
        let identity = take_str(&body, &mut pos)?;
        let operation = take_str(&body, &mut pos)?;
        let mut body = body;
        let payload = body.split_off(pos);
        Ok(Self {
            identity,
            operation,
            payload,
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    OperationNotExist = 3,
    Unknown = 4,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = RpcError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::UserException),
            2 => Ok(ReplyStatus::ObjectNotExist),
            3 => Ok(ReplyStatus::OperationNotExist),
            4 => Ok(ReplyStatus::Unknown),
            other => Err(RpcError::Protocol(format!("unknown reply status {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            payload,
        }
    }

    pub fn failure(status: ReplyStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: message.into().into_bytes(),
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.status as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode_body(mut body: Vec<u8>) -> RpcResult<Self> {
        if body.is_empty() {
            return Err(RpcError::Protocol("empty reply body".into()));
        }
        let status = ReplyStatus::try_from(body[0])?;
        let payload = body.split_off(1);
        Ok(Self { status, payload })
    }

    /// Turn the reply into the caller's result.
    pub fn into_result(self, identity: &str, operation: &str) -> RpcResult<Vec<u8>> {
        if self.status == ReplyStatus::Ok {
            return Ok(self.payload);
        }
        let message = String::from_utf8_lossy(&self.payload).into_owned();
        Err(match self.status {
            ReplyStatus::UserException => RpcError::UserException(message),
            ReplyStatus::ObjectNotExist => RpcError::ObjectNotExist(identity.to_string()),
            ReplyStatus::OperationNotExist => RpcError::OperationNotExist {
                identity: identity.to_string(),
                operation: operation.to_string(),
            },
            ReplyStatus::Ok | ReplyStatus::Unknown => RpcError::Unknown(message),
        })
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) -> RpcResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| RpcError::Protocol(format!("request string of {} bytes is too long", s.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn take_str(body: &[u8], pos: &mut usize) -> RpcResult<String> {
    let truncated = || RpcError::Protocol("truncated request body".into());
    let len_bytes = body.get(*pos..*pos + 2).ok_or_else(truncated)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    *pos += 2;
    let raw = body.get(*pos..*pos + len).ok_or_else(truncated)?;
    *pos += len;
    String::from_utf8(raw.to_vec()).map_err(|_| RpcError::Protocol("request string is not UTF-8".into()))
}

/// Why a transfer on a socket did not complete.
#[derive(Debug)]
pub enum TransferError {
    /// No progress within the idle timeout.
    Stalled,
    /// The peer closed the stream.
    Closed,
    Io(std::io::Error),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Stalled => write!(f, "transfer stalled"),
            TransferError::Closed => write!(f, "peer closed the connection"),
            TransferError::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Fill `buf`, failing if any single read makes no progress within `idle`.
///
/// The timer restarts after every successful read, so a slow but moving
/// transfer never trips it.
pub async fn read_with_progress<R>(reader: &mut R, buf: &mut [u8], idle: Timeout) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = idle
            .run(reader.read(&mut buf[filled..]))
            .await
            .map_err(|_| TransferError::Stalled)?
            .map_err(TransferError::Io)?;
        if n == 0 {
            return Err(TransferError::Closed);
        }
        filled += n;
    }
    Ok(())
}

/// Write all of `buf`, failing if any single write makes no progress within `idle`.
pub async fn write_with_progress<W>(writer: &mut W, buf: &[u8], idle: Timeout) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < buf.len() {
        let n = idle
            .run(writer.write(&buf[written..]))
            .await
            .map_err(|_| TransferError::Stalled)?
            .map_err(TransferError::Io)?;
        if n == 0 {
            return Err(TransferError::Closed);
        }
        written += n;
    }
    idle.run(writer.flush())
        .await
        .map_err(|_| TransferError::Stalled)?
        .map_err(TransferError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(FrameKind::Reply, 0x0102_0304, 5);
        let raw = header.encode();
        assert_eq!(&raw[..4], b"RPCD");
        assert_eq!(raw[5], 2);
        assert_eq!(&raw[6..10], &[1, 2, 3, 4]);
        assert_eq!(FrameHeader::decode(&raw, 1024).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_oversized_and_garbage() {
        let raw = FrameHeader::new(FrameKind::Request, 1, 2048).encode();
        assert!(matches!(FrameHeader::decode(&raw, 1024), Err(RpcError::Protocol(_))));

        let mut bad = raw;
        bad[0] = b'X';
        assert!(FrameHeader::decode(&bad, 4096).is_err());

        let mut bad_kind = FrameHeader::new(FrameKind::Request, 1, 0).encode();
        bad_kind[5] = 9;
        assert!(FrameHeader::decode(&bad_kind, 4096).is_err());
    }

    #[test]
    fn test_request_body() {
        let req = Request {
            identity: "timeout".into(),
            operation: "sleep".into(),
            payload: 100u32.to_be_bytes().to_vec(),
        };
        let decoded = Request::decode_body(req.encode_body().unwrap()).unwrap();
        assert_eq!(decoded, req);

        assert!(Request::decode_body(vec![0, 9, b'a']).is_err());
    }

    #[test]
    fn test_request_body_rejects_long_operation() {
        let req = Request {
            identity: "timeout".into(),
            operation: "x".repeat(usize::from(u16::MAX) + 1),
            payload: Vec::new(),
        };
        assert!(matches!(req.encode_body(), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_check_body_len() {
        assert!(check_body_len(1024, 1024).is_ok());
        assert!(matches!(check_body_len(1025, 1024), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn test_reply_into_result() {
        let ok = Reply::ok(b"fine".to_vec());
        assert_eq!(ok.into_result("o", "op").unwrap(), b"fine");

        let user = Reply::failure(ReplyStatus::UserException, "boom");
        let decoded = Reply::decode_body(user.encode_body()).unwrap();
        assert_eq!(decoded.into_result("o", "op"), Err(RpcError::UserException("boom".into())));

        let missing = Reply::failure(ReplyStatus::OperationNotExist, "");
        assert!(matches!(
            missing.into_result("o", "nope"),
            Err(RpcError::OperationNotExist { .. })
        ));
        assert!(Reply::decode_body(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_read_with_progress_detects_stall() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"abc").await.unwrap();

        let mut buf = [0u8; 6];
        let result = read_with_progress(&mut server, &mut buf, Timeout::After(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(TransferError::Stalled)));
    }

    #[tokio::test]
    async fn test_write_with_progress_tolerates_slow_reader() {
        let (mut client, mut server) = tokio::io::duplex(16);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut total = 0;
            while total < buf.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let n = server.read(&mut buf[total..]).await.unwrap();
                total += n;
            }
            total
        });

        // Total transfer takes far longer than the idle timeout, but each write progresses.
        let payload = vec![7u8; 1024];
        write_with_progress(&mut client, &payload, Timeout::After(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn test_write_with_progress_detects_stall() {
        let (mut client, _server) = tokio::io::duplex(16);
        let payload = vec![0u8; 1024];
        let result = write_with_progress(&mut client, &payload, Timeout::After(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(TransferError::Stalled)));
    }
}
