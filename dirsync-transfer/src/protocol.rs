//! Wire format, version 1. All integers are big-endian.
//!
//! Request header:
//!
//! ```text
//! u8  version      = 1
//! u16 name_len     1..=255
//! [u8; name_len]   filename, UTF-8
//! u8  operation    1 = Create, 2 = Modify, 3 = Delete
//! u64 size
//! ```
//!
//! Create and Modify are followed by exactly `size` body bytes, sent in
//! chunks of [`CHUNK_SIZE`]. Delete has no body and its size is ignored.
//!
//! Response frame, at most [`MAX_RESPONSE_LEN`] bytes:
//!
//! ```text
//! u8  status       0 = ok, 1 = failure
//! u16 message_len  <= 4093
//! [u8; message_len] UTF-8 reason
//! ```

use std::fmt;

use dirsync_core::{ChangeKind, MAX_NAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{stream_err, ProtocolError, TransferError};

pub const PROTOCOL_VERSION: u8 = 1;
pub const CHUNK_SIZE: usize = 4096;
pub const MAX_RESPONSE_LEN: usize = 4096;

/// Failure message sent to a connection turned away at the session limit.
/// The server closes the connection after sending it.
pub const BUSY_MESSAGE: &str = "server busy";

/// version + name_len
const HEADER_PREFIX_LEN: usize = 3;
/// operation + size
const HEADER_SUFFIX_LEN: usize = 9;
/// status + message_len
pub const RESPONSE_PREFIX_LEN: usize = 3;
pub const MAX_MESSAGE_LEN: usize = MAX_RESPONSE_LEN - RESPONSE_PREFIX_LEN;

const STATUS_OK: u8 = 0;
const STATUS_FAILURE: u8 = 1;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Modify,
    Delete,
}

impl Operation {
    pub fn tag(self) -> u8 {
        match self {
            Operation::Create => 1,
            Operation::Modify => 2,
            Operation::Delete => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(Operation::Create),
            2 => Ok(Operation::Modify),
            3 => Ok(Operation::Delete),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }

    /// Create and Modify carry file content.
    pub fn has_body(self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl From<ChangeKind> for Operation {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => Operation::Create,
            ChangeKind::Modified => Operation::Modify,
            ChangeKind::Deleted => Operation::Delete,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Modify => write!(f, "modify"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub filename: String,
    pub operation: Operation,
    pub size: u64,
}

impl TransferRequest {
    pub fn new(filename: impl Into<String>, operation: Operation, size: u64) -> Self {
        Self {
            filename: filename.into(),
            operation,
            size,
        }
    }

    pub fn delete(filename: impl Into<String>) -> Self {
        Self::new(filename, Operation::Delete, 0)
    }

    /// Number of body bytes that follow the header on the wire.
    pub fn body_len(&self) -> u64 {
        if self.operation.has_body() {
            self.size
        } else {
            0
        }
    }

    pub fn encode_header(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.filename.as_bytes();
        check_name_len(name.len())?;

        let mut out = Vec::with_capacity(HEADER_PREFIX_LEN + name.len() + HEADER_SUFFIX_LEN);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.push(self.operation.tag());
        out.extend_from_slice(&self.body_len().to_be_bytes());
        Ok(out)
    }

    /// Decode a header from the start of `bytes`. Anything after the header
    /// (the body) is ignored.
    pub fn decode_header(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let prefix = bytes.get(..HEADER_PREFIX_LEN).ok_or(ProtocolError::Truncated {
            expected: HEADER_PREFIX_LEN,
            actual: bytes.len(),
        })?;
        let name_len = decode_prefix([prefix[0], prefix[1], prefix[2]])?;
        let expected = HEADER_PREFIX_LEN + name_len + HEADER_SUFFIX_LEN;
        let rest = bytes
            .get(HEADER_PREFIX_LEN..expected)
            .ok_or(ProtocolError::Truncated {
                expected,
                actual: bytes.len(),
            })?;
        decode_rest(name_len, rest)
    }

    /// Read the next header from a session stream.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly
    /// before sending another request.
    pub async fn read_async<R>(reader: &mut R) -> Result<Option<Self>, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; HEADER_PREFIX_LEN];
        if reader.read(&mut prefix[..1]).await.map_err(stream_err)? == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut prefix[1..])
            .await
            .map_err(stream_err)?;
        let name_len = decode_prefix(prefix)?;

        let mut rest = vec![0u8; name_len + HEADER_SUFFIX_LEN];
        reader.read_exact(&mut rest).await.map_err(stream_err)?;
        Ok(Some(decode_rest(name_len, &rest)?))
    }
}

fn check_name_len(len: usize) -> Result<(), ProtocolError> {
    if len == 0 || len > MAX_NAME_LEN {
        return Err(ProtocolError::NameLength(len));
    }
    Ok(())
}

fn decode_prefix(prefix: [u8; HEADER_PREFIX_LEN]) -> Result<usize, ProtocolError> {
    if prefix[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(prefix[0]));
    }
    let name_len = u16::from_be_bytes([prefix[1], prefix[2]]) as usize;
    check_name_len(name_len)?;
    Ok(name_len)
}

/// `rest` is exactly `name_len + HEADER_SUFFIX_LEN` bytes.
fn decode_rest(name_len: usize, rest: &[u8]) -> Result<TransferRequest, ProtocolError> {
    let (name, suffix) = rest.split_at(name_len);
    let filename = std::str::from_utf8(name)
        .map_err(|_| ProtocolError::NameEncoding)?
        .to_string();
    let operation = Operation::from_tag(suffix[0])?;
    let mut size = [0u8; 8];
    size.copy_from_slice(&suffix[1..HEADER_SUFFIX_LEN]);
    Ok(TransferRequest {
        filename,
        operation,
        size: u64::from_be_bytes(size),
    })
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub ok: bool,
    pub message: String,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }

    /// Encode as one frame. Messages longer than [`MAX_MESSAGE_LEN`] bytes
    /// are cut at the last char boundary that fits.
    pub fn encode(&self) -> Vec<u8> {
        let message = truncate_on_char_boundary(&self.message, MAX_MESSAGE_LEN);
        let mut out = Vec::with_capacity(RESPONSE_PREFIX_LEN + message.len());
        out.push(if self.ok { STATUS_OK } else { STATUS_FAILURE });
        out.extend_from_slice(&(message.len() as u16).to_be_bytes());
        out.extend_from_slice(message.as_bytes());
        out
    }

    /// Validate a frame prefix and return `(ok, message_len)`.
    pub fn decode_prefix(prefix: [u8; RESPONSE_PREFIX_LEN]) -> Result<(bool, usize), ProtocolError> {
        let ok = match prefix[0] {
            STATUS_OK => true,
            STATUS_FAILURE => false,
            other => return Err(ProtocolError::UnknownStatus(other)),
        };
        let len = u16::from_be_bytes([prefix[1], prefix[2]]) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(ProtocolError::MessageLength(len));
        }
        Ok((ok, len))
    }

    pub fn from_parts(ok: bool, message: Vec<u8>) -> Result<Self, ProtocolError> {
        let message = String::from_utf8(message).map_err(|_| ProtocolError::MessageEncoding)?;
        Ok(Self { ok, message })
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let prefix = frame.get(..RESPONSE_PREFIX_LEN).ok_or(ProtocolError::Truncated {
            expected: RESPONSE_PREFIX_LEN,
            actual: frame.len(),
        })?;
        let (ok, len) = Self::decode_prefix([prefix[0], prefix[1], prefix[2]])?;
        let expected = RESPONSE_PREFIX_LEN + len;
        let message = frame
            .get(RESPONSE_PREFIX_LEN..expected)
            .ok_or(ProtocolError::Truncated {
                expected,
                actual: frame.len(),
            })?;
        Self::from_parts(ok, message.to_vec())
    }

    pub async fn read_async<R>(reader: &mut R) -> Result<Self, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; RESPONSE_PREFIX_LEN];
        reader.read_exact(&mut prefix).await.map_err(stream_err)?;
        let (ok, len) = Self::decode_prefix(prefix)?;
        let mut message = vec![0u8; len];
        reader.read_exact(&mut message).await.map_err(stream_err)?;
        Ok(Self::from_parts(ok, message)?)
    }

    pub async fn write_async<W>(&self, writer: &mut W) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await.map_err(stream_err)?;
        writer.flush().await.map_err(stream_err)
    }
}

fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn create_header_layout_is_big_endian() {
        let header = TransferRequest::new("a.txt", Operation::Create, 5)
            .encode_header()
            .unwrap();
        assert_eq!(
            header,
            vec![1, 0, 5, b'a', b'.', b't', b'x', b't', 1, 0, 0, 0, 0, 0, 0, 0, 5]
        );
        assert_eq!(
            TransferRequest::decode_header(&header).unwrap(),
            TransferRequest::new("a.txt", Operation::Create, 5)
        );
    }

    #[test]
    fn delete_encodes_zero_size() {
        let mut request = TransferRequest::delete("gone");
        request.size = 99;
        let header = request.encode_header().unwrap();
        assert_eq!(&header[header.len() - 8..], &[0u8; 8]);
    }

    #[test]
    fn decode_ignores_trailing_body() {
        let mut bytes = TransferRequest::new("b", Operation::Modify, 3)
            .encode_header()
            .unwrap();
        bytes.extend_from_slice(b"xyz");
        let decoded = TransferRequest::decode_header(&bytes).unwrap();
        assert_eq!(decoded.operation, Operation::Modify);
        assert_eq!(decoded.size, 3);
    }

    #[rstest]
    #[case(vec![2, 0, 1, b'a', 1, 0, 0, 0, 0, 0, 0, 0, 0], ProtocolError::UnsupportedVersion(2))]
    #[case(vec![1, 0, 1, b'a', 9, 0, 0, 0, 0, 0, 0, 0, 0], ProtocolError::UnknownOperation(9))]
    #[case(vec![1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0], ProtocolError::NameLength(0))]
    #[case(vec![1, 1, 0], ProtocolError::NameLength(256))]
    #[case(vec![1, 0, 1, 0xff, 1, 0, 0, 0, 0, 0, 0, 0, 0], ProtocolError::NameEncoding)]
    #[case(vec![1, 0, 4, b'a'], ProtocolError::Truncated { expected: 16, actual: 4 })]
    fn malformed_headers_are_rejected(#[case] bytes: Vec<u8>, #[case] expected: ProtocolError) {
        assert_eq!(TransferRequest::decode_header(&bytes).unwrap_err(), expected);
    }

    #[test]
    fn over_long_name_cannot_be_encoded() {
        let name = "n".repeat(MAX_NAME_LEN + 1);
        let err = TransferRequest::new(name, Operation::Create, 0)
            .encode_header()
            .unwrap_err();
        assert_eq!(err, ProtocolError::NameLength(256));
        assert!(TransferRequest::new("n".repeat(MAX_NAME_LEN), Operation::Create, 0)
            .encode_header()
            .is_ok());
    }

    #[test]
    fn change_kinds_map_to_operations() {
        assert_eq!(Operation::from(ChangeKind::Created), Operation::Create);
        assert_eq!(Operation::from(ChangeKind::Modified), Operation::Modify);
        assert_eq!(Operation::from(ChangeKind::Deleted), Operation::Delete);
    }

    #[test]
    fn response_frame_layout() {
        let frame = Response::failure("no").encode();
        assert_eq!(frame, vec![1, 0, 2, b'n', b'o']);
        assert_eq!(Response::decode(&frame).unwrap(), Response::failure("no"));
    }

    #[test]
    fn long_response_is_truncated_on_a_char_boundary() {
        // 'é' is two bytes, so 4093 bytes of it cannot end exactly on the limit.
        let message = "é".repeat(3000);
        let frame = Response::ok(message).encode();
        assert!(frame.len() <= MAX_RESPONSE_LEN);
        let decoded = Response::decode(&frame).unwrap();
        assert_eq!(decoded.message.len(), MAX_MESSAGE_LEN - 1);
        assert!(decoded.message.chars().all(|c| c == 'é'));
    }

    #[rstest]
    #[case(vec![7, 0, 0], ProtocolError::UnknownStatus(7))]
    #[case(vec![0, 0x10, 0], ProtocolError::MessageLength(4096))]
    #[case(vec![0, 0, 1, 0xc3], ProtocolError::MessageEncoding)]
    fn malformed_responses_are_rejected(#[case] bytes: Vec<u8>, #[case] expected: ProtocolError) {
        assert_eq!(Response::decode(&bytes).unwrap_err(), expected);
    }

    #[tokio::test]
    async fn clean_eof_before_header_is_not_an_error() {
        let mut empty: &[u8] = &[];
        assert!(TransferRequest::read_async(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_header_is_connection_closed() {
        let mut partial: &[u8] = &[1, 0, 5, b'a'];
        let err = TransferRequest::read_async(&mut partial).await.unwrap_err();
        assert!(matches!(err, TransferError::ConnectionClosed));
    }

    #[tokio::test]
    async fn read_async_matches_decode_header() {
        let request = TransferRequest::new("notes.md", Operation::Create, 1234);
        let bytes = request.encode_header().unwrap();
        let mut reader: &[u8] = &bytes;
        assert_eq!(
            TransferRequest::read_async(&mut reader).await.unwrap(),
            Some(request)
        );
    }
}
