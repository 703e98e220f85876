//! `RequestHeader`/`ReplyHeader` and body (de)compression.

use ps_errors::{PsError, PsResult};
use serde::{Deserialize, Serialize};

/// Compression applied to a frame's body, carried as an explicit byte so a
/// peer that doesn't support a scheme can fail cleanly instead of
/// misparsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressKind {
    None = 0,
    Snappy = 1,
}

impl CompressKind {
    pub fn from_byte(b: u8) -> PsResult<Self> {
        match b {
            0 => Ok(CompressKind::None),
            1 => Ok(CompressKind::Snappy),
            other => Err(PsError::UnSupportCompressType(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Compress `body` per this scheme.
    pub fn compress(self, body: &[u8]) -> PsResult<Vec<u8>> {
        match self {
            CompressKind::None => Ok(body.to_vec()),
            CompressKind::Snappy => snap::raw::Encoder::new()
                .compress_vec(body)
                .map_err(|e| PsError::SnappyCompress(e.to_string())),
        }
    }

    /// Reverse [`CompressKind::compress`].
    pub fn decompress(self, body: &[u8]) -> PsResult<Vec<u8>> {
        match self {
            CompressKind::None => Ok(body.to_vec()),
            CompressKind::Snappy => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| PsError::SnappyUncompress(e.to_string())),
        }
    }
}

/// Precedes every request frame's body. `timestamp` is the caller's
/// monotone per-connection counter, used to match replies to pending calls;
/// `type` is the numeric [`crate::RpcKind`] discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub timestamp: u64,
    pub r#type: u32,
    pub compress_kind: u8,
}

impl RequestHeader {
    pub fn new(timestamp: u64, kind: u32, compress: CompressKind) -> Self {
        RequestHeader {
            timestamp,
            r#type: kind,
            compress_kind: compress.to_byte(),
        }
    }

    pub fn compress_kind(&self) -> PsResult<CompressKind> {
        CompressKind::from_byte(self.compress_kind)
    }
}

/// Precedes every reply frame's body. `error_code` is `0` on success, else a
/// [`PsError::code`] value the caller reconstructs with
/// [`PsError::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub timestamp: u64,
    pub error_code: i32,
    pub compress_kind: u8,
}

impl ReplyHeader {
    pub fn ok(timestamp: u64, compress: CompressKind) -> Self {
        ReplyHeader {
            timestamp,
            error_code: 0,
            compress_kind: compress.to_byte(),
        }
    }

    pub fn err(timestamp: u64, error: &PsError) -> Self {
        ReplyHeader {
            timestamp,
            error_code: error.code(),
            compress_kind: CompressKind::None.to_byte(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }

    pub fn compress_kind(&self) -> PsResult<CompressKind> {
        CompressKind::from_byte(self.compress_kind)
    }
}

/// A request as it actually crosses the wire: header plus a bincode (and
/// optionally Snappy-compressed) body. `tokio_tower` frames and tags this
/// struct; the header lets a receiver read `type`/`compress_kind` and
/// reject what it doesn't support before paying for a full body decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub header: RequestHeader,
    pub body: Vec<u8>,
}

/// The reply counterpart of [`RequestFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub header: ReplyHeader,
    pub body: Vec<u8>,
}

/// Encode `req` into a [`RequestFrame`], compressing the body per
/// `compress`.
pub fn encode_request(
    timestamp: u64,
    kind: crate::RpcKind,
    req: &crate::RpcRequest,
    compress: CompressKind,
) -> PsResult<RequestFrame> {
    let raw = bincode::serialize(req).map_err(|e| PsError::SerializeRequest(e.to_string()))?;
    let body = compress.compress(&raw)?;
    Ok(RequestFrame {
        header: RequestHeader::new(timestamp, kind as u32, compress),
        body,
    })
}

/// Reverse [`encode_request`].
pub fn decode_request(frame: &RequestFrame) -> PsResult<crate::RpcRequest> {
    let raw = frame.header.compress_kind()?.decompress(&frame.body)?;
    bincode::deserialize(&raw).map_err(|e| PsError::DeserializeRequest(e.to_string()))
}

/// Encode a successful reply.
pub fn encode_reply(
    timestamp: u64,
    reply: &crate::RpcReply,
    compress: CompressKind,
) -> PsResult<ReplyFrame> {
    let raw = bincode::serialize(reply).map_err(|e| PsError::SerializeReply(e.to_string()))?;
    let body = compress.compress(&raw)?;
    Ok(ReplyFrame {
        header: ReplyHeader::ok(timestamp, compress),
        body,
    })
}

/// Encode a failed reply: the body carries nothing, the error rides in the
/// header's `error_code`.
pub fn encode_error_reply(timestamp: u64, error: &PsError) -> ReplyFrame {
    ReplyFrame {
        header: ReplyHeader::err(timestamp, error),
        body: Vec::new(),
    }
}

/// Reverse [`encode_reply`]/[`encode_error_reply`].
pub fn decode_reply(frame: &ReplyFrame) -> PsResult<crate::RpcReply> {
    if !frame.header.is_ok() {
        return Err(PsError::from_code(frame.header.error_code));
    }
    let raw = frame.header.compress_kind()?.decompress(&frame.body)?;
    bincode::deserialize(&raw).map_err(|e| PsError::DeserializeReply(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_a_compressed_frame() {
        let req = crate::RpcRequest::TryJoin {
            addr: "127.0.0.1:4000".into(),
        };
        let frame = encode_request(1, crate::RpcKind::TryJoin, &req, CompressKind::Snappy).unwrap();
        assert_eq!(frame.header.r#type, crate::RpcKind::TryJoin as u32);
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn error_reply_carries_no_body() {
        let frame = encode_error_reply(7, &PsError::TimeoutError);
        assert!(!frame.header.is_ok());
        assert!(frame.body.is_empty());
        assert_eq!(decode_reply(&frame), Err(PsError::TimeoutError));
    }

    #[test]
    fn snappy_round_trips() {
        let body = b"a table row payload, repeated repeated repeated".to_vec();
        let compressed = CompressKind::Snappy.compress(&body).unwrap();
        let restored = CompressKind::Snappy.decompress(&compressed).unwrap();
        assert_eq!(restored, body);
    }

    #[test]
    fn unknown_compress_byte_is_rejected() {
        assert!(matches!(
            CompressKind::from_byte(9),
            Err(PsError::UnSupportCompressType(9))
        ));
    }
}
