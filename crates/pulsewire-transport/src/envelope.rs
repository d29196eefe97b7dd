//! Wire envelope framing shared by the multiplexed socket transports.
//!
//! Requests carry a 4-digit action code and a 10-character correlation
//! identifier in front of the payload. Responses echo the identifier followed
//! by a 3-digit status code. Stream frames reuse the identifier slot with a
//! registered stream identifier instead of a pending-request one.

use bytes::{BufMut, Bytes, BytesMut};
use pulsewire_core::{Result, StreamError};

/// Length of the zero-padded action code on outbound requests.
pub const ACTION_LEN: usize = 4;
/// Length of the correlation identifier on both directions.
pub const REQUEST_ID_LEN: usize = 10;
/// Length of the zero-padded status code on inbound frames.
pub const STATUS_LEN: usize = 3;
/// Correlation identifiers with this prefix route to a stream handler
/// instead of a pending unary waiter.
pub const STREAM_PREFIX: &str = "STRM";

const RESPONSE_PAYLOAD_OFFSET: usize = REQUEST_ID_LEN + STATUS_LEN;

/// Action codes understood by the measurement service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ActionCode {
    /// Create a measurement and obtain its identifier.
    CreateMeasurement = 510,
    /// Subscribe a stream identifier to a measurement's results.
    SubscribeResults = 511,
    /// Upload one payload chunk.
    SendChunk = 512,
    /// Request cancellation of an in-flight measurement.
    CancelMeasurement = 513,
}

impl ActionCode {
    /// The numeric wire value.
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Builds one outbound request frame: action, correlation id, payload.
pub fn encode_request(action: u16, request_id: &str, payload: &[u8]) -> Bytes {
    debug_assert_eq!(request_id.len(), REQUEST_ID_LEN);
    let mut buf = BytesMut::with_capacity(ACTION_LEN + REQUEST_ID_LEN + payload.len());
    buf.put_slice(format!("{action:04}").as_bytes());
    buf.put_slice(request_id.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// One parsed inbound frame: unary response or stream frame.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Correlation identifier the frame routes by.
    pub request_id: String,
    /// 3-digit status code.
    pub status: u16,
    /// Remaining payload bytes.
    pub payload: Bytes,
}

impl InboundFrame {
    /// Whether the frame routes to a registered stream handler.
    pub fn is_stream(&self) -> bool {
        self.request_id.starts_with(STREAM_PREFIX)
    }

    /// Consumes the frame, mapping a non-success status to its error.
    pub fn into_payload(self) -> Result<Bytes> {
        match status_error(self.status, &self.payload) {
            None => Ok(self.payload),
            Some(e) => Err(e),
        }
    }
}

/// Parses one inbound frame. The payload is zero-copy sliced out of `bytes`.
pub fn decode_frame(bytes: Bytes) -> Result<InboundFrame> {
    if bytes.len() < RESPONSE_PAYLOAD_OFFSET {
        return Err(StreamError::protocol(format!(
            "inbound frame too short: {} bytes",
            bytes.len()
        )));
    }
    let request_id = std::str::from_utf8(&bytes[..REQUEST_ID_LEN])
        .map_err(|_| StreamError::protocol("correlation id is not UTF-8"))?
        .to_string();
    let status_str = std::str::from_utf8(&bytes[REQUEST_ID_LEN..RESPONSE_PAYLOAD_OFFSET])
        .map_err(|_| StreamError::protocol("status code is not UTF-8"))?;
    let status: u16 = status_str
        .parse()
        .map_err(|_| StreamError::protocol(format!("status code is not numeric: {status_str:?}")))?;
    Ok(InboundFrame {
        request_id,
        status,
        payload: bytes.slice(RESPONSE_PAYLOAD_OFFSET..),
    })
}

/// Maps a wire status code to the engine's error taxonomy. `200` maps to
/// `None`; the payload is used as failure detail where one exists.
pub fn status_error(status: u16, payload: &[u8]) -> Option<StreamError> {
    let detail = || String::from_utf8_lossy(payload).into_owned();
    match status {
        200 => None,
        400 => Some(StreamError::Validation { reason: detail() }),
        401 => Some(StreamError::Unauthenticated { reason: detail() }),
        403 => Some(StreamError::Unauthorized { reason: detail() }),
        404 => Some(StreamError::NotFound { reason: detail() }),
        408 => Some(StreamError::Timeout { timeout_ms: 0 }),
        other => Some(StreamError::internal(format!(
            "server status {other}: {}",
            detail()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_layout() {
        let frame = encode_request(510, "0510000001", b"{}");
        assert_eq!(&frame[..], b"05100510000001{}");
    }

    #[test]
    fn test_decode_unary_response() {
        let frame = decode_frame(Bytes::from_static(b"0510000001200{\"id\":\"m\"}")).unwrap();
        assert_eq!(frame.request_id, "0510000001");
        assert_eq!(frame.status, 200);
        assert!(!frame.is_stream());
        assert_eq!(&frame.into_payload().unwrap()[..], b"{\"id\":\"m\"}");
    }

    #[test]
    fn test_decode_stream_frame() {
        let frame = decode_frame(Bytes::from_static(b"STRM000001200data")).unwrap();
        assert!(frame.is_stream());
        assert_eq!(frame.status, 200);
    }

    #[test]
    fn test_short_frame_rejected() {
        let err = decode_frame(Bytes::from_static(b"too-short")).unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
    }

    #[test]
    fn test_non_numeric_status_rejected() {
        let err = decode_frame(Bytes::from_static(b"0510000001abc")).unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
    }

    #[test]
    fn test_status_taxonomy_mapping() {
        assert!(status_error(200, b"").is_none());
        assert!(matches!(
            status_error(400, b"bad study").unwrap(),
            StreamError::Validation { .. }
        ));
        assert!(matches!(
            status_error(401, b"").unwrap(),
            StreamError::Unauthenticated { .. }
        ));
        assert!(matches!(
            status_error(403, b"").unwrap(),
            StreamError::Unauthorized { .. }
        ));
        assert!(matches!(
            status_error(404, b"").unwrap(),
            StreamError::NotFound { .. }
        ));
        assert!(matches!(
            status_error(408, b"").unwrap(),
            StreamError::Timeout { .. }
        ));
        assert!(matches!(
            status_error(500, b"boom").unwrap(),
            StreamError::Internal { .. }
        ));
    }
}
