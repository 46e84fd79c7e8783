//! Line codec for worker communication.
//!
//! Pure encode/decode functions for the envelopes in [`super::protocol`], plus
//! [`LineCodec`], the tokio-util framing used on the worker's stdio. Works over
//! any AsyncRead/AsyncWrite (pipes, duplex streams, etc).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{
    CallEnvelope, HANDSHAKE_TYPE, Handshake, ResponseEnvelope, ResponseOutcome, WireHandshake,
    WireResponse,
};
use crate::error::ProtocolError;
use crate::version::VersionPolicy;

/// Upper bound on a single protocol line. Longer lines are discarded.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Encode a call as a single JSON line (no trailing newline).
pub fn encode(call: &CallEnvelope) -> Result<String, ProtocolError> {
    serde_json::to_string(call).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a response line.
///
/// Requires an `id` and exactly one of `result`/`error`. A `jsonrpc` field is
/// optional but must be `"2.0"` when present.
pub fn decode(line: &str) -> Result<ResponseEnvelope, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::InvalidEnvelope(
            "response must be a JSON object".to_string(),
        ));
    }
    let wire: WireResponse = serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;

    let id = wire
        .id
        .ok_or_else(|| ProtocolError::InvalidEnvelope("missing id".to_string()))?;

    let outcome = match (wire.result, wire.error) {
        (Some(result), None) => ResponseOutcome::Result(result),
        (None, Some(error)) => ResponseOutcome::Error(error),
        (Some(_), Some(_)) => {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "response {} carries both result and error",
                id
            )));
        }
        (None, None) => {
            return Err(ProtocolError::InvalidEnvelope(format!(
                "response {} carries neither result nor error",
                id
            )));
        }
    };

    Ok(ResponseEnvelope { id, outcome })
}

/// Probe a line for the worker handshake. Never fails - `None` means
/// "not a handshake", whatever else the line may be.
pub fn parse_handshake(line: &str) -> Option<Handshake> {
    let wire: WireHandshake = serde_json::from_str(line).ok()?;
    if wire.kind != HANDSHAKE_TYPE {
        return None;
    }
    Some(Handshake {
        worker_id: wire.worker_id,
        protocol_version: wire.protocol_version,
    })
}

/// Check a worker's advertised version against the expected one.
pub fn validate_protocol_version(
    worker: &str,
    expected: &str,
    policy: &dyn VersionPolicy,
) -> Result<(), ProtocolError> {
    if policy.is_compatible(worker, expected) {
        Ok(())
    } else {
        Err(ProtocolError::VersionMismatch {
            worker: worker.to_string(),
            expected: expected.to_string(),
        })
    }
}

/// Worker side: encode the handshake line.
pub fn encode_handshake(handshake: &Handshake) -> Result<String, ProtocolError> {
    let wire = WireHandshake {
        kind: HANDSHAKE_TYPE.to_string(),
        worker_id: handshake.worker_id.clone(),
        protocol_version: handshake.protocol_version.clone(),
    };
    serde_json::to_string(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Worker side: decode a call line.
pub fn decode_call(line: &str) -> Result<CallEnvelope, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
}

/// Worker side: encode a response line.
pub fn encode_response(response: &ResponseEnvelope) -> Result<String, ProtocolError> {
    let (result, error) = match &response.outcome {
        ResponseOutcome::Result(value) => (Some(value.clone()), None),
        ResponseOutcome::Error(err) => (None, Some(err.clone())),
    };
    let wire = WireResponse {
        jsonrpc: Some(Default::default()),
        id: Some(response.id),
        result,
        error,
    };
    serde_json::to_string(&wire).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Newline framing over [`LinesCodec`].
///
/// Partial lines stay buffered until a terminator arrives, blank lines are
/// skipped, and over-long lines are dropped without ending the stream.
pub struct LineCodec {
    inner: LinesCodec,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn filter(
        &mut self,
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Filtered, io::Error> {
        match result {
            Ok(Some(line)) if line.trim().is_empty() => Ok(Filtered::Skip),
            Ok(Some(line)) => Ok(Filtered::Line(line)),
            Ok(None) => Ok(Filtered::NeedMore),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(
                    max_length = self.inner.max_length(),
                    "Discarding over-long line"
                );
                Ok(Filtered::Skip)
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

enum Filtered {
    Line(String),
    Skip,
    NeedMore,
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let result = self.inner.decode(src);
            match self.filter(result)? {
                Filtered::Line(line) => return Ok(Some(line)),
                Filtered::Skip => continue,
                Filtered::NeedMore => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let result = self.inner.decode_eof(src);
            match self.filter(result)? {
                Filtered::Line(line) => return Ok(Some(line)),
                Filtered::Skip => continue,
                Filtered::NeedMore => return Ok(None),
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "protocol line contains an embedded newline",
            ));
        }
        tracing::trace!(line_bytes = line.len(), "Encoding line");
        self.inner.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        CorrelationId, JsonRpcVersion, RequestId, RpcError, error_codes,
    };
    use crate::version::{ExactMatch, SameMajor};
    use serde_json::json;
    use std::time::Duration;

    fn call(id: u64, method: &str, params: Option<serde_json::Value>) -> CallEnvelope {
        CallEnvelope {
            jsonrpc: JsonRpcVersion::V2,
            id: RequestId::new(id),
            method: method.to_string(),
            params,
            correlation_id: CorrelationId::parse("550e8400-e29b-41d4-a716-446655440000")
                .unwrap(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn encode_is_a_single_compact_line() {
        let line = encode(&call(3, "echo", Some(json!({"text": "a\nb"})))).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(
            line,
            r#"{"jsonrpc":"2.0","id":3,"method":"echo","params":{"text":"a\nb"},"correlation_id":"550e8400-e29b-41d4-a716-446655440000"}"#
        );
    }

    #[test]
    fn decode_result_response() {
        let resp = decode(r#"{"jsonrpc":"2.0","id":5,"result":{"sum":3}}"#).unwrap();
        assert_eq!(resp.id, RequestId::new(5));
        assert_eq!(resp.outcome, ResponseOutcome::Result(json!({"sum": 3})));
    }

    #[test]
    fn decode_accepts_null_result_and_missing_jsonrpc() {
        let resp = decode(r#"{"id":1,"result":null}"#).unwrap();
        assert_eq!(resp.outcome, ResponseOutcome::Result(serde_json::Value::Null));
    }

    #[test]
    fn decode_error_response() {
        let resp = decode(r#"{"id":2,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        assert!(resp.is_error());
        assert_eq!(
            resp.outcome,
            ResponseOutcome::Error(RpcError::new(error_codes::METHOD_NOT_FOUND, "nope"))
        );
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        let cases = [
            (r#"not json"#, error_codes::PARSE_ERROR),
            (r#"[1,2]"#, error_codes::INVALID_REQUEST),
            (r#"{"result":1}"#, error_codes::INVALID_REQUEST),
            (r#"{"id":1}"#, error_codes::INVALID_REQUEST),
            (
                r#"{"id":1,"result":1,"error":{"code":1,"message":"x"}}"#,
                error_codes::INVALID_REQUEST,
            ),
            (r#"{"id":"abc","result":1}"#, error_codes::INVALID_REQUEST),
            (r#"{"jsonrpc":"1.0","id":1,"result":1}"#, error_codes::INVALID_REQUEST),
        ];
        for (line, code) in cases {
            let err = decode(line).unwrap_err();
            assert_eq!(err.code(), code, "line: {line}");
        }
    }

    #[test]
    fn handshake_probe_distinguishes_lines() {
        let hs = parse_handshake(r#"{"type":"ready","worker_id":"w-1","protocol_version":"1.0"}"#)
            .unwrap();
        assert_eq!(hs.worker_id, "w-1");
        assert_eq!(hs.protocol_version, "1.0");

        assert!(parse_handshake(r#"{"id":1,"result":true}"#).is_none());
        assert!(parse_handshake(r#"{"type":"other","worker_id":"w","protocol_version":"1"}"#).is_none());
        assert!(parse_handshake("booting...").is_none());
    }

    #[test]
    fn handshake_roundtrips_through_worker_encoder() {
        let hs = Handshake {
            worker_id: "w-9".to_string(),
            protocol_version: "1.0".to_string(),
        };
        let line = encode_handshake(&hs).unwrap();
        assert_eq!(parse_handshake(&line), Some(hs));
    }

    #[test]
    fn validate_protocol_version_uses_policy() {
        assert!(validate_protocol_version("1.0", "1.0", &ExactMatch).is_ok());
        let err = validate_protocol_version("1.3", "1.0", &ExactMatch).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::VersionMismatch {
                worker: "1.3".to_string(),
                expected: "1.0".to_string(),
            }
        );
        assert!(validate_protocol_version("1.3", "1.0", &SameMajor).is_ok());
    }

    #[test]
    fn worker_side_response_is_decodable() {
        let line = encode_response(&ResponseEnvelope::error(
            RequestId::new(4),
            RpcError::new(7, "bad"),
        ))
        .unwrap();
        assert_eq!(
            line,
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":7,"message":"bad"}}"#
        );
        assert!(decode(&line).unwrap().is_error());
    }

    #[test]
    fn decode_call_reads_what_encode_writes() {
        let original = call(11, "add", Some(json!({"a": 1, "b": 2})));
        let decoded = decode_call(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.method, "add");
        assert_eq!(decoded.correlation_id, original.correlation_id);
    }

    #[test]
    fn line_codec_buffers_partial_lines_and_skips_blank_ones() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("{\"id\":1");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b",\"result\":1}\n\n   \r\nnext\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("{\"id\":1,\"result\":1}".to_string())
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("next".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn line_codec_drops_over_long_lines_and_recovers() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789abcdef\nok\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("ok".to_string()));
    }

    #[test]
    fn line_codec_flushes_trailing_line_at_eof() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("tail");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("tail".to_string()));
    }

    #[test]
    fn line_codec_rejects_embedded_newlines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.encode("a\nb".to_string(), &mut buf).is_err());
        codec.encode("ab".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"ab\n");
    }
}
