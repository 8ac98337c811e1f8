//! Controller wire protocol: newline-delimited JSON envelopes.
//!
//! ```text
//! controller                          agent
//!     │ ── hello{client_id, caps} ──────► │  admission
//!     │ ◄────────────── welcome{peer} ─── │  (rejected: socket closed)
//!     │ ── request{method, core, ..} ───► │
//!     │ ◄──── response{ok, result, err} ─ │  same request_id
//!     │ ◄───────── logs{subscription} ─── │  batched core output
//!     │ ◄────────────────── event{name} ─ │  start/stop callbacks
//!     │ ◄──── ping{nonce} / pong{nonce} ─► │  liveness, either side
//! ```

use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

use crate::config::CoreKind;
use crate::error::AgentError;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as integer or string")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(value)
                    .map(ProtocolVersion)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let value = u64::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version cannot be negative: {value}")))?;
                self.visit_u64(value)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value
                    .trim()
                    .trim_start_matches('v')
                    .parse::<u16>()
                    .map(ProtocolVersion)
                    .map_err(|err| E::custom(format!("invalid protocol version '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl Envelope {
    pub fn new(msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            request_id: None,
            msg,
        }
    }

    pub fn reply(request_id: Option<String>, msg: WireMsg) -> Self {
        Self {
            request_id,
            ..Self::new(msg)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Ping(PingPayload),
    Pong(PingPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Logs(LogsPayload),
    Event(EventPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    /// Controller callbacks the agent may invoke, e.g. `on_start`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomePayload {
    pub peer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Start,
    Stop,
    Restart,
    Version,
    IsEnabled,
    FetchLogs,
    StopLogs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestPayload {
    pub method: Method,
    #[serde(default)]
    pub core: CoreKind,
    /// Raw core config as the controller produced it.
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub subscription: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl ResponsePayload {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(err: &AgentError) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(RpcError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: Value::Null,
            error: Some(RpcError {
                code: "bad_request".to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogsPayload {
    pub subscription: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = trim_line_end(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_end(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Incremental splitter for a byte stream of NDJSON frames. Malformed or
/// oversized lines are reported and skipped; decoding continues after them.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline_idx).collect();
            let frame = trim_line_end(&line);
            if !frame.is_empty() {
                self.decode_raw_frame(frame, &mut report);
            }
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }
        report
    }

    /// Decodes whatever is left after the peer closed without a newline.
    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        let frame = trim_line_end(&rest);
        if !frame.is_empty() {
            self.decode_raw_frame(frame, &mut report);
        }
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_request() -> Envelope {
        Envelope {
            version: ProtocolVersion::CURRENT,
            request_id: Some("req-1".to_string()),
            msg: WireMsg::Request(RequestPayload {
                method: Method::Start,
                core: CoreKind::SingBox,
                config: Some(r#"{"inbounds":[]}"#.to_string()),
                subscription: None,
            }),
        }
    }

    #[test]
    fn envelope_layout_matches_protocol() {
        let encoded = serde_json::to_value(start_request()).expect("encode");
        assert_eq!(
            encoded,
            json!({
                "version": 1,
                "request_id": "req-1",
                "type": "request",
                "payload": {
                    "method": "start",
                    "core": "sing_box",
                    "config": "{\"inbounds\":[]}",
                    "subscription": null
                }
            })
        );

        let welcome = serde_json::to_value(Envelope::new(WireMsg::Welcome(WelcomePayload {
            peer: "10.0.0.9".to_string(),
        })))
        .expect("encode");
        assert_eq!(welcome, json!({"version": 1, "type": "welcome", "payload": {"peer": "10.0.0.9"}}));
    }

    #[test]
    fn request_defaults_to_xray_core() {
        let decoded: Envelope = decode_frame(
            br#"{"type":"request","request_id":"7","payload":{"method":"version"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(decoded.version, ProtocolVersion::CURRENT);
        match decoded.msg {
            WireMsg::Request(request) => {
                assert_eq!(request.method, Method::Version);
                assert_eq!(request.core, CoreKind::Xray);
                assert_eq!(request.config, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn version_field_accepts_string_and_number() {
        for raw in [
            r#"{"version":"1","type":"ping","payload":{"nonce":3}}"#,
            r#"{"version":"v1","type":"ping","payload":{"nonce":3}}"#,
            r#"{"version":1,"type":"ping","payload":{"nonce":3}}"#,
        ] {
            let decoded: Envelope = serde_json::from_str(raw).expect("decode");
            assert_eq!(decoded.version, ProtocolVersion(1));
            assert_eq!(decoded.msg, WireMsg::Ping(PingPayload { nonce: 3 }));
        }
        assert!(serde_json::from_str::<Envelope>(r#"{"version":-1,"type":"ping","payload":{"nonce":3}}"#).is_err());
    }

    #[test]
    fn failure_response_carries_error_code() {
        let response = ResponsePayload::failure(&AgentError::NotRunning(CoreKind::Xray));
        assert!(!response.ok);
        assert_eq!(
            response.error,
            Some(RpcError {
                code: "not_running".to_string(),
                message: "xray core is not running".to_string(),
            })
        );
        let encoded = serde_json::to_value(ResponsePayload::success(json!("1.8.4"))).expect("encode");
        assert_eq!(encoded, json!({"ok": true, "result": "1.8.4"}));
    }

    #[test]
    fn decoder_handles_split_chunks_and_recovers_from_garbage() {
        let frame = encode_frame(&start_request(), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let (head, tail) = frame.split_at(10);

        let mut decoder = NdjsonFrameDecoder::<Envelope>::default();
        let first = decoder.push_chunk(head);
        assert!(first.frames.is_empty() && first.errors.is_empty());

        let mut rest = tail.to_vec();
        rest.extend_from_slice(b"{\"type\":\"nope\"\r\n\n");
        rest.extend_from_slice(&frame);
        let report = decoder.push_chunk(&rest);
        assert_eq!(report.frames, vec![start_request(), start_request()]);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let logs = Envelope::new(WireMsg::Logs(LogsPayload {
            subscription: 1,
            text: "x".repeat(256),
        }));
        assert!(matches!(encode_frame(&logs, 64), Err(FrameError::OversizedFrame { .. })));

        let mut decoder = NdjsonFrameDecoder::<Envelope>::new(128);
        let report = decoder.push_chunk(&vec![b'x'; 200]);
        assert!(matches!(report.errors[..], [FrameError::OversizedBuffer { size: 200, max: 128 }]));

        let ping = encode_frame(&Envelope::new(WireMsg::Ping(PingPayload { nonce: 1 })), 128).expect("encode");
        let report = decoder.push_chunk(&ping);
        assert_eq!(report.frames.len(), 1);
    }

    #[test]
    fn finish_decodes_unterminated_tail() {
        let mut decoder = NdjsonFrameDecoder::<Envelope>::default();
        let report = decoder.push_chunk(br#"{"type":"pong","payload":{"nonce":9}}"#);
        assert!(report.frames.is_empty());
        let report = decoder.finish();
        assert_eq!(report.frames[0].msg, WireMsg::Pong(PingPayload { nonce: 9 }));
        assert!(decoder.finish().frames.is_empty());
    }
}
