//! Controller config intake: parse, stamp, filter, normalize.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::config::{CoreKind, TlsMaterial};
use crate::error::AgentError;

const SILENT_LEVEL: &str = "silent";
const FALLBACK_LEVEL: &str = "warn";

/// Session-scoped inputs to [`ConfigDocument::build`].
#[derive(Clone, Debug)]
pub struct TransformContext {
    pub kind: CoreKind,
    pub peer: String,
    pub tls: TlsMaterial,
    /// Inbound tags to keep; empty keeps all of them.
    pub allowed_inbounds: Vec<String>,
}

/// A controller-supplied core config, validated and ready for stdin.
///
/// Key order of the original JSON is preserved. Peer identity and the local
/// certificate paths travel alongside the document, not inside it.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigDocument {
    body: Map<String, Value>,
    peer: String,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl ConfigDocument {
    pub fn build(raw: &[u8], ctx: &TransformContext) -> Result<Self, AgentError> {
        let parsed: Value = serde_json::from_slice(raw)?;
        let Value::Object(mut body) = parsed else {
            return Err(AgentError::ConfigInvalid(
                "config root must be a JSON object".to_string(),
            ));
        };

        if !ctx.allowed_inbounds.is_empty() {
            filter_inbounds(&mut body, &ctx.allowed_inbounds)?;
        }
        if ctx.kind == CoreKind::SingBox {
            lift_silent_level(&mut body);
        }

        Ok(Self {
            body,
            peer: ctx.peer.clone(),
            cert_path: ctx.tls.cert_path.clone(),
            key_path: ctx.tls.key_path.clone(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Tags of the inbounds that survived filtering, in order.
    pub fn inbound_tags(&self) -> Vec<&str> {
        self.body
            .get("inbounds")
            .and_then(Value::as_array)
            .map(|inbounds| inbounds.iter().filter_map(inbound_tag).collect())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Result<String, AgentError> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

fn inbound_tag(inbound: &Value) -> Option<&str> {
    inbound.get("tag").and_then(Value::as_str)
}

fn filter_inbounds(body: &mut Map<String, Value>, allowed: &[String]) -> Result<(), AgentError> {
    match body.get_mut("inbounds") {
        Some(Value::Array(items)) => {
            items.retain(|inbound| {
                inbound_tag(inbound).is_some_and(|tag| allowed.iter().any(|a| a == tag))
            });
        }
        None | Some(Value::Null) => {
            body.insert("inbounds".to_string(), Value::Array(Vec::new()));
        }
        Some(_) => {
            return Err(AgentError::ConfigInvalid(
                "\"inbounds\" must be an array".to_string(),
            ))
        }
    }
    Ok(())
}

fn lift_silent_level(body: &mut Map<String, Value>) {
    let Some(level) = body
        .get_mut("log")
        .and_then(Value::as_object_mut)
        .and_then(|log| log.get_mut("level"))
    else {
        return;
    };
    if level.as_str() == Some(SILENT_LEVEL) {
        *level = Value::String(FALLBACK_LEVEL.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(kind: CoreKind, allowed: &[&str]) -> TransformContext {
        TransformContext {
            kind,
            peer: "203.0.113.7".to_string(),
            tls: TlsMaterial {
                cert_path: PathBuf::from("/var/lib/marzban-node/ssl_cert.pem"),
                key_path: PathBuf::from("/var/lib/marzban-node/ssl_key.pem"),
            },
            allowed_inbounds: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn raw_with_inbounds(tags: &[&str]) -> Vec<u8> {
        let inbounds: Vec<Value> = tags
            .iter()
            .map(|tag| json!({"tag": tag, "listen": "0.0.0.0"}))
            .collect();
        serde_json::to_vec(&json!({"log": {"level": "info"}, "inbounds": inbounds})).expect("encode")
    }

    #[test]
    fn allow_list_keeps_matching_inbounds_in_order() {
        let doc = ConfigDocument::build(&raw_with_inbounds(&["a", "b", "c", "d"]), &ctx(CoreKind::Xray, &["c", "a"]))
            .expect("build");
        assert_eq!(doc.inbound_tags(), vec!["a", "c"]);
    }

    #[test]
    fn empty_allow_list_leaves_inbounds_untouched() {
        let raw = raw_with_inbounds(&["a", "b", "c", "d"]);
        let doc = ConfigDocument::build(&raw, &ctx(CoreKind::SingBox, &[])).expect("build");
        assert_eq!(doc.inbound_tags(), vec!["a", "b", "c", "d"]);
        let original: Value = serde_json::from_slice(&raw).expect("decode");
        let emitted: Value = serde_json::from_str(&doc.to_json().expect("json")).expect("decode");
        assert_eq!(emitted, original);
    }

    #[test]
    fn untagged_inbounds_and_missing_list_are_handled() {
        let raw = serde_json::to_vec(&json!({
            "inbounds": [{"listen": "::"}, {"tag": "a"}, {"tag": 7}]
        }))
        .expect("encode");
        let doc = ConfigDocument::build(&raw, &ctx(CoreKind::Xray, &["a"])).expect("build");
        assert_eq!(doc.inbound_tags(), vec!["a"]);

        let doc = ConfigDocument::build(br#"{"outbounds": []}"#, &ctx(CoreKind::Xray, &["a"]))
            .expect("build");
        assert_eq!(doc.get("inbounds"), Some(&json!([])));
    }

    #[test]
    fn stamps_peer_and_trust_material_outside_the_body() {
        let doc = ConfigDocument::build(&raw_with_inbounds(&["a"]), &ctx(CoreKind::Xray, &[]))
            .expect("build");
        assert_eq!(doc.peer(), "203.0.113.7");
        assert_eq!(doc.cert_path(), Path::new("/var/lib/marzban-node/ssl_cert.pem"));
        assert_eq!(doc.key_path(), Path::new("/var/lib/marzban-node/ssl_key.pem"));
        assert!(!doc.to_json().expect("json").contains("203.0.113.7"));
    }

    #[test]
    fn silent_level_is_lifted_for_sing_box_only() {
        let raw = br#"{"log": {"level": "silent", "timestamp": true}, "inbounds": []}"#;
        let sing_box = ConfigDocument::build(raw, &ctx(CoreKind::SingBox, &[])).expect("build");
        assert_eq!(sing_box.get("log"), Some(&json!({"level": "warn", "timestamp": true})));

        let xray = ConfigDocument::build(raw, &ctx(CoreKind::Xray, &[])).expect("build");
        assert_eq!(xray.get("log"), Some(&json!({"level": "silent", "timestamp": true})));

        let debug = ConfigDocument::build(br#"{"log": {"level": "debug"}}"#, &ctx(CoreKind::SingBox, &[]))
            .expect("build");
        assert_eq!(debug.get("log"), Some(&json!({"level": "debug"})));
    }

    #[test]
    fn key_order_survives_serialization() {
        let raw = br#"{"route": {}, "log": {"level": "info"}, "inbounds": [], "dns": {}}"#;
        let doc = ConfigDocument::build(raw, &ctx(CoreKind::SingBox, &[])).expect("build");
        assert_eq!(
            doc.to_json().expect("json"),
            r#"{"route":{},"log":{"level":"info"},"inbounds":[],"dns":{}}"#
        );
    }

    #[test]
    fn rejects_invalid_input() {
        let context = ctx(CoreKind::Xray, &["a"]);
        assert!(matches!(
            ConfigDocument::build(b"{not json", &context),
            Err(AgentError::ConfigInvalid(_))
        ));
        assert!(matches!(
            ConfigDocument::build(b"[1, 2]", &context),
            Err(AgentError::ConfigInvalid(_))
        ));
        assert!(matches!(
            ConfigDocument::build(br#"{"inbounds": {"tag": "a"}}"#, &context),
            Err(AgentError::ConfigInvalid(_))
        ));
    }
}
