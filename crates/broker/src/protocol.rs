//! The wire protocol.
//!
//! JSON text frames with single-letter actions, one shape for both
//! directions: `{a, c, d, v, op, data, error, …}`. Fields that do not
//! apply to an action are simply absent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use easygrid_core::{ConnectionId, DocumentKey, Error};
use easygrid_ops::Operation;

/// Protocol revision sent in the handshake reply.
pub const PROTOCOL_VERSION: u32 = 1;

/// The OT type implemented by the broker.
pub const OT_TYPE: &str = "json0";

/// Wire actions.
pub mod action {
    /// Handshake; mandatory before any other action.
    pub const HANDSHAKE: &str = "hs";
    /// Subscribe to a document.
    pub const SUBSCRIBE: &str = "s";
    /// Unsubscribe from a document.
    pub const UNSUBSCRIBE: &str = "us";
    /// Submit or broadcast an operation.
    pub const OP: &str = "op";
    /// Fetch a snapshot without subscribing.
    pub const FETCH: &str = "f";
    /// Presence ping / cursor broadcast; never persisted.
    pub const PRESENCE: &str = "p";
}

/// Error payload of a reply frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: Some(err.to_string()),
        }
    }
}

/// One protocol frame, inbound or outbound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Frame {
    /// Action.
    pub a: String,
    /// Collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    /// Document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Version: observed version on submit, new version on ack/broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<u64>,
    /// Operation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Operation>,
    /// Snapshot or presence payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error payload of a failed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Handshake reply: protocol revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u32>,
    /// Handshake reply: OT type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Handshake reply: assigned connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Frame {
    /// The handshake reply.
    pub fn handshake_reply(conn: &ConnectionId) -> Self {
        Self {
            a: action::HANDSHAKE.to_string(),
            protocol: Some(PROTOCOL_VERSION),
            doc_type: Some(OT_TYPE.to_string()),
            id: Some(conn.clone()),
            ..Default::default()
        }
    }

    /// A snapshot reply (`s` or `f`).
    pub fn snapshot(a: &str, key: &DocumentKey, version: u64, data: Value) -> Self {
        Self {
            a: a.to_string(),
            c: Some(key.collection.as_str().to_string()),
            d: Some(key.doc_id.clone()),
            v: Some(version),
            data: Some(data),
            ..Default::default()
        }
    }

    /// The ack sent to a submitter: `{a:"op", v}`.
    pub fn op_ack(version: u64) -> Self {
        Self {
            a: action::OP.to_string(),
            v: Some(version),
            ..Default::default()
        }
    }

    /// An op broadcast to subscribers.
    pub fn op_broadcast(key: &DocumentKey, version: u64, op: Operation) -> Self {
        Self {
            a: action::OP.to_string(),
            c: Some(key.collection.as_str().to_string()),
            d: Some(key.doc_id.clone()),
            v: Some(version),
            op: Some(op),
            ..Default::default()
        }
    }

    /// An error reply for the given action.
    pub fn error(a: &str, err: &Error) -> Self {
        Self {
            a: a.to_string(),
            error: Some(ErrorPayload::from(err)),
            ..Default::default()
        }
    }

    /// Returns the document key addressed by this frame, if complete.
    pub fn document_key(&self) -> Result<DocumentKey, Error> {
        let collection = self
            .c
            .as_deref()
            .ok_or_else(|| Error::operation_invalid("missing collection"))?;
        let doc_id = self
            .d
            .as_deref()
            .ok_or_else(|| Error::operation_invalid("missing document id"))?;
        Ok(DocumentKey::new(
            easygrid_core::Collection::parse(collection)?,
            doc_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easygrid_ops::{AtomicEdit, Path};
    use serde_json::json;

    #[test]
    fn test_submit_frame_shape() {
        let raw = r#"{"a":"op","c":"rec_tblX","d":"recY","v":7,
            "op":[{"p":["data","fldN"],"od":3,"oi":4}]}"#;
        let frame: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.a, "op");
        assert_eq!(frame.v, Some(7));
        let op = frame.op.unwrap();
        assert_eq!(op.len(), 1);
        assert_eq!(op.edits()[0].od, Some(json!(3)));

        let key = Frame {
            a: "op".into(),
            c: Some("rec_tblX".into()),
            d: Some("recY".into()),
            ..Default::default()
        }
        .document_key()
        .unwrap();
        assert_eq!(key.table_id(), "tblX");
    }

    #[test]
    fn test_ack_shape() {
        let json = serde_json::to_value(Frame::op_ack(8)).unwrap();
        assert_eq!(json, json!({"a": "op", "v": 8}));
    }

    #[test]
    fn test_broadcast_shape() {
        let key = DocumentKey::for_record("tblX", "recY");
        let op = Operation::from_edits(vec![AtomicEdit::replace(
            Path::field("fld1"),
            json!("hi"),
            json!("ho"),
        )]);
        let json = serde_json::to_value(Frame::op_broadcast(&key, 6, op)).unwrap();
        assert_eq!(json["a"], "op");
        assert_eq!(json["c"], "rec_tblX");
        assert_eq!(json["d"], "recY");
        assert_eq!(json["v"], 6);
        assert_eq!(json["op"][0]["od"], "hi");
    }

    #[test]
    fn test_handshake_reply_shape() {
        let json = serde_json::to_value(Frame::handshake_reply(&"c1".to_string())).unwrap();
        assert_eq!(json, json!({"a": "hs", "protocol": 1, "type": "json0", "id": "c1"}));
    }

    #[test]
    fn test_error_shape() {
        let frame = Frame::error(action::OP, &Error::version_mismatch(5, 6));
        let json = serde_json::to_value(frame).unwrap();
        assert_eq!(json["error"]["code"], "version_mismatch");
    }

    #[test]
    fn test_bad_collection_rejected() {
        let frame = Frame {
            a: "s".into(),
            c: Some("view_x".into()),
            d: Some("recY".into()),
            ..Default::default()
        };
        assert!(frame.document_key().is_err());
    }
}
