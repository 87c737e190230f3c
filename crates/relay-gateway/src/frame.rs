//! Wire frames.
//!
//! Inbound frames are JSON objects discriminated by a `type` field. Matching
//! on `type` is trimmed and case-insensitive. Each recognized type decodes into
//! its own struct; an unrecognized type becomes [`ClientFrame::Ignored`] rather
//! than an error.
//!
//! Outbound frames come in two flavors: tagged replies (`pong`, `auth`,
//! `response`) and untagged ones (`{payload}` pushes and `{error}` frames).

use relay_core::{Accountability, AuthTokens, PrimaryKey, Query};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

/// Decode failures for inbound frames.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Unable to parse frame: {0}")]
    Malformed(String),

    #[error("Frame is missing a \"type\"")]
    MissingType,

    #[error("Invalid {frame_type} frame: {reason}")]
    InvalidFields { frame_type: String, reason: String },
}

// =============================================================================
// INBOUND
// =============================================================================

/// `AUTH`: exactly one credential form is used, checked in this order:
/// `access_token`, `refresh_token`, `email` + `password`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthFrame {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub uid: Option<String>,
}

/// `HANDSHAKE`: first frame in handshake mode.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandshakeFrame {
    pub access_token: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

/// `ITEMS`: CRUD against a collection. Field requirements depend on `action`
/// and are checked by the items handler, not at decode time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ItemsFrame {
    pub collection: Option<String>,
    pub action: Option<String>,
    pub data: Option<JsonValue>,
    pub query: Option<Query>,
    pub id: Option<PrimaryKey>,
    pub ids: Option<Vec<PrimaryKey>>,
    pub key: Option<PrimaryKey>,
    pub keys: Option<Vec<PrimaryKey>>,
    pub uid: Option<String>,
}

/// `GET`: read-by-query answered with a correlated `response`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GetFrame {
    pub collection: Option<String>,
    #[serde(default)]
    pub query: Query,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeFrame {
    pub collection: String,
    #[serde(default)]
    pub query: Option<Query>,
    pub uid: Option<String>,
}

/// `UNSUBSCRIBE`: by `uid`, by `collection`, or everything when both are absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UnsubscribeFrame {
    pub collection: Option<String>,
    pub uid: Option<String>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Auth(AuthFrame),
    Items(ItemsFrame),
    Get(GetFrame),
    Subscribe(SubscribeFrame),
    Unsubscribe(UnsubscribeFrame),
    Ping { uid: Option<String> },
    Handshake(HandshakeFrame),
    /// A well-formed frame of a type no handler knows.
    Ignored { frame_type: String },
}

fn fields<T: DeserializeOwned>(frame_type: &str, value: JsonValue) -> Result<T, FrameError> {
    serde_json::from_value(value).map_err(|e| FrameError::InvalidFields {
        frame_type: frame_type.to_string(),
        reason: e.to_string(),
    })
}

/// Normalized `type` of a raw frame object.
pub fn frame_type(value: &JsonValue) -> Option<String> {
    value
        .get("type")
        .and_then(JsonValue::as_str)
        .map(|t| t.trim().to_uppercase())
}

/// Correlation id of a raw frame, when present.
pub fn frame_uid(value: &JsonValue) -> Option<String> {
    match value.get("uid")? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ClientFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: JsonValue =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON frame.
    pub fn from_value(value: JsonValue) -> Result<Self, FrameError> {
        if !value.is_object() {
            return Err(FrameError::Malformed("expected a JSON object".into()));
        }
        let frame_type = frame_type(&value).ok_or(FrameError::MissingType)?;
        let uid = frame_uid(&value);
        let mut value = value;
        // uid may arrive as a number; the structs only take strings.
        if let (Some(obj), Some(uid)) = (value.as_object_mut(), uid.as_ref()) {
            obj.insert("uid".into(), JsonValue::String(uid.clone()));
        }

        Ok(match frame_type.as_str() {
            "AUTH" => ClientFrame::Auth(fields(&frame_type, value)?),
            "ITEMS" => ClientFrame::Items(fields(&frame_type, value)?),
            "GET" => ClientFrame::Get(fields(&frame_type, value)?),
            "SUBSCRIBE" => ClientFrame::Subscribe(fields(&frame_type, value)?),
            "UNSUBSCRIBE" => ClientFrame::Unsubscribe(fields(&frame_type, value)?),
            "PING" => ClientFrame::Ping { uid },
            "HANDSHAKE" => ClientFrame::Handshake(fields(&frame_type, value)?),
            _ => ClientFrame::Ignored { frame_type },
        })
    }

    /// Normalized type name, for logging.
    pub fn type_name(&self) -> &str {
        match self {
            ClientFrame::Auth(_) => "AUTH",
            ClientFrame::Items(_) => "ITEMS",
            ClientFrame::Get(_) => "GET",
            ClientFrame::Subscribe(_) => "SUBSCRIBE",
            ClientFrame::Unsubscribe(_) => "UNSUBSCRIBE",
            ClientFrame::Ping { .. } => "PING",
            ClientFrame::Handshake(_) => "HANDSHAKE",
            ClientFrame::Ignored { frame_type } => frame_type,
        }
    }

    /// Correlation id carried by the frame.
    pub fn uid(&self) -> Option<&str> {
        match self {
            ClientFrame::Auth(f) => f.uid.as_deref(),
            ClientFrame::Items(f) => f.uid.as_deref(),
            ClientFrame::Get(f) => f.uid.as_deref(),
            ClientFrame::Subscribe(f) => f.uid.as_deref(),
            ClientFrame::Unsubscribe(f) => f.uid.as_deref(),
            ClientFrame::Ping { uid } => uid.as_deref(),
            ClientFrame::Handshake(_) | ClientFrame::Ignored { .. } => None,
        }
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// `{type:'pong'}`
    Pong,
    /// `{type:'auth', accountability}`
    Auth { accountability: Accountability },
    /// `{type:'auth', access_token, refresh_token, expires}`
    AuthTokens(AuthTokens),
    /// `{type:'response', data, uid?}`
    Response {
        data: JsonValue,
        uid: Option<String>,
    },
    /// `{payload}`: untagged subscription push.
    Payload(JsonValue),
    /// `{error, uid?}`
    Error {
        error: String,
        uid: Option<String>,
    },
}

impl ServerFrame {
    pub fn response(data: JsonValue, uid: Option<String>) -> Self {
        ServerFrame::Response { data, uid }
    }

    pub fn error(error: impl Into<String>, uid: Option<String>) -> Self {
        ServerFrame::Error {
            error: error.into(),
            uid,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ServerFrame::Pong => json!({ "type": "pong" }),
            ServerFrame::Auth { accountability } => {
                json!({ "type": "auth", "accountability": accountability })
            }
            ServerFrame::AuthTokens(tokens) => json!({
                "type": "auth",
                "access_token": tokens.access_token,
                "refresh_token": tokens.refresh_token,
                "expires": tokens.expires,
            }),
            ServerFrame::Response { data, uid } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("response"));
                obj.insert("data".into(), data.clone());
                if let Some(uid) = uid {
                    obj.insert("uid".into(), json!(uid));
                }
                JsonValue::Object(obj)
            }
            ServerFrame::Payload(payload) => json!({ "payload": payload }),
            ServerFrame::Error { error, uid } => {
                let mut obj = Map::new();
                obj.insert("error".into(), json!(error));
                if let Some(uid) = uid {
                    obj.insert("uid".into(), json!(uid));
                }
                JsonValue::Object(obj)
            }
        }
    }

    /// Serialized text frame.
    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}

impl Serialize for ServerFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_is_trimmed_and_case_insensitive() {
        let frame = ClientFrame::decode(r#"{"type":"  ping "}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping { uid: None });

        let frame = ClientFrame::decode(r#"{"type":"Subscribe","collection":"articles"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe(ref s) if s.collection == "articles"));
    }

    #[test]
    fn test_unknown_type_is_ignored_not_error() {
        let frame = ClientFrame::decode(r#"{"type":"telemetry"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Ignored {
                frame_type: "TELEMETRY".into()
            }
        );
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ClientFrame::decode("{not json"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            ClientFrame::decode("[1,2]"),
            Err(FrameError::Malformed(_))
        ));
        assert_eq!(
            ClientFrame::decode(r#"{"collection":"a"}"#),
            Err(FrameError::MissingType)
        );
    }

    #[test]
    fn test_subscribe_requires_collection() {
        let err = ClientFrame::decode(r#"{"type":"SUBSCRIBE"}"#).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFields { ref frame_type, .. } if frame_type == "SUBSCRIBE"));
    }

    #[test]
    fn test_items_frame_fields() {
        let frame = ClientFrame::decode(
            r#"{"type":"ITEMS","collection":"articles","action":"update","ids":[1,"b"],"data":{"x":1},"uid":7}"#,
        )
        .unwrap();
        let ClientFrame::Items(items) = frame else {
            panic!("expected ITEMS");
        };
        assert_eq!(items.collection.as_deref(), Some("articles"));
        assert_eq!(
            items.ids,
            Some(vec![PrimaryKey::Int(1), PrimaryKey::Str("b".into())])
        );
        assert_eq!(items.uid.as_deref(), Some("7"));
    }

    #[test]
    fn test_get_frame_defaults_query() {
        let frame = ClientFrame::decode(r#"{"type":"GET","collection":"a","uid":"u1"}"#).unwrap();
        assert_eq!(frame.uid(), Some("u1"));
        let ClientFrame::Get(get) = frame else {
            panic!("expected GET");
        };
        assert_eq!(get.query, Query::default());
    }

    #[test]
    fn test_outbound_shapes() {
        assert_eq!(ServerFrame::Pong.to_json(), json!({"type": "pong"}));
        assert_eq!(
            ServerFrame::Payload(json!({"id": 1})).to_json(),
            json!({"payload": {"id": 1}})
        );
        assert_eq!(
            ServerFrame::error("invalid collection", None).to_json(),
            json!({"error": "invalid collection"})
        );
        assert_eq!(
            ServerFrame::response(json!([]), Some("u1".into())).to_json(),
            json!({"type": "response", "data": [], "uid": "u1"})
        );
        let tokens = AuthTokens {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires: 900_000,
        };
        assert_eq!(
            ServerFrame::AuthTokens(tokens).to_json(),
            json!({"type": "auth", "access_token": "a", "refresh_token": "r", "expires": 900_000})
        );
    }

    #[test]
    fn test_payload_frame_is_untagged() {
        let json = ServerFrame::Payload(json!([1, 2])).to_json();
        assert!(json.get("type").is_none());
    }
}
