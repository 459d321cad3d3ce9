//! Client-facing real-time protocol.
//!
//! Every frame is a JSON envelope discriminated by `messageType`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Messages the gateway pushes to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ServerMessage {
    PropertyStatus {
        id: String,
        data: Map<String, Value>,
    },
    ActionStatus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: Value,
    },
    Event {
        id: String,
        data: Value,
    },
    ThingAdded {
        id: String,
    },
    ThingRemoved {
        id: String,
    },
    ThingModified {
        id: String,
    },
    Connected {
        id: String,
        data: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: ErrorBody,
    },
}

impl ServerMessage {
    pub fn property_status(id: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        let mut data = Map::new();
        data.insert(name.into(), value);
        ServerMessage::PropertyStatus {
            id: id.into(),
            data,
        }
    }

    pub fn error(id: Option<String>, body: ErrorBody) -> Self {
        ServerMessage::Error { id, data: body }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::PropertyStatus { .. } => "propertyStatus",
            ServerMessage::ActionStatus { .. } => "actionStatus",
            ServerMessage::Event { .. } => "event",
            ServerMessage::ThingAdded { .. } => "thingAdded",
            ServerMessage::ThingRemoved { .. } => "thingRemoved",
            ServerMessage::ThingModified { .. } => "thingModified",
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
}

impl ErrorBody {
    pub fn bad_request(message: impl Into<String>, request: Option<Value>) -> Self {
        Self {
            code: 400,
            status: "400 Bad Request".to_string(),
            message: message.into(),
            request,
        }
    }

    pub fn not_found(message: impl Into<String>, request: Option<Value>) -> Self {
        Self {
            code: 404,
            status: "404 Not Found".to_string(),
            message: message.into(),
            request,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Commands a client may send over an open connection.
///
/// `id` targets a device; it may be omitted on a single-device connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum ClientMessage {
    SetProperty {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: Map<String, Value>,
    },
    AddEventSubscription {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: Map<String, Value>,
    },
    RequestAction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: Map<String, Value>,
    },
}

impl ClientMessage {
    pub const KNOWN_TYPES: [&'static str; 3] =
        ["setProperty", "addEventSubscription", "requestAction"];

    pub fn id(&self) -> Option<&str> {
        match self {
            ClientMessage::SetProperty { id, .. }
            | ClientMessage::AddEventSubscription { id, .. }
            | ClientMessage::RequestAction { id, .. } => id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_envelope_uses_message_type_tag() {
        let msg = ServerMessage::property_status("lamp", "on", json!(true));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"messageType": "propertyStatus", "id": "lamp", "data": {"on": true}})
        );
        assert_eq!(v["messageType"], msg.message_type());
    }

    #[test]
    fn action_status_omits_missing_id() {
        let msg = ServerMessage::ActionStatus {
            id: None,
            data: json!({"fade": {"status": "pending"}}),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("id").is_none());
    }

    #[test]
    fn inbound_set_property_parses_without_id() {
        let m: ClientMessage =
            serde_json::from_value(json!({"messageType": "setProperty", "data": {"level": 3}}))
                .unwrap();
        assert_eq!(m.id(), None);
        match m {
            ClientMessage::SetProperty { data, .. } => assert_eq!(data["level"], json!(3)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
