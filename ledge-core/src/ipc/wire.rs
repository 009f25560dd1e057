//! IPC wire format
//!
//! Newline-delimited JSON over the Unix socket, one message per line.
//! Every message is a tagged object; unknown fields are ignored so
//! clients and hosts can evolve independently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-host messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Invoke a named command; the reply carries the same `id`.
    Command {
        name: String,
        id: String,
        #[serde(default)]
        payload: Value,
    },

    /// Inject an event onto the bus. With an `id` the host acks with
    /// a reply carrying the delivered count; without one the publish
    /// is fire-and-forget.
    Publish {
        topic: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// Host-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Successful command result, correlated by `id`.
    Reply { id: String, result: Value },

    /// Command failure, or a protocol error (`id` absent when the
    /// offending line could not be parsed at all).
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },

    /// An event observed on the bus, fanned out to every connected
    /// client.
    Broadcast { topic: String, payload: Value },
}

impl Response {
    pub fn reply(id: impl Into<String>, result: Value) -> Self {
        Response::Reply {
            id: id.into(),
            result,
        }
    }

    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Response::Error {
            id,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_request_shape() {
        let line = r#"{"type":"command","name":"plugins.list","id":"r1"}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        match request {
            Request::Command { name, id, payload } => {
                assert_eq!(name, "plugins.list");
                assert_eq!(id, "r1");
                assert!(payload.is_null());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_publish_request_shape() {
        let line = r#"{"type":"publish","topic":"clock/tick","payload":{"hour":9}}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        match request {
            Request::Publish { topic, payload, id } => {
                assert_eq!(topic, "clock/tick");
                assert_eq!(payload["hour"], 9);
                assert!(id.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_publish_request_with_correlation_id() {
        let line = r#"{"type":"publish","topic":"clock/tick","id":"p1"}"#;
        let request: Request = serde_json::from_str(line).unwrap();
        assert!(matches!(
            request,
            Request::Publish { id: Some(id), .. } if id == "p1"
        ));
    }

    #[test]
    fn test_error_without_id_omits_field() {
        let response = Response::error(None, "malformed message");
        let line = serde_json::to_string(&response).unwrap();
        assert!(!line.contains("\"id\""));
        assert!(line.contains("malformed message"));
    }

    #[test]
    fn test_reply_round_trips() {
        let response = Response::reply("r7", json!({"plugins": []}));
        let line = serde_json::to_string(&response).unwrap();
        let parsed: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(parsed, Response::Reply { id, .. } if id == "r7"));
    }

    #[test]
    fn test_unknown_request_type_is_an_error() {
        let line = r#"{"type":"teleport","where":"elsewhere"}"#;
        assert!(serde_json::from_str::<Request>(line).is_err());
    }
}
