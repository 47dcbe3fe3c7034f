//! JSON-RPC 2.0 framing for the signaling socket.
//!
//! Requests carry an id and expect a reply; notifications carry none.
//! Code 500 is a generic failure; code 302 carries a `SessionMeta`
//! payload pointing the client at the owning node.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

pub fn response<T: Serialize>(id: &Value, result: &T) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
    .to_string()
}

pub fn error_response(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    })
    .to_string()
}

pub fn notification<T: Serialize>(method: &str, params: &T) -> String {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_id() {
        let req = RpcRequest::parse(
            r#"{"jsonrpc":"2.0","id":7,"method":"join","params":{"sid":"room-1"}}"#,
        )
        .unwrap();
        assert_eq!(req.method, "join");
        assert!(!req.is_notification());
        assert_eq!(req.params.unwrap()["sid"], "room-1");
    }

    #[test]
    fn missing_id_is_a_notification() {
        let req =
            RpcRequest::parse(r#"{"jsonrpc":"2.0","method":"trickle","params":{}}"#).unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn response_echoes_id() {
        let text = response(&json!(3), &"pong");
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["result"], "pong");
        assert_eq!(value["jsonrpc"], "2.0");
    }

    #[test]
    fn error_response_carries_code() {
        let text = error_response(&json!("abc"), 302, "{\"node_url\":\"ws://n2\"}");
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["error"]["code"], 302);
        assert_eq!(value["id"], "abc");
    }

    #[test]
    fn notification_has_no_id() {
        let text = notification("offer", &json!({"type": "offer"}));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "offer");
    }
}
