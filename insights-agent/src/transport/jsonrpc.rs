// ABOUTME: JSON-RPC 2.0 envelopes: classifying inbound lines and building outbound ones.
// ABOUTME: Requests carry u64 ids from the transport's counter; peers may answer with numbers or strings.

use crate::error::RpcError;
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// A request the peer sent us and expects an answer to
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(ServerRequest),
    Notification(Notification),
    Response {
        id: Value,
        outcome: Result<Value, RpcError>,
    },
}

/// Classify a parsed line. None for anything that is not a JSON-RPC object.
pub fn classify(value: Value) -> Option<Incoming> {
    let Value::Object(mut obj) = value else {
        return None;
    };

    let id = obj.remove("id").filter(|id| !id.is_null());
    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let params = obj.remove("params").unwrap_or(Value::Null);

    match (method, id) {
        (Some(method), Some(id)) => Some(Incoming::Request(ServerRequest { id, method, params })),
        (Some(method), None) => Some(Incoming::Notification(Notification { method, params })),
        (None, Some(id)) => {
            if let Some(error) = obj.remove("error") {
                let error = serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| {
                    RpcError::internal(format!("Malformed error object: {}", error))
                });
                Some(Incoming::Response {
                    id,
                    outcome: Err(error),
                })
            } else {
                let result = obj.remove("result").unwrap_or(Value::Null);
                Some(Incoming::Response {
                    id,
                    outcome: Ok(result),
                })
            }
        }
        (None, None) => None,
    }
}

/// Response ids as our counter values
pub fn id_as_u64(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "method": method, "params": params})
}

pub fn response(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "result": result})
}

pub fn error_response(id: &Value, error: &RpcError) -> Value {
    json!({"jsonrpc": JSONRPC_VERSION, "id": id, "error": error})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_all_shapes() {
        assert!(matches!(
            classify(json!({"jsonrpc": "2.0", "id": 1, "method": "fs/read_text_file", "params": {}})),
            Some(Incoming::Request(ServerRequest { .. }))
        ));
        assert!(matches!(
            classify(json!({"jsonrpc": "2.0", "method": "session/update"})),
            Some(Incoming::Notification(Notification { .. }))
        ));
        assert!(matches!(
            classify(json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}})),
            Some(Incoming::Response { outcome: Ok(_), .. })
        ));
        match classify(json!({"id": "4", "error": {"code": -32601, "message": "nope"}})) {
            Some(Incoming::Response { id, outcome: Err(e) }) => {
                assert_eq!(id_as_u64(&id), Some(4));
                assert_eq!(e.code, -32601);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_objects_are_rejected() {
        assert!(classify(json!([1, 2])).is_none());
        assert!(classify(json!("hello")).is_none());
        assert!(classify(json!({"jsonrpc": "2.0"})).is_none());
    }
}
