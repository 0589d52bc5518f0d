//! IPC wire format
//!
//! Newline-terminated UTF-8 JSON documents over a local stream socket:
//! one request per line from the client, one response per line from the
//! server.

use serde::{Deserialize, Serialize};

/// Upper bound on a single framed message
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

pub const METHOD_PING: &str = "ping";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_START: &str = "start";
pub const METHOD_STOP: &str = "stop";
pub const METHOD_START_TUNNEL: &str = "start_tunnel";
pub const METHOD_STOP_TUNNEL: &str = "stop_tunnel";
pub const METHOD_RESTART_TUNNEL: &str = "restart_tunnel";
pub const METHOD_ACTIVATE_TUNNEL: &str = "activate_tunnel";
pub const METHOD_STATUS: &str = "status";
pub const METHOD_GET_CONFIG: &str = "get_config";
pub const METHOD_RELOAD_CONFIG: &str = "reload_config";
pub const METHOD_IS_CONNECTED: &str = "is_connected";

/// A request from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A response from server to client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tag parameter for tunnel-scoped methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagParams {
    pub tag: String,
}

/// Payload of the `ping` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub version: String,
    pub pid: u32,
}

/// Payload of boolean responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoolResult {
    pub value: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_params_are_optional_on_the_wire() {
        let req: Request = serde_json::from_str(r#"{"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert!(req.params.is_none());

        let encoded = serde_json::to_string(&req).unwrap();
        assert!(!encoded.contains("params"));
    }

    #[test]
    fn test_response_error_shape() {
        let resp = Response {
            result: None,
            error: Some("tunnel \"x\" not found".to_string()),
        };
        let encoded = serde_json::to_string(&resp).unwrap();
        assert_eq!(encoded, r#"{"error":"tunnel \"x\" not found"}"#);
    }
}
