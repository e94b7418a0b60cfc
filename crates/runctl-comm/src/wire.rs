//! Wire formats exchanged with remote applications
//!
//! Request bodies are posted to the application's `/command` endpoint; the
//! application later posts its reply to the listener's `/response`
//! endpoint. The callback port travels in the `X-Answer-Port` header.

use serde::{Deserialize, Serialize};

/// Header carrying the callback port for the asynchronous reply.
pub const ANSWER_PORT_HEADER: &str = "X-Answer-Port";

/// Command request body, posted to the remote application.
///
/// ```json
/// { "id": "<trigger>", "data": {...}, "entry_state": "<STATE>", "exit_state": "<STATE>" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Trigger name.
    pub id: String,
    /// Opaque command payload.
    pub data: serde_json::Value,
    pub entry_state: String,
    pub exit_state: String,
}

/// Asynchronous reply body, posted by the remote application to the
/// listener.
///
/// ```json
/// { "appname": "<process-name>", "success": true, "result": "OK", "data": { "cmdid": "<trigger>" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    /// Name the reply is correlated by in the dispatcher registry.
    pub appname: String,
    pub success: bool,
    /// `"OK"` on success, otherwise failure text.
    pub result: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CommandReply {
    /// Whether the application reported clean completion.
    pub fn is_ok(&self) -> bool {
        self.success && self.result == "OK"
    }

    /// The trigger this reply answers, when the application echoed it.
    pub fn cmdid(&self) -> Option<&str> {
        self.data.get("cmdid").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_round_trips_through_json() {
        let raw = r#"{
            "appname": "tracker01",
            "success": true,
            "result": "OK",
            "data": { "cmdid": "conf" }
        }"#;
        let reply: CommandReply = serde_json::from_str(raw).unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.cmdid(), Some("conf"));

        let back = serde_json::to_value(&reply).unwrap();
        assert_eq!(back["appname"], "tracker01");
        assert_eq!(back["data"]["cmdid"], "conf");
    }

    #[test]
    fn reply_without_data_is_accepted() {
        let raw = r#"{ "appname": "a", "success": false, "result": "could not configure" }"#;
        let reply: CommandReply = serde_json::from_str(raw).unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.cmdid(), None);
    }

    #[test]
    fn request_matches_wire_shape() {
        let req = CommandRequest {
            id: "start".into(),
            data: serde_json::json!({ "run": 42 }),
            entry_state: "CONFIGURED".into(),
            exit_state: "RUNNING".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["id"], "start");
        assert_eq!(v["data"]["run"], 42);
        assert_eq!(v["entry_state"], "CONFIGURED");
        assert_eq!(v["exit_state"], "RUNNING");
    }
}
