//! Wire frames exchanged over `/ws`
//!
//! Server to client: every frame is `{type, data, version, timestamp}`. State
//! deltas come straight from the core store; `ack`, `error` and `pong` are
//! replies to client frames and carry the caller's `request_id`.
//!
//! Client to server: `{type, request_id?, ...fields}`.

use devorch_core::{ApprovalId, CommandId, ServiceId, ServiceRequest, SubmitRequest};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

/// One inbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Retried frames with the same id are answered once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientFrame {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    GetState,
    Ping,
    Approve {
        approval_id: ApprovalId,
    },
    Reject {
        approval_id: ApprovalId,
    },
    RunCommand(RunCommand),
    CancelCommand {
        command_id: CommandId,
    },
    /// Same body as `POST /api/services`
    StartService(ServiceRequest),
    StopService {
        service_id: ServiceId,
    },
    ClearLogs,
}

/// Body of `run_command`, also accepted by `POST /api/commands`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub use_nlp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl RunCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            use_nlp: false,
            provider: None,
        }
    }

    pub fn into_request(self) -> SubmitRequest {
        let mut request = SubmitRequest::new(self.command);
        request.cwd = self.cwd;
        request.use_nlp = self.use_nlp || self.provider.is_some();
        request.provider = self.provider;
        request
    }
}

/// Replies to client frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Ack {
        request_id: Option<String>,
        result: serde_json::Value,
    },
    Error {
        request_id: Option<String>,
        code: String,
        message: String,
    },
    Pong {
        request_id: Option<String>,
    },
}

/// A reply stamped with the store version it was produced at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyFrame {
    pub version: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub reply: Reply,
}

impl ReplyFrame {
    pub fn new(version: u64, reply: Reply) -> Self {
        Self {
            version,
            timestamp: chrono::Utc::now(),
            reply,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Any server frame, as seen by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub version: u64,
    pub timestamp: String,
}

impl ServerFrame {
    pub fn request_id(&self) -> Option<&str> {
        self.data.get("request_id").and_then(|v| v.as_str())
    }
}

/// Bounded memory of request ids seen on one connection
#[derive(Debug)]
pub struct RecentRequests {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record an id; false when it was already seen
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_frames() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"approve","approval_id":"apr_1","request_id":"r1"}"#)
                .unwrap();
        assert_eq!(frame.request_id.as_deref(), Some("r1"));
        assert_eq!(
            frame.message,
            ClientMessage::Approve {
                approval_id: ApprovalId::from("apr_1")
            }
        );

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"get_state"}"#).unwrap();
        assert_eq!(frame.message, ClientMessage::GetState);
        assert!(frame.request_id.is_none());

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"run_command","command":"ls","use_nlp":true}"#).unwrap();
        match frame.message {
            ClientMessage::RunCommand(run) => {
                assert_eq!(run.command, "ls");
                assert!(run.use_nlp);
                assert!(run.cwd.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"format_disk"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"approve"}"#).is_err());
    }

    #[test]
    fn test_reply_wire_shape() {
        let frame = ReplyFrame::new(
            12,
            Reply::Error {
                request_id: Some("r9".to_string()),
                code: "approval_conflict".to_string(),
                message: "already resolved".to_string(),
            },
        );
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["version"], 12);
        assert_eq!(json["data"]["code"], "approval_conflict");
        assert_eq!(json["data"]["request_id"], "r9");

        let parsed: ServerFrame = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.request_id(), Some("r9"));
    }

    #[test]
    fn test_provider_implies_nlp() {
        let mut run = RunCommand::new("list files");
        run.provider = Some("ollama".to_string());
        let request = run.into_request();
        assert!(request.use_nlp);
        assert_eq!(request.text, "list files");
    }

    #[test]
    fn test_recent_requests_forget_oldest() {
        let mut recent = RecentRequests::new(2);
        assert!(recent.insert("a"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c"));
        assert!(recent.insert("a"));
        assert!(!recent.insert("c"));
    }
}
