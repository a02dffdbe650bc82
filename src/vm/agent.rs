//! In-guest agent protocol
//!
//! Line-delimited JSON request/reply with correlation ids so exec streams
//! never head-of-line-block control operations. A request produces exactly
//! one terminal message (`reply` or `exit`); streaming operations interleave
//! `stream` messages before the terminal one.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ExecSpec, StdStream};

/// Operations the agent understands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentOp {
    /// Create the in-guest container from a spec
    CreateContainer { spec: ExecSpec },

    /// Start a created container
    StartContainer { container_id: String },

    /// Deliver a signal
    SignalContainer { container_id: String, signal: String },

    /// Freeze / thaw
    PauseContainer { container_id: String },
    ResumeContainer { container_id: String },

    /// Remove in-guest state
    RemoveContainer { container_id: String },

    /// Await main-process exit; terminal message is `exit`
    WaitContainer { container_id: String },

    /// Run an auxiliary command; `stream` messages then `exit`
    ExecContainer {
        container_id: String,
        command: Vec<String>,
        env: Vec<String>,
        tty: bool,
    },

    /// Write to the main process stdin
    ContainerStdin { container_id: String, data_b64: String },

    /// Snapshot of a container record
    InspectContainer { container_id: String },

    /// All in-guest containers
    ListContainers,

    /// Recent log chunks
    FetchLogs { container_id: String, tail: Option<usize> },

    /// Resource usage
    ContainerStats { container_id: String },

    /// Apply new limits
    UpdateResources {
        container_id: String,
        resources: crate::backend::ResourceLimits,
    },

    /// Agent liveness / version probe
    Ping,
}

/// A framed request line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Correlation id echoed on every message for this request
    pub id: String,

    #[serde(flatten)]
    pub op: AgentOp,
}

impl AgentRequest {
    pub fn new(op: AgentOp) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op,
        }
    }
}

/// Message kinds flowing back from the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMessageKind {
    /// Terminal reply carrying a payload
    Reply,

    /// Interleaved output chunk
    Stream,

    /// Terminal exit notification for wait/exec
    Exit,
}

/// A framed response line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Correlation id of the originating request
    pub id: String,

    pub kind: AgentMessageKind,

    #[serde(default = "default_ok")]
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

fn default_ok() -> bool {
    true
}

impl AgentMessage {
    pub fn reply(id: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            kind: AgentMessageKind::Reply,
            ok: true,
            error: None,
            payload,
        }
    }

    pub fn error(id: &str, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            kind: AgentMessageKind::Reply,
            ok: false,
            error: Some(error.into()),
            payload: Value::Null,
        }
    }

    pub fn stream(id: &str, stream: StdStream, data: &[u8]) -> Self {
        Self {
            id: id.to_string(),
            kind: AgentMessageKind::Stream,
            ok: true,
            error: None,
            payload: serde_json::json!({
                "stream": stream,
                "data_b64": base64::engine::general_purpose::STANDARD.encode(data),
            }),
        }
    }

    pub fn exit(id: &str, exit_code: i64, oom_killed: bool) -> Self {
        Self {
            id: id.to_string(),
            kind: AgentMessageKind::Exit,
            ok: true,
            error: None,
            payload: serde_json::json!({
                "exit_code": exit_code,
                "oom_killed": oom_killed,
            }),
        }
    }

    /// Decode a `stream` payload
    pub fn decode_stream(&self) -> Option<(StdStream, Vec<u8>)> {
        if self.kind != AgentMessageKind::Stream {
            return None;
        }
        let stream = match self.payload.get("stream")?.as_str()? {
            "stdout" => StdStream::Stdout,
            "stderr" => StdStream::Stderr,
            _ => return None,
        };
        let data = base64::engine::general_purpose::STANDARD
            .decode(self.payload.get("data_b64")?.as_str()?)
            .ok()?;
        Some((stream, data))
    }

    /// Decode an `exit` payload
    pub fn decode_exit(&self) -> Option<crate::backend::ExitStatus> {
        if self.kind != AgentMessageKind::Exit {
            return None;
        }
        Some(crate::backend::ExitStatus {
            exit_code: self.payload.get("exit_code")?.as_i64()?,
            oom_killed: self
                .payload
                .get("oom_killed")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            vm_lost: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_roundtrip() {
        let request = AgentRequest::new(AgentOp::StartContainer {
            container_id: "abc".into(),
        });
        let line = serde_json::to_string(&request).unwrap();
        assert!(line.contains("\"op\":\"start_container\""));

        let back: AgentRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, request.id);
        assert!(matches!(back.op, AgentOp::StartContainer { container_id } if container_id == "abc"));
    }

    #[test]
    fn test_stream_roundtrip() {
        let msg = AgentMessage::stream("r1", StdStream::Stdout, b"hello\n");
        let line = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&line).unwrap();

        let (stream, data) = back.decode_stream().unwrap();
        assert_eq!(stream, StdStream::Stdout);
        assert_eq!(data, b"hello\n");
    }

    #[test]
    fn test_exit_roundtrip() {
        let msg = AgentMessage::exit("r1", 137, true);
        let exit = msg.decode_exit().unwrap();
        assert_eq!(exit.exit_code, 137);
        assert!(exit.oom_killed);
    }

    #[test]
    fn test_error_reply() {
        let msg = AgentMessage::error("r1", "no such container");
        assert!(!msg.ok);
        assert_eq!(msg.kind, AgentMessageKind::Reply);
    }
}
