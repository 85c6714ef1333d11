//! Coordinator <-> agent wire protocol: a framed JSON conversation over a
//! single long-lived WebSocket connection at path `/ws`. Frames are strictly
//! request -> response, driven by the coordinator; the agent never
//! initiates.

use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PROTOCOL_VERSION: i64 = 1;

/// Sent once by the coordinator immediately after the WebSocket upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorHello {
    pub id: String,
    pub secret: String,
    pub version: i64,
}

/// The agent's reply to a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHello {
    pub time: DateTime<Utc>,
}

/// A typed flag value, replacing the reflection-based flag round-trip of
/// the original tool with an explicit tagged variant (spec §9 REDESIGN).
/// The coordinator serializes each set flag to its canonical string form;
/// the agent re-parses it into the reconstructed command's flag set using
/// the type the command registry declares for that flag name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum FlagValue {
    String(String),
    Bool(bool),
    Int64(i64),
    Int(i32),
    Uint(u32),
    Uint64(u64),
    Float64(f64),
    /// Serialized as a Go-style duration string ("5s", "1m30s") rather than
    /// nanoseconds, so the canonical string form round-trips through the
    /// CLI parser too.
    Duration(std::time::Duration),
}

impl FlagValue {
    /// Canonical string form sent over the wire in `BenchmarkCommand::flags`.
    pub fn to_canonical_string(&self) -> String {
        match self {
            FlagValue::String(s) => s.clone(),
            FlagValue::Bool(b) => b.to_string(),
            FlagValue::Int64(i) => i.to_string(),
            FlagValue::Int(i) => i.to_string(),
            FlagValue::Uint(u) => u.to_string(),
            FlagValue::Uint64(u) => u.to_string(),
            FlagValue::Float64(f) => f.to_string(),
            FlagValue::Duration(d) => crate::cli::format_duration(*d),
        }
    }
}

/// Coordinator-only flags that are never forwarded to agents because they
/// have no meaning outside the coordinator process.
pub const COORDINATOR_ONLY_FLAGS: &[&str] = &[
    "warp-client",
    "agents",
    "serverprof",
    "autocompletion",
    "help",
    "syncstart",
    "analyze.out",
    "inspect.out",
];

/// A benchmark invocation forwarded to an agent: the workload command name
/// plus its positional args and canonicalized flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkCommand {
    pub command: String,
    pub args: Vec<String>,
    pub flags: HashMap<String, String>,
}

impl BenchmarkCommand {
    /// Build a command from a full flag map, dropping coordinator-only
    /// flags and converting every remaining `FlagValue` to its canonical
    /// string form.
    pub fn new(command: impl Into<String>, args: Vec<String>, flags: &HashMap<String, FlagValue>) -> Self {
        let flags = flags
            .iter()
            .filter(|(name, _)| !COORDINATOR_ONLY_FLAGS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.to_canonical_string()))
            .collect();
        Self {
            command: command.into(),
            args,
            flags,
        }
    }
}

/// A request frame sent by the coordinator to a single agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerRequest {
    Disconnect,
    Benchmark { benchmark: BenchmarkCommand },
    StartStage { stage: Stage, start_time: DateTime<Utc> },
    StageStatus { stage: Stage },
    SendOps,
    /// Additive extension noted in the design notes: returns only ops
    /// appended since `idx`, avoiding the quadratic cost of re-sending the
    /// whole store on every poll of a long-running benchmark.
    SendOpsSince { idx: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageInfo {
    pub started: bool,
    pub finished: bool,
    pub progress: Option<f64>,
    pub custom: Option<HashMap<String, String>>,
}

/// Every agent reply, regardless of which request triggered it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentResponse {
    BenchmarkStarted {
        time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        err: String,
    },
    BenchmarkStatus {
        time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        err: String,
        stage_info: StageInfo,
    },
    Ops {
        time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        err: String,
        ops: Vec<crate::oplog::OpLog>,
        /// Present only for `send_ops_since` replies: the store length at
        /// the time of the snapshot, so the caller can compute the next
        /// cursor.
        #[serde(default)]
        next_idx: Option<usize>,
    },
}

impl AgentResponse {
    pub fn err(&self) -> &str {
        match self {
            AgentResponse::BenchmarkStarted { err, .. } => err,
            AgentResponse::BenchmarkStatus { err, .. } => err,
            AgentResponse::Ops { err, .. } => err,
        }
    }

    pub fn is_err(&self) -> bool {
        !self.err().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn coordinator_only_flags_are_dropped() {
        let mut flags = HashMap::new();
        flags.insert("concurrent".to_string(), FlagValue::Int64(32));
        flags.insert("agents".to_string(), FlagValue::String("a,b".to_string()));
        let cmd = BenchmarkCommand::new("get", vec![], &flags);
        assert!(cmd.flags.contains_key("concurrent"));
        assert!(!cmd.flags.contains_key("agents"));
    }

    #[test]
    fn flag_value_canonical_roundtrip_shapes() {
        assert_eq!(FlagValue::Bool(true).to_canonical_string(), "true");
        assert_eq!(FlagValue::Int64(-5).to_canonical_string(), "-5");
        assert_eq!(
            FlagValue::Duration(Duration::from_secs(5)).to_canonical_string(),
            "5s"
        );
    }

    #[test]
    fn server_request_serializes_with_op_tag() {
        let req = ServerRequest::StageStatus { stage: Stage::Prepare };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["op"], "stage_status");
        assert_eq!(v["stage"], "prepare");
    }
}
