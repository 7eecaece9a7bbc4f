//! Signal value types: metrics, events, sessions. No behavior lives here —
//! see `store` for the live-view semantics built on top of these.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unordered string attribute bag. Empty maps must not allocate — `HashMap`
/// satisfies that (new() doesn't allocate until the first insert).
pub type Attributes = HashMap<String, String>;

/// Bucket id used when a signal arrives with no recognizable `session.id`.
pub const UNKNOWN_SESSION: &str = "unknown";

// Well-known signal names the statistics calculator and store special-case.
pub const METRIC_SESSION_COUNT: &str = "claude_code.session.count";
pub const METRIC_COST_USAGE: &str = "claude_code.cost.usage";
pub const METRIC_TOKEN_USAGE: &str = "claude_code.token.usage";
pub const METRIC_ACTIVE_TIME_TOTAL: &str = "claude_code.active_time.total";
pub const METRIC_LINES_OF_CODE: &str = "claude_code.lines_of_code.count";
pub const METRIC_COMMIT_COUNT: &str = "claude_code.commit.count";
pub const METRIC_PULL_REQUEST_COUNT: &str = "claude_code.pull_request.count";
pub const METRIC_CODE_EDIT_DECISION: &str = "claude_code.code_edit_tool.decision";

pub const EVENT_API_REQUEST: &str = "claude_code.api_request";
pub const EVENT_API_ERROR: &str = "claude_code.api_error";
pub const EVENT_TOOL_RESULT: &str = "claude_code.tool_result";
pub const EVENT_TOOL_DECISION: &str = "claude_code.tool_decision";

/// A numeric data point tied to a name and attributes. Semantically
/// cumulative unless the caller knows otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub attributes: Attributes,
    pub timestamp: DateTime<Utc>,
}

/// A named, attribute-bearing log record. `sequence` orders events within a
/// session when present; `0` means "no ordering hint".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: i64,
}

impl Event {
    /// Build an event, deriving `sequence` from the `event.sequence`
    /// attribute if present (parse failure falls back to 0).
    pub fn new(name: impl Into<String>, attributes: Attributes, timestamp: DateTime<Utc>) -> Self {
        let sequence = attributes
            .get("event.sequence")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Self {
            name: name.into(),
            attributes,
            timestamp,
            sequence,
        }
    }
}

/// Canonical string identifying a `(name, attributes)` family, used both as
/// the counter-reset tracking key in memory and as the `counter_state`
/// primary key on disk.
pub fn metric_key(name: &str, attributes: &Attributes) -> String {
    if attributes.is_empty() {
        return name.to_string();
    }
    let mut pairs: Vec<String> = attributes.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    format!("{name}|{}", pairs.join(","))
}

/// Derived lifecycle/presence state for a session, computed from `exited`
/// and time elapsed since `last_event_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Exited,
    Active,
    Idle,
    Done,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Exited => "exited",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Done => "done",
        };
        f.write_str(s)
    }
}

/// One interactive CLI run, keyed by an opaque `session.id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub pid: Option<u32>,
    pub terminal: Option<String>,
    pub working_dir: Option<String>,
    pub model: Option<String>,
    pub organization_id: Option<String>,
    pub user_account_uuid: Option<String>,

    pub total_cost: f64,
    pub total_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub active_time_secs: f64,

    pub started_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub exited: bool,
    pub fast_mode: bool,

    pub service_version: Option<String>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub host_arch: Option<String>,

    pub metrics: Vec<Metric>,
    pub events: Vec<Event>,

    /// Last observed value per metric key, for cumulative-counter deltas.
    pub previous_values: HashMap<String, f64>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.exited {
            return SessionStatus::Exited;
        }
        match self.last_event_at {
            None => SessionStatus::Done,
            Some(last) => {
                let elapsed = (now - last).num_seconds();
                if elapsed <= 30 {
                    SessionStatus::Active
                } else if elapsed <= 300 {
                    SessionStatus::Idle
                } else {
                    SessionStatus::Done
                }
            }
        }
    }
}
