use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub type OverrideSet = BTreeMap<usize, Map<String, Value>>;

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

pub fn display_timestamp(raw: &str) -> String {
    match parse_timestamp(raw) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => raw.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub current_run_id: Option<i64>,
    #[serde(default)]
    pub next_protocol_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectCreate {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: i64,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub n_runs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRun {
    pub run_id: i64,
    pub subject_id: i64,
    pub subject_name: String,
    pub protocol_id: i64,
    #[serde(default)]
    pub protocol_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session_id: i64,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub n_runs: usize,
    #[serde(default)]
    pub runs: Vec<SubjectRun>,
}

impl SessionDetail {
    pub fn protocol_id(&self) -> Option<i64> {
        self.runs.first().map(|r| r.protocol_id)
    }

    pub fn subject_names(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.subject_name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[serde(alias = "not_run")]
    Pending,
    Running,
    Stopped,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Resume,
    Restart,
    New,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Resume => "resume",
            RunMode::Restart => "restart",
            RunMode::New => "new",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    #[serde(default)]
    pub current_step_idx: usize,
    #[serde(default)]
    pub current_trial: u64,
    #[serde(default)]
    pub graduation_type: Option<String>,
    #[serde(default)]
    pub graduation_params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRun {
    pub id: i64,
    pub session_id: i64,
    pub pilot_id: i64,
    #[serde(default)]
    pub subject_key: String,
    pub status: RunStatus,
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub progress: Option<RunProgress>,
    #[serde(default)]
    pub overrides: Option<OverrideSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub can_resume: bool,
    #[serde(default)]
    pub can_restart: bool,
    #[serde(default = "default_true")]
    pub can_start_new: bool,
    #[serde(default)]
    pub latest_run: Option<SessionRun>,
}

fn default_true() -> bool {
    true
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            can_resume: false,
            can_restart: false,
            can_start_new: true,
            latest_run: None,
        }
    }
}

impl StartOptions {
    pub fn allows(&self, mode: RunMode) -> bool {
        match mode {
            RunMode::Resume => self.can_resume,
            RunMode::Restart => self.can_restart,
            RunMode::New => self.can_start_new,
        }
    }

    pub fn allowed_modes(&self) -> Vec<RunMode> {
        [RunMode::Resume, RunMode::Restart, RunMode::New]
            .into_iter()
            .filter(|m| self.allows(*m))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub pilot_id: i64,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<OverrideSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub status: String,
    #[serde(default)]
    pub run_id: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StartResponse {
    // The proxy reports orchestrator failures with a 200 and `status: "error"`.
    pub fn is_started(&self) -> bool {
        self.status != "error"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: String,
    #[serde(default)]
    pub run_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignProtocol {
    pub protocol_id: i64,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignResult {
    pub status: String,
    #[serde(default)]
    pub assigned: usize,
    #[serde(default)]
    pub session: Option<Value>,
}
