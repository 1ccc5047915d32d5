use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type PilotSnapshot = BTreeMap<String, PilotState>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub id: i64,
    pub session_id: i64,
    #[serde(default)]
    pub subject_key: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PilotState {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub active_run: Option<ActiveRun>,
    #[serde(default)]
    pub last_seen_sec: Option<f64>,
    #[serde(default)]
    pub ip: Option<String>,
}

impl PilotState {
    pub fn active_session(&self) -> Option<i64> {
        self.active_run.as_ref().map(|r| r.session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PilotRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub prefs: Option<Value>,
}
