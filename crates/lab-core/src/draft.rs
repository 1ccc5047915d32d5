use crate::coerce::{parse_typed, CoerceError};
use crate::resolve::normalize_key;
use lab_schemas::{Graduation, OverrideSet, RunMode, SessionRun, StartRequest, GRADUATION_KEY};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("invalid value for {key}: {source}")]
    Invalid {
        key: String,
        #[source]
        source: CoerceError,
    },
    #[error("graduation expects a positive trial count or a JSON object, got {0:?}")]
    Graduation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputOutcome {
    Set { key: String, value: Value },
    Cleared { removed: usize },
}

pub fn parse_graduation_input(raw: &str) -> Result<Value, InputError> {
    let text = raw.trim();
    if let Ok(n) = text.parse::<f64>() {
        if n.is_finite() && n.fract() == 0.0 && n >= 1.0 && n <= u64::MAX as f64 {
            return Ok(Graduation::NTrials {
                current_trial: n as u64,
            }
            .to_value());
        }
    }
    match serde_json::from_str::<Value>(text) {
        Ok(v @ Value::Object(_)) => Ok(v),
        _ => Err(InputError::Graduation(text.to_string())),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideDraft {
    steps: OverrideSet,
    dirty: bool,
}

impl OverrideDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_empty(&self) -> bool {
        self.steps.values().all(|m| m.is_empty())
    }

    pub fn step(&self, step_index: usize) -> Option<&Map<String, Value>> {
        self.steps.get(&step_index)
    }

    pub fn steps(&self) -> &OverrideSet {
        &self.steps
    }

    pub fn get(&self, step_index: usize, key: &str) -> Option<(&str, &Value)> {
        let id = normalize_key(key);
        self.steps
            .get(&step_index)?
            .iter()
            .find(|(k, _)| normalize_key(k) == id)
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn set(&mut self, step_index: usize, key: &str, value: Value) {
        let entry = self.steps.entry(step_index).or_default();
        remove_all_casings(entry, key);
        entry.insert(key.to_string(), value);
        self.dirty = true;
    }

    pub fn clear(&mut self, step_index: usize, key: &str) -> usize {
        self.dirty = true;
        let Some(entry) = self.steps.get_mut(&step_index) else {
            return 0;
        };
        let removed = remove_all_casings(entry, key);
        if entry.is_empty() {
            self.steps.remove(&step_index);
        }
        removed
    }

    pub fn apply_input(
        &mut self,
        step_index: usize,
        key: &str,
        raw: &str,
        declared_type: Option<&str>,
    ) -> Result<InputOutcome, InputError> {
        if raw.trim().is_empty() {
            let removed = self.clear(step_index, key);
            debug!(step_index, key, removed, "override cleared");
            return Ok(InputOutcome::Cleared { removed });
        }
        let value = if normalize_key(key) == GRADUATION_KEY {
            parse_graduation_input(raw)?
        } else {
            parse_typed(raw, declared_type).map_err(|source| InputError::Invalid {
                key: key.to_string(),
                source,
            })?
        };
        self.set(step_index, key, value.clone());
        debug!(step_index, key, "override set");
        Ok(InputOutcome::Set {
            key: key.to_string(),
            value,
        })
    }

    // Only new runs carry overrides, and only when the draft was edited and
    // still holds at least one non-empty step.
    pub fn payload_for(&self, mode: RunMode) -> Option<OverrideSet> {
        if mode != RunMode::New || !self.dirty || self.is_empty() {
            return None;
        }
        let payload: OverrideSet = self
            .steps
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(i, m)| (*i, m.clone()))
            .collect();
        Some(payload)
    }

    pub fn reset(&mut self) {
        self.steps.clear();
        self.dirty = false;
    }
}

fn remove_all_casings(entry: &mut Map<String, Value>, key: &str) -> usize {
    let id = normalize_key(key);
    let doomed: Vec<String> = entry
        .keys()
        .filter(|k| normalize_key(k) == id)
        .cloned()
        .collect();
    for k in &doomed {
        entry.remove(k);
    }
    doomed.len()
}

pub type SharedDraft = Arc<Mutex<OverrideDraft>>;

#[derive(Debug, Default)]
pub struct DraftBook {
    drafts: Mutex<BTreeMap<i64, SharedDraft>>,
}

impl DraftBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self, session_id: i64) -> SharedDraft {
        self.drafts
            .lock()
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(OverrideDraft::new())))
            .clone()
    }

    pub fn existing(&self, session_id: i64) -> Option<SharedDraft> {
        self.drafts.lock().get(&session_id).cloned()
    }

    pub fn discard(&self, session_id: i64) {
        self.drafts.lock().remove(&session_id);
    }
}

pub fn start_request(pilot_id: i64, mode: RunMode, draft: Option<&OverrideDraft>) -> StartRequest {
    StartRequest {
        pilot_id,
        mode,
        overrides: draft.and_then(|d| d.payload_for(mode)),
    }
}

pub fn recorded_overrides(run: Option<&SessionRun>) -> Option<&OverrideSet> {
    run.and_then(|r| r.overrides.as_ref())
        .filter(|o| o.values().any(|m| !m.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{resolve_step, ValueSource};
    use lab_schemas::{ParamDescriptor, ProtocolStep, RunStatus, TaskSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn nafc_spec() -> TaskSpec {
        let mut params = BTreeMap::new();
        params.insert(
            "iti".to_string(),
            ParamDescriptor {
                tag: None,
                value_type: Some("int".to_string()),
                default: Some(json!(500)),
            },
        );
        params.insert(
            "bias".to_string(),
            ParamDescriptor {
                tag: None,
                value_type: Some("float".to_string()),
                default: Some(json!(0.5)),
            },
        );
        TaskSpec {
            name: "Nafc".to_string(),
            params,
        }
    }

    fn empty_step() -> ProtocolStep {
        ProtocolStep {
            id: None,
            order_index: 0,
            step_name: "nafc".to_string(),
            task_type: "Nafc".to_string(),
            params: Some(Map::new()),
        }
    }

    #[test]
    fn override_then_clear_restores_default() {
        let spec = nafc_spec();
        let step = empty_step();
        let mut draft = OverrideDraft::new();

        let before = resolve_step(&step, Some(&spec), draft.step(0));
        let iti = before.iter().find(|r| r.key == "iti").expect("iti row");
        assert_eq!(iti.shown_text(), "500");
        assert_eq!(iti.effective.source, ValueSource::Default);

        draft.apply_input(0, "ITI", "700", Some("int")).expect("valid");
        let during = resolve_step(&step, Some(&spec), draft.step(0));
        assert_eq!(during.iter().find(|r| r.key == "iti").map(|r| r.shown_text()), Some("700".to_string()));

        draft.apply_input(0, "ITI", "  ", Some("int")).expect("clear");
        let after = resolve_step(&step, Some(&spec), draft.step(0));
        assert_eq!(after, before);
        assert!(draft.is_dirty());
    }

    #[test]
    fn writing_any_casing_replaces_all_others() {
        let mut draft = OverrideDraft::new();
        draft.set(0, "iti", json!(600));
        draft.set(0, "ITI", json!(650));
        draft.set(0, "Iti", json!(700));
        let step = draft.step(0).expect("step");
        assert_eq!(step.len(), 1);
        assert_eq!(draft.get(0, "iTI"), Some(("Iti", &json!(700))));
    }

    #[test]
    fn clearing_one_key_keeps_the_others() {
        let mut draft = OverrideDraft::new();
        draft.set(0, "ITI", json!(700));
        draft.set(0, "bias", json!(0.2));
        draft.set(1, "iti", json!(900));
        assert_eq!(draft.clear(0, "iti"), 1);
        assert_eq!(draft.get(0, "bias"), Some(("bias", &json!(0.2))));
        assert_eq!(draft.get(1, "ITI"), Some(("iti", &json!(900))));
        assert_eq!(draft.get(0, "ITI"), None);
    }

    #[test]
    fn invalid_input_leaves_draft_unchanged() {
        let mut draft = OverrideDraft::new();
        draft.set(0, "iti", json!(600));
        let snapshot = draft.clone();
        let err = draft
            .apply_input(0, "iti", "fast", Some("int"))
            .expect_err("not an int");
        assert!(matches!(err, InputError::Invalid { .. }));
        assert_eq!(draft, snapshot);
    }

    #[test]
    fn graduation_input_rewrites_trial_count() {
        assert_eq!(
            parse_graduation_input("5"),
            Ok(json!({ "type": "NTrials", "value": { "current_trial": 5 } }))
        );
        assert!(parse_graduation_input("0").is_err());
        assert!(parse_graduation_input("-1").is_err());
        assert!(parse_graduation_input("2.5").is_err());
        assert!(parse_graduation_input("[1]").is_err());
        assert_eq!(
            parse_graduation_input(r#"{"type":"NTrials","value":{"current_trial":8}}"#),
            Ok(json!({ "type": "NTrials", "value": { "current_trial": 8 } }))
        );

        let mut draft = OverrideDraft::new();
        draft.apply_input(2, "Graduation", "5", None).expect("graduation");
        assert_eq!(
            draft.get(2, "graduation").map(|(_, v)| v.clone()),
            Some(json!({ "type": "NTrials", "value": { "current_trial": 5 } }))
        );
        assert!(draft.apply_input(2, "graduation", "0", None).is_err());
    }

    #[test]
    fn resume_and_restart_never_carry_overrides() {
        let mut draft = OverrideDraft::new();
        draft.set(0, "iti", json!(700));
        assert!(draft.is_dirty());
        assert_eq!(start_request(1, RunMode::Resume, Some(&draft)).overrides, None);
        assert_eq!(start_request(1, RunMode::Restart, Some(&draft)).overrides, None);
        let new_run = start_request(1, RunMode::New, Some(&draft));
        assert_eq!(
            new_run.overrides.and_then(|o| o.get(&0).cloned()),
            json!({ "iti": 700 }).as_object().cloned()
        );
    }

    #[test]
    fn new_run_needs_dirty_and_non_empty() {
        let clean = OverrideDraft::new();
        assert_eq!(clean.payload_for(RunMode::New), None);

        let mut cleared = OverrideDraft::new();
        cleared.set(0, "iti", json!(700));
        cleared.clear(0, "iti");
        assert!(cleared.is_dirty());
        assert_eq!(cleared.payload_for(RunMode::New), None);

        let mut reset = OverrideDraft::new();
        reset.set(0, "iti", json!(700));
        reset.reset();
        assert_eq!(reset.payload_for(RunMode::New), None);
    }

    #[test]
    fn draft_book_hands_out_the_same_draft() {
        let book = DraftBook::new();
        let modal = book.draft(7);
        let panel = book.draft(7);
        modal.lock().set(0, "iti", json!(700));
        assert_eq!(panel.lock().get(0, "ITI").map(|(_, v)| v.clone()), Some(json!(700)));
        assert!(book.existing(8).is_none());
        book.discard(7);
        assert!(book.existing(7).is_none());
    }

    #[test]
    fn recorded_overrides_are_display_only() {
        let run = SessionRun {
            id: 1,
            session_id: 7,
            pilot_id: 2,
            subject_key: "bp_s7_r1".to_string(),
            status: RunStatus::Stopped,
            mode: Some(RunMode::New),
            started_at: None,
            ended_at: None,
            progress: None,
            overrides: serde_json::from_value(json!({ "0": { "iti": 800 } })).ok(),
        };
        assert!(recorded_overrides(Some(&run)).is_some());
        let book = DraftBook::new();
        let draft = book.draft(7);
        assert!(draft.lock().is_empty());
        assert!(!draft.lock().is_dirty());
    }
}
