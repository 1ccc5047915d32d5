use crate::page::ConsolePage;
use crate::visibility::VisibilityObserver;
use anyhow::{anyhow, Result};
use futures::future::join_all;
use lab_core::{
    recorded_overrides, resolve_step, start_request, InputError, InputOutcome, ParamRow,
    PilotMonitor, PilotScope,
};
use lab_schemas::{
    display_timestamp, OverrideSet, PilotSnapshot, PilotState, Protocol, ProtocolStep, RunMode,
    RunProgress, RunStatus, SessionDetail, SessionRun, TaskCatalog, TaskSpec,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ButtonLabel {
    Start,
    Stop,
}

impl ButtonLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            ButtonLabel::Start => "START",
            ButtonLabel::Stop => "STOP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ButtonAction {
    Start { session_id: i64 },
    Stop { run_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionButton {
    pub label: ButtonLabel,
    pub enabled: bool,
    pub action: ButtonAction,
    pub hint: Option<&'static str>,
}

pub fn button_for(session_id: i64, pilot: Option<&PilotState>, in_flight: bool) -> ActionButton {
    let start = |enabled: bool, hint: Option<&'static str>| ActionButton {
        label: ButtonLabel::Start,
        enabled,
        action: ButtonAction::Start { session_id },
        hint,
    };
    let button = match pilot {
        None => start(false, Some("pilot offline")),
        Some(p) if !p.connected => start(false, Some("pilot offline")),
        Some(p) => match p.active_run.as_ref() {
            Some(run) if run.session_id == session_id => ActionButton {
                label: ButtonLabel::Stop,
                enabled: true,
                action: ButtonAction::Stop { run_id: run.id },
                hint: None,
            },
            Some(_) => start(false, Some("pilot busy")),
            None => start(true, None),
        },
    };
    if in_flight {
        ActionButton {
            enabled: false,
            hint: Some("working"),
            ..button
        }
    } else {
        button
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepPanel {
    pub order_index: usize,
    pub step_name: String,
    pub task_type: String,
    pub params: Vec<ParamRow>,
    #[serde(skip)]
    step: ProtocolStep,
    #[serde(skip)]
    spec: Option<TaskSpec>,
}

impl StepPanel {
    fn new(step: &ProtocolStep, spec: Option<&TaskSpec>, overrides: Option<&Map<String, Value>>) -> Self {
        Self {
            order_index: step.order_index,
            step_name: step.step_name.clone(),
            task_type: step.task_type.clone(),
            params: resolve_step(step, spec, overrides),
            step: step.clone(),
            spec: spec.cloned(),
        }
    }

    fn refresh(&mut self, overrides: Option<&Map<String, Value>>) {
        self.params = resolve_step(&self.step, self.spec.as_ref(), overrides);
    }

    pub fn param_row(&self, key: &str) -> Option<&ParamRow> {
        let id = lab_core::normalize_key(key);
        self.params
            .iter()
            .find(|r| lab_core::normalize_key(&r.key) == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCard {
    pub session_id: i64,
    pub title: String,
    pub protocol_id: i64,
    pub protocol_name: String,
    pub subjects: Vec<String>,
    pub started_at: Option<String>,
    pub latest_run_id: Option<i64>,
    pub status: Option<RunStatus>,
    pub mode: Option<RunMode>,
    pub progress: Option<RunProgress>,
    pub steps: Vec<StepPanel>,
    pub recorded_overrides: Option<OverrideSet>,
}

impl SessionCard {
    fn build(
        detail: &SessionDetail,
        protocol: &Protocol,
        latest: Option<&SessionRun>,
        catalog: &TaskCatalog,
        draft: Option<&OverrideSet>,
    ) -> Self {
        let steps = protocol
            .ordered_steps()
            .into_iter()
            .map(|step| {
                StepPanel::new(
                    step,
                    catalog.get(&step.task_type),
                    draft.and_then(|d| d.get(&step.order_index)),
                )
            })
            .collect();
        Self {
            session_id: detail.session_id,
            title: format!("Session {} · {}", detail.session_id, protocol.name),
            protocol_id: protocol.id,
            protocol_name: protocol.name.clone(),
            subjects: detail.subject_names().into_iter().map(str::to_string).collect(),
            started_at: latest
                .and_then(|r| r.started_at.as_deref())
                .or(detail.started_at.as_deref())
                .map(display_timestamp),
            latest_run_id: latest.map(|r| r.id),
            status: latest.map(|r| r.status),
            mode: latest.and_then(|r| r.mode),
            progress: latest.and_then(|r| r.progress.clone()),
            steps,
            recorded_overrides: recorded_overrides(latest).cloned(),
        }
    }

    pub fn step(&self, order_index: usize) -> Option<&StepPanel> {
        self.steps.iter().find(|s| s.order_index == order_index)
    }
}

#[derive(Debug, Clone)]
pub enum RowState {
    Placeholder,
    Hydrating,
    Hydrated(Box<SessionCard>),
    Failed { title: String, error: String },
    Removed,
}

impl RowState {
    pub fn is_hydrated(&self) -> bool {
        matches!(self, RowState::Hydrated(_))
    }
}

#[derive(Debug)]
struct Row {
    state: RowState,
    button: Option<ActionButton>,
    in_flight: bool,
}

#[derive(Debug, Default)]
struct Rows {
    order: Vec<i64>,
    by_id: BTreeMap<i64, Row>,
    observer: VisibilityObserver,
}

#[derive(Debug, Error)]
pub enum EditError {
    #[error("session {0} is not loaded yet")]
    NotLoaded(i64),
    #[error("session {session_id} has no step {step_index}")]
    UnknownStep { session_id: i64, step_index: usize },
    #[error(transparent)]
    Input(#[from] InputError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PressOutcome {
    Ignored,
    Started { run_id: Option<i64> },
    Stopped { run_id: i64 },
    Failed { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardUpdate {
    pub buttons: Vec<i64>,
}

impl BoardUpdate {
    pub fn is_empty(&self) -> bool {
        self.buttons.is_empty()
    }
}

pub struct SessionBoard {
    page: Arc<ConsolePage>,
    pilot: String,
    subject_filter: Option<String>,
    rows: Mutex<Rows>,
    monitor: Mutex<PilotMonitor>,
}

impl SessionBoard {
    pub fn new(page: Arc<ConsolePage>, pilot: &str, subject_filter: Option<&str>) -> Self {
        Self {
            page,
            pilot: pilot.to_string(),
            subject_filter: subject_filter
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty()),
            rows: Mutex::new(Rows::default()),
            monitor: Mutex::new(PilotMonitor::new(PilotScope::Pilot(pilot.to_string()))),
        }
    }

    pub fn pilot(&self) -> &str {
        &self.pilot
    }

    pub fn page(&self) -> &ConsolePage {
        &self.page
    }

    pub async fn populate(&self, force: bool) -> usize {
        let sessions = match self.page.sessions(force).await {
            Ok(s) => s,
            Err(_) => return 0,
        };
        let mut rows = self.rows.lock();
        *rows = Rows::default();
        for summary in sessions.iter() {
            let id = summary.session_id;
            rows.order.push(id);
            rows.by_id.insert(
                id,
                Row {
                    state: RowState::Placeholder,
                    button: None,
                    in_flight: false,
                },
            );
            rows.observer.observe(id);
        }
        debug!(rows = rows.order.len(), "session rows laid out");
        rows.order.len()
    }

    pub fn row_ids(&self) -> Vec<i64> {
        let rows = self.rows.lock();
        rows.order
            .iter()
            .copied()
            .filter(|id| !matches!(rows.by_id.get(id).map(|r| &r.state), Some(RowState::Removed) | None))
            .collect()
    }

    pub fn row_state(&self, session_id: i64) -> Option<RowState> {
        self.rows.lock().by_id.get(&session_id).map(|r| r.state.clone())
    }

    pub fn button(&self, session_id: i64) -> Option<ActionButton> {
        self.rows.lock().by_id.get(&session_id).and_then(|r| r.button.clone())
    }

    pub async fn reveal(&self, visible: &[i64]) -> Vec<i64> {
        let fresh = {
            let mut rows = self.rows.lock();
            let fresh = rows.observer.intersect(visible);
            for id in &fresh {
                if let Some(row) = rows.by_id.get_mut(id) {
                    row.state = RowState::Hydrating;
                }
            }
            fresh
        };
        join_all(fresh.iter().map(|id| self.hydrate(*id))).await;
        fresh
    }

    async fn hydrate(&self, session_id: i64) {
        let outcome = self.load_card(session_id).await;
        let pilot = self.monitor.lock().pilot(&self.pilot).cloned();
        let mut rows = self.rows.lock();
        let Some(row) = rows.by_id.get_mut(&session_id) else {
            return;
        };
        match outcome {
            Ok(Some(card)) => {
                row.button = Some(button_for(session_id, pilot.as_ref(), row.in_flight));
                row.state = RowState::Hydrated(Box::new(card));
            }
            Ok(None) => {
                debug!(session_id, "row removed");
                row.state = RowState::Removed;
            }
            Err(e) => {
                warn!(session_id, error = %e, "hydration failed");
                row.state = RowState::Failed {
                    title: format!("Session {} (failed to load)", session_id),
                    error: e.to_string(),
                };
            }
        }
    }

    fn passes_filter(&self, detail: &SessionDetail) -> bool {
        match &self.subject_filter {
            None => true,
            Some(f) => detail
                .subject_names()
                .iter()
                .any(|name| name.to_lowercase().contains(f.as_str())),
        }
    }

    async fn load_card(&self, session_id: i64) -> Result<Option<SessionCard>> {
        let detail = self
            .page
            .session_detail(session_id)
            .await
            .found()
            .ok_or_else(|| anyhow!("session {} not found", session_id))?;
        if detail.runs.is_empty() || !self.passes_filter(&detail) {
            return Ok(None);
        }
        let protocol_id = detail
            .protocol_id()
            .ok_or_else(|| anyhow!("session {} has no protocol", session_id))?;
        let protocol = self
            .page
            .protocol(protocol_id)
            .await
            .found()
            .ok_or_else(|| anyhow!("protocol {} not found", protocol_id))?;
        let pilot_id = self
            .page
            .pilot_id(&self.pilot)
            .await?
            .ok_or_else(|| anyhow!("pilot {} is not registered", self.pilot))?;
        let latest = self
            .page
            .limiter()
            .run(self.page.api().latest_run(session_id, pilot_id))
            .await?;
        let catalog = self.page.task_catalog(false).await?;
        let draft = self
            .page
            .drafts()
            .existing(session_id)
            .map(|d| d.lock().steps().clone());
        Ok(Some(SessionCard::build(
            &detail,
            &protocol,
            latest.as_ref(),
            &catalog,
            draft.as_ref(),
        )))
    }

    pub fn apply_pilot_state(&self, snapshot: PilotSnapshot) -> BoardUpdate {
        let pilot = {
            let mut monitor = self.monitor.lock();
            if monitor.observe(snapshot).is_none() {
                return BoardUpdate::default();
            }
            monitor.pilot(&self.pilot).cloned()
        };
        let mut rows = self.rows.lock();
        let Rows { order, by_id, .. } = &mut *rows;
        let mut update = BoardUpdate::default();
        for id in order.iter() {
            let Some(row) = by_id.get_mut(id) else {
                continue;
            };
            if !row.state.is_hydrated() {
                continue;
            }
            let next = button_for(*id, pilot.as_ref(), row.in_flight);
            if row.button.as_ref() != Some(&next) {
                row.button = Some(next);
                update.buttons.push(*id);
            }
        }
        update
    }

    pub fn edit_override(
        &self,
        session_id: i64,
        step_index: usize,
        key: &str,
        raw: &str,
    ) -> Result<InputOutcome, EditError> {
        let mut rows = self.rows.lock();
        let card = match rows.by_id.get_mut(&session_id).map(|r| &mut r.state) {
            Some(RowState::Hydrated(card)) => card,
            _ => return Err(EditError::NotLoaded(session_id)),
        };
        let panel = card
            .steps
            .iter_mut()
            .find(|s| s.order_index == step_index)
            .ok_or(EditError::UnknownStep {
                session_id,
                step_index,
            })?;
        // Stored under the card's casing so the payload matches what is displayed.
        let (key, declared) = match panel.param_row(key) {
            Some(row) => (row.key.clone(), row.value_type.clone()),
            None => (key.trim().to_string(), None),
        };
        let shared = self.page.drafts().draft(session_id);
        let mut draft = shared.lock();
        let outcome = draft.apply_input(step_index, &key, raw, declared.as_deref())?;
        panel.refresh(draft.step(step_index));
        Ok(outcome)
    }

    // Dispatches the row's bound action. The button stays disabled until the call returns.
    pub async fn press(&self, session_id: i64, mode: RunMode) -> PressOutcome {
        let action = {
            let mut rows = self.rows.lock();
            let Some(row) = rows.by_id.get_mut(&session_id) else {
                return PressOutcome::Ignored;
            };
            let Some(button) = row.button.clone() else {
                return PressOutcome::Ignored;
            };
            if !button.enabled || row.in_flight {
                return PressOutcome::Ignored;
            }
            row.in_flight = true;
            row.button = Some(ActionButton {
                enabled: false,
                hint: Some("working"),
                ..button.clone()
            });
            button.action
        };

        let outcome = match action {
            ButtonAction::Start { session_id } => self.start(session_id, mode).await,
            ButtonAction::Stop { run_id } => self.stop(run_id).await,
        };

        let pilot = self.monitor.lock().pilot(&self.pilot).cloned();
        if let Some(row) = self.rows.lock().by_id.get_mut(&session_id) {
            row.in_flight = false;
            row.button = Some(button_for(session_id, pilot.as_ref(), false));
        }
        outcome
    }

    async fn start(&self, session_id: i64, mode: RunMode) -> PressOutcome {
        let pilot_id = match self.page.pilot_id(&self.pilot).await {
            Ok(Some(id)) => id,
            Ok(None) => return self.fail(format!("pilot {} is not registered", self.pilot)),
            Err(e) => return self.fail(format!("start failed: {}", e)),
        };
        match self.page.api().start_options(session_id, pilot_id).await {
            Ok(options) if !options.allows(mode) => {
                return self.fail(format!("{} is not available for session {}", mode, session_id));
            }
            Ok(_) => {}
            Err(e) => debug!(session_id, error = %e, "start options unavailable"),
        }
        let draft = self.page.drafts().existing(session_id);
        let request = {
            let guard = draft.as_ref().map(|d| d.lock());
            start_request(pilot_id, mode, guard.as_deref())
        };
        match self.page.api().start_on_pilot(session_id, &request).await {
            Ok(resp) if resp.is_started() => {
                if let (Some(_), Some(d)) = (&request.overrides, &draft) {
                    let mut rows = self.rows.lock();
                    d.lock().reset();
                    if let Some(RowState::Hydrated(card)) =
                        rows.by_id.get_mut(&session_id).map(|r| &mut r.state)
                    {
                        for panel in card.steps.iter_mut() {
                            panel.refresh(None);
                        }
                    }
                }
                info!(session_id, pilot = %self.pilot, %mode, run_id = ?resp.run_id, "run started");
                self.page.set_status(match resp.run_id {
                    Some(run_id) => format!("started run {}", run_id),
                    None => "run started".to_string(),
                });
                PressOutcome::Started {
                    run_id: resp.run_id,
                }
            }
            Ok(resp) => self.fail(format!(
                "start failed: {}",
                resp.message.unwrap_or(resp.status)
            )),
            Err(e) => self.fail(format!("start failed: {}", e)),
        }
    }

    async fn stop(&self, run_id: i64) -> PressOutcome {
        match self.page.api().stop_run(run_id).await {
            Ok(_) => {
                info!(run_id, pilot = %self.pilot, "run stopped");
                self.page.set_status(format!("stopped run {}", run_id));
                PressOutcome::Stopped { run_id }
            }
            Err(e) => self.fail(format!("stop failed: {}", e)),
        }
    }

    fn fail(&self, message: String) -> PressOutcome {
        warn!(pilot = %self.pilot, %message, "action failed");
        self.page.set_status(message.clone());
        PressOutcome::Failed { message }
    }
}
