use lab_schemas::{PilotSnapshot, PilotState};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PilotView {
    pub connected: bool,
    pub state: Option<String>,
    pub active_run_id: Option<i64>,
    pub active_session_id: Option<i64>,
}

impl From<&PilotState> for PilotView {
    fn from(p: &PilotState) -> Self {
        Self {
            connected: p.connected,
            state: p.state.clone(),
            active_run_id: p.active_run.as_ref().map(|r| r.id),
            active_session_id: p.active_session(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PilotChange {
    pub pilot: String,
    pub before: Option<PilotView>,
    pub after: Option<PilotView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PilotChangeSet {
    pub initial: bool,
    pub changes: Vec<PilotChange>,
}

impl PilotChangeSet {
    pub fn is_empty(&self) -> bool {
        !self.initial && self.changes.is_empty()
    }

    pub fn pilots(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.pilot.as_str())
    }
}

pub fn project(snapshot: &PilotSnapshot) -> BTreeMap<String, PilotView> {
    snapshot
        .iter()
        .map(|(name, state)| (name.clone(), PilotView::from(state)))
        .collect()
}

fn diff_views(
    prev: &BTreeMap<String, PilotView>,
    next: &BTreeMap<String, PilotView>,
) -> Vec<PilotChange> {
    let mut names: Vec<&String> = prev.keys().chain(next.keys()).collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .filter_map(|name| {
            let before = prev.get(name);
            let after = next.get(name);
            (before != after).then(|| PilotChange {
                pilot: name.clone(),
                before: before.cloned(),
                after: after.cloned(),
            })
        })
        .collect()
}

pub fn diff_snapshots(prev: &PilotSnapshot, next: &PilotSnapshot) -> PilotChangeSet {
    PilotChangeSet {
        initial: false,
        changes: diff_views(&project(prev), &project(next)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PilotScope {
    All,
    Pilot(String),
}

impl PilotScope {
    fn admits(&self, name: &str) -> bool {
        match self {
            PilotScope::All => true,
            PilotScope::Pilot(p) => p == name,
        }
    }
}

#[derive(Debug)]
pub struct PilotMonitor {
    scope: PilotScope,
    applied: Option<BTreeMap<String, PilotView>>,
    latest: PilotSnapshot,
}

impl PilotMonitor {
    pub fn new(scope: PilotScope) -> Self {
        Self {
            scope,
            applied: None,
            latest: PilotSnapshot::new(),
        }
    }

    pub fn scope(&self) -> &PilotScope {
        &self.scope
    }

    pub fn observe(&mut self, snapshot: PilotSnapshot) -> Option<PilotChangeSet> {
        let scoped: PilotSnapshot = snapshot
            .into_iter()
            .filter(|(name, _)| self.scope.admits(name))
            .collect();
        let next = project(&scoped);
        self.latest = scoped;
        let set = match self.applied.as_ref() {
            None => PilotChangeSet {
                initial: true,
                changes: diff_views(&BTreeMap::new(), &next),
            },
            Some(prev) => PilotChangeSet {
                initial: false,
                changes: diff_views(prev, &next),
            },
        };
        if set.is_empty() {
            trace!("pilot snapshot unchanged");
            return None;
        }
        self.applied = Some(next);
        Some(set)
    }

    pub fn latest(&self) -> &PilotSnapshot {
        &self.latest
    }

    pub fn pilot(&self, name: &str) -> Option<&PilotState> {
        self.latest.get(name)
    }
}
