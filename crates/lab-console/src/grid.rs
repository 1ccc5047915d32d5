use crate::render;
use lab_core::{PilotChangeSet, PilotMonitor, PilotScope};
use lab_schemas::PilotSnapshot;
use tracing::debug;

pub struct PilotGrid {
    monitor: PilotMonitor,
    html: String,
    renders: usize,
}

impl Default for PilotGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl PilotGrid {
    pub fn new() -> Self {
        Self {
            monitor: PilotMonitor::new(PilotScope::All),
            html: String::new(),
            renders: 0,
        }
    }

    pub fn apply(&mut self, snapshot: PilotSnapshot) -> Result<Option<PilotChangeSet>, askama::Error> {
        let Some(changes) = self.monitor.observe(snapshot) else {
            return Ok(None);
        };
        self.html = render::pilot_grid(self.monitor.latest())?;
        self.renders += 1;
        debug!(pilots = changes.changes.len(), renders = self.renders, "pilot grid rendered");
        Ok(Some(changes))
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn renders(&self) -> usize {
        self.renders
    }

    pub fn snapshot(&self) -> &PilotSnapshot {
        self.monitor.latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_schemas::PilotState;

    fn snap(connected: bool) -> PilotSnapshot {
        let mut s = PilotSnapshot::new();
        s.insert(
            "rig-a".into(),
            PilotState {
                connected,
                ..PilotState::default()
            },
        );
        s
    }

    #[test]
    fn renders_only_on_change() {
        let mut grid = PilotGrid::new();
        assert!(grid.apply(snap(true)).expect("render").is_some());
        assert!(grid.apply(snap(true)).expect("render").is_none());
        assert_eq!(grid.renders(), 1);
        assert!(grid.html().contains("online"));

        let gone = grid.apply(PilotSnapshot::new()).expect("render").expect("changes");
        assert!(!gone.initial);
        assert_eq!(grid.renders(), 2);
    }
}
