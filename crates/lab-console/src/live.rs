use crate::board::{BoardUpdate, SessionBoard};
use crate::grid::PilotGrid;
use anyhow::Result;
use lab_client::{FeedError, PilotFeed};
use lab_core::PilotChangeSet;
use lab_schemas::PilotSnapshot;
use tracing::{debug, warn};

pub trait LiveSink {
    type Update;

    fn apply(&mut self, snapshot: PilotSnapshot) -> Result<Option<Self::Update>>;
}

impl LiveSink for PilotGrid {
    type Update = PilotChangeSet;

    fn apply(&mut self, snapshot: PilotSnapshot) -> Result<Option<PilotChangeSet>> {
        Ok(PilotGrid::apply(self, snapshot)?)
    }
}

impl LiveSink for &SessionBoard {
    type Update = BoardUpdate;

    fn apply(&mut self, snapshot: PilotSnapshot) -> Result<Option<BoardUpdate>> {
        let update = self.apply_pilot_state(snapshot);
        Ok(if update.is_empty() { None } else { Some(update) })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    pub received: usize,
    pub applied: usize,
    pub malformed: usize,
}

pub async fn pump<S: LiveSink>(
    feed: &mut PilotFeed,
    sink: &mut S,
    limit: Option<usize>,
    mut on_applied: impl FnMut(&S, &S::Update) -> Result<()>,
) -> Result<LiveStats> {
    let mut stats = LiveStats::default();
    while limit.map_or(true, |n| stats.received < n) {
        let Some(next) = feed.next_snapshot().await else {
            debug!(url = feed.url(), "pilot feed ended");
            break;
        };
        stats.received += 1;
        match next {
            Ok(snapshot) => {
                if let Some(update) = sink.apply(snapshot)? {
                    stats.applied += 1;
                    on_applied(sink, &update)?;
                }
            }
            Err(FeedError::Decode(e)) => {
                stats.malformed += 1;
                warn!(error = %e, "skipping malformed pilot snapshot");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stats)
}
