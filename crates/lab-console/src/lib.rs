pub mod board;
pub mod grid;
pub mod live;
pub mod page;
pub mod render;
#[cfg(test)]
mod testing;
pub mod visibility;

pub use board::{
    button_for, ActionButton, BoardUpdate, ButtonAction, ButtonLabel, EditError, PressOutcome,
    RowState, SessionBoard, SessionCard, StepPanel,
};
pub use grid::PilotGrid;
pub use live::{pump, LiveSink, LiveStats};
pub use page::ConsolePage;
pub use visibility::VisibilityObserver;
