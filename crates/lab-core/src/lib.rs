pub mod coerce;
pub mod draft;
pub mod pilots;
pub mod resolve;

pub use coerce::{parse_typed, CoerceError, TypeClass};
pub use draft::{
    parse_graduation_input, recorded_overrides, start_request, DraftBook, InputError,
    InputOutcome, OverrideDraft, SharedDraft,
};
pub use pilots::{
    diff_snapshots, project, PilotChange, PilotChangeSet, PilotMonitor, PilotScope, PilotView,
};
pub use resolve::{
    effective_value, is_populated, normalize_key, resolve_step, Effective, ParamRow, ValueSource,
};
