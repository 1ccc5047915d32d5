use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;

mod pilot;
mod protocol;
mod session;
mod task;

pub use pilot::{ActiveRun, PilotRecord, PilotSnapshot, PilotState};
pub use protocol::{Protocol, ProtocolCreate, ProtocolStep, ProtocolStepCreate};
pub use session::{
    display_timestamp, parse_timestamp, AssignProtocol, AssignResult, OverrideSet, RunMode,
    RunProgress, RunStatus, SessionDetail, SessionRun, SessionSummary, StartOptions,
    StartRequest, StartResponse, StopResponse, Subject, SubjectCreate, SubjectRun,
};
pub use task::{display_value, normalize_name, Graduation, ParamDescriptor, TaskCatalog, TaskSpec};

pub const GRADUATION_KEY: &str = "graduation";

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub fn schema_names() -> Vec<String> {
    SCHEMAS
        .files()
        .filter_map(|f| f.path().file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect()
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let file = SCHEMAS
        .get_file(name)
        .ok_or_else(|| anyhow!("unknown schema: {}", name))?;
    let raw = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema is not utf-8: {}", name))?;
    let schema: Value = serde_json::from_str(raw)?;
    JSONSchema::compile(&schema).map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))
}

pub fn validate_against(name: &str, value: &Value) -> Result<()> {
    let compiled = compile_schema(name)?;
    if let Err(errors) = compiled.validate(value) {
        let msgs: Vec<String> = errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
        return Err(anyhow!(
            "{} validation failed: {}",
            name,
            msgs.join("; ")
        ));
    }
    Ok(())
}
