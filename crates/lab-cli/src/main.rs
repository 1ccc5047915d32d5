use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lab_client::{ConfigOverrides, ConsoleConfig, PilotFeed};
use lab_core::OverrideDraft;
use lab_console::{
    pump, render, ButtonLabel, ConsolePage, PilotGrid, PressOutcome, RowState, SessionBoard,
    SessionCard,
};
use lab_schemas::{
    display_timestamp, AssignProtocol, OverrideSet, PilotSnapshot, ProtocolCreate, RunMode,
    TaskCatalog,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "lab-console",
    version = "0.3.0",
    about = "Operator console for the experiment orchestration backend"
)]
struct Cli {
    /// YAML settings file; environment and flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    url: Option<String>,
    #[arg(long, global = true)]
    ws_url: Option<String>,
    #[arg(long, global = true)]
    pilot: Option<String>,
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,
    #[arg(long, global = true)]
    max_in_flight: Option<usize>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "resume")]
    Resume,
    #[value(name = "restart")]
    Restart,
    #[value(name = "new")]
    New,
}

impl From<ModeArg> for RunMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Resume => RunMode::Resume,
            ModeArg::Restart => RunMode::Restart,
            ModeArg::New => RunMode::New,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Sessions {
        #[arg(long)]
        subject: Option<String>,
        /// How many rows to hydrate, in list order.
        #[arg(long, default_value_t = 20)]
        window: usize,
        /// Keep following the live pilot channel and print buttons as they change.
        #[arg(long, conflicts_with = "json")]
        follow: bool,
        #[arg(long, requires = "follow")]
        count: Option<usize>,
        #[arg(long)]
        html: bool,
        #[arg(long)]
        json: bool,
    },
    Session {
        session_id: i64,
        #[arg(long)]
        json: bool,
    },
    StartSession {
        session_id: i64,
        #[arg(long)]
        json: bool,
    },
    Params {
        protocol_id: i64,
        #[arg(long = "set")]
        set_values: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Protocols {
        #[arg(long)]
        json: bool,
    },
    Protocol {
        protocol_id: i64,
        #[arg(long)]
        json: bool,
    },
    ProtocolCreate {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Tasks {
        #[arg(long)]
        json: bool,
    },
    Subjects {
        #[arg(long)]
        json: bool,
    },
    SubjectAdd {
        name: String,
        #[arg(long)]
        json: bool,
    },
    SubjectSessions {
        name: String,
        #[arg(long)]
        json: bool,
    },
    AssignProtocol {
        #[arg(long)]
        protocol: i64,
        #[arg(long = "subject", required = true)]
        subjects: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    Pilots {
        #[arg(long)]
        html: bool,
        #[arg(long)]
        json: bool,
    },
    Start {
        session_id: i64,
        #[arg(long, value_enum, default_value = "new")]
        mode: ModeArg,
        /// Override as `<step>.<key>=<value>`; repeatable.
        #[arg(long = "set")]
        set_values: Vec<String>,
        /// Override set file (YAML or JSON), keyed by step index.
        #[arg(long)]
        overrides: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Stop {
        run_id: i64,
        #[arg(long)]
        json: bool,
    },
    Progress {
        run_id: i64,
        #[arg(long)]
        json: bool,
    },
    Watch {
        /// Stop after this many messages.
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        html: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run(cli).await;
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<Option<Value>> {
    let overrides = ConfigOverrides {
        base_url: cli.url,
        ws_url: cli.ws_url,
        pilot: cli.pilot,
        max_in_flight: cli.max_in_flight,
        token_file: cli.token_file,
    };
    let cfg = ConsoleConfig::load(cli.config.as_deref(), overrides, |k| std::env::var(k).ok())
        .context("loading console configuration")?;
    debug!(base_url = %cfg.base_url, pilot = ?cfg.pilot, "configuration loaded");
    let page = ConsolePage::open(&cfg)?;
    run_command(cli.command, &cfg, page).await
}

async fn run_command(
    command: Commands,
    cfg: &ConsoleConfig,
    page: Arc<ConsolePage>,
) -> Result<Option<Value>> {
    match command {
        Commands::Sessions {
            subject,
            window,
            follow,
            count,
            html,
            json,
        } => {
            let pilot = require_pilot(cfg)?;
            let board = SessionBoard::new(page.clone(), pilot, subject.as_deref());
            let rows = board.populate(false).await;
            if rows == 0 {
                if let Some(status) = page.status() {
                    bail!(status);
                }
            }
            let window: Vec<i64> = board.row_ids().into_iter().take(window).collect();
            board.reveal(&window).await;
            seed_pilot_state(&page, &board).await;
            if json {
                let rows: Vec<Value> = board
                    .row_ids()
                    .into_iter()
                    .map(|id| row_to_json(&board, id))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sessions",
                    "pilot": pilot,
                    "rows": rows,
                    "status": page.status()
                })));
            }
            if html {
                println!("{}", render::status(page.status().as_deref())?);
                println!("{}", render::board(&board)?);
            } else {
                if let Some(status) = page.status() {
                    println!("status: {}", status);
                }
                for id in board.row_ids() {
                    print_row(&board, id);
                }
            }
            if follow {
                let mut feed = PilotFeed::connect(&cfg.pilots_ws_url()?).await?;
                let stats = pump(&mut feed, &mut &board, count, |b, update| {
                    for &id in &update.buttons {
                        let Some(button) = b.button(id) else { continue };
                        if html {
                            println!("{}", render::button(&button)?);
                        } else {
                            let state = if button.enabled { "" } else { " (disabled)" };
                            println!("session {}: {}{}", id, button.label.as_str(), state);
                        }
                    }
                    Ok(())
                })
                .await?;
                debug!(
                    received = stats.received,
                    applied = stats.applied,
                    malformed = stats.malformed,
                    "follow finished"
                );
            }
        }
        Commands::Session { session_id, json } => {
            let detail = page
                .session_detail(session_id)
                .await
                .found()
                .ok_or_else(|| anyhow!("session {} not found", session_id))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "session",
                    "session": &*detail
                })));
            }
            println!("session: {}", detail.session_id);
            println!(
                "started_at: {}",
                detail.started_at.as_deref().map(display_timestamp).unwrap_or_else(|| "-".into())
            );
            for run in &detail.runs {
                println!(
                    "  run {}  {}  protocol {} ({})",
                    run.run_id,
                    run.subject_name,
                    run.protocol_id,
                    run.protocol_name.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::StartSession { session_id, json } => {
            let result = page.api().start_session(session_id).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "start-session",
                    "result": result
                })));
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Params {
            protocol_id,
            set_values,
            json,
        } => {
            let protocol = page
                .protocol(protocol_id)
                .await
                .found()
                .ok_or_else(|| anyhow!("protocol {} not found", protocol_id))?;
            let catalog = page.task_catalog(false).await?;
            let mut draft = OverrideDraft::new();
            for (step, key, raw) in parse_set_values(&set_values)? {
                let (key, declared) = protocol
                    .step(step)
                    .ok_or_else(|| anyhow!("protocol {} has no step {}", protocol_id, step))
                    .map(|s| canonical_param(s, &catalog, &key))?;
                draft.apply_input(step, &key, &raw, declared.as_deref())?;
            }
            let steps: Vec<Value> = protocol
                .ordered_steps()
                .into_iter()
                .map(|step| {
                    let rows = lab_core::resolve_step(
                        step,
                        catalog.get(&step.task_type),
                        draft.step(step.order_index),
                    );
                    json!({
                        "order_index": step.order_index,
                        "step_name": step.step_name,
                        "task_type": step.task_type,
                        "params": rows
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "params",
                    "protocol": protocol.name,
                    "steps": steps,
                    "overrides": draft.payload_for(RunMode::New)
                })));
            }
            println!("protocol: {} ({})", protocol.name, protocol.id);
            for step in protocol.ordered_steps() {
                println!(
                    "{}. {} ({})",
                    step.order_index + 1,
                    step.step_name,
                    step.task_type
                );
                let rows = lab_core::resolve_step(
                    step,
                    catalog.get(&step.task_type),
                    draft.step(step.order_index),
                );
                for row in rows {
                    let marker = if row.is_overridden() { " *" } else { "" };
                    println!(
                        "   {} = {} [{}]{}",
                        row.key,
                        row.shown_text(),
                        row.effective.source.as_str(),
                        marker
                    );
                }
            }
        }
        Commands::Protocols { json } => {
            let protocols = page.protocols(false).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "protocols",
                    "protocols": &*protocols
                })));
            }
            for p in protocols.iter() {
                println!("{}\t{}\t{} steps", p.id, p.name, p.steps.len());
            }
        }
        Commands::Protocol { protocol_id, json } => {
            let protocol = page
                .protocol(protocol_id)
                .await
                .found()
                .ok_or_else(|| anyhow!("protocol {} not found", protocol_id))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "protocol",
                    "protocol": &*protocol
                })));
            }
            println!("protocol: {} ({})", protocol.name, protocol.id);
            if let Some(desc) = &protocol.description {
                println!("description: {}", desc);
            }
            for step in protocol.ordered_steps() {
                println!(
                    "{}. {} ({})",
                    step.order_index + 1,
                    step.step_name,
                    step.task_type
                );
                for key in step.param_keys() {
                    if let Some((k, v)) = step.param(key) {
                        println!("   {} = {}", k, lab_schemas::display_value(k, v));
                    }
                }
            }
        }
        Commands::ProtocolCreate { file, json } => {
            let payload = read_payload(&file)?;
            lab_schemas::validate_against("protocol_create_v1.jsonschema", &payload)?;
            let create: ProtocolCreate = serde_json::from_value(payload)
                .with_context(|| format!("decoding {}", file.display()))?;
            let created = page.api().create_protocol(&create).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "protocol-create",
                    "protocol": created
                })));
            }
            println!("created protocol {} ({})", created.name, created.id);
        }
        Commands::Tasks { json } => {
            let catalog = page.task_catalog(false).await?;
            if json {
                let tasks: Vec<_> = catalog.iter().collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "tasks",
                    "tasks": tasks
                })));
            }
            for task in catalog.iter() {
                let keys: Vec<&str> = task.params.keys().map(String::as_str).collect();
                println!("{}\t{}", task.name, keys.join(", "));
            }
        }
        Commands::Subjects { json } => {
            let subjects = page.subjects(false).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "subjects",
                    "subjects": &*subjects
                })));
            }
            for s in subjects.iter() {
                println!("{}\t{}", s.id, s.name);
            }
        }
        Commands::SubjectAdd { name, json } => {
            let subject = page.api().create_subject(&name).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "subject-add",
                    "subject": subject
                })));
            }
            println!("created subject {} ({})", subject.name, subject.id);
        }
        Commands::SubjectSessions { name, json } => {
            let sessions = page.api().list_subject_sessions(&name).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "subject-sessions",
                    "subject": name,
                    "sessions": sessions
                })));
            }
            for s in &sessions {
                println!("{}", s);
            }
        }
        Commands::AssignProtocol {
            protocol,
            subjects,
            json,
        } => {
            let result = page
                .api()
                .assign_protocol(&AssignProtocol {
                    protocol_id: protocol,
                    subjects,
                })
                .await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "assign-protocol",
                    "result": result
                })));
            }
            println!("{}: {} subject(s) assigned", result.status, result.assigned);
        }
        Commands::Pilots { html, json } => {
            let live = page.api().live_pilots().await?;
            let registry = match page.backend_pilots(false).await {
                Ok(r) => r.to_vec(),
                Err(e) => {
                    warn!(error = %e, "pilot registry unavailable");
                    Vec::new()
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "pilots",
                    "live": live,
                    "registry": registry
                })));
            }
            if html {
                println!("{}", render::pilot_grid(&live)?);
                return Ok(None);
            }
            print_pilots(&live);
        }
        Commands::Start {
            session_id,
            mode,
            set_values,
            overrides,
            json,
        } => {
            let pilot = require_pilot(cfg)?;
            let board = SessionBoard::new(page.clone(), pilot, None);
            board.populate(false).await;
            board.reveal(&[session_id]).await;
            match board.row_state(session_id) {
                Some(RowState::Hydrated(_)) => {}
                Some(RowState::Failed { error, .. }) => bail!(error),
                _ => bail!("session {} is not available to start", session_id),
            }
            seed_pilot_state(&page, &board).await;
            if let Some(path) = overrides {
                let payload = read_payload(&path)?;
                lab_schemas::validate_against("override_set_v1.jsonschema", &payload)?;
                let set: OverrideSet = serde_json::from_value(payload)
                    .with_context(|| format!("decoding {}", path.display()))?;
                for (step, params) in set {
                    for (key, value) in params {
                        board.edit_override(session_id, step, &key, &raw_input(&value))?;
                    }
                }
            }
            for (step, key, raw) in parse_set_values(&set_values)? {
                board.edit_override(session_id, step, &key, &raw)?;
            }
            if board.button(session_id).map(|b| b.label) == Some(ButtonLabel::Stop) {
                bail!("session {} is already running on {}", session_id, pilot);
            }
            let mode = RunMode::from(mode);
            let outcome = board.press(session_id, mode).await;
            let run_id = match outcome {
                PressOutcome::Started { run_id } => run_id,
                PressOutcome::Failed { message } => bail!(message),
                PressOutcome::Stopped { .. } | PressOutcome::Ignored => {
                    let reason = board
                        .button(session_id)
                        .and_then(|b| b.hint)
                        .unwrap_or("start is not available");
                    bail!("cannot start session {}: {}", session_id, reason)
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "start",
                    "session_id": session_id,
                    "pilot": pilot,
                    "mode": mode,
                    "run_id": run_id
                })));
            }
            println!("started session {} on {} ({})", session_id, pilot, mode);
            if let Some(id) = run_id {
                println!("run_id: {}", id);
            }
        }
        Commands::Stop { run_id, json } => {
            let result = page.api().stop_run(run_id).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stop",
                    "result": result
                })));
            }
            println!("{}: run {}", result.status, run_id);
        }
        Commands::Progress { run_id, json } => {
            let progress = page.api().run_progress(run_id).await?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "progress",
                    "run": progress
                })));
            }
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Commands::Watch { count, html } => {
            let url = cfg.pilots_ws_url()?;
            let mut feed = PilotFeed::connect(&url).await?;
            let mut grid = PilotGrid::new();
            let stats = pump(&mut feed, &mut grid, count, |g, _| {
                if html {
                    println!("{}", g.html());
                } else {
                    print_pilots(g.snapshot());
                    println!();
                }
                Ok(())
            })
            .await?;
            debug!(
                received = stats.received,
                applied = stats.applied,
                malformed = stats.malformed,
                "watch finished"
            );
        }
    }
    Ok(None)
}

fn require_pilot(cfg: &ConsoleConfig) -> Result<&str> {
    cfg.pilot
        .as_deref()
        .ok_or_else(|| anyhow!("no pilot configured: pass --pilot or set LAB_CONSOLE_PILOT"))
}

async fn seed_pilot_state(page: &ConsolePage, board: &SessionBoard) {
    match page.api().live_pilots().await {
        Ok(snapshot) => {
            board.apply_pilot_state(snapshot);
        }
        Err(e) => warn!(error = %e, "live pilot state unavailable"),
    }
}

// Same casing and type the card shows for the key; unknown keys pass through trimmed.
fn canonical_param(
    step: &lab_schemas::ProtocolStep,
    catalog: &TaskCatalog,
    key: &str,
) -> (String, Option<String>) {
    let wanted = lab_core::normalize_key(key);
    lab_core::resolve_step(step, catalog.get(&step.task_type), None)
        .into_iter()
        .find(|row| lab_core::normalize_key(&row.key) == wanted)
        .map(|row| (row.key, row.value_type))
        .unwrap_or_else(|| (key.trim().to_string(), None))
}

fn parse_set_values(values: &[String]) -> Result<Vec<(usize, String, String)>> {
    let mut out = Vec::new();
    for raw in values {
        let (target, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected step.key=value", raw))?;
        let (step, key) = target
            .split_once('.')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected step.key=value", raw))?;
        let step: usize = step
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid --set '{}': step must be an index", raw))?;
        if key.trim().is_empty() {
            bail!("invalid --set '{}': key cannot be empty", raw);
        }
        out.push((step, key.trim().to_string(), value.to_string()));
    }
    Ok(out)
}

fn raw_input(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn read_payload(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn row_to_json(board: &SessionBoard, id: i64) -> Value {
    match board.row_state(id) {
        Some(RowState::Hydrated(card)) => json!({
            "session_id": id,
            "state": "hydrated",
            "card": card,
            "button": board.button(id)
        }),
        Some(RowState::Failed { title, error }) => json!({
            "session_id": id,
            "state": "failed",
            "title": title,
            "error": error
        }),
        _ => json!({ "session_id": id, "state": "pending" }),
    }
}

fn print_row(board: &SessionBoard, id: i64) {
    match board.row_state(id) {
        Some(RowState::Hydrated(card)) => print_card(&card, board),
        Some(RowState::Failed { title, error }) => println!("{}\n   {}", title, error),
        _ => println!("Session {} (not loaded)", id),
    }
}

fn print_card(card: &SessionCard, board: &SessionBoard) {
    let control = board
        .button(card.session_id)
        .map(|b| {
            let state = if b.enabled { "" } else { " (disabled)" };
            format!("{}{}", b.label.as_str(), state)
        })
        .unwrap_or_default();
    println!(
        "{}  [{}]  {}  {}",
        card.title,
        card.subjects.join(", "),
        card.status.map(|s| s.as_str()).unwrap_or("never run"),
        control
    );
    if let Some(p) = &card.progress {
        println!("   step {} · trial {}", p.current_step_idx + 1, p.current_trial);
    }
    for step in &card.steps {
        println!(
            "   {}. {} ({})",
            step.order_index + 1,
            step.step_name,
            step.task_type
        );
        for row in &step.params {
            println!("      {} = {}", row.key, row.shown_text());
        }
    }
}

fn print_pilots(snapshot: &PilotSnapshot) {
    if snapshot.is_empty() {
        println!("no pilots connected");
        return;
    }
    for (name, p) in snapshot {
        let state = if p.connected {
            p.state.as_deref().unwrap_or("IDLE")
        } else {
            "OFFLINE"
        };
        match &p.active_run {
            Some(run) => println!(
                "{}\t{}\tsession {} run {}",
                name, state, run.session_id, run.id
            ),
            None => println!("{}\t{}", name, state),
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sessions { json, .. }
        | Commands::Session { json, .. }
        | Commands::StartSession { json, .. }
        | Commands::Params { json, .. }
        | Commands::Protocols { json, .. }
        | Commands::Protocol { json, .. }
        | Commands::ProtocolCreate { json, .. }
        | Commands::Tasks { json, .. }
        | Commands::Subjects { json, .. }
        | Commands::SubjectAdd { json, .. }
        | Commands::SubjectSessions { json, .. }
        | Commands::AssignProtocol { json, .. }
        | Commands::Pilots { json, .. }
        | Commands::Start { json, .. }
        | Commands::Stop { json, .. }
        | Commands::Progress { json, .. } => *json,
        Commands::Watch { .. } => false,
    }
}
