// Templates are askama with html escaping on, so backend strings (subject
// names, protocol names, orchestrator messages) never reach the markup raw.

use crate::board::{ActionButton, RowState, SessionBoard, SessionCard};
use askama::Template;
use lab_schemas::{display_value, PilotSnapshot};

pub type RenderResult = Result<String, askama::Error>;

#[derive(Template)]
#[template(
    source = r#"<li class="session pending" data-session="{{ session_id }}"><span class="title">Session {{ session_id }}</span><span class="loading">loading…</span></li>"#,
    ext = "html"
)]
struct PlaceholderRow {
    session_id: i64,
}

#[derive(Template)]
#[template(
    source = r#"<li class="session failed" data-session="{{ session_id }}"><span class="title">{{ title }}</span><span class="error">{{ error }}</span></li>"#,
    ext = "html"
)]
struct FailedRow<'a> {
    session_id: i64,
    title: &'a str,
    error: &'a str,
}

#[derive(Template)]
#[template(
    source = r#"<button class="run {{ label|lower }}" data-action="{{ action }}" data-target="{{ target }}"{% if !enabled %} disabled{% endif %}{% if let Some(h) = hint %} title="{{ h }}"{% endif %}>{{ label }}</button>"#,
    ext = "html"
)]
struct ButtonView<'a> {
    label: &'a str,
    enabled: bool,
    action: &'a str,
    target: i64,
    hint: Option<&'a str>,
}

struct ParamView {
    key: String,
    tag: String,
    shown: String,
    source: &'static str,
    overridden: bool,
}

struct StepView {
    heading: String,
    params: Vec<ParamView>,
}

#[derive(Template)]
#[template(
    source = r#"<li class="session" data-session="{{ session_id }}">
<header><span class="title">{{ title }}</span>{% for s in subjects %}<span class="subject">{{ s }}</span>{% endfor %}</header>
<div class="run-state">{% if let Some(st) = status %}<span class="status {{ st }}">{{ st }}</span>{% endif %}{% if let Some(p) = progress %}<span class="progress">{{ p }}</span>{% endif %}{% if let Some(t) = started_at %}<time>{{ t }}</time>{% endif %}</div>
{% for step in steps %}<table class="params"><caption>{{ step.heading }}</caption>{% for p in step.params %}<tr class="{{ p.source }}{% if p.overridden %} overridden{% endif %}"><th title="{{ p.tag }}">{{ p.key }}</th><td>{{ p.shown }}</td></tr>{% endfor %}</table>
{% endfor %}{% if !recorded.is_empty() %}<ul class="recorded">{% for r in recorded %}<li>{{ r }}</li>{% endfor %}</ul>
{% endif %}{{ button|safe }}
</li>"#,
    ext = "html"
)]
struct CardView<'a> {
    session_id: i64,
    title: &'a str,
    subjects: &'a [String],
    status: Option<&'static str>,
    progress: Option<String>,
    started_at: Option<&'a str>,
    steps: Vec<StepView>,
    recorded: Vec<String>,
    button: String,
}

struct TileView<'a> {
    name: &'a str,
    connected: bool,
    state: String,
    active: String,
}

#[derive(Template)]
#[template(
    source = r#"<section class="pilots">{% if tiles.is_empty() %}<p class="empty">No pilots connected</p>{% endif %}{% for t in tiles %}<div class="pilot {% if t.connected %}online{% else %}offline{% endif %}"><h3>{{ t.name }}</h3><span class="state">{{ t.state }}</span>{% if !t.active.is_empty() %}<span class="active">{{ t.active }}</span>{% endif %}</div>{% endfor %}</section>"#,
    ext = "html"
)]
struct GridView<'a> {
    tiles: Vec<TileView<'a>>,
}

#[derive(Template)]
#[template(
    source = r#"<p class="status">{% if let Some(m) = message %}{{ m }}{% endif %}</p>"#,
    ext = "html"
)]
struct StatusLine<'a> {
    message: Option<&'a str>,
}

pub fn placeholder(session_id: i64) -> RenderResult {
    PlaceholderRow { session_id }.render()
}

pub fn failed(session_id: i64, title: &str, error: &str) -> RenderResult {
    FailedRow {
        session_id,
        title,
        error,
    }
    .render()
}

pub fn button(button: &ActionButton) -> RenderResult {
    let (action, target) = match button.action {
        crate::board::ButtonAction::Start { session_id } => ("start", session_id),
        crate::board::ButtonAction::Stop { run_id } => ("stop", run_id),
    };
    ButtonView {
        label: button.label.as_str(),
        enabled: button.enabled,
        action,
        target,
        hint: button.hint,
    }
    .render()
}

pub fn card(card: &SessionCard, control: Option<&ActionButton>) -> RenderResult {
    let steps = card
        .steps
        .iter()
        .map(|s| StepView {
            heading: format!("{}. {} ({})", s.order_index + 1, s.step_name, s.task_type),
            params: s
                .params
                .iter()
                .map(|p| ParamView {
                    key: p.key.clone(),
                    tag: p.tag.clone().unwrap_or_default(),
                    shown: p.shown_text(),
                    source: p.effective.source.as_str(),
                    overridden: p.is_overridden(),
                })
                .collect(),
        })
        .collect();
    let recorded = card
        .recorded_overrides
        .iter()
        .flat_map(|set| set.iter())
        .flat_map(|(step, params)| {
            params
                .iter()
                .map(move |(k, v)| format!("step {}: {} = {}", step + 1, k, display_value(k, v)))
        })
        .collect();
    let progress = card.progress.as_ref().map(|p| {
        format!(
            "step {} · trial {}",
            p.current_step_idx + 1,
            p.current_trial
        )
    });
    CardView {
        session_id: card.session_id,
        title: &card.title,
        subjects: &card.subjects,
        status: card.status.map(|s| s.as_str()),
        progress,
        started_at: card.started_at.as_deref(),
        steps,
        recorded,
        button: match control {
            Some(b) => button(b)?,
            None => String::new(),
        },
    }
    .render()
}

pub fn board(board: &SessionBoard) -> RenderResult {
    let mut out = String::from("<ul class=\"sessions\">");
    for id in board.row_ids() {
        let fragment = match board.row_state(id) {
            Some(RowState::Hydrated(c)) => card(&c, board.button(id).as_ref())?,
            Some(RowState::Failed { title, error }) => failed(id, &title, &error)?,
            Some(RowState::Placeholder) | Some(RowState::Hydrating) => placeholder(id)?,
            Some(RowState::Removed) | None => continue,
        };
        out.push_str(&fragment);
    }
    out.push_str("</ul>");
    Ok(out)
}

pub fn pilot_grid(snapshot: &PilotSnapshot) -> RenderResult {
    let tiles = snapshot
        .iter()
        .map(|(name, p)| TileView {
            name,
            connected: p.connected,
            state: if p.connected {
                p.state.clone().unwrap_or_else(|| "IDLE".to_string())
            } else {
                "OFFLINE".to_string()
            },
            active: p
                .active_run
                .as_ref()
                .map(|r| format!("session {} · run {}", r.session_id, r.id))
                .unwrap_or_default(),
        })
        .collect();
    GridView { tiles }.render()
}

pub fn status(message: Option<&str>) -> RenderResult {
    StatusLine { message }.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{button_for, ButtonLabel};
    use lab_schemas::PilotState;

    #[test]
    fn backend_strings_are_escaped() {
        let html = failed(4, "Session 4", "<script>alert(1)</script>").expect("render");
        assert!(html.contains("&lt;script&gt;"), "{}", html);
        assert!(!html.contains("<script>"));
        let line = status(Some("start failed: \"busy\" & <gone>")).expect("render");
        assert!(line.contains("&amp; &lt;gone&gt;"), "{}", line);
    }

    #[test]
    fn disabled_button_carries_hint() {
        let b = button_for(3, None, false);
        assert_eq!(b.label, ButtonLabel::Start);
        let html = button(&b).expect("render");
        assert!(html.contains("disabled"));
        assert!(html.contains("title=\"pilot offline\""));
        assert!(html.contains("data-action=\"start\""));
    }

    #[test]
    fn grid_lists_every_pilot() {
        let mut snap = PilotSnapshot::new();
        snap.insert("rig-a".into(), PilotState::default());
        snap.insert(
            "rig-b".into(),
            PilotState {
                connected: true,
                state: Some("RUNNING".into()),
                ..PilotState::default()
            },
        );
        let html = pilot_grid(&snap).expect("render");
        assert!(html.contains("rig-a") && html.contains("OFFLINE"));
        assert!(html.contains("class=\"pilot online\""));
        assert!(pilot_grid(&PilotSnapshot::new())
            .expect("render")
            .contains("No pilots connected"));
    }
}
