use crate::board::SessionBoard;
use crate::page::ConsolePage;
use lab_client::ApiClient;
use lab_schemas::{ActiveRun, PilotSnapshot, PilotState};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_get(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub(crate) async fn backend() -> MockServer {
    let server = MockServer::start().await;
    mount_get(
        &server,
        "/api/sessions",
        json!([{ "session_id": 1 }, { "session_id": 2 }, { "session_id": 3 }]),
    )
    .await;
    mount_get(
        &server,
        "/api/sessions/1",
        json!({
            "session_id": 1,
            "started_at": "2026-03-02T10:00:00",
            "n_runs": 1,
            "runs": [{
                "run_id": 5, "subject_id": 9, "subject_name": "mouse-a",
                "protocol_id": 7, "protocol_name": "shaping"
            }]
        }),
    )
    .await;
    mount_get(
        &server,
        "/api/sessions/2",
        json!({ "session_id": 2, "n_runs": 0, "runs": [] }),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/sessions/3"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_get(
        &server,
        "/api/protocols/7",
        json!({
            "id": 7,
            "name": "shaping",
            "steps": [{
                "order_index": 0, "step_name": "free reward",
                "task_type": "FreeMoving", "params": { "Reward_ms": 40 }
            }]
        }),
    )
    .await;
    mount_get(
        &server,
        "/api/tasks/leaf",
        json!([{
            "name": "freemoving",
            "params": {
                "reward_ms": { "tag": "Reward (ms)", "type": "int", "default": 30 },
                "n_trials": { "type": "int", "default": 100 }
            }
        }]),
    )
    .await;
    mount_get(&server, "/api/backend/pilots", json!([{ "id": 2, "name": "rig-a" }])).await;
    mount_get(
        &server,
        "/api/sessions/1/pilots/2/latest-run",
        json!({
            "id": 11, "session_id": 1, "pilot_id": 2, "status": "stopped",
            "mode": "new", "overrides": { "0": { "n_trials": 20 } }
        }),
    )
    .await;
    mount_get(
        &server,
        "/api/sessions/1/pilots/2/start-options",
        json!({ "can_resume": true, "can_restart": true, "can_start_new": true }),
    )
    .await;
    server
}

pub(crate) fn board(server: &MockServer) -> SessionBoard {
    let api = ApiClient::new(&server.uri(), None).expect("client");
    SessionBoard::new(ConsolePage::new(api, 4, Some("rig-a".into())), "rig-a", None)
}

pub(crate) fn online(active: Option<(i64, i64)>) -> PilotSnapshot {
    let mut snap = PilotSnapshot::new();
    snap.insert(
        "rig-a".into(),
        PilotState {
            connected: true,
            active_run: active.map(|(id, session_id)| ActiveRun {
                id,
                session_id,
                subject_key: None,
                started_at: None,
            }),
            ..PilotState::default()
        },
    );
    snap
}
