use crate::config::ConsoleConfig;
use lab_schemas::{
    AssignProtocol, AssignResult, PilotRecord, PilotSnapshot, Protocol, ProtocolCreate,
    SessionDetail, SessionRun, SessionSummary, StartOptions, StartRequest, StartResponse,
    StopResponse, Subject, SubjectCreate, TaskSpec,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {path} returned {status}: {body}")]
    Http {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("{method} {path} failed: {source}")]
    Transport {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("decoding response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("building client: {0}")]
    Build(String),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

/// Thin typed wrapper over the console's REST endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::Build(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ApiError::Build(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(cfg: &ConsoleConfig) -> Result<Self, ApiError> {
        Self::new(&cfg.base_url, cfg.token.as_deref())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        debug!(%method, path, "api request");
        let resp = req.send().await.map_err(|source| ApiError::Transport {
            method: method.clone(),
            path: path.to_string(),
            source,
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|source| ApiError::Transport {
            method: method.clone(),
            path: path.to_string(),
            source,
        })?;
        if !status.is_success() {
            debug!(%method, path, status = status.as_u16(), "api request failed");
            return Err(ApiError::Http {
                method,
                path: path.to_string(),
                status,
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<Value, T>(Method::GET, path, None).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<Value, T>(Method::POST, path, None).await
    }

    pub async fn list_subjects(&self) -> Result<Vec<Subject>, ApiError> {
        self.get("/api/subjects").await
    }

    pub async fn create_subject(&self, name: &str) -> Result<Subject, ApiError> {
        let body = SubjectCreate {
            name: name.to_string(),
        };
        self.post("/api/subjects", &body).await
    }

    pub async fn list_subject_sessions(&self, subject: &str) -> Result<Vec<Value>, ApiError> {
        self.get(&format!("/api/subjects/{}/sessions", path_segment(subject)?))
            .await
    }

    pub async fn list_protocols(&self) -> Result<Vec<Protocol>, ApiError> {
        self.get("/api/protocols").await
    }

    pub async fn create_protocol(&self, protocol: &ProtocolCreate) -> Result<Protocol, ApiError> {
        self.post("/api/protocols", protocol).await
    }

    pub async fn get_protocol(&self, protocol_id: i64) -> Result<Protocol, ApiError> {
        self.get(&format!("/api/protocols/{}", protocol_id)).await
    }

    pub async fn list_leaf_tasks(&self) -> Result<Vec<TaskSpec>, ApiError> {
        self.get("/api/tasks/leaf").await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        self.get("/api/sessions").await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<SessionDetail, ApiError> {
        self.get(&format!("/api/sessions/{}", session_id)).await
    }

    /// Creates a session for every subject waiting on an assigned protocol.
    pub async fn start_session(&self, session_id: i64) -> Result<Value, ApiError> {
        self.post_empty(&format!("/api/sessions/{}/start", session_id))
            .await
    }

    pub async fn start_on_pilot(
        &self,
        session_id: i64,
        request: &StartRequest,
    ) -> Result<StartResponse, ApiError> {
        self.post(&format!("/api/sessions/{}/start-on-pilot", session_id), request)
            .await
    }

    pub async fn latest_run(
        &self,
        session_id: i64,
        pilot_id: i64,
    ) -> Result<Option<SessionRun>, ApiError> {
        self.get(&format!(
            "/api/sessions/{}/pilots/{}/latest-run",
            session_id, pilot_id
        ))
        .await
    }

    pub async fn start_options(
        &self,
        session_id: i64,
        pilot_id: i64,
    ) -> Result<StartOptions, ApiError> {
        self.get(&format!(
            "/api/sessions/{}/pilots/{}/start-options",
            session_id, pilot_id
        ))
        .await
    }

    pub async fn stop_run(&self, run_id: i64) -> Result<StopResponse, ApiError> {
        self.post_empty(&format!("/api/session-runs/{}/stop", run_id))
            .await
    }

    pub async fn run_progress(&self, run_id: i64) -> Result<Value, ApiError> {
        self.get(&format!("/api/session-runs/{}/with-progress", run_id))
            .await
    }

    pub async fn list_backend_pilots(&self) -> Result<Vec<PilotRecord>, ApiError> {
        self.get("/api/backend/pilots").await
    }

    /// Live connectivity snapshot, the same payload the push channel carries.
    pub async fn live_pilots(&self) -> Result<PilotSnapshot, ApiError> {
        self.get("/api/pilots").await
    }

    pub async fn assign_protocol(&self, payload: &AssignProtocol) -> Result<AssignResult, ApiError> {
        self.post("/api/assign-protocol", payload).await
    }
}

/// Percent-encodes one path segment, including `/` and `?`.
fn path_segment(raw: &str) -> Result<String, ApiError> {
    let mut url = Url::parse("http://segment/").map_err(|e| ApiError::Build(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| ApiError::Build(format!("cannot encode path segment {:?}", raw)))?
        .clear()
        .push(raw);
    Ok(url.path().trim_start_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_schemas::RunMode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_bearer_token_and_decodes_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "session_id": 4, "started_at": "2025-02-01T09:30:00", "n_runs": 2 }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), Some("s3cret")).expect("client");
        let sessions = client.list_sessions().await.expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, 4);
    }

    #[tokio::test]
    async fn start_on_pilot_posts_mode_and_overrides() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sessions/4/start-on-pilot"))
            .and(body_json(json!({
                "pilot_id": 2,
                "mode": "new",
                "overrides": { "0": { "ITI": 700 } }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "started", "run_id": 11 })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), None).expect("client");
        let request = StartRequest {
            pilot_id: 2,
            mode: RunMode::New,
            overrides: serde_json::from_value(json!({ "0": { "ITI": 700 } })).ok(),
        };
        let resp = client.start_on_pilot(4, &request).await.expect("start");
        assert!(resp.is_started());
        assert_eq!(resp.run_id, Some(11));
    }

    #[tokio::test]
    async fn latest_run_may_be_null() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions/4/pilots/2/latest-run"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Null))
            .mount(&server)
            .await;
        let client = ApiClient::new(&server.uri(), None).expect("client");
        assert_eq!(client.latest_run(4, 2).await.expect("latest"), None);
    }

    #[tokio::test]
    async fn non_success_status_is_an_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/protocols/99"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Protocol not found"))
            .mount(&server)
            .await;
        let client = ApiClient::new(&server.uri(), None).expect("client");
        let err = client.get_protocol(99).await.expect_err("missing");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Protocol not found"), "{}", err);
    }

    #[tokio::test]
    async fn subject_names_are_encoded_as_one_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/subjects/mouse%20a%2F1%3F/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "session_id": 3 }])))
            .expect(1)
            .mount(&server)
            .await;
        let client = ApiClient::new(&server.uri(), None).expect("client");
        let sessions = client
            .list_subject_sessions("mouse a/1?")
            .await
            .expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(path_segment("rat-7").expect("segment"), "rat-7");
    }
}
