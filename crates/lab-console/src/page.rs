use anyhow::{Context, Result};
use lab_client::{ApiClient, ApiError, CollectionCache, ConsoleConfig, FetchCache, Fetched, Limiter};
use lab_core::DraftBook;
use lab_schemas::{PilotRecord, Protocol, SessionDetail, SessionSummary, Subject, TaskCatalog, TaskSpec};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

pub struct ConsolePage {
    api: ApiClient,
    limiter: Limiter,
    pilot: Option<String>,
    sessions: CollectionCache<SessionSummary>,
    protocols: CollectionCache<Protocol>,
    tasks: CollectionCache<TaskSpec>,
    subjects: CollectionCache<Subject>,
    backend_pilots: CollectionCache<PilotRecord>,
    session_details: FetchCache<i64, SessionDetail>,
    protocol_details: FetchCache<i64, Protocol>,
    drafts: DraftBook,
    status: Mutex<Option<String>>,
}

impl ConsolePage {
    pub fn new(api: ApiClient, max_in_flight: usize, pilot: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            api,
            limiter: Limiter::new(max_in_flight),
            pilot,
            sessions: CollectionCache::new(),
            protocols: CollectionCache::new(),
            tasks: CollectionCache::new(),
            subjects: CollectionCache::new(),
            backend_pilots: CollectionCache::new(),
            session_details: FetchCache::new("session"),
            protocol_details: FetchCache::new("protocol"),
            drafts: DraftBook::new(),
            status: Mutex::new(None),
        })
    }

    pub fn open(cfg: &ConsoleConfig) -> Result<Arc<Self>> {
        let api = ApiClient::from_config(cfg).context("building api client")?;
        Ok(Self::new(api, cfg.max_in_flight, cfg.pilot.clone()))
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub fn drafts(&self) -> &DraftBook {
        &self.drafts
    }

    pub fn pilot(&self) -> Option<&str> {
        self.pilot.as_deref()
    }

    pub fn status(&self) -> Option<String> {
        self.status.lock().clone()
    }

    pub fn set_status(&self, message: impl Into<String>) {
        *self.status.lock() = Some(message.into());
    }

    pub fn clear_status(&self) {
        *self.status.lock() = None;
    }

    fn surface<T>(&self, what: &str, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if let Err(e) = &result {
            warn!(what, error = %e, "collection load failed");
            self.set_status(format!("could not load {}: {}", what, e));
        }
        result
    }

    pub async fn sessions(&self, force: bool) -> Result<Arc<Vec<SessionSummary>>, ApiError> {
        let loaded = self
            .sessions
            .load(force, || self.api.list_sessions())
            .await;
        self.surface("sessions", loaded)
    }

    pub async fn protocols(&self, force: bool) -> Result<Arc<Vec<Protocol>>, ApiError> {
        let loaded = self
            .protocols
            .load(force, || self.api.list_protocols())
            .await;
        self.surface("protocols", loaded)
    }

    pub async fn subjects(&self, force: bool) -> Result<Arc<Vec<Subject>>, ApiError> {
        let loaded = self
            .subjects
            .load(force, || self.api.list_subjects())
            .await;
        self.surface("subjects", loaded)
    }

    pub async fn task_catalog(&self, force: bool) -> Result<TaskCatalog, ApiError> {
        let loaded = self
            .tasks
            .load(force, || self.limiter.run(self.api.list_leaf_tasks()))
            .await;
        let specs = self.surface("tasks", loaded)?;
        Ok(TaskCatalog::new(specs.iter().cloned()))
    }

    pub async fn backend_pilots(&self, force: bool) -> Result<Arc<Vec<PilotRecord>>, ApiError> {
        let loaded = self
            .backend_pilots
            .load(force, || self.api.list_backend_pilots())
            .await;
        self.surface("pilots", loaded)
    }

    pub async fn pilot_id(&self, name: &str) -> Result<Option<i64>, ApiError> {
        let pilots = self.backend_pilots(false).await?;
        Ok(pilots.iter().find(|p| p.name == name).map(|p| p.id))
    }

    pub async fn session_detail(&self, session_id: i64) -> Fetched<SessionDetail> {
        self.session_details
            .get(session_id, || self.limiter.run(self.api.get_session(session_id)))
            .await
    }

    pub async fn protocol(&self, protocol_id: i64) -> Fetched<Protocol> {
        self.protocol_details
            .get(protocol_id, || {
                self.limiter.run(self.api.get_protocol(protocol_id))
            })
            .await
    }
}
