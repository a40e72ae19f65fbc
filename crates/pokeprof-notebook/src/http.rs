/// HTTP surface: the streaming query endpoint and the tree browser reads.
///
/// - `GET /api/health`
/// - `GET /api/query?q=...&persona=...&session=...` (SSE: `route`, `sections`, `token`*,
///   `done` | `error`). Queries sharing a `session` id cancel their predecessor.
/// - `GET /api/indexes`
/// - `GET /api/indexes/{name}/tree`
/// - `GET /api/indexes/{name}/node/{*node_id}`
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::browse;
use crate::error::AppError;
use crate::pipeline::{Pipeline, QueryEvent, QueryHandle, QuerySession};
use notebook_common::api::{IndexListResponse, NodeDetailResponse, TreeNodeView};

#[derive(Clone)]
pub struct HttpState {
    pipeline: Arc<Pipeline>,
    sessions: Arc<Mutex<HashMap<String, QuerySession>>>,
}

impl HttpState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            sessions: Arc::default(),
        }
    }

    fn submit(&self, session: Option<&str>, query: &str, persona: Option<&str>) -> QueryHandle {
        let Some(session) = session else {
            return self.pipeline.submit(query, persona);
        };
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.retain(|id, s| id == session || !s.is_idle());
        sessions
            .entry(session.to_string())
            .or_default()
            .submit(&self.pipeline, query, persona)
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/query", get(handle_query))
        .route("/api/indexes", get(handle_list_indexes))
        .route("/api/indexes/{name}/tree", get(handle_tree))
        .route("/api/indexes/{name}/node/{*node_id}", get(handle_node))
        .with_state(state)
}

pub async fn serve(addr: &str, state: HttpState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "HTTP server listening");
    axum::serve(listener, router(state)).await
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl HttpError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl From<AppError> for HttpError {
    fn from(err: AppError) -> Self {
        let (status, code) = match &err {
            AppError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            code,
            message: err.user_message(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    indexes: usize,
}

async fn handle_health(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        indexes: state.pipeline.registry().snapshot().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    q: String,
    #[serde(default)]
    persona: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

/// SSE `data` for one event.
fn event_payload(event: &QueryEvent) -> Value {
    match event {
        QueryEvent::Route(route) => serde_json::to_value(route).unwrap_or(Value::Null),
        QueryEvent::Sections(sections) => serde_json::to_value(sections).unwrap_or(Value::Null),
        QueryEvent::Token(token) => json!({ "text": token }),
        QueryEvent::Done => json!({}),
        QueryEvent::Error(message) => json!({ "message": message }),
    }
}

fn to_sse(event: &QueryEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event_payload(event).to_string())
}

async fn handle_query(
    State(state): State<HttpState>,
    Query(params): Query<QueryParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HttpError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(HttpError::bad_request("q must not be empty"));
    }
    info!(persona = ?params.persona, "query received");

    // Axum drops the stream when the client disconnects, which cancels the query.
    let events = state
        .submit(params.session.as_deref(), query, params.persona.as_deref())
        .into_stream()
        .map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn handle_list_indexes(State(state): State<HttpState>) -> Json<IndexListResponse> {
    let snapshot = state.pipeline.registry().snapshot();
    Json(IndexListResponse {
        indexes: browse::index_summaries(&snapshot),
    })
}

async fn handle_tree(
    State(state): State<HttpState>,
    Path(name): Path<String>,
) -> Result<Json<TreeNodeView>, HttpError> {
    let snapshot = state.pipeline.registry().snapshot();
    let index = browse::require_index(&snapshot, &name)?;
    Ok(Json(browse::tree_view(&index)))
}

async fn handle_node(
    State(state): State<HttpState>,
    Path((name, node_id)): Path<(String, String)>,
) -> Result<Json<NodeDetailResponse>, HttpError> {
    let snapshot = state.pipeline.registry().snapshot();
    let index = browse::require_index(&snapshot, &name)?;
    Ok(Json(browse::node_detail(&index, &node_id)?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DomainConfig;
    use crate::model::fixtures::sample_rulebook;
    use crate::oracle::DisabledOracle;
    use crate::registry::{IndexRegistry, RegistrySnapshot};
    use crate::retriever::Retriever;
    use crate::synthesizer::{SynthesisRequest, Synthesizer, SynthesizerError, TokenStream};

    struct EchoSynth;

    #[async_trait::async_trait]
    impl Synthesizer for EchoSynth {
        async fn generate(&self, request: SynthesisRequest) -> Result<TokenStream, SynthesizerError> {
            let count = request.sections.len();
            Ok(futures::stream::once(async move { Ok(format!("{count} sections")) }).boxed())
        }
    }

    fn state() -> HttpState {
        let registry = Arc::new(IndexRegistry::new(RegistrySnapshot::new([sample_rulebook()])));
        let pipeline = Pipeline::new(
            Arc::new(DomainConfig::default()),
            registry,
            Retriever::new(Arc::new(DisabledOracle), 1, Duration::from_secs(1)),
            Arc::new(EchoSynth),
        );
        HttpState::new(Arc::new(pipeline))
    }

    #[tokio::test]
    async fn browse_endpoints() {
        let Json(list) = handle_list_indexes(State(state())).await;
        assert_eq!(list.indexes[0].name, "rulebook");

        let Json(tree) = handle_tree(State(state()), Path("rulebook".to_string()))
            .await
            .unwrap();
        assert_eq!(tree.children.len(), 2);

        let Json(node) = handle_node(
            State(state()),
            Path(("rulebook".to_string(), "3.4.1".to_string())),
        )
        .await
        .unwrap();
        assert!(node.content.contains("rule 1.1"));

        let missing = handle_tree(State(state()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_counts_indexes() {
        let Json(health) = handle_health(State(state())).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.indexes, 1);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let params = QueryParams {
            q: "  ".into(),
            persona: None,
            session: None,
        };
        let err = handle_query(State(state()), Query(params)).await.err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn same_session_query_replaces_the_previous_one() {
        let state = state();
        let first = state.submit(Some("tab-1"), "prize cards", None);
        let second = state.submit(Some("tab-1"), "prize cards", Some("judge"));

        let first: Vec<QueryEvent> = first.into_stream().collect().await;
        assert!(!first.iter().any(QueryEvent::is_terminal));
        let second: Vec<QueryEvent> = second.into_stream().collect().await;
        assert_eq!(second.last(), Some(&QueryEvent::Done));

        // Finished sessions are dropped when another one starts.
        let third = state.submit(Some("tab-2"), "prize cards", None);
        let sessions: Vec<String> = state.sessions.lock().unwrap().keys().cloned().collect();
        assert_eq!(sessions, vec!["tab-2"]);
        drop(third);
    }

    #[tokio::test]
    async fn queries_without_a_session_run_independently() {
        let state = state();
        let first = state.submit(None, "prize cards", None);
        let second = state.submit(None, "prize cards", None);
        let first: Vec<QueryEvent> = first.into_stream().collect().await;
        let second: Vec<QueryEvent> = second.into_stream().collect().await;
        assert_eq!(first.last(), Some(&QueryEvent::Done));
        assert_eq!(second.last(), Some(&QueryEvent::Done));
        assert!(state.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn payloads_per_event() {
        assert_eq!(
            event_payload(&QueryEvent::Token("Six".into())),
            json!({"text": "Six"})
        );
        assert_eq!(event_payload(&QueryEvent::Done), json!({}));
        assert_eq!(
            event_payload(&QueryEvent::Error("No relevant sections found.".into()))["message"],
            "No relevant sections found."
        );
    }
}
