/// Query orchestration: route, retrieve, apply errata, then stream the answer.
///
/// Each submitted query runs as one spawned task that reports to its subscriber over a
/// bounded channel of [`QueryEvent`]s. The order is always
/// `route`, `sections`, `token`*, then exactly one of `done` or `error`. Dropping the
/// [`QueryHandle`] (or calling [`QueryHandle::cancel`]) cancels the task at its next
/// await point and no further events are sent.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::cache::RetrievalCache;
use crate::config::DomainConfig;
use crate::error::AppError;
use crate::model::{AppliedErrata, DocumentIndex, RetrievalBudget, RetrievedSection, RouteDecision};
use crate::overlay::ErrataSet;
use crate::registry::IndexRegistry;
use crate::retriever::{RetrievalRequest, Retriever};
use crate::router::Router;
use crate::synthesizer::{SynthesisRequest, Synthesizer, NO_SECTIONS_ANSWER};

const EVENT_BUFFER: usize = 64;
const DEFAULT_SYNTH_TIMEOUT: Duration = Duration::from_secs(120);

/// A retrieved section as announced to the subscriber, without its content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionRef {
    pub document_name: String,
    pub node_id: String,
    pub section_number: String,
    pub title: String,
    pub breadcrumb: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errata: Option<AppliedErrata>,
}

impl From<&RetrievedSection> for SectionRef {
    fn from(section: &RetrievedSection) -> Self {
        Self {
            document_name: section.document_name.clone(),
            node_id: section.node_id.clone(),
            section_number: section.section_number.clone(),
            title: section.title.clone(),
            breadcrumb: section.breadcrumb.clone(),
            score: section.score,
            errata: section.errata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum QueryEvent {
    Route(RouteDecision),
    Sections(Vec<SectionRef>),
    Token(String),
    Done,
    /// Terminal; carries a message fit for display.
    Error(String),
}

impl QueryEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::Route(_) => "route",
            QueryEvent::Sections(_) => "sections",
            QueryEvent::Token(_) => "token",
            QueryEvent::Done => "done",
            QueryEvent::Error(_) => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Done | QueryEvent::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Routing,
    Retrieving,
    Streaming,
    Done,
    Error,
    /// Subscriber went away or cancelled; nothing more is emitted.
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Error | PipelineState::Cancelled
        )
    }

    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Routing)
            | (Routing, Retrieving)
            | (Retrieving, Streaming)
            | (Streaming, Streaming)
            | (Streaming, Done) => true,
            (from, Error | Cancelled) => from != Idle && !from.is_terminal(),
            _ => false,
        }
    }
}

/// Why a query stopped before `done`.
enum Stop {
    Cancelled,
    Failed(AppError),
}

impl From<AppError> for Stop {
    fn from(err: AppError) -> Self {
        Stop::Failed(err)
    }
}

/// Per-query task state: the event sender, the cancel token and the state machine.
struct QueryRun {
    events: mpsc::Sender<QueryEvent>,
    cancel: CancellationToken,
    state: PipelineState,
}

impl QueryRun {
    fn advance(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "query state");
        }
        self.state = next;
    }

    fn check_cancelled(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Send one event. A closed channel means the subscriber disconnected.
    async fn emit(&self, event: QueryEvent) -> Result<(), Stop> {
        self.check_cancelled()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            sent = self.events.send(event) => sent.map_err(|_| {
                self.cancel.cancel();
                Stop::Cancelled
            }),
        }
    }
}

/// Subscriber side of one query.
pub struct QueryHandle {
    stream: QueryStream,
    cancel: CancellationToken,
}

impl QueryHandle {
    pub async fn recv(&mut self) -> Option<QueryEvent> {
        self.stream.next().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The events as a stream. Dropping the stream cancels the query.
    pub fn into_stream(self) -> QueryStream {
        self.stream
    }

    /// Drain every event and fold them into a [`QueryResult`].
    pub async fn collect(mut self) -> QueryResult {
        let mut result = QueryResult::default();
        while let Some(event) = self.recv().await {
            match event {
                QueryEvent::Route(route) => result.route = Some(route),
                QueryEvent::Sections(sections) => result.sections = sections,
                QueryEvent::Token(token) => result.answer.push_str(&token),
                QueryEvent::Done => break,
                QueryEvent::Error(message) => {
                    result.error = Some(message);
                    break;
                }
            }
        }
        result
    }
}

/// Event stream that cancels its query when dropped.
pub struct QueryStream {
    inner: ReceiverStream<QueryEvent>,
    _guard: DropGuard,
}

impl Stream for QueryStream {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub route: Option<RouteDecision>,
    pub sections: Vec<SectionRef>,
    pub answer: String,
    pub error: Option<String>,
}

pub struct Pipeline {
    domain: Arc<DomainConfig>,
    registry: Arc<IndexRegistry>,
    router: Router,
    retriever: Retriever,
    synthesizer: Arc<dyn Synthesizer>,
    errata: Arc<ErrataSet>,
    cache: RetrievalCache,
    budget: RetrievalBudget,
    synth_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        domain: Arc<DomainConfig>,
        registry: Arc<IndexRegistry>,
        retriever: Retriever,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            router: Router::new(domain.clone()),
            domain,
            registry,
            retriever,
            synthesizer,
            errata: Arc::new(ErrataSet::empty()),
            cache: RetrievalCache::disabled(),
            budget: RetrievalBudget::default(),
            synth_timeout: DEFAULT_SYNTH_TIMEOUT,
        }
    }

    pub fn with_errata(mut self, errata: ErrataSet) -> Self {
        self.errata = Arc::new(errata);
        self
    }

    pub fn with_cache(mut self, cache: RetrievalCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_budget(mut self, budget: RetrievalBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Deadline for the whole answer generation, first token to last.
    pub fn with_synth_timeout(mut self, timeout: Duration) -> Self {
        self.synth_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    /// Start a query and return the subscriber's handle to its events.
    pub fn submit(self: &Arc<Self>, query: &str, persona: Option<&str>) -> QueryHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let run = QueryRun {
            events: tx,
            cancel: cancel.clone(),
            state: PipelineState::Idle,
        };
        let pipeline = Arc::clone(self);
        let query = query.to_string();
        let persona = self.domain.resolve_persona(persona);
        tokio::spawn(async move { pipeline.run(run, query, persona).await });

        QueryHandle {
            stream: QueryStream {
                inner: ReceiverStream::new(rx),
                _guard: cancel.clone().drop_guard(),
            },
            cancel,
        }
    }

    async fn run(&self, mut run: QueryRun, query: String, persona: String) {
        let started = Instant::now();
        match self.drive(&mut run, &query, &persona).await {
            Ok(()) => {
                run.advance(PipelineState::Done);
                info!(persona = %persona, elapsed_ms = started.elapsed().as_millis() as u64, "query done");
            }
            Err(Stop::Cancelled) => {
                run.advance(PipelineState::Cancelled);
                info!(persona = %persona, "query cancelled");
            }
            Err(Stop::Failed(error)) => {
                run.advance(PipelineState::Error);
                warn!(persona = %persona, error = %error, "query failed");
                // Best effort: the subscriber may already be gone.
                if !run.cancel.is_cancelled() {
                    let _ = run.events.send(QueryEvent::Error(error.user_message())).await;
                }
            }
        }
    }

    async fn drive(&self, run: &mut QueryRun, query: &str, persona: &str) -> Result<(), Stop> {
        // One snapshot for the whole query; reloads during the query do not affect it.
        let snapshot = self.registry.snapshot();

        run.advance(PipelineState::Routing);
        let available = snapshot.available_documents();
        let route = self
            .router
            .route(query, &available, snapshot.cards(), persona);
        info!(
            documents = ?route.documents,
            confidence = route.confidence,
            query_type = route.query_type.as_str(),
            "query routed"
        );
        let indexes: Vec<Arc<DocumentIndex>> = route
            .documents
            .iter()
            .filter_map(|name| snapshot.get(name))
            .collect();
        let referable: Vec<Arc<DocumentIndex>> = snapshot
            .indexes()
            .filter(|index| !route.documents.iter().any(|name| name == index.document_name()))
            .cloned()
            .collect();
        let card_names = route.card_names.clone();

        run.advance(PipelineState::Retrieving);
        run.emit(QueryEvent::Route(route)).await?;
        let sections = self
            .retrieve(run, query, persona, &indexes, &referable, &card_names)
            .await?;
        let sections = self.errata.apply(sections);

        run.advance(PipelineState::Streaming);
        run.emit(QueryEvent::Sections(
            sections.iter().map(SectionRef::from).collect(),
        ))
        .await?;

        if sections.is_empty() {
            run.emit(QueryEvent::Token(NO_SECTIONS_ANSWER.to_string()))
                .await?;
        } else {
            self.stream_answer(run, query, persona, sections).await?;
        }

        run.emit(QueryEvent::Done).await
    }

    async fn retrieve(
        &self,
        run: &QueryRun,
        query: &str,
        persona: &str,
        indexes: &[Arc<DocumentIndex>],
        referable: &[Arc<DocumentIndex>],
        card_names: &[String],
    ) -> Result<Vec<RetrievedSection>, Stop> {
        // Referable documents can contribute sections too, so their versions belong in the key.
        let documents: Vec<&DocumentIndex> = indexes
            .iter()
            .chain(referable)
            .map(|i| i.as_ref())
            .collect();
        if let Some(sections) = self
            .cache
            .get_sections(query, persona, &self.budget, &documents)
            .await
        {
            return Ok(sections);
        }
        run.check_cancelled()?;

        let request = RetrievalRequest {
            query,
            persona,
            indexes,
            budget: self.budget,
            card_names,
            referable,
        };
        let outcome = match self.retriever.retrieve(&request, &run.cancel).await {
            Ok(outcome) => outcome,
            Err(_) if run.cancel.is_cancelled() => return Err(Stop::Cancelled),
            Err(e) => return Err(e.into()),
        };
        run.check_cancelled()?;

        // Degraded results would pin keyword ranking in the cache after the oracle recovers.
        if outcome.degraded.is_empty() {
            self.cache
                .set_sections(query, persona, &self.budget, &documents, &outcome.sections)
                .await;
        }
        Ok(outcome.sections)
    }

    async fn stream_answer(
        &self,
        run: &QueryRun,
        query: &str,
        persona: &str,
        sections: Vec<RetrievedSection>,
    ) -> Result<(), Stop> {
        let deadline = Instant::now() + self.synth_timeout;
        let request = SynthesisRequest {
            query: query.to_string(),
            persona: persona.to_string(),
            sections,
        };

        run.check_cancelled()?;
        let mut tokens = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(Stop::Cancelled),
            started = tokio::time::timeout_at(deadline, self.synthesizer.generate(request)) => {
                match started {
                    Err(_) => return Err(AppError::SynthesizerTimeout.into()),
                    Ok(result) => result.map_err(AppError::from)?,
                }
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(Stop::Cancelled),
                next = tokio::time::timeout_at(deadline, tokens.next()) => next,
            };
            match next {
                Err(_) => return Err(AppError::SynthesizerTimeout.into()),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(AppError::from(e).into()),
                Ok(Some(Ok(token))) if token.is_empty() => {}
                Ok(Some(Ok(token))) => run.emit(QueryEvent::Token(token)).await?,
            }
        }
    }
}

/// One subscriber's sequence of queries. Submitting cancels whatever is still running.
#[derive(Default)]
pub struct QuerySession {
    in_flight: Option<CancellationToken>,
}

impl QuerySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, pipeline: &Arc<Pipeline>, query: &str, persona: Option<&str>) -> QueryHandle {
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }
        let handle = pipeline.submit(query, persona);
        self.in_flight = Some(handle.cancel.clone());
        handle
    }

    /// Nothing submitted yet, or the last query's stream is gone.
    pub fn is_idle(&self) -> bool {
        self.in_flight
            .as_ref()
            .map_or(true, CancellationToken::is_cancelled)
    }
}
