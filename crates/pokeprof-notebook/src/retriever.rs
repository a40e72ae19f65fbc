/// Bounded oracle-guided tree descent with a keyword-overlap fallback.
///
/// Each routed document is descended independently (concurrently, with oracle calls
/// gated by a shared semaphore), then the per-document hits are merged, sorted and
/// truncated. The oracle call budget and the selected-section budget are shared by all
/// documents of one retrieval.
///
/// Scores:
/// - oracle selection: `(0.5 + 0.5 * confidence) / ((1 + 0.25 * (depth - 1)) * (1 + 0.1 * position))`
/// - card title lookup: `1.0`
/// - keyword fallback: `0.5 * matched / query_tokens`
/// - cross-reference: `0.5 * score of the referencing section`
/// - referenced document: its own score times `0.7`
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::model::{DocumentIndex, DocumentType, NodeIdx, RetrievalBudget, RetrievedSection};
use crate::oracle::{BudgetHint, Oracle, OracleRequest, ORACLE_SCHEMA_VERSION};

pub const CARD_LOOKUP_SCORE: f32 = 1.0;
const FALLBACK_WEIGHT: f32 = 0.5;
const CROSS_REF_FACTOR: f32 = 0.5;
const CROSS_DOC_FACTOR: f32 = 0.7;

static CROSS_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:see\s+)?(?:rule|section)\s+(\d{1,3}(?:\.\d+)*(?:\.[a-z](?:\.\d+)*)?)")
        .expect("valid regex")
});

// "see the penalty guidelines", "as defined in the rulebook", "refer to the standard list"
static CROSS_DOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:as\s+(?:defined|described|outlined|specified)\s+in\s+(?:the\s+)?|see\s+(?:the\s+)?|refer\s+to\s+(?:the\s+)?)(rulebook|rules?\s+(?:and\s+)?regulations|penalty\s+guidelines|legal\s+card\s+list|standard\s+(?:legal\s+)?list)\b",
    )
    .expect("valid regex")
});

static QUERY_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+(?:\.[\p{L}\p{N}]+)*").expect("valid regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "if", "in", "is", "it", "many", "much", "my", "of", "on", "or", "the", "their", "this",
    "to", "what", "when", "where", "which", "who", "why", "with", "you", "your",
];

/// Oracle score for a selection. Decreasing in depth and position, increasing in
/// confidence; 1.0 for a confident first pick at depth 1.
pub fn oracle_score(depth: usize, confidence: f32, position: usize) -> f32 {
    let depth_penalty = 1.0 + 0.25 * depth.saturating_sub(1) as f32;
    let position_penalty = 1.0 + 0.1 * position as f32;
    (0.5 + 0.5 * confidence.clamp(0.0, 1.0)) / (depth_penalty * position_penalty)
}

/// Lower-cased query words with light plural folding. Stopwords are dropped unless
/// nothing else is left.
pub fn query_tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut all: Vec<(String, bool)> = Vec::new();
    for m in QUERY_TOKEN_RE.find_iter(&lower) {
        let raw = m.as_str();
        let token = fold_plural(raw);
        if !all.iter().any(|(t, _)| *t == token) {
            all.push((token, STOPWORDS.contains(&raw)));
        }
    }
    if all.iter().all(|(_, stop)| *stop) {
        all.into_iter().map(|(t, _)| t).collect()
    } else {
        all.into_iter().filter(|(_, stop)| !stop).map(|(t, _)| t).collect()
    }
}

fn fold_plural(token: &str) -> String {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token[..token.len() - 1].to_string()
    } else {
        token.to_string()
    }
}

pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub persona: &'a str,
    /// Routed documents in route priority order.
    pub indexes: &'a [Arc<DocumentIndex>],
    pub budget: RetrievalBudget,
    /// Card names detected by the router.
    pub card_names: &'a [String],
    /// Unrouted documents that retrieved text may name ("see the penalty guidelines").
    /// A named one is searched as well, with its scores scaled down.
    pub referable: &'a [Arc<DocumentIndex>],
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub sections: Vec<RetrievedSection>,
    pub oracle_calls: usize,
    /// Documents whose descent fell back to keyword ranking.
    pub degraded: Vec<String>,
}

/// Budget shared by every document descent of one retrieval.
struct SharedBudget {
    calls_left: AtomicUsize,
    calls_made: AtomicUsize,
    selected: AtomicUsize,
    max_sections: usize,
}

impl SharedBudget {
    fn new(budget: &RetrievalBudget) -> Self {
        Self {
            calls_left: AtomicUsize::new(budget.max_oracle_calls),
            calls_made: AtomicUsize::new(0),
            selected: AtomicUsize::new(0),
            max_sections: budget.max_sections,
        }
    }

    fn try_reserve_call(&self) -> bool {
        let reserved = self
            .calls_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if reserved {
            self.calls_made.fetch_add(1, Ordering::SeqCst);
        }
        reserved
    }

    fn add_selected(&self, n: usize) {
        self.selected.fetch_add(n, Ordering::SeqCst);
    }

    fn sections_full(&self) -> bool {
        self.selected.load(Ordering::SeqCst) >= self.max_sections
    }

    fn remaining_sections(&self) -> usize {
        self.max_sections
            .saturating_sub(self.selected.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    idx: NodeIdx,
    score: f32,
}

#[derive(Default)]
struct DocumentHits {
    hits: Vec<Hit>,
    seen: HashSet<NodeIdx>,
}

impl DocumentHits {
    fn push(&mut self, idx: NodeIdx, score: f32) -> bool {
        if idx == 0 || !self.seen.insert(idx) {
            return false;
        }
        self.hits.push(Hit { idx, score });
        true
    }
}

#[derive(Default)]
struct DocumentResult {
    hits: Vec<Hit>,
    /// The document had at least one node under its root.
    had_candidates: bool,
    /// Keyword fallback ran because the oracle was unavailable or failed.
    oracle_degraded: bool,
}

#[derive(Clone)]
pub struct Retriever {
    oracle: Arc<dyn Oracle>,
    oracle_slots: Arc<Semaphore>,
    oracle_timeout: Duration,
}

impl Retriever {
    pub fn new(oracle: Arc<dyn Oracle>, max_concurrent_calls: usize, oracle_timeout: Duration) -> Self {
        Self {
            oracle,
            oracle_slots: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            oracle_timeout,
        }
    }

    /// Retrieve ranked sections for `request`. Fails with `RetrievalExhausted` only when
    /// every document with content had to fall back to keyword ranking and that
    /// fallback matched nothing.
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome, AppError> {
        let shared = SharedBudget::new(&request.budget);
        let lowered_cards: Vec<String> = request.card_names.iter().map(|c| c.to_lowercase()).collect();

        let results = join_all(
            request
                .indexes
                .iter()
                .map(|index| self.retrieve_document(request, index, &shared, &lowered_cards, cancel)),
        )
        .await;

        let mut merge = Merge::default();
        for (rank, (index, result)) in request.indexes.iter().zip(results).enumerate() {
            merge.add(rank, index, result, 1.0);
        }

        let referenced = referenced_documents(request, &merge.sections);
        if !referenced.is_empty() && !cancel.is_cancelled() {
            let extra = join_all(
                referenced
                    .iter()
                    .map(|index| self.retrieve_document(request, index, &shared, &lowered_cards, cancel)),
            )
            .await;
            for (offset, (index, result)) in referenced.iter().zip(extra).enumerate() {
                debug!(document = index.document_name(), hits = result.hits.len(), "referenced document");
                merge.add(request.indexes.len() + offset, index, result, CROSS_DOC_FACTOR);
            }
        }

        let Merge {
            sections: mut merged,
            degraded,
            any_healthy,
        } = merge;
        merged.sort_by(|(rank_a, a), (rank_b, b)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| rank_a.cmp(rank_b))
                .then_with(|| a.position.cmp(&b.position))
        });
        let mut seen = HashSet::new();
        let sections: Vec<RetrievedSection> = merged
            .into_iter()
            .map(|(_, section)| section)
            .filter(|s| seen.insert((s.document_name.clone(), s.node_id.clone())))
            .take(request.budget.max_sections)
            .collect();

        let oracle_calls = shared.calls_made.load(Ordering::SeqCst);
        if sections.is_empty() && !degraded.is_empty() && !any_healthy {
            warn!(
                documents = ?degraded,
                "retrieval exhausted: oracle unavailable and keyword fallback matched nothing"
            );
            return Err(AppError::RetrievalExhausted);
        }

        info!(
            sections = sections.len(),
            oracle_calls,
            degraded = degraded.len(),
            "retrieval complete"
        );
        Ok(RetrievalOutcome {
            sections,
            oracle_calls,
            degraded,
        })
    }

    async fn retrieve_document(
        &self,
        request: &RetrievalRequest<'_>,
        index: &DocumentIndex,
        shared: &SharedBudget,
        lowered_cards: &[String],
        cancel: &CancellationToken,
    ) -> DocumentResult {
        let document = index.document_name();
        if index.root().children.is_empty() {
            debug!(document, "document has no sections");
            return DocumentResult::default();
        }

        let mut hits = DocumentHits::default();
        let mut oracle_degraded = false;

        // Card databases answer named-card questions by direct title lookup.
        let card_hits = if index.document_type() == DocumentType::CardDatabase {
            card_lookup(index, lowered_cards)
        } else {
            Vec::new()
        };
        if !card_hits.is_empty() {
            for idx in card_hits {
                hits.push(idx, CARD_LOOKUP_SCORE);
            }
            shared.add_selected(hits.hits.len());
            debug!(document, cards = hits.hits.len(), "card lookup");
        } else {
            let (descent, last_frontier) =
                self.descend(request, index, shared, &mut hits, cancel).await;
            let wants_fallback = match descent {
                DescentEnd::OracleFailed | DescentEnd::NothingChosen => {
                    oracle_degraded = true;
                    true
                }
                DescentEnd::CallsExhausted => hits.hits.is_empty(),
                DescentEnd::Finished | DescentEnd::Cancelled => false,
            };
            if wants_fallback && !cancel.is_cancelled() {
                let limit = request.budget.max_sections;
                // Search where the descent had narrowed to first, then the whole document.
                let ranked = keyword_fallback(index, request.query, &last_frontier, limit);
                let ranked = if ranked.is_empty() {
                    keyword_fallback(index, request.query, &index.root().children, limit)
                } else {
                    ranked
                };
                debug!(document, matches = ranked.len(), oracle_degraded, "keyword fallback");
                for hit in ranked {
                    if hits.push(hit.idx, hit.score) {
                        shared.add_selected(1);
                    }
                }
            }
        }

        expand_cross_references(index, &mut hits, request.budget.max_sections);

        DocumentResult {
            hits: hits.hits,
            had_candidates: true,
            oracle_degraded,
        }
    }

    async fn descend(
        &self,
        request: &RetrievalRequest<'_>,
        index: &DocumentIndex,
        shared: &SharedBudget,
        hits: &mut DocumentHits,
        cancel: &CancellationToken,
    ) -> (DescentEnd, Vec<NodeIdx>) {
        let document = index.document_name();
        let mut frontier: Vec<NodeIdx> = index.root().children.clone();
        if !self.oracle.is_available() {
            return (DescentEnd::OracleFailed, frontier);
        }
        let mut depth = 1;

        while !frontier.is_empty() {
            if cancel.is_cancelled() {
                return (DescentEnd::Cancelled, frontier);
            }
            if shared.sections_full() {
                return (DescentEnd::Finished, frontier);
            }
            if !shared.try_reserve_call() {
                debug!(document, "oracle call budget exhausted");
                return (DescentEnd::CallsExhausted, frontier);
            }

            let summaries: Vec<_> = frontier.iter().filter_map(|&idx| index.summary(idx)).collect();
            let oracle_request = OracleRequest {
                version: ORACLE_SCHEMA_VERSION,
                query: request.query.to_string(),
                persona: request.persona.to_string(),
                document_name: document.to_string(),
                frontier: summaries,
                budget_hint: BudgetHint {
                    depth,
                    max_depth: request.budget.max_depth,
                    remaining_sections: shared.remaining_sections(),
                    remaining_calls: shared.calls_left.load(Ordering::SeqCst),
                },
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return (DescentEnd::Cancelled, frontier),
                outcome = self.call_oracle(&oracle_request) => outcome,
            };
            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    warn!(document, depth, error = %e, "oracle call failed, degrading to keyword fallback");
                    return (DescentEnd::OracleFailed, frontier);
                }
            };

            let choice = response.validate(&oracle_request.frontier);
            for violation in &choice.violations {
                let err = AppError::OracleContractViolation(violation.clone());
                warn!(document, depth, error = %err, "ignoring invalid oracle output");
            }

            let mut position = 0;
            let mut added = 0;
            let mut select = |idx: NodeIdx, hits: &mut DocumentHits| {
                if hits.push(idx, oracle_score(depth, choice.confidence, position)) {
                    added += 1;
                }
                position += 1;
            };
            for id in &choice.select {
                if let Some(idx) = index.find(id) {
                    select(idx, hits);
                }
            }
            let mut next = Vec::new();
            for id in &choice.descend {
                let Some(idx) = index.find(id) else { continue };
                let node = &index.nodes()[idx];
                if node.is_leaf() || depth >= request.budget.max_depth {
                    select(idx, hits);
                } else {
                    next.extend(node.children.iter().copied());
                }
            }
            shared.add_selected(added);
            if choice.select.is_empty() && choice.descend.is_empty() && hits.hits.is_empty() {
                warn!(document, depth, "oracle chose nothing usable, degrading to keyword fallback");
                return (DescentEnd::NothingChosen, frontier);
            }
            debug!(
                document,
                depth,
                selected = added,
                next_frontier = next.len(),
                "descent step"
            );

            frontier = next;
            depth += 1;
        }
        (DescentEnd::Finished, frontier)
    }

    async fn call_oracle(
        &self,
        request: &OracleRequest,
    ) -> Result<crate::oracle::OracleResponse, AppError> {
        let _permit = self
            .oracle_slots
            .acquire()
            .await
            .map_err(|_| AppError::OracleUnavailable("oracle semaphore closed".to_string()))?;
        match tokio::time::timeout(self.oracle_timeout, self.oracle.choose(request)).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::OracleTimeout),
        }
    }
}

enum DescentEnd {
    Finished,
    CallsExhausted,
    OracleFailed,
    /// The oracle answered but named no frontier node, and nothing was selected yet.
    NothingChosen,
    Cancelled,
}

/// Per-document results folded into one ranked list.
#[derive(Default)]
struct Merge {
    /// Route rank (routed documents first, then referenced ones) and section.
    sections: Vec<(usize, RetrievedSection)>,
    degraded: Vec<String>,
    any_healthy: bool,
}

impl Merge {
    fn add(&mut self, rank: usize, index: &DocumentIndex, result: DocumentResult, factor: f32) {
        if result.oracle_degraded {
            self.degraded.push(index.document_name().to_string());
        } else if result.had_candidates {
            self.any_healthy = true;
        }
        self.sections.extend(
            result
                .hits
                .iter()
                .filter_map(|hit| RetrievedSection::from_node(index, hit.idx, hit.score * factor))
                .map(|section| (rank, section)),
        );
    }
}

fn referenced_type(phrase: &str) -> DocumentType {
    let phrase = phrase.to_lowercase();
    if phrase.starts_with("penalty") {
        DocumentType::PenaltyGuidelines
    } else if phrase.ends_with("list") {
        DocumentType::LegalCardList
    } else {
        DocumentType::Rulebook
    }
}

/// Referable documents whose type is named in the content of a retrieved section of
/// another document type. Routed documents are never searched twice.
fn referenced_documents<'a>(
    request: &RetrievalRequest<'a>,
    sections: &[(usize, RetrievedSection)],
) -> Vec<&'a Arc<DocumentIndex>> {
    let mut wanted = HashSet::new();
    for (_, section) in sections {
        for caps in CROSS_DOC_RE.captures_iter(&section.content) {
            let document_type = referenced_type(&caps[1]);
            if document_type != section.document_type {
                wanted.insert(document_type);
            }
        }
    }
    if wanted.is_empty() {
        return Vec::new();
    }
    request
        .referable
        .iter()
        .filter(|index| wanted.contains(&index.document_type()))
        .filter(|index| {
            !request
                .indexes
                .iter()
                .any(|routed| routed.document_name() == index.document_name())
        })
        .collect()
}

/// Leaf titles of card databases matching any detected card name, case-insensitively.
fn card_lookup(index: &DocumentIndex, lowered_cards: &[String]) -> Vec<NodeIdx> {
    if lowered_cards.is_empty() {
        return Vec::new();
    }
    index
        .nodes()
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, node)| node.is_leaf())
        .filter(|(_, node)| lowered_cards.contains(&node.metadata.title.trim().to_lowercase()))
        .map(|(idx, _)| idx)
        .collect()
}

/// Rank leaves under `scope` by overlap between query tokens and the leaf's title and
/// section number. Only leaves matching at least one token are returned.
fn keyword_fallback(index: &DocumentIndex, query: &str, scope: &[NodeIdx], limit: usize) -> Vec<Hit> {
    let tokens = query_tokens(query);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut visited = HashSet::new();
    let mut ranked = Vec::new();
    for &root in scope {
        for idx in index.subtree(root) {
            if !visited.insert(idx) {
                continue;
            }
            let node = &index.nodes()[idx];
            if !node.is_leaf() || idx == 0 {
                continue;
            }
            let label = format!("{} {}", node.metadata.section_number, node.metadata.title);
            let leaf_tokens = query_tokens(&label);
            let matched = tokens.iter().filter(|t| leaf_tokens.contains(t)).count();
            if matched > 0 {
                let score = FALLBACK_WEIGHT * matched as f32 / tokens.len() as f32;
                ranked.push(Hit { idx, score });
            }
        }
    }
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.idx.cmp(&b.idx)));
    ranked.truncate(limit);
    ranked
}

/// Add sections referenced as "see rule 3.4" / "section 2.1" from already retrieved
/// sections of the same document.
fn expand_cross_references(index: &DocumentIndex, hits: &mut DocumentHits, limit: usize) {
    let primary: Vec<Hit> = hits.hits.clone();
    for hit in primary {
        if hits.hits.len() >= limit {
            break;
        }
        let content = &index.nodes()[hit.idx].content;
        for caps in CROSS_REF_RE.captures_iter(content) {
            if hits.hits.len() >= limit {
                break;
            }
            if let Some(target) = index.find_section(&caps[1]) {
                if hits.push(target, CROSS_REF_FACTOR * hit.score) {
                    debug!(
                        document = index.document_name(),
                        from = %index.nodes()[hit.idx].id,
                        to = %caps[1].to_string(),
                        "cross reference"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{index_from_outline, sample_rulebook};
    use crate::oracle::{DisabledOracle, OracleError, OracleResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Script = dyn Fn(&OracleRequest) -> Result<OracleResponse, OracleError> + Send + Sync;

    struct ScriptedOracle {
        script: Box<Script>,
        calls: AtomicUsize,
        seen_ids: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedOracle {
        fn new<F>(f: F) -> Arc<Self>
        where
            F: Fn(&OracleRequest) -> Result<OracleResponse, OracleError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                script: Box::new(f),
                calls: AtomicUsize::new(0),
                seen_ids: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Oracle for ScriptedOracle {
        async fn choose(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_ids
                .lock()
                .unwrap()
                .push(request.frontier.iter().map(|n| n.id.clone()).collect());
            (self.script)(request)
        }
    }

    /// Selects frontier nodes whose title contains `needle`, descends every other
    /// non-leaf node.
    fn title_seeker(needle: &'static str) -> Arc<ScriptedOracle> {
        ScriptedOracle::new(move |req| {
            let mut response = OracleResponse::default();
            for node in &req.frontier {
                if node.title.contains(needle) {
                    response.select.push(node.id.clone());
                } else if !node.is_leaf {
                    response.descend.push(node.id.clone());
                }
            }
            Ok(response)
        })
    }

    fn retriever(oracle: Arc<dyn Oracle>) -> Retriever {
        Retriever::new(oracle, 2, Duration::from_secs(5))
    }

    async fn run(
        retriever: &Retriever,
        query: &str,
        indexes: &[Arc<DocumentIndex>],
        budget: RetrievalBudget,
    ) -> Result<RetrievalOutcome, AppError> {
        let request = RetrievalRequest {
            query,
            persona: "judge",
            indexes,
            budget,
            card_names: &[],
            referable: &[],
        };
        retriever.retrieve(&request, &CancellationToken::new()).await
    }

    #[test]
    fn score_is_monotonic() {
        assert_eq!(oracle_score(1, 1.0, 0), 1.0);
        assert!(oracle_score(1, 1.0, 0) > oracle_score(2, 1.0, 0));
        assert!(oracle_score(2, 1.0, 0) > oracle_score(2, 1.0, 1));
        assert!(oracle_score(1, 0.9, 0) > oracle_score(1, 0.2, 0));
        assert_eq!(oracle_score(3, 0.5, 2), oracle_score(3, 0.5, 2));
    }

    #[test]
    fn query_tokens_drop_stopwords_and_fold_plurals() {
        assert_eq!(
            query_tokens("How many Prize cards at the start of a game?"),
            vec!["prize", "card", "start", "game"]
        );
        assert_eq!(query_tokens("what is it"), vec!["what", "is", "it"]);
        assert_eq!(query_tokens("see rule 3.4.1."), vec!["see", "rule", "3.4.1"]);
    }

    #[tokio::test]
    async fn guided_descent_selects_matching_section() {
        let oracle = title_seeker("Prize Cards");
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(&retriever(oracle.clone()), "prize cards", &indexes, RetrievalBudget::default())
            .await
            .unwrap();
        let numbers: Vec<&str> = outcome.sections.iter().map(|s| s.section_number.as_str()).collect();
        assert_eq!(numbers, vec!["3.4"]);
        assert_eq!(outcome.sections[0].breadcrumb, "3 Setup > 3.4 Prize Cards");
        assert_eq!(oracle.calls(), 2);
        // The synthetic root is never offered.
        let seen = oracle.seen_ids.lock().unwrap();
        assert_eq!(seen[0], vec!["1", "3"]);
        assert!(seen.iter().flatten().all(|id| id != "root"));
    }

    #[tokio::test]
    async fn invalid_ids_are_ignored() {
        let oracle = ScriptedOracle::new(|req| {
            Ok(OracleResponse {
                version: Some(1),
                descend: vec!["nope".into()],
                select: vec!["made-up".into(), req.frontier[0].id.clone(), "3.4".into()],
                confidence: Some(0.8),
            })
        });
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(&retriever(oracle), "anything", &indexes, RetrievalBudget::default())
            .await
            .unwrap();
        let ids: Vec<&str> = outcome.sections.iter().map(|s| s.node_id.as_str()).collect();
        // "3.4" is not in the first frontier, so it is dropped like the made-up ids.
        assert_eq!(ids, vec!["1"]);
    }

    #[tokio::test]
    async fn oracle_calls_and_sections_stay_within_budget() {
        // Always descends everything and selects everything: the greediest oracle.
        let oracle = ScriptedOracle::new(|req| {
            Ok(OracleResponse {
                version: None,
                descend: req.frontier.iter().filter(|n| !n.is_leaf).map(|n| n.id.clone()).collect(),
                select: req.frontier.iter().filter(|n| n.is_leaf).map(|n| n.id.clone()).collect(),
                confidence: None,
            })
        });
        let deep = index_from_outline(
            "deep",
            DocumentType::Rulebook,
            &[
                (1, "1", "A", "a"),
                (2, "1.1", "B", "b"),
                (3, "1.1.1", "C", "c"),
                (4, "1.1.1.1", "D", "d"),
                (5, "1.1.1.1.1", "E", "e"),
                (6, "1.1.1.1.1.1", "F", "f"),
            ],
        );
        let indexes = vec![Arc::new(sample_rulebook()), Arc::new(deep)];
        for (calls, sections) in [(0, 3), (1, 2), (3, 10), (12, 1)] {
            let budget = RetrievalBudget {
                max_sections: sections,
                max_depth: 3,
                max_oracle_calls: calls,
            };
            let outcome = run(&retriever(oracle.clone()), "q", &indexes, budget).await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => panic!("budget {budget:?} failed: {e}"),
            };
            assert!(outcome.oracle_calls <= calls, "calls for {budget:?}");
            assert!(outcome.sections.len() <= sections, "sections for {budget:?}");
        }
    }

    #[tokio::test]
    async fn max_depth_turns_descend_into_select() {
        let oracle = ScriptedOracle::new(|req| {
            Ok(OracleResponse {
                descend: req.frontier.iter().map(|n| n.id.clone()).collect(),
                ..Default::default()
            })
        });
        let indexes = vec![Arc::new(sample_rulebook())];
        let budget = RetrievalBudget {
            max_sections: 10,
            max_depth: 1,
            max_oracle_calls: 10,
        };
        let outcome = run(&retriever(oracle.clone()), "q", &indexes, budget).await.unwrap();
        let ids: Vec<&str> = outcome.sections.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn disabled_oracle_falls_back_to_keywords() {
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(
            &retriever(Arc::new(DisabledOracle)),
            "How many Prize cards at the start of a game?",
            &indexes,
            RetrievalBudget::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.oracle_calls, 0);
        assert_eq!(outcome.degraded, vec!["rulebook"]);
        assert_eq!(outcome.sections[0].node_id, "3.4.1");
        assert!(outcome.sections[0].score > 0.0 && outcome.sections[0].score <= 0.5);
        assert!(outcome.sections.iter().all(|s| s.node_id != "3.3"));
    }

    #[tokio::test]
    async fn fallback_without_matches_is_exhausted() {
        let indexes = vec![Arc::new(sample_rulebook())];
        let err = run(
            &retriever(Arc::new(DisabledOracle)),
            "xyzzy plugh",
            &indexes,
            RetrievalBudget::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::RetrievalExhausted));
    }

    #[tokio::test]
    async fn failing_oracle_degrades_one_step_not_the_query() {
        let oracle = ScriptedOracle::new(|req| {
            if req.budget_hint.depth == 1 {
                Ok(OracleResponse {
                    descend: vec!["3".into()],
                    ..Default::default()
                })
            } else {
                Err(OracleError::Unavailable("connection reset".into()))
            }
        });
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(&retriever(oracle), "opening hand size", &indexes, RetrievalBudget::default())
            .await
            .unwrap();
        assert_eq!(outcome.degraded, vec!["rulebook"]);
        assert_eq!(outcome.sections[0].node_id, "3.3");
    }

    #[tokio::test]
    async fn slow_oracle_times_out_into_fallback() {
        struct Sleepy;
        #[async_trait]
        impl Oracle for Sleepy {
            async fn choose(&self, _: &OracleRequest) -> Result<OracleResponse, OracleError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(OracleResponse::default())
            }
        }
        let retriever = Retriever::new(Arc::new(Sleepy), 1, Duration::from_millis(20));
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(&retriever, "prize card count", &indexes, RetrievalBudget::default())
            .await
            .unwrap();
        assert_eq!(outcome.degraded, vec!["rulebook"]);
        assert_eq!(outcome.sections[0].node_id, "3.4.1");
    }

    #[tokio::test]
    async fn empty_document_does_not_affect_others() {
        let empty = crate::model::TreeBuilder::new("empty", DocumentType::RulingsCompendium)
            .finish(String::new())
            .unwrap();
        let indexes = vec![Arc::new(empty), Arc::new(sample_rulebook())];
        let outcome = run(
            &retriever(title_seeker("Prize Cards")),
            "prize",
            &indexes,
            RetrievalBudget::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.sections.len(), 1);
        assert_eq!(outcome.sections[0].document_name, "rulebook");
    }

    #[tokio::test]
    async fn card_names_bypass_descent() {
        let cards = index_from_outline(
            "card_db_pokemon",
            DocumentType::CardDatabase,
            &[
                (1, "", "Fire Type", ""),
                (2, "", "Charizard ex", "Burning Darkness"),
                (2, "", "Charmander", "Ember"),
            ],
        );
        let oracle = title_seeker("nothing");
        let indexes = vec![Arc::new(cards)];
        let card_names = vec!["Charizard ex".to_string()];
        let request = RetrievalRequest {
            query: "What does Charizard ex do?",
            persona: "player",
            indexes: &indexes,
            budget: RetrievalBudget::default(),
            card_names: &card_names,
            referable: &[],
        };
        let outcome = retriever(oracle.clone())
            .retrieve(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.sections.len(), 1);
        assert_eq!(outcome.sections[0].node_id, "charizard-ex");
        assert_eq!(outcome.sections[0].score, CARD_LOOKUP_SCORE);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn merge_orders_by_score_then_route_rank() {
        let oracle = ScriptedOracle::new(|req| {
            Ok(OracleResponse {
                select: vec![req.frontier[0].id.clone()],
                ..Default::default()
            })
        });
        let other = index_from_outline(
            "penalty_guidelines",
            DocumentType::PenaltyGuidelines,
            &[(1, "1", "Warnings", "text")],
        );
        let indexes = vec![Arc::new(other), Arc::new(sample_rulebook())];
        let outcome = run(&retriever(oracle), "q", &indexes, RetrievalBudget::default())
            .await
            .unwrap();
        let docs: Vec<&str> = outcome.sections.iter().map(|s| s.document_name.as_str()).collect();
        assert_eq!(docs, vec!["penalty_guidelines", "rulebook"]);
        assert_eq!(outcome.sections[0].score, outcome.sections[1].score);
    }

    #[tokio::test]
    async fn cancelled_retrieval_issues_no_calls() {
        let oracle = title_seeker("Prize");
        let indexes = vec![Arc::new(sample_rulebook())];
        let request = RetrievalRequest {
            query: "prize",
            persona: "judge",
            indexes: &indexes,
            budget: RetrievalBudget::default(),
            card_names: &[],
            referable: &[],
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = retriever(oracle.clone()).retrieve(&request, &cancel).await.unwrap();
        assert!(outcome.sections.is_empty());
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn unusable_oracle_choice_falls_back_to_keywords() {
        let invented: Arc<ScriptedOracle> = ScriptedOracle::new(|_| {
            Ok(OracleResponse {
                select: vec!["hallucinated".into()],
                ..Default::default()
            })
        });
        let silent: Arc<ScriptedOracle> = ScriptedOracle::new(|_| Ok(OracleResponse::default()));
        let indexes = vec![Arc::new(sample_rulebook())];
        for oracle in [invented, silent] {
            let outcome = run(
                &retriever(oracle.clone()),
                "How many Prize cards at the start of a game?",
                &indexes,
                RetrievalBudget::default(),
            )
            .await
            .unwrap();
            assert_eq!(oracle.calls(), 1);
            assert_eq!(outcome.oracle_calls, 1);
            assert_eq!(outcome.degraded, vec!["rulebook"]);
            assert_eq!(outcome.sections[0].node_id, "3.4.1");
        }
    }

    #[tokio::test]
    async fn empty_choice_after_a_selection_is_not_degraded() {
        let oracle = ScriptedOracle::new(|req| {
            if req.budget_hint.depth == 1 {
                Ok(OracleResponse {
                    select: vec!["1".into()],
                    descend: vec!["3".into()],
                    ..Default::default()
                })
            } else {
                Ok(OracleResponse::default())
            }
        });
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(&retriever(oracle), "overview", &indexes, RetrievalBudget::default())
            .await
            .unwrap();
        assert!(outcome.degraded.is_empty());
        let ids: Vec<&str> = outcome.sections.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[tokio::test]
    async fn referenced_sections_are_added_at_half_score() {
        let indexes = vec![Arc::new(sample_rulebook())];
        let outcome = run(
            &retriever(Arc::new(DisabledOracle)),
            "prize card count",
            &indexes,
            RetrievalBudget::default(),
        )
        .await
        .unwrap();
        let ranked: Vec<(&str, f32)> = outcome
            .sections
            .iter()
            .map(|s| (s.node_id.as_str(), s.score))
            .collect();
        // 3.4.1 says "see rule 1.1"; 1.2 only shares "card".
        assert_eq!(ranked[0], ("3.4.1", 0.5));
        assert_eq!(ranked[1], ("1.1", 0.25));
        assert_eq!(ranked[2].0, "1.2");

        let budget = RetrievalBudget {
            max_sections: 1,
            ..RetrievalBudget::default()
        };
        let outcome = run(&retriever(Arc::new(DisabledOracle)), "prize card count", &indexes, budget)
            .await
            .unwrap();
        let ids: Vec<&str> = outcome.sections.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["3.4.1"]);
    }

    fn conduct_documents() -> (Arc<DocumentIndex>, Arc<DocumentIndex>) {
        let rulebook = index_from_outline(
            "rulebook",
            DocumentType::Rulebook,
            &[(1, "5", "Conduct", "Unsporting conduct is penalized, see the Penalty Guidelines.")],
        );
        let penalties = index_from_outline(
            "penalty_guidelines",
            DocumentType::PenaltyGuidelines,
            &[(1, "3", "Unsporting Conduct", "A first offense is a warning.")],
        );
        (Arc::new(rulebook), Arc::new(penalties))
    }

    async fn run_with_referable(
        retriever: &Retriever,
        indexes: &[Arc<DocumentIndex>],
        referable: &[Arc<DocumentIndex>],
        budget: RetrievalBudget,
    ) -> RetrievalOutcome {
        let request = RetrievalRequest {
            query: "unsporting conduct",
            persona: "judge",
            indexes,
            budget,
            card_names: &[],
            referable,
        };
        retriever.retrieve(&request, &CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn named_documents_are_searched_at_reduced_score() {
        let (rulebook, penalties) = conduct_documents();
        let oracle = title_seeker("Conduct");
        let outcome = run_with_referable(
            &retriever(oracle.clone()),
            &[rulebook.clone()],
            &[penalties.clone()],
            RetrievalBudget::default(),
        )
        .await;
        let ranked: Vec<(&str, &str, f32)> = outcome
            .sections
            .iter()
            .map(|s| (s.document_name.as_str(), s.node_id.as_str(), s.score))
            .collect();
        assert_eq!(
            ranked,
            vec![("rulebook", "5", 1.0), ("penalty_guidelines", "3", CROSS_DOC_FACTOR)]
        );
        assert_eq!(oracle.calls(), 2);

        // Already routed: searched once, at full score.
        let oracle = title_seeker("Conduct");
        let outcome = run_with_referable(
            &retriever(oracle.clone()),
            &[rulebook.clone(), penalties.clone()],
            &[penalties.clone()],
            RetrievalBudget::default(),
        )
        .await;
        assert_eq!(outcome.sections.len(), 2);
        assert!(outcome.sections.iter().all(|s| s.score == 1.0));
        assert_eq!(oracle.calls(), 2);

        // The referenced document shares the section budget.
        let oracle = title_seeker("Conduct");
        let budget = RetrievalBudget {
            max_sections: 1,
            ..RetrievalBudget::default()
        };
        let outcome =
            run_with_referable(&retriever(oracle.clone()), &[rulebook], &[penalties], budget).await;
        assert_eq!(outcome.sections.len(), 1);
        assert_eq!(outcome.sections[0].document_name, "rulebook");
        assert_eq!(oracle.calls(), 1);
    }

    #[test]
    fn document_references_map_to_types() {
        let phrases: Vec<DocumentType> = CROSS_DOC_RE
            .captures_iter(
                "As defined in the rulebook. See the penalty guidelines. \
                 Refer to the Standard Legal List. See rules and regulations. See rule 3.4.",
            )
            .map(|caps| referenced_type(&caps[1]))
            .collect();
        assert_eq!(
            phrases,
            vec![
                DocumentType::Rulebook,
                DocumentType::PenaltyGuidelines,
                DocumentType::LegalCardList,
                DocumentType::Rulebook,
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_oracle_calls_stay_within_limit() {
        #[derive(Default)]
        struct Crowd {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }
        #[async_trait]
        impl Oracle for Crowd {
            async fn choose(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(OracleResponse {
                    select: vec![request.frontier[0].id.clone()],
                    ..Default::default()
                })
            }
        }

        let oracle = Arc::new(Crowd::default());
        let indexes: Vec<Arc<DocumentIndex>> = ["rulebook", "penalty_guidelines", "legal_card_list", "rulings"]
            .into_iter()
            .map(|name| {
                Arc::new(index_from_outline(
                    name,
                    DocumentType::Rulebook,
                    &[(1, "1", "Only Section", "text")],
                ))
            })
            .collect();
        let outcome = run(
            &Retriever::new(oracle.clone(), 2, Duration::from_secs(5)),
            "q",
            &indexes,
            RetrievalBudget::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.oracle_calls, 4);
        assert_eq!(outcome.sections.len(), 4);
        assert_eq!(oracle.peak.load(Ordering::SeqCst), 2);
    }
}
