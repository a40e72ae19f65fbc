/// The oracle: an injected capability that picks which frontier nodes to descend into
/// and which to select as answers.
///
/// Requests and responses use a fixed, versioned schema. Responses are validated
/// against the frontier they were asked about before the retriever acts on them.
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use notebook_common::openai::{ChatRequest, Message, OpenAiClient, OpenAiClientError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;
use crate::model::NodeSummary;

pub const ORACLE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetHint {
    /// Depth of the frontier being shown (root children are depth 1).
    pub depth: usize,
    pub max_depth: usize,
    pub remaining_sections: usize,
    pub remaining_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub version: u32,
    pub query: String,
    pub persona: String,
    pub document_name: String,
    /// Summaries only; node content is never sent at this stage.
    pub frontier: Vec<NodeSummary>,
    pub budget_hint: BudgetHint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub descend: Vec<String>,
    /// Ordered most relevant first.
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// An oracle response after checking it against the frontier it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChoice {
    pub descend: Vec<String>,
    pub select: Vec<String>,
    /// In `[0, 1]`; 1.0 when the oracle did not report one.
    pub confidence: f32,
    /// Everything that was dropped, for logging.
    pub violations: Vec<String>,
}

impl OracleResponse {
    /// Keep only ids present in `frontier`, first occurrence wins, and an id listed in
    /// both `select` and `descend` is selected.
    pub fn validate(&self, frontier: &[NodeSummary]) -> ValidatedChoice {
        let allowed: HashSet<&str> = frontier.iter().map(|n| n.id.as_str()).collect();
        let mut violations = Vec::new();
        let mut seen = HashSet::new();

        let mut keep = |ids: &[String], kind: &str| -> Vec<String> {
            let mut out = Vec::new();
            for id in ids {
                if !allowed.contains(id.as_str()) {
                    violations.push(format!("{kind} id not in frontier: {id}"));
                } else if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
            out
        };
        let select = keep(&self.select, "select");
        let descend = keep(&self.descend, "descend");

        let confidence = match self.confidence {
            None => 1.0,
            Some(c) if (0.0..=1.0).contains(&c) => c,
            Some(c) => {
                violations.push(format!("confidence out of range: {c}"));
                if c.is_nan() {
                    1.0
                } else {
                    c.clamp(0.0, 1.0)
                }
            }
        };

        ValidatedChoice {
            descend,
            select,
            confidence,
            violations,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle call timed out")]
    Timeout,

    #[error("oracle response unusable: {0}")]
    InvalidResponse(String),
}

impl From<OracleError> for AppError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Unavailable(msg) => AppError::OracleUnavailable(msg),
            OracleError::Timeout => AppError::OracleTimeout,
            OracleError::InvalidResponse(msg) => AppError::OracleContractViolation(msg),
        }
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn choose(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;

    /// `false` puts the retriever in explicit fallback mode: no calls are made.
    fn is_available(&self) -> bool {
        true
    }
}

/// Oracle for keyword-only operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    async fn choose(&self, _request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        Err(OracleError::Unavailable("oracle disabled".to_string()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

const ORACLE_SYSTEM_PROMPT: &str = "You navigate the section tree of a Pokemon TCG rules document. \
You receive a JSON object with a user question and the current frontier: a list of sections \
(id, title, section_number, token_count, is_leaf). Reply with ONLY a JSON object of the form \
{\"version\": 1, \"descend\": [ids], \"select\": [ids], \"confidence\": number between 0 and 1}. \
\"select\" lists sections whose own text answers the question, most relevant first. \
\"descend\" lists non-leaf sections whose subsections are worth exploring. \
Use only ids from the frontier. Prefer 1-3 ids in total; return empty lists if nothing is relevant.";

/// Oracle backed by an OpenAI-compatible chat completion endpoint in JSON mode.
#[derive(Clone)]
pub struct LlmOracle {
    client: OpenAiClient,
    model: String,
    timeout: Duration,
}

impl LlmOracle {
    pub fn new(client: OpenAiClient, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    async fn choose(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| OracleError::InvalidResponse(format!("request encoding: {e}")))?;
        let completion = ChatRequest::new(
            self.model.clone(),
            vec![Message::system(ORACLE_SYSTEM_PROMPT), Message::user(payload)],
        )
        .temperature(0.0)
        .max_tokens(300)
        .json_mode();

        let content = self
            .client
            .complete(&completion, Some(self.timeout))
            .await
            .map_err(|e| match e {
                OpenAiClientError::EmptyCompletion => {
                    OracleError::InvalidResponse("empty completion".to_string())
                }
                e if e.is_timeout() => OracleError::Timeout,
                e => OracleError::Unavailable(e.to_string()),
            })?;
        debug!(document = %request.document_name, content = %content, "oracle reply");
        parse_response(&content)
    }
}

/// Parse a raw oracle reply. Tolerates a fenced code block around the JSON.
pub fn parse_response(raw: &str) -> Result<OracleResponse, OracleError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let response: OracleResponse = serde_json::from_str(body)
        .map_err(|e| OracleError::InvalidResponse(format!("not a choice object: {e}")))?;
    match response.version {
        Some(v) if v != ORACLE_SCHEMA_VERSION => Err(OracleError::InvalidResponse(format!(
            "unsupported schema version {v}"
        ))),
        _ => Ok(response),
    }
}
