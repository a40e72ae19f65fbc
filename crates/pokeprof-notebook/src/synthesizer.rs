/// Answer generation: the injected capability that turns retrieved sections into a
/// persona-styled, streamed answer.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use notebook_common::openai::{ChatRequest, Message, OpenAiClient};
use tracing::{debug, warn};

use crate::config::DomainConfig;
use crate::error::AppError;
use crate::indexer::count_tokens;
use crate::model::{DocumentType, ErrataMode, RetrievedSection};

pub const NO_SECTIONS_ANSWER: &str =
    "I couldn't find relevant rule sections to answer this question.";

/// Remaining budget below which an oversized section is dropped instead of truncated.
const MIN_TRUNCATED_TOKENS: usize = 50;

pub type TokenStream = BoxStream<'static, Result<String, SynthesizerError>>;

#[derive(Debug, thiserror::Error)]
pub enum SynthesizerError {
    #[error("synthesizer unavailable: {0}")]
    Unavailable(String),

    #[error("synthesizer timed out")]
    Timeout,

    #[error("answer stream failed: {0}")]
    Stream(String),
}

impl From<SynthesizerError> for AppError {
    fn from(err: SynthesizerError) -> Self {
        match err {
            SynthesizerError::Timeout => AppError::SynthesizerTimeout,
            other => AppError::SynthesizerFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub query: String,
    pub persona: String,
    /// Ranked sections with errata already applied.
    pub sections: Vec<RetrievedSection>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start generating. The returned stream is lazy; dropping it stops generation.
    async fn generate(&self, request: SynthesisRequest) -> Result<TokenStream, SynthesizerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContextGroup {
    Cards,
    Rules,
    Rulings,
}

impl ContextGroup {
    fn of(document_type: DocumentType) -> Self {
        match document_type {
            DocumentType::CardDatabase => ContextGroup::Cards,
            DocumentType::RulingsCompendium => ContextGroup::Rulings,
            _ => ContextGroup::Rules,
        }
    }

    fn header(&self) -> &'static str {
        match self {
            ContextGroup::Cards => "=== CARD TEXT ===",
            ContextGroup::Rules => "=== GAME RULES ===",
            ContextGroup::Rulings => "=== COMPENDIUM RULINGS ===",
        }
    }
}

/// Assemble the reference material within `token_budget`: card text first, then game
/// rules, then rulings. Group headers appear only when cards are mixed with others.
pub fn build_context(sections: &[RetrievedSection], token_budget: usize) -> String {
    let mut ordered: Vec<&RetrievedSection> = Vec::with_capacity(sections.len());
    for group in [ContextGroup::Cards, ContextGroup::Rules, ContextGroup::Rulings] {
        ordered.extend(sections.iter().filter(|s| ContextGroup::of(s.document_type) == group));
    }
    let has_cards = ordered.iter().any(|s| ContextGroup::of(s.document_type) == ContextGroup::Cards);
    let mixed = has_cards && ordered.iter().any(|s| ContextGroup::of(s.document_type) != ContextGroup::Cards);

    let mut parts = Vec::new();
    let mut used = 0;
    let mut current = None;
    for section in ordered {
        let group = ContextGroup::of(section.document_type);
        if mixed && current != Some(group) {
            current = Some(group);
            parts.push(group.header().to_string());
        }

        let trail = if section.breadcrumb.is_empty() {
            section.document_name.clone()
        } else {
            format!("{}: {}", section.document_name, section.breadcrumb)
        };
        let mut text = format!("[{trail}]\n{}", section.content.trim());
        if let Some(errata) = &section.errata {
            if errata.mode == ErrataMode::Replace {
                let source = if errata.source.is_empty() { "errata" } else { errata.source.as_str() };
                text.push_str(&format!("\n(Text updated by {source}.)"));
            }
        }

        let tokens = count_tokens(&text);
        if used + tokens > token_budget {
            let remaining = token_budget.saturating_sub(used);
            if remaining > MIN_TRUNCATED_TOKENS {
                let truncated: String = text.chars().take(remaining * 4).collect();
                parts.push(format!("{truncated}\n[...truncated]"));
            }
            break;
        }
        parts.push(text);
        used += tokens;
    }
    parts.join("\n\n---\n\n")
}

/// System prompts per persona, read once from `{persona}_system.txt`.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    prompts: HashMap<String, String>,
}

impl PromptLibrary {
    pub fn load(dir: Option<&Path>, personas: &[String]) -> Self {
        let mut prompts = HashMap::new();
        let Some(dir) = dir else {
            return Self { prompts };
        };
        for persona in personas {
            let path = dir.join(format!("{persona}_system.txt"));
            match std::fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => {
                    prompts.insert(persona.clone(), text.trim().to_string());
                }
                Ok(_) => warn!(path = %path.display(), "system prompt is empty, using default"),
                Err(e) => warn!(path = %path.display(), error = %e, "system prompt not found, using default"),
            }
        }
        Self { prompts }
    }

    pub fn system_prompt(&self, persona: &str, domain_name: &str) -> String {
        self.prompts.get(persona).cloned().unwrap_or_else(|| {
            format!(
                "You are PokeProf, a helpful {persona} assistant for {domain_name} rules. \
                 Answer only from the reference material, always cite specific section \
                 numbers, and never fabricate rulings."
            )
        })
    }
}

/// Synthesizer backed by a streaming OpenAI-compatible chat completion endpoint.
#[derive(Clone)]
pub struct LlmSynthesizer {
    client: OpenAiClient,
    model: String,
    timeout: Duration,
    domain: Arc<DomainConfig>,
    prompts: Arc<PromptLibrary>,
}

impl LlmSynthesizer {
    pub fn new(
        client: OpenAiClient,
        model: String,
        timeout: Duration,
        domain: Arc<DomainConfig>,
        prompts: PromptLibrary,
    ) -> Self {
        Self {
            client,
            model,
            timeout,
            domain,
            prompts: Arc::new(prompts),
        }
    }

    /// System prompt and user message for `request`, or `None` when there is no
    /// reference material to answer from.
    pub fn build_messages(&self, request: &SynthesisRequest) -> Option<Vec<Message>> {
        let budget = self.domain.token_budget(&request.persona);
        let context = build_context(&request.sections, budget);
        if context.trim().is_empty() {
            return None;
        }
        let has_cards = request
            .sections
            .iter()
            .any(|s| s.document_type == DocumentType::CardDatabase);
        let user = if has_cards {
            format!(
                "Based on the following card data and rule sections, answer this question:\n\n\
                 Question: {}\n\nReference Material:\n{context}",
                request.query
            )
        } else {
            format!(
                "Based on the following rule sections, answer this question:\n\n\
                 Question: {}\n\nRule Sections:\n{context}",
                request.query
            )
        };
        Some(vec![
            Message::system(
                self.prompts
                    .system_prompt(&request.persona, &self.domain.domain_name),
            ),
            Message::user(user),
        ])
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn generate(&self, request: SynthesisRequest) -> Result<TokenStream, SynthesizerError> {
        let Some(messages) = self.build_messages(&request) else {
            return Ok(stream::once(async { Ok(NO_SECTIONS_ANSWER.to_string()) }).boxed());
        };
        debug!(persona = %request.persona, sections = request.sections.len(), "synthesis started");

        let completion = ChatRequest::new(self.model.clone(), messages)
            .temperature(0.1)
            .max_tokens(1024);
        let deltas = self
            .client
            .stream(&completion, Some(self.timeout))
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SynthesizerError::Timeout
                } else {
                    SynthesizerError::Unavailable(e.to_string())
                }
            })?;

        Ok(deltas
            .map(|delta| {
                delta.map_err(|e| {
                    if e.is_timeout() {
                        SynthesizerError::Timeout
                    } else {
                        SynthesizerError::Stream(e.to_string())
                    }
                })
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{index_from_outline, sample_rulebook};
    use crate::model::AppliedErrata;
    use notebook_common::openai::{OpenAiClientConfig, RetryPolicy, Role};

    fn section(index: &crate::model::DocumentIndex, id: &str) -> RetrievedSection {
        RetrievedSection::from_node(index, index.find(id).unwrap(), 1.0).unwrap()
    }

    fn mixed_sections() -> Vec<RetrievedSection> {
        let rules = sample_rulebook();
        let cards = index_from_outline(
            "card_db_pokemon",
            DocumentType::CardDatabase,
            &[(1, "", "Fire Type", ""), (2, "", "Charizard ex", "Burning Darkness: 180 damage.")],
        );
        let rulings = index_from_outline(
            "rulings_compendium",
            DocumentType::RulingsCompendium,
            &[(1, "", "Charizard ex and Prize cards", "Counts Prize cards taken by the opponent.")],
        );
        vec![
            section(&rulings, "charizard-ex-and-prize-cards"),
            section(&rules, "3.4"),
            section(&cards, "charizard-ex"),
        ]
    }

    #[test]
    fn context_orders_cards_rules_rulings() {
        let context = build_context(&mixed_sections(), 6000);
        let cards = context.find("=== CARD TEXT ===").unwrap();
        let rules = context.find("=== GAME RULES ===").unwrap();
        let rulings = context.find("=== COMPENDIUM RULINGS ===").unwrap();
        assert!(cards < rules && rules < rulings);
        assert!(context.contains("[rulebook: 3 Setup > 3.4 Prize Cards]"));
        assert!(context.contains("[card_db_pokemon: Fire Type > Charizard ex]"));
    }

    #[test]
    fn headers_only_when_cards_are_mixed_in() {
        let rules = sample_rulebook();
        let context = build_context(&[section(&rules, "3.4"), section(&rules, "1.1")], 6000);
        assert!(!context.contains("==="));
        assert!(context.contains("\n\n---\n\n"));
    }

    #[test]
    fn context_respects_token_budget() {
        let rules = sample_rulebook();
        let sections = vec![section(&rules, "3.4"), section(&rules, "1.1")];
        let first_only = build_context(&sections[..1], 6000);
        let budget = count_tokens(&first_only);
        let context = build_context(&sections, budget);
        assert_eq!(context, first_only);
        assert!(build_context(&sections, 0).is_empty());
    }

    #[test]
    fn replaced_text_is_marked() {
        let rules = sample_rulebook();
        let mut s = section(&rules, "3.4");
        s.errata = Some(AppliedErrata {
            mode: ErrataMode::Replace,
            source: "Rules update 2025".into(),
        });
        let context = build_context(&[s], 6000);
        assert!(context.contains("(Text updated by Rules update 2025.)"));
    }

    #[test]
    fn default_prompt_names_persona() {
        let library = PromptLibrary::default();
        let prompt = library.system_prompt("professor", "Pokemon TCG");
        assert!(prompt.contains("professor"));
        assert!(prompt.contains("section numbers"));
    }

    #[test]
    fn prompts_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("judge_system.txt"), "You are a strict judge.\n").unwrap();
        let personas = vec!["judge".to_string(), "player".to_string()];
        let library = PromptLibrary::load(Some(dir.path()), &personas);
        assert_eq!(library.system_prompt("judge", "x"), "You are a strict judge.");
        assert!(library.system_prompt("player", "x").contains("player"));
    }

    fn synthesizer() -> LlmSynthesizer {
        let client = OpenAiClient::new(OpenAiClientConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::none(),
            ..OpenAiClientConfig::default()
        })
        .unwrap();
        LlmSynthesizer::new(
            client,
            "test-model".into(),
            Duration::from_secs(1),
            Arc::new(DomainConfig::default()),
            PromptLibrary::default(),
        )
    }

    #[test]
    fn card_questions_use_reference_framing() {
        let request = SynthesisRequest {
            query: "What does Charizard ex do?".into(),
            persona: "player".into(),
            sections: mixed_sections(),
        };
        let messages = synthesizer().build_messages(&request).unwrap();
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[1].content.contains("Reference Material:"));
        assert!(messages[1].content.contains("Question: What does Charizard ex do?"));
    }

    #[tokio::test]
    async fn no_sections_yields_canned_answer_without_a_call() {
        let request = SynthesisRequest {
            query: "q".into(),
            persona: "judge".into(),
            sections: Vec::new(),
        };
        let tokens: Vec<_> = synthesizer()
            .generate(request)
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].as_deref().unwrap(), NO_SECTIONS_ANSWER);
    }
}
