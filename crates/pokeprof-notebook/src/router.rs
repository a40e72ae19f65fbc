/// Keyword/heuristic query router. Pure and synchronous: no I/O, never fails.
///
/// Scoring, per available document:
/// - every routing-hint keyword found in the query adds 1.0 (2.0 for multi-word phrases)
///   to each document of the keyword's types,
/// - a detected card name adds 3.0 to the card database holding it,
/// - card names plus interaction wording add 1.0 to rulebooks and 2.0 to rulings.
///
/// Documents with a positive score form the route; query-type bias may extend it and
/// persona bias only reorders it. With no signal at all every document is routed with
/// confidence 0.
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::config::DomainConfig;
use crate::model::{DocumentIndex, DocumentType, QueryType, RouteDecision};

const CARD_MATCH_BOOST: f32 = 3.0;

const INTERACTION_KEYWORDS: &[&str] = &[
    "how does",
    "play off",
    "interact",
    "affect",
    "work with",
    "work together",
    "prevent",
    "block",
    "stack",
    "combo",
    "combined",
    "does it",
    "override",
    "negate",
];

const PENALTY_KEYWORDS: &[&str] = &[
    "penalty",
    "infraction",
    "marked card",
    "game loss",
    "warning",
    "disqualif",
    "slow play",
    "deck error",
    "drawing extra",
    "unsporting",
    "caution",
];

const FORMAT_KEYWORDS: &[&str] = &[
    "legal",
    "banned",
    "standard",
    "expanded",
    "format",
    "rotation",
    "allowed",
    "playable",
];

const CARD_TEXT_KEYWORDS: &[&str] = &["errata", "card text"];

/// Capitalized words followed by a variant qualifier, e.g. "Charizard ex", "Mew VMAX".
static CARD_PATTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b((?:[A-Z][\w'’\-é]*\s+)*[A-Z][\w'’\-é]*)\s+(ex|EX|GX|V|VMAX|VSTAR|BREAK|Prime|LV\.X)\b",
    )
    .expect("valid regex")
});

/// Capitalized sentence openers that are never part of a card name.
const LEADING_STOPWORDS: &[&str] = &[
    "What", "How", "Does", "Do", "Can", "Is", "Are", "If", "When", "Which", "Who", "Why",
    "Should", "Could", "Would", "Will", "The", "A", "An", "My", "Your", "I",
];

/// A card name found in a query.
#[derive(Debug, Clone, PartialEq)]
pub struct CardMatch {
    /// Display name ("Charizard ex").
    pub name: String,
    /// Card database holding the card, when known from the index.
    pub document_name: Option<String>,
}

/// Card names harvested from card-database leaf titles, longest first.
#[derive(Debug, Clone, Default)]
pub struct CardNameIndex {
    /// (lower-cased name, display name, document name)
    entries: Vec<(String, String, String)>,
}

impl CardNameIndex {
    pub fn from_indexes<'a, I>(indexes: I) -> Self
    where
        I: IntoIterator<Item = &'a DocumentIndex>,
    {
        let mut seen = HashMap::new();
        for index in indexes {
            if index.document_type() != DocumentType::CardDatabase {
                continue;
            }
            for node in index.nodes().iter().skip(1).filter(|n| n.is_leaf()) {
                let title = node.metadata.title.trim();
                if title.is_empty() {
                    continue;
                }
                seen.entry(title.to_lowercase()).or_insert_with(|| {
                    (title.to_string(), index.document_name().to_string())
                });
            }
        }
        let mut entries: Vec<(String, String, String)> = seen
            .into_iter()
            .map(|(lower, (display, doc))| (lower, display, doc))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest-match-first, whole-word, non-overlapping lookup of known card names.
    pub fn detect(&self, query: &str) -> Vec<CardMatch> {
        let q = query.to_lowercase();
        let mut taken: Vec<(usize, usize)> = Vec::new();
        let mut matches = Vec::new();
        for (lower, display, doc) in &self.entries {
            let free = whole_word_positions(&q, lower).find(|&start| {
                let end = start + lower.len();
                !taken.iter().any(|&(s, e)| start < e && s < end)
            });
            let Some(start) = free else {
                continue;
            };
            let end = start + lower.len();
            taken.push((start, end));
            matches.push((
                start,
                CardMatch {
                    name: display.clone(),
                    document_name: Some(doc.clone()),
                },
            ));
        }
        matches.sort_by_key(|(start, _)| *start);
        matches.into_iter().map(|(_, m)| m).collect()
    }
}

/// Start offsets of `needle` in `haystack` bounded by non-alphanumerics on both sides.
fn whole_word_positions<'a>(haystack: &'a str, needle: &'a str) -> impl Iterator<Item = usize> + 'a {
    haystack
        .match_indices(needle)
        .map(|(i, _)| i)
        .filter(move |&start| {
            let end = start + needle.len();
            let before_ok = haystack[..start]
                .chars()
                .next_back()
                .is_none_or(|c| !c.is_alphanumeric());
            let after_ok = haystack[end..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_alphanumeric());
            !needle.is_empty() && before_ok && after_ok
        })
}

/// Keyword occurrence that starts on a word boundary. The end is left open so
/// "prize" matches "prizes" and "disqualif" matches "disqualification".
fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    haystack.match_indices(keyword).any(|(start, _)| {
        haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

/// Card names recognisable from shape alone ("Mew VMAX"), for cards the index does
/// not know about.
pub fn detect_card_pattern(query: &str) -> Vec<String> {
    let mut names = Vec::new();
    for caps in CARD_PATTERN_RE.captures_iter(query) {
        let words: Vec<&str> = caps[1]
            .split_whitespace()
            .skip_while(|w| LEADING_STOPWORDS.contains(w))
            .collect();
        if words.is_empty() {
            continue;
        }
        let name = format!("{} {}", words.join(" "), &caps[2]);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

pub fn has_interaction_intent(query: &str) -> bool {
    let q = query.to_lowercase();
    INTERACTION_KEYWORDS.iter().any(|kw| q.contains(kw))
}

/// Classify a query by keyword patterns and the number of detected cards.
pub fn classify(query: &str, card_count: usize) -> QueryType {
    let q = query.to_lowercase();
    let any = |keywords: &[&str]| keywords.iter().any(|kw| contains_keyword(&q, kw));

    if any(PENALTY_KEYWORDS) {
        QueryType::Penalty
    } else if any(FORMAT_KEYWORDS) {
        QueryType::FormatLegality
    } else if any(CARD_TEXT_KEYWORDS) {
        QueryType::CardSpecific
    } else if (card_count > 0 && has_interaction_intent(&q)) || card_count >= 2 {
        QueryType::CardInteraction
    } else {
        QueryType::RulesLookup
    }
}

fn type_bias(query_type: QueryType) -> &'static [(DocumentType, f32)] {
    match query_type {
        QueryType::Penalty => &[(DocumentType::PenaltyGuidelines, 2.0)],
        QueryType::RulesLookup => &[(DocumentType::Rulebook, 1.0)],
        QueryType::FormatLegality => &[(DocumentType::LegalCardList, 2.0)],
        QueryType::CardSpecific => &[(DocumentType::Rulebook, 0.5)],
        QueryType::CardInteraction => &[
            (DocumentType::Rulebook, 1.0),
            (DocumentType::RulingsCompendium, 1.5),
        ],
    }
}

/// A document the router may send a query to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableDocument {
    pub name: String,
    pub document_type: DocumentType,
}

#[derive(Debug, Clone)]
pub struct Router {
    domain: Arc<DomainConfig>,
}

impl Router {
    pub fn new(domain: Arc<DomainConfig>) -> Self {
        Self { domain }
    }

    pub fn route(
        &self,
        query: &str,
        available: &[AvailableDocument],
        cards: &CardNameIndex,
        persona: &str,
    ) -> RouteDecision {
        let q = query.to_lowercase();

        // Keyword signal per document type.
        let mut matched_keywords = Vec::new();
        let mut type_scores: HashMap<DocumentType, f32> = HashMap::new();
        let mut signal = 0.0f32;
        for (keyword, types) in &self.domain.routing_hints {
            if !contains_keyword(&q, keyword) {
                continue;
            }
            let weight = if keyword.contains(' ') { 2.0 } else { 1.0 };
            signal += weight;
            matched_keywords.push(keyword.as_str());
            for doc_type in types {
                *type_scores.entry(*doc_type).or_default() += weight;
            }
        }

        // Card names: known ones first, then qualifier-shaped names the index lacks.
        let mut card_matches = cards.detect(query);
        for name in detect_card_pattern(query) {
            let lower = name.to_lowercase();
            if !card_matches.iter().any(|m| m.name.to_lowercase() == lower) {
                card_matches.push(CardMatch {
                    name,
                    document_name: None,
                });
            }
        }
        let interaction = !card_matches.is_empty() && has_interaction_intent(&q);
        let query_type = classify(query, card_matches.len());

        let mut base: Vec<f32> = available
            .iter()
            .map(|doc| type_scores.get(&doc.document_type).copied().unwrap_or(0.0))
            .collect();
        for card in &card_matches {
            signal += CARD_MATCH_BOOST;
            for (i, doc) in available.iter().enumerate() {
                let holds_card = match &card.document_name {
                    Some(name) => *name == doc.name,
                    None => doc.document_type == DocumentType::CardDatabase,
                };
                if holds_card {
                    base[i] += CARD_MATCH_BOOST;
                }
            }
        }
        if interaction {
            for (i, doc) in available.iter().enumerate() {
                match doc.document_type {
                    DocumentType::Rulebook => base[i] += 1.0,
                    DocumentType::RulingsCompendium => base[i] += 2.0,
                    _ => {}
                }
            }
        }

        let card_names: Vec<String> = card_matches.iter().map(|m| m.name.clone()).collect();
        let mut reasoning = vec![format!("query_type={}", query_type.as_str())];
        if !matched_keywords.is_empty() {
            reasoning.push(format!("keyword_match={}", matched_keywords.join("|")));
        }
        if !card_names.is_empty() {
            reasoning.push(format!("cards_detected={}", card_names.join("|")));
        }

        if !base.iter().any(|s| *s > 0.0) {
            reasoning.push("no keyword match, routed to all documents".to_string());
            let decision = RouteDecision {
                documents: available.iter().map(|d| d.name.clone()).collect(),
                confidence: 0.0,
                reasoning: reasoning.join(", "),
                query_type,
                card_names,
            };
            debug!(reasoning = %decision.reasoning, "route (default)");
            return decision;
        }

        let bias = type_bias(query_type);
        let mut ranked: Vec<(usize, f32)> = Vec::new();
        for (i, doc) in available.iter().enumerate() {
            let type_boost: f32 = bias
                .iter()
                .filter(|(t, _)| *t == doc.document_type)
                .map(|(_, b)| *b)
                .sum();
            if base[i] <= 0.0 && type_boost <= 0.0 {
                continue;
            }
            let score = base[i]
                + type_boost
                + self.domain.persona_bias_for(persona, doc.document_type);
            ranked.push((i, score));
        }
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (i, score) in &ranked {
            reasoning.push(format!("{}={score:.1}", available[*i].name));
        }

        let decision = RouteDecision {
            documents: ranked.iter().map(|(i, _)| available[*i].name.clone()).collect(),
            confidence: (signal / (signal + 1.0)).clamp(0.0, 1.0),
            reasoning: reasoning.join(", "),
            query_type,
            card_names,
        };
        debug!(
            documents = ?decision.documents,
            confidence = decision.confidence,
            reasoning = %decision.reasoning,
            "route"
        );
        decision
    }
}
