use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AskQuestionParams {
    /// The rules question to answer.
    pub query: String,
    /// Answer persona: "judge", "professor" or "player" (default: "judge").
    pub persona: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct IndexNameParams {
    /// Document index name, e.g. "rulebook" or "card_db_pokemon".
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetNodeParams {
    /// Document index name.
    pub name: String,
    /// Node id inside that index, e.g. "3.4" or "charizard-ex".
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IndexSummary {
    pub name: String,
    pub document_type: String,
    pub node_count: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IndexListResponse {
    pub indexes: Vec<IndexSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeMetadataView {
    pub document_type: String,
    pub section_number: String,
    pub title: String,
}

/// Tree shape of an index without node content.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TreeNodeView {
    pub id: String,
    pub metadata: NodeMetadataView,
    pub token_count: usize,
    pub children: Vec<TreeNodeView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChildSummary {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDetailResponse {
    pub id: String,
    pub content: String,
    pub metadata: NodeMetadataView,
    pub token_count: usize,
    pub children: Vec<ChildSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SectionSummary {
    pub document_name: String,
    pub section_number: String,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RouteSummary {
    pub documents: Vec<String>,
    pub confidence: f32,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AskQuestionResponse {
    pub route: Option<RouteSummary>,
    pub sections: Vec<SectionSummary>,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdatedIndex {
    pub name: String,
    pub rebuilt: bool,
    pub source_hash: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateIndexesResponse {
    pub indexes: Vec<UpdatedIndex>,
}
