/// Tree data model shared by the indexer, retriever and browse endpoints.
///
/// A [`DocumentIndex`] owns its nodes in a flat arena. Index 0 is the synthetic root and
/// arena order is pre-order document order, so a node's arena index doubles as its
/// pre-order position (used for deterministic tie-breaking). Parent/child links are
/// arena indices; there is no shared ownership between nodes and no recursion is needed
/// to build, walk or serialize a tree.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Arena index of a node inside its [`DocumentIndex`].
pub type NodeIdx = usize;

pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Rulebook,
    PenaltyGuidelines,
    LegalCardList,
    RulingsCompendium,
    CardDatabase,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::Rulebook,
        DocumentType::PenaltyGuidelines,
        DocumentType::LegalCardList,
        DocumentType::RulingsCompendium,
        DocumentType::CardDatabase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Rulebook => "rulebook",
            DocumentType::PenaltyGuidelines => "penalty_guidelines",
            DocumentType::LegalCardList => "legal_card_list",
            DocumentType::RulingsCompendium => "rulings_compendium",
            DocumentType::CardDatabase => "card_database",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| AppError::Config(format!("unknown document type: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub document_type: DocumentType,
    /// Leading enumeration of the heading ("3.2.1"), empty when the heading has none.
    pub section_number: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    /// Markdown owned by this node only; descendants' text is not included.
    pub content: String,
    pub metadata: NodeMetadata,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
    pub token_count: usize,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// "3.4 Prize Cards", "Prize Cards" or the id, whichever is most descriptive.
    pub fn label(&self) -> String {
        let section = &self.metadata.section_number;
        let title = &self.metadata.title;
        match (section.is_empty(), title.is_empty()) {
            (false, false) => format!("{section} {title}"),
            (false, true) => section.clone(),
            (true, false) => title.clone(),
            (true, true) => self.id.clone(),
        }
    }
}

/// What the oracle is allowed to see of a frontier node. Never carries content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub title: String,
    pub section_number: String,
    pub token_count: usize,
    pub is_leaf: bool,
}

/// Serialized shape of an index. Converted into [`DocumentIndex`] only after the tree
/// invariants have been checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDocumentIndex {
    document_name: String,
    document_type: DocumentType,
    total_tokens: usize,
    source_hash: String,
    nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDocumentIndex", into = "RawDocumentIndex")]
pub struct DocumentIndex {
    document_name: String,
    document_type: DocumentType,
    total_tokens: usize,
    source_hash: String,
    nodes: Vec<TreeNode>,
    by_id: HashMap<String, NodeIdx>,
    by_section: HashMap<String, NodeIdx>,
}

impl TryFrom<RawDocumentIndex> for DocumentIndex {
    type Error = AppError;

    fn try_from(raw: RawDocumentIndex) -> Result<Self, Self::Error> {
        DocumentIndex::from_parts(
            raw.document_name,
            raw.document_type,
            raw.nodes,
            raw.total_tokens,
            raw.source_hash,
        )
    }
}

impl From<DocumentIndex> for RawDocumentIndex {
    fn from(index: DocumentIndex) -> Self {
        RawDocumentIndex {
            document_name: index.document_name,
            document_type: index.document_type,
            total_tokens: index.total_tokens,
            source_hash: index.source_hash,
            nodes: index.nodes,
        }
    }
}

impl DocumentIndex {
    /// Assemble an index from its arena, rejecting anything that is not a well-formed tree:
    /// exactly one root at index 0, every other node reachable through exactly one parent,
    /// arena order equal to pre-order, unique ids, and a matching `total_tokens`.
    pub fn from_parts(
        document_name: String,
        document_type: DocumentType,
        nodes: Vec<TreeNode>,
        total_tokens: usize,
        source_hash: String,
    ) -> Result<Self, AppError> {
        let invalid = |message: String| AppError::Store(format!("{document_name}: {message}"));

        let Some(root) = nodes.first() else {
            return Err(invalid("index has no root node".to_string()));
        };
        if root.parent.is_some() {
            return Err(invalid("root node has a parent".to_string()));
        }

        let mut by_id = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            if by_id.insert(node.id.clone(), idx).is_some() {
                return Err(invalid(format!("duplicate node id: {}", node.id)));
            }
            if idx > 0 && node.parent.is_none() {
                return Err(invalid(format!("node {} has no parent", node.id)));
            }
            for &child in &node.children {
                let Some(child_node) = nodes.get(child) else {
                    return Err(invalid(format!("node {} has dangling child {child}", node.id)));
                };
                if child_node.parent != Some(idx) {
                    return Err(invalid(format!(
                        "node {} is listed under {} but points elsewhere",
                        child_node.id, node.id
                    )));
                }
            }
        }

        // Pre-order walk must visit 0, 1, 2, ... exactly once each; this rules out cycles,
        // shared children and unreachable nodes in one pass.
        let mut expected = 0;
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            if idx != expected {
                return Err(invalid(format!(
                    "arena is not in pre-order (found {idx}, expected {expected})"
                )));
            }
            expected += 1;
            stack.extend(nodes[idx].children.iter().rev());
        }
        if expected != nodes.len() {
            return Err(invalid(format!(
                "{} of {} nodes are unreachable from the root",
                nodes.len() - expected,
                nodes.len()
            )));
        }

        let summed: usize = nodes.iter().map(|n| n.token_count).sum();
        if summed != total_tokens {
            return Err(invalid(format!(
                "total_tokens is {total_tokens} but nodes sum to {summed}"
            )));
        }

        let mut by_section = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            if !node.metadata.section_number.is_empty() {
                by_section
                    .entry(node.metadata.section_number.clone())
                    .or_insert(idx);
            }
        }

        Ok(Self {
            document_name,
            document_type,
            total_tokens,
            source_hash,
            nodes,
            by_id,
            by_section,
        })
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn node(&self, idx: NodeIdx) -> Option<&TreeNode> {
        self.nodes.get(idx)
    }

    /// All nodes in pre-order (arena order), root first.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn find(&self, id: &str) -> Option<NodeIdx> {
        self.by_id.get(id).copied()
    }

    pub fn find_section(&self, section_number: &str) -> Option<NodeIdx> {
        self.by_section.get(section_number).copied()
    }

    /// Distance from the root; root children have depth 1.
    pub fn depth(&self, idx: NodeIdx) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes.get(idx).and_then(|n| n.parent);
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.nodes[parent].parent;
        }
        depth
    }

    /// Explicit-stack pre-order traversal.
    pub fn preorder(&self) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![0];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(self.nodes[idx].children.iter().rev());
        }
        order
    }

    /// Every node in the subtree rooted at `idx`, including `idx`, in pre-order.
    pub fn subtree(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        let mut out = Vec::new();
        if idx >= self.nodes.len() {
            return out;
        }
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.nodes[current].children.iter().rev());
        }
        out
    }

    pub fn summary(&self, idx: NodeIdx) -> Option<NodeSummary> {
        self.nodes.get(idx).map(|node| NodeSummary {
            id: node.id.clone(),
            title: node.metadata.title.clone(),
            section_number: node.metadata.section_number.clone(),
            token_count: node.token_count,
            is_leaf: node.is_leaf(),
        })
    }

    /// Breadcrumb such as "3. Setup > 3.4 Prize Cards", excluding the synthetic root.
    pub fn breadcrumb(&self, idx: NodeIdx) -> String {
        let mut trail = Vec::new();
        let mut cursor = Some(idx);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(current) else {
                break;
            };
            if node.parent.is_none() {
                break;
            }
            trail.push(node.label());
            cursor = node.parent;
        }
        trail.reverse();
        trail.join(" > ")
    }
}

/// Incremental construction of a [`DocumentIndex`]. Nodes must be added in document
/// order, which keeps the arena in pre-order.
pub struct TreeBuilder {
    document_name: String,
    document_type: DocumentType,
    nodes: Vec<TreeNode>,
    ids: HashSet<String>,
}

impl TreeBuilder {
    pub fn new(document_name: &str, document_type: DocumentType) -> Self {
        let root = TreeNode {
            id: ROOT_ID.to_string(),
            content: String::new(),
            metadata: NodeMetadata {
                document_type,
                section_number: String::new(),
                title: document_name.to_string(),
            },
            parent: None,
            children: Vec::new(),
            token_count: 0,
        };
        Self {
            document_name: document_name.to_string(),
            document_type,
            nodes: vec![root],
            ids: HashSet::from([ROOT_ID.to_string()]),
        }
    }

    pub fn root(&self) -> NodeIdx {
        0
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn node(&self, idx: NodeIdx) -> Option<&TreeNode> {
        self.nodes.get(idx)
    }

    /// Append a child under `parent`. `parent` must already exist.
    pub fn add_child(
        &mut self,
        parent: NodeIdx,
        id: String,
        section_number: String,
        title: String,
    ) -> NodeIdx {
        let idx = self.nodes.len();
        self.ids.insert(id.clone());
        self.nodes.push(TreeNode {
            id,
            content: String::new(),
            metadata: NodeMetadata {
                document_type: self.document_type,
                section_number,
                title,
            },
            parent: Some(parent),
            children: Vec::new(),
            token_count: 0,
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn set_content(&mut self, idx: NodeIdx, content: String, token_count: usize) {
        if let Some(node) = self.nodes.get_mut(idx) {
            node.content = content;
            node.token_count = token_count;
        }
    }

    pub fn finish(self, source_hash: String) -> Result<DocumentIndex, AppError> {
        let total_tokens = self.nodes.iter().map(|n| n.token_count).sum();
        DocumentIndex::from_parts(
            self.document_name,
            self.document_type,
            self.nodes,
            total_tokens,
            source_hash,
        )
    }
}

/// Which kind of question the router believes it is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    RulesLookup,
    Penalty,
    FormatLegality,
    CardSpecific,
    CardInteraction,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::RulesLookup => "rules_lookup",
            QueryType::Penalty => "penalty",
            QueryType::FormatLegality => "format_legality",
            QueryType::CardSpecific => "card_specific",
            QueryType::CardInteraction => "card_interaction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Document names in priority order, no duplicates.
    pub documents: Vec<String>,
    /// In `[0, 1]`; 0 means "no signal, routed everywhere".
    pub confidence: f32,
    pub reasoning: String,
    pub query_type: QueryType,
    /// Card names detected in the query, in the casing of the query.
    pub card_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalBudget {
    pub max_sections: usize,
    pub max_depth: usize,
    pub max_oracle_calls: usize,
}

impl Default for RetrievalBudget {
    fn default() -> Self {
        Self {
            max_sections: 10,
            max_depth: 6,
            max_oracle_calls: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrataMode {
    /// The correction text replaces the section content.
    Replace,
    /// The correction text is appended as a note after the section content.
    Annotate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedErrata {
    pub mode: ErrataMode,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSection {
    pub document_name: String,
    pub document_type: DocumentType,
    pub node_id: String,
    pub section_number: String,
    pub title: String,
    pub breadcrumb: String,
    pub score: f32,
    /// Pre-order position of the node in its document.
    pub position: usize,
    /// Content as stored in the index.
    pub source_content: String,
    /// Content as presented downstream (after errata).
    pub content: String,
    pub errata: Option<AppliedErrata>,
}

impl RetrievedSection {
    pub fn from_node(index: &DocumentIndex, idx: NodeIdx, score: f32) -> Option<Self> {
        let node = index.node(idx)?;
        Some(Self {
            document_name: index.document_name().to_string(),
            document_type: index.document_type(),
            node_id: node.id.clone(),
            section_number: node.metadata.section_number.clone(),
            title: node.metadata.title.clone(),
            breadcrumb: index.breadcrumb(idx),
            score,
            position: idx,
            source_content: node.content.clone(),
            content: node.content.clone(),
            errata: None,
        })
    }
}

/// Checks a built index for problems a reviewer would want to see before serving it.
/// Returns human-readable issues; an empty list means the tree is clean.
pub fn validate_tree(index: &DocumentIndex, section_pattern: Option<&regex::Regex>) -> Vec<String> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    let mut visited = 0;
    for idx in index.preorder() {
        visited += 1;
        let node = &index.nodes()[idx];
        if !seen.insert(node.id.as_str()) {
            issues.push(format!("duplicate node id: {}", node.id));
        }
        if let Some(pattern) = section_pattern {
            let number = &node.metadata.section_number;
            if !number.is_empty() && !pattern.is_match(number) {
                issues.push(format!(
                    "section number '{number}' doesn't match pattern '{}'",
                    pattern.as_str()
                ));
            }
        }
    }
    if visited != index.node_count() {
        issues.push(format!(
            "pre-order walk visited {visited} of {} nodes",
            index.node_count()
        ));
    }
    let summed: usize = index.nodes().iter().map(|n| n.token_count).sum();
    if summed != index.total_tokens() {
        issues.push(format!(
            "total_tokens {} != sum of node tokens {summed}",
            index.total_tokens()
        ));
    }
    issues
}
