/// Read-only views of loaded indexes for the tree browser endpoints and MCP tools.
use notebook_common::api::{
    ChildSummary, IndexSummary, NodeDetailResponse, NodeMetadataView, TreeNodeView,
};

use crate::error::AppError;
use crate::model::{DocumentIndex, NodeMetadata};
use crate::registry::RegistrySnapshot;

pub fn index_summaries(snapshot: &RegistrySnapshot) -> Vec<IndexSummary> {
    snapshot
        .indexes()
        .map(|index| IndexSummary {
            name: index.document_name().to_string(),
            document_type: index.document_type().to_string(),
            node_count: index.node_count(),
            total_tokens: index.total_tokens(),
        })
        .collect()
}

fn metadata_view(metadata: &NodeMetadata) -> NodeMetadataView {
    NodeMetadataView {
        document_type: metadata.document_type.to_string(),
        section_number: metadata.section_number.clone(),
        title: metadata.title.clone(),
    }
}

/// The whole tree without content. Built from the leaves up over the pre-order arena,
/// so nesting depth never turns into call depth.
pub fn tree_view(index: &DocumentIndex) -> TreeNodeView {
    let nodes = index.nodes();
    let mut built: Vec<Option<TreeNodeView>> = Vec::with_capacity(nodes.len());
    built.resize_with(nodes.len(), || None);

    // Children always sit after their parent in pre-order, so walking backwards
    // finishes every child before its parent needs it.
    for (idx, node) in nodes.iter().enumerate().rev() {
        let children = node
            .children
            .iter()
            .filter_map(|&child| built[child].take())
            .collect();
        built[idx] = Some(TreeNodeView {
            id: node.id.clone(),
            metadata: metadata_view(&node.metadata),
            token_count: node.token_count,
            children,
        });
    }

    built
        .into_iter()
        .next()
        .flatten()
        .unwrap_or_else(|| TreeNodeView {
            id: index.root().id.clone(),
            metadata: metadata_view(&index.root().metadata),
            token_count: index.root().token_count,
            children: Vec::new(),
        })
}

pub fn node_detail(index: &DocumentIndex, node_id: &str) -> Result<NodeDetailResponse, AppError> {
    let idx = index.find(node_id).ok_or_else(|| AppError::NotFound {
        kind: "node",
        name: format!("{}/{node_id}", index.document_name()),
    })?;
    let node = &index.nodes()[idx];
    let children = node
        .children
        .iter()
        .map(|&child| {
            let child = &index.nodes()[child];
            ChildSummary {
                id: child.id.clone(),
                title: child.label(),
            }
        })
        .collect();
    Ok(NodeDetailResponse {
        id: node.id.clone(),
        content: node.content.clone(),
        metadata: metadata_view(&node.metadata),
        token_count: node.token_count,
        children,
    })
}

/// Look up an index in `snapshot`, failing with `NotFound`.
pub fn require_index(
    snapshot: &RegistrySnapshot,
    name: &str,
) -> Result<std::sync::Arc<DocumentIndex>, AppError> {
    snapshot.get(name).ok_or_else(|| AppError::NotFound {
        kind: "index",
        name: name.to_string(),
    })
}
