/// MCP server implementation for PokeProf.
///
/// Exposes five tools:
/// - `ask_question`: Route, retrieve and answer a rules question
/// - `list_indexes`: Summaries of the loaded document indexes
/// - `get_tree`: Section tree of one index, without content
/// - `get_node`: Full content of one section
/// - `update_indexes`: Rebuild indexes whose source markdown changed
use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use tracing::info;

use crate::browse;
use crate::pipeline::Pipeline;
use crate::update::UpdateService;
use notebook_common::api::{
    AskQuestionParams, AskQuestionResponse, GetNodeParams, IndexListResponse, IndexNameParams,
    NodeDetailResponse, RouteSummary, SectionSummary, TreeNodeView, UpdateIndexesResponse,
};

#[derive(Clone)]
pub struct PokeProfServer {
    pipeline: Arc<Pipeline>,
    update_service: Arc<UpdateService>,
    tool_router: ToolRouter<PokeProfServer>,
}

impl PokeProfServer {
    pub fn new(pipeline: Arc<Pipeline>, update_service: Arc<UpdateService>) -> Self {
        Self {
            pipeline,
            update_service,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl PokeProfServer {
    #[tool(description = "Answer a Pokemon TCG rules question. Routes the question to the relevant documents (rulebook, penalty guidelines, legal card list, rulings compendium, card database), retrieves the matching sections and returns a cited answer in the chosen persona's style.")]
    async fn ask_question(
        &self,
        Parameters(params): Parameters<AskQuestionParams>,
    ) -> Result<Json<AskQuestionResponse>, String> {
        let query = params.query.trim().to_string();
        if query.is_empty() {
            return Err("query must not be empty".to_string());
        }

        let result = self
            .pipeline
            .submit(&query, params.persona.as_deref())
            .collect()
            .await;
        if let Some(message) = result.error {
            return Err(message);
        }

        Ok(Json(AskQuestionResponse {
            route: result.route.map(|route| RouteSummary {
                documents: route.documents,
                confidence: route.confidence,
                reasoning: route.reasoning,
            }),
            sections: result
                .sections
                .into_iter()
                .map(|s| SectionSummary {
                    document_name: s.document_name,
                    section_number: s.section_number,
                    title: s.title,
                    score: s.score,
                })
                .collect(),
            answer: result.answer,
        }))
    }

    #[tool(description = "List the loaded document indexes with their type, node count and total tokens.")]
    async fn list_indexes(&self) -> Result<Json<IndexListResponse>, String> {
        let snapshot = self.pipeline.registry().snapshot();
        Ok(Json(IndexListResponse {
            indexes: browse::index_summaries(&snapshot),
        }))
    }

    #[tool(description = "Get the section tree of one document index (ids, section numbers, titles, token counts; no content).")]
    async fn get_tree(
        &self,
        Parameters(params): Parameters<IndexNameParams>,
    ) -> Result<Json<TreeNodeView>, String> {
        let name = params.name.trim();
        if name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        let snapshot = self.pipeline.registry().snapshot();
        let index = browse::require_index(&snapshot, name).map_err(|e| e.to_string())?;
        Ok(Json(browse::tree_view(&index)))
    }

    #[tool(description = "Get the full content of one section by index name and node id (e.g. 'rulebook' and '3.4').")]
    async fn get_node(
        &self,
        Parameters(params): Parameters<GetNodeParams>,
    ) -> Result<Json<NodeDetailResponse>, String> {
        let name = params.name.trim();
        let node_id = params.node_id.trim();
        if name.is_empty() || node_id.is_empty() {
            return Err("name and node_id must not be empty".to_string());
        }
        let snapshot = self.pipeline.registry().snapshot();
        let index = browse::require_index(&snapshot, name).map_err(|e| e.to_string())?;
        browse::node_detail(&index, node_id)
            .map(Json)
            .map_err(|e| e.to_string())
    }

    #[tool(description = "Rebuild the document indexes whose source markdown changed since the last build, then reload them. Unchanged documents are skipped.")]
    async fn update_indexes(&self) -> Result<Json<UpdateIndexesResponse>, String> {
        info!("update_indexes tool invoked");
        let indexes = self.update_service.update_all(false).await;
        Ok(Json(UpdateIndexesResponse { indexes }))
    }
}

#[tool_handler]
impl ServerHandler for PokeProfServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation {
                name: "pokeprof-notebook".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "PokeProf rules MCP server. Use ask_question for Pokemon TCG rules, penalty, \
                 format and card questions (persona: judge, professor or player). Use \
                 list_indexes, get_tree and get_node to browse the indexed documents, and \
                 update_indexes after the source documents change."
                    .to_string(),
            ),
        }
    }
}
