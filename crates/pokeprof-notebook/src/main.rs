use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use notebook_common::openai::{OpenAiClient, OpenAiClientConfig};
use notebook_common::redis::RedisCache;
use pokeprof_notebook::cache::RetrievalCache;
use pokeprof_notebook::config::Config;
use pokeprof_notebook::http::{self, HttpState};
use pokeprof_notebook::oracle::{DisabledOracle, LlmOracle, Oracle};
use pokeprof_notebook::overlay::ErrataSet;
use pokeprof_notebook::pipeline::Pipeline;
use pokeprof_notebook::registry::IndexRegistry;
use pokeprof_notebook::retriever::Retriever;
use pokeprof_notebook::server::PokeProfServer;
use pokeprof_notebook::store::{FileIndexStore, IndexStore, MirroredIndexStore, RedisIndexStore};
use pokeprof_notebook::synthesizer::{LlmSynthesizer, PromptLibrary};
use pokeprof_notebook::update::UpdateService;

const REDIS_NAMESPACE: &str = "pokeprof:v1:";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing to stderr (stdout is reserved for MCP JSON-RPC)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting pokeprof-notebook");

    // 1. Load config and domain tables
    let config = Config::from_env()?;
    let domain = Arc::new(config.load_domain()?);
    info!(
        index_dir = %config.index_dir.display(),
        domain = %domain.domain_name,
        documents = domain.documents.len(),
        redis = config.redis_url.is_some(),
        oracle_disabled = config.oracle_disabled,
        "configuration loaded"
    );

    // 2. Connect to Redis (optional, graceful degradation if unavailable)
    let redis = RedisCache::new(config.redis_url.as_deref(), REDIS_NAMESPACE);
    if redis.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, running without cache");
    }
    let cache = RetrievalCache::new(redis.clone());

    let file_store = FileIndexStore::new(&config.index_dir);
    let store: Arc<dyn IndexStore> = if redis.is_enabled() {
        Arc::new(MirroredIndexStore::new(file_store, RedisIndexStore::new(redis)))
    } else {
        Arc::new(file_store)
    };

    // 3. Rebuild stale indexes and load the registry
    let registry = Arc::new(IndexRegistry::default());
    let update_service = Arc::new(UpdateService::new(
        Arc::clone(&domain),
        Arc::clone(&store),
        Arc::clone(&registry),
        cache.clone(),
    ));
    let results = update_service.update_all(false).await;
    let rebuilt = results.iter().filter(|r| r.rebuilt).count();
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    info!(
        indexes = registry.snapshot().len(),
        rebuilt,
        failed,
        "indexes ready"
    );

    // 4. Errata and prompts
    let errata = match &config.errata_path {
        Some(path) => ErrataSet::load(path)?,
        None => ErrataSet::empty(),
    };
    let prompts = PromptLibrary::load(config.prompts_dir.as_deref(), &domain.personas);

    // 5. Oracle, retriever, synthesizer
    let openai_config = OpenAiClientConfig::from_env();
    info!(
        base_url = %openai_config.base_url,
        timeout_ms = openai_config.timeout.as_millis() as u64,
        max_retries = openai_config.retry.max_retries,
        "openai client configured"
    );
    let openai = OpenAiClient::new(openai_config)?;

    let oracle: Arc<dyn Oracle> = if config.oracle_disabled {
        info!("oracle disabled, retrieval uses keyword ranking only");
        Arc::new(DisabledOracle)
    } else {
        Arc::new(LlmOracle::new(
            openai.clone(),
            config.oracle_model.clone(),
            config.oracle_timeout,
        ))
    };
    let retriever = Retriever::new(
        oracle,
        config.max_concurrent_oracle_calls,
        config.oracle_timeout,
    );
    let synthesizer = Arc::new(LlmSynthesizer::new(
        openai,
        config.synth_model.clone(),
        config.synth_timeout,
        Arc::clone(&domain),
        prompts,
    ));

    let pipeline = Arc::new(
        Pipeline::new(domain, registry, retriever, synthesizer)
            .with_errata(errata)
            .with_cache(cache)
            .with_budget(config.budget)
            .with_synth_timeout(config.synth_timeout),
    );

    // 6. Serve. HTTP alone when only an HTTP address is set; otherwise MCP in the
    // foreground with HTTP alongside when configured.
    let http_state = HttpState::new(Arc::clone(&pipeline));
    let server = PokeProfServer::new(pipeline, update_service);

    match (&config.http_listen_addr, &config.mcp_tcp_listen_addr) {
        (Some(http_addr), None) => {
            http::serve(http_addr, http_state).await?;
        }
        (http_addr, mcp_addr) => {
            if let Some(http_addr) = http_addr.clone() {
                tokio::spawn(async move {
                    if let Err(e) = http::serve(&http_addr, http_state).await {
                        tracing::error!(error = %e, "HTTP server error");
                    }
                });
            }
            match mcp_addr {
                Some(addr) => serve_tcp(addr, server).await?,
                None => {
                    info!("MCP server ready, serving on stdio");
                    let service = server.serve(stdio()).await.inspect_err(|e| {
                        tracing::error!(error = %e, "MCP server error");
                    })?;
                    service.waiting().await?;
                    info!("MCP server shut down");
                }
            }
        }
    }
    Ok(())
}

async fn serve_tcp(addr: &str, server: PokeProfServer) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(listen_addr = %addr, "MCP server ready, serving on TCP");
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            tracing::info!(peer = %peer, "MCP client connected");
            let service = server.serve(stream).await.inspect_err(|e| {
                tracing::error!(error = %e, "MCP server error");
            })?;
            service.waiting().await?;
            tracing::info!(peer = %peer, "MCP client disconnected");
            Ok::<(), anyhow::Error>(())
        });
    }
}
