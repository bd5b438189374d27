use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use querydesk::agent::Agent;
use querydesk::config::QuerydeskConfig;
use querydesk::database::Database;
use querydesk::knowledge::{HttpEmbedder, KnowledgeIndex, DEMO_KNOWLEDGE_DOCS};
use querydesk::llm_client::LlmClient;
use querydesk::refine::RefinementPipeline;
use querydesk::server;
use querydesk::session::SessionManager;
use querydesk::tools::confirm::ConfirmQueryTool;
use querydesk::tools::execute::ExecuteSqlTool;
use querydesk::tools::knowledge::KnowledgeSearchTool;
use querydesk::tools::schema::SchemaTool;
use querydesk::tools::ToolRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,querydesk=debug")),
        )
        .init();

    let config = QuerydeskConfig::load();
    tracing::info!(
        model = %config.llm_model,
        critic = %config.critic_model_name(),
        db = %config.database_path,
        "Querydesk starting"
    );

    let db = Arc::new(
        Database::new(&config.database_path)
            .with_context(|| format!("Failed to open database at {}", config.database_path))?,
    );

    let embedder = Arc::new(HttpEmbedder::new(
        config.embeddings_api_url.clone(),
        config.llm_api_key.clone(),
        config.embeddings_model.clone(),
    ));
    let index = Arc::new(
        KnowledgeIndex::new(db.clone(), embedder)
            .with_threshold(config.similarity_threshold)
            .with_limit(config.knowledge_search_limit),
    );

    if config.seed_demo_data {
        db.seed_demo_data().context("Failed to seed demo data")?;
        for doc in DEMO_KNOWLEDGE_DOCS {
            if let Err(error) = index.add_document(doc).await {
                tracing::warn!("Skipping knowledge doc ingestion: {:#}", error);
                break;
            }
        }
    }

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(SchemaTool::new(db.clone()))).await;
    registry
        .register(Arc::new(ExecuteSqlTool::new(db.clone())))
        .await;
    registry.register(Arc::new(ConfirmQueryTool::new())).await;
    registry
        .register(Arc::new(KnowledgeSearchTool::new(index.clone())))
        .await;

    let model = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let critic = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.llm_api_key.clone(),
        config.critic_model_name().to_string(),
    ));

    let agent = Arc::new(
        Agent::new(model, registry, RefinementPipeline::new(critic))
            .with_system_prompt(config.system_prompt.clone())
            .with_temperature(config.temperature)
            .with_max_turn_steps(config.max_turn_steps),
    );

    let sessions = Arc::new(SessionManager::new());
    server::serve(agent, sessions).await
}
