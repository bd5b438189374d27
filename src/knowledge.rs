//! Knowledge store: embedding boundary plus a cosine-similarity index over
//! documents persisted in SQLite.
//!
//! The corpus is small (company glossary / schema notes), so search loads
//! every stored vector and ranks in process rather than delegating to an
//! external ANN service.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::database::Database;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;
pub const DEFAULT_SEARCH_LIMIT: usize = 3;

/// Schema notes ingested alongside the demo dataset.
pub const DEMO_KNOWLEDGE_DOCS: &[&str] = &[
    "The departments table lists company departments with a name and an \
     annual budget; its id is referenced by employees.dep_id.",
    "The employees table holds one row per employee: name, dep_id (foreign \
     key to departments), hire_date, and role (Junior, Middle, Senior, Lead, \
     or Manager).",
    "Salary amounts live in the salaries table: emp_id references \
     employees.id, amount is the yearly salary, updated_at marks when the \
     figure was last revised.",
    "Projects are tracked in the projects table (title, status); who works \
     on what is in project_assignments, which links emp_id to project_id \
     with hours_spent.",
];

/// Text → vector boundary.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// OpenAI-compatible `/embeddings` client.
#[derive(Clone)]
pub struct HttpEmbedder {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRecord>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRecord {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.api_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
        }

        let response = req.send().await.context("Embedding request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            anyhow::bail!("Embedding backend returned {}: {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|r| r.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding backend returned no vectors"))
    }
}

/// A matched document with its similarity score.
#[derive(Debug, Clone)]
pub struct KnowledgeMatch {
    pub text: String,
    pub score: f32,
}

/// Nearest-neighbor search over the persisted document set.
pub struct KnowledgeIndex {
    db: Arc<Database>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    limit: usize,
}

impl KnowledgeIndex {
    pub fn new(db: Arc<Database>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            db,
            embedder,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Embed and store a document under a stable content-derived id, so
    /// re-ingesting the same text overwrites instead of duplicating.
    pub async fn add_document(&self, text: &str) -> Result<()> {
        let vector = self.embedder.embed(text).await?;
        let id = stable_doc_id(text);
        self.db.upsert_knowledge_doc(&id, text, &vector)?;
        tracing::debug!(doc_id = %id, "Stored knowledge document");
        Ok(())
    }

    /// Top-k documents above the similarity threshold, best first.
    pub async fn search(&self, query: &str) -> Result<Vec<KnowledgeMatch>> {
        let query_vec = self.embedder.embed(query).await?;
        let docs = self.db.list_knowledge_docs()?;

        let mut scored: Vec<KnowledgeMatch> = docs
            .into_iter()
            .map(|doc| KnowledgeMatch {
                score: cosine_similarity(&query_vec, &doc.embedding),
                text: doc.text,
            })
            .filter(|m| m.score > self.threshold)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(self.limit);
        Ok(scored)
    }
}

fn stable_doc_id(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
