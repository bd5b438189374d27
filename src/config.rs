use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::agent::{DEFAULT_MAX_TURN_STEPS, DEFAULT_TEMPERATURE};
use crate::knowledge::{DEFAULT_SEARCH_LIMIT, DEFAULT_SIMILARITY_THRESHOLD};
use crate::prompts::DEFAULT_SYSTEM_PROMPT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerydeskConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Model used for validation and optimization passes; falls back to
    /// `llm_model` when unset.
    #[serde(default)]
    pub critic_model: Option<String>,

    // Embeddings endpoint for the knowledge index
    #[serde(default = "default_embeddings_url")]
    pub embeddings_api_url: String,
    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,

    // System prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    // Database
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub seed_demo_data: bool,

    // Knowledge search
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_knowledge_search_limit")]
    pub knowledge_search_limit: usize,

    // Turn behavior
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_turn_steps")]
    pub max_turn_steps: usize,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_embeddings_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_embeddings_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_database_path() -> String {
    "querydesk.db".to_string()
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_knowledge_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_turn_steps() -> usize {
    DEFAULT_MAX_TURN_STEPS
}

impl Default for QuerydeskConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            critic_model: None,
            embeddings_api_url: default_embeddings_url(),
            embeddings_model: default_embeddings_model(),
            system_prompt: default_system_prompt(),
            database_path: default_database_path(),
            seed_demo_data: false,
            similarity_threshold: default_similarity_threshold(),
            knowledge_search_limit: default_knowledge_search_limit(),
            temperature: default_temperature(),
            max_turn_steps: default_max_turn_steps(),
        }
    }
}

impl QuerydeskConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("querydesk.toml")
    }

    /// Load config from querydesk.toml next to the executable, falling
    /// back to defaults plus environment variables.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<QuerydeskConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }
        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }
        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }
        if let Ok(model) = env::var("QUERYDESK_CRITIC_MODEL") {
            if !model.trim().is_empty() {
                config.critic_model = Some(model);
            }
        }
        if let Ok(url) = env::var("EMBEDDINGS_API_URL") {
            config.embeddings_api_url = url;
        }
        if let Ok(model) = env::var("EMBEDDINGS_MODEL") {
            config.embeddings_model = model;
        }
        if let Ok(path) = env::var("QUERYDESK_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }
        if let Ok(enabled) = env::var("QUERYDESK_SEED_DEMO_DATA") {
            config.seed_demo_data = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }
        if let Ok(threshold) = env::var("QUERYDESK_SIMILARITY_THRESHOLD") {
            if let Ok(value) = threshold.parse() {
                config.similarity_threshold = value;
            }
        }
        if let Ok(limit) = env::var("QUERYDESK_KNOWLEDGE_SEARCH_LIMIT") {
            if let Ok(value) = limit.parse() {
                config.knowledge_search_limit = value;
            }
        }
        if let Ok(temperature) = env::var("QUERYDESK_TEMPERATURE") {
            if let Ok(value) = temperature.parse() {
                config.temperature = value;
            }
        }
        if let Ok(steps) = env::var("QUERYDESK_MAX_TURN_STEPS") {
            if let Ok(value) = steps.parse() {
                config.max_turn_steps = value;
            }
        }

        config
    }

    /// Model name the refinement pipeline should use.
    pub fn critic_model_name(&self) -> &str {
        self.critic_model.as_deref().unwrap_or(&self.llm_model)
    }
}
