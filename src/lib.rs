pub mod agent;
pub mod config;
pub mod database;
pub mod gate;
pub mod history;
pub mod knowledge;
pub mod llm_client;
pub mod prompts;
pub mod refine;
pub mod server;
pub mod session;
pub mod tools;
