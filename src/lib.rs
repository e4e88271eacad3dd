pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod feedback;
pub mod history;
pub mod intensity;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod pregen;
pub mod queue;
pub mod session;
pub mod srs;
