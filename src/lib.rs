pub mod analyzer;
pub mod api;
pub mod budget;
pub mod config;
pub mod db;
pub mod llm;
pub mod model;
pub mod outbox;
pub mod pipeline;
pub mod queue;
pub mod replier;
pub mod scanner;
pub mod scorer;
pub mod secrets;
pub mod service;
pub mod twitter;
