pub mod config;
pub mod conversation;
pub mod error;
pub mod llm_client;
pub mod pet;
pub mod presentation;
pub mod runtime;
pub mod server;
pub mod store;
