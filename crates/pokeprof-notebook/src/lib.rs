pub mod browse;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod indexer;
pub mod model;
pub mod oracle;
pub mod overlay;
pub mod pipeline;
pub mod registry;
pub mod retriever;
pub mod router;
pub mod server;
pub mod store;
pub mod synthesizer;
pub mod update;
