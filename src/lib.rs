pub mod cache;
pub mod config;
pub mod fetcher;
pub mod models;
pub mod orchestrator;
pub mod price_parser;
pub mod proxy_pool;
pub mod repository;
pub mod selector_engine;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use orchestrator::{ScrapeOrchestrator, ScrapeReport};
pub use utils::error::{AppError, ErrorKind};

pub type Result<T> = std::result::Result<T, AppError>;
