//! Archive engine: storage, ingestion, crawling and scheduling

pub mod config_loader;
pub mod crawl_engine;
pub mod database;
pub mod downloader;
pub mod logger;
pub mod maintenance;
pub mod models;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, init_config};
pub use crawl_engine::{CrawlEngine, CrawlSettings};
pub use database::ContentStore;
pub use downloader::Downloader;
pub use maintenance::{Maintenance, MaintenanceSettings};
pub use scheduler::Scheduler;
pub use storage::FileStorage;
