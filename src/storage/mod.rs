//! Storage layer for Meshwire
//!
//! # Components
//!
//! - **Config**: node configuration persistence (JSON format)
//! - **Log store**: timestamped app log lines, on disk or in memory
//!
//! # Example
//!
//! ```no_run
//! use meshwire::storage::{config, new_log_store, FILE_KIND};
//! use std::path::Path;
//!
//! // Save configuration
//! let config = config::NodeConfig::generate();
//! config::save_config(Path::new("config.json"), &config).unwrap();
//!
//! // Record an app log line
//! let logs = new_log_store(Path::new("logs.jsonl"), "chat", FILE_KIND).unwrap();
//! logs.store(chrono::Utc::now(), "started").unwrap();
//! ```

pub mod config;
pub mod log_store;

// Re-export commonly used types
pub use config::{load_config, save_config, AppEntry, NodeConfig};
pub use log_store::{
    log_key, new_log_store, FileLogStore, LogStore, LogWriter, MemoryLogStore, FILE_KIND,
    MEMORY_KIND,
};
