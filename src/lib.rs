// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod reconciler;
pub mod settings;
pub mod strategy;
pub mod supervisor;
pub mod venue;

// Re-export commonly used types
pub use models::*;
pub use strategy::StrategyUnit;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
