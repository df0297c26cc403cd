// Core modules
pub mod config;
pub mod error;
pub mod execution;
pub mod grind;
pub mod models;
pub mod persistence;

// Re-export commonly used types
pub use error::{EngineError, GatewayError};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
