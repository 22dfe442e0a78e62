//! Snapshot Agent Library
//!
//! Snapshots a project tree, encrypts sensitive files, archives the result and
//! ships it to local storage or a git remote (working copy or object API).

pub mod config;
pub mod crypto;
pub mod executor;
pub mod fs;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::outcome::RunOutcome;
pub use executor::Engine;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
