//! File system traversal, metadata and classification.

pub mod classify;
pub mod metadata;
pub mod walker;

pub use classify::{Classification, Classifier, FileRecord, Partition};
