//! Resumable, rate-limited orchestration for collecting research paper
//! metadata from several bibliographic sources.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod orchestrator;
pub mod rate_limit;
pub mod recovery;
pub mod session;
pub mod shutdown;
pub mod source;
pub mod ui;
pub mod work;

pub use error::{HarvestError, Result};
