//! Amnesia Upload Library
//!
//! Upload processing engine: validates submitted content against a policy and
//! persists it with stage-then-promote writes, either from complete
//! single-shot batches or from resumable, out-of-order chunk sessions.
//!
//! # Modules
//!
//! - `upload`: policy, sniffing, naming, storage and both upload paths
//! - `engine`: shared state wiring everything from one `Config`
//! - `config`: environment-driven configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod upload;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineBuilder};
pub use error::{Result, UploadError};
