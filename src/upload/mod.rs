//! Upload Processing
//!
//! Accepts content either as complete single-shot batches or as unordered
//! chunks, validates it against a [`Policy`], and persists durable artifacts:
//! - Content sniffing with claimed-type verification
//! - Per-type, per-category and aggregate size ceilings
//! - Stage-then-promote writes, atomic per batch
//! - Resumable chunk sessions with progress, cancellation and expiry
//!
//! Chunked flow:
//! 1. Client picks (or asks for) a session ID
//! 2. Chunks arrive in any order via [`ChunkStore::put_chunk`]; chunk 0
//!    carries the target name and chunk count
//! 3. [`SessionRegistry::progress`] reports distinct indices received
//! 4. [`ChunkAssembler::complete`] builds the artifact and drops the chunks

pub mod artifact_store;
pub mod assembler;
pub mod chunk_store;
pub mod naming;
pub mod policy;
pub mod processor;
pub mod session;
pub mod sniff;
pub mod types;

pub use artifact_store::ArtifactStore;
pub use assembler::ChunkAssembler;
pub use chunk_store::ChunkStore;
pub use naming::{NameGenerator, RandomNames};
pub use policy::Policy;
pub use processor::{SingleShotProcessor, ValidationHook};
pub use session::{SessionProgress, SessionRegistry};
pub use sniff::{FixedSniffer, SignatureSniffer, Sniffer};
pub use types::*;
