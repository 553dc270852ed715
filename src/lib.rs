//! MemRag - Tiered memory and retrieval-augmented record store
//!
//! MemRag keeps typed memory records (episodic, semantic, procedural,
//! working, preference, interaction) in a hot in-memory tier with a vector
//! index, scores and expires them over time, and mirrors every change to a
//! cold object store from which a partition can be rebuilt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          MemorySystem                             │
//! │                                                                   │
//! │   add_record / add_document          query(text, k, kinds)        │
//! │            │                                  │                   │
//! │   ┌────────▼────────┐               ┌─────────▼─────────┐         │
//! │   │ EmbeddingProvider│◄──────────────│  RetrievalEngine  │         │
//! │   └────────┬────────┘               │  - ranking modes  │         │
//! │            │                        │  - text fallback  │         │
//! │   ┌────────▼────────┐  search       └─────────┬─────────┘         │
//! │   │  RecordStore    │◄──────────────┐         │ touch             │
//! │   │  (hot, versioned)│  ┌────────────┴─────┐   │                   │
//! │   └───┬─────────▲───┘  │  EmbeddingIndex  │◄──┘                   │
//! │       │         │      └──────────▲───────┘                       │
//! │       │   ┌─────┴──────────────┐  │                               │
//! │       │   │  LifecycleManager  ├──┘ archive / evict               │
//! │       │   │  importance + TTL  │                                  │
//! │       │   └────────────────────┘                                  │
//! │       │ changes_since                                             │
//! │   ┌───▼─────────────┐                                             │
//! │   │  Synchronizer   │ checkpoint, retry, restore, snapshots       │
//! │   └───┬─────────────┘                                             │
//! └───────┼───────────────────────────────────────────────────────────┘
//!         │ MRG1 objects (gzip json, optional AES-256-GCM)
//! ┌───────▼───────────────────────────────────────────────────────────┐
//! │  ColdStorage: {partition}/memories/{kind}/{id}                     │
//! │               {partition}/documents/{doc_id}/{offset}              │
//! │               {partition}/indexes/checkpoint.json                  │
//! │               {partition}/indexes/chunks/{id}                      │
//! │               {partition}/backups/{snapshot}.json.gz               │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`memory`]: Records, the hot record store and document chunking
//! - [`index`]: In-memory cosine similarity index
//! - [`embedding`]: Embedding providers
//! - [`lifecycle`]: Importance scoring, expiry and eviction
//! - [`retrieval`]: Query ranking
//! - [`sync`]: Cold storage mirroring, restore and snapshots
//! - [`registry`]: Startup resolution of pluggable capabilities
//! - [`system`]: The caller-facing facade
//! - [`api`]: HTTP surface
//! - [`crypto`]: Object encryption and partition key derivation
//! - [`config`]: Configuration management

pub mod api;
pub mod config;
pub mod crypto;
pub mod deadline;
pub mod embedding;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod memory;
pub mod registry;
pub mod retrieval;
pub mod sync;
pub mod system;

pub use config::MemRagConfig;
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use memory::{MemoryKind, MemoryRecord, TtlChoice};
pub use retrieval::{QueryRequest, QueryResult, RankingMode};
pub use system::{MemorySystem, NewRecord, Stats};
