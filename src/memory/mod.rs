//! Memory records and the hot-tier record store
//!
//! - `record`: the `MemoryRecord` type, kinds and their capability table
//! - `store`: the authoritative in-memory table with snapshot scans
//! - `chunker`: document splitting for chunk records

pub mod chunker;
pub mod record;
pub mod store;

pub use chunker::{Chunker, TextChunk};
pub use record::{
    ChunkRef, KindPolicy, KindTable, KindTtl, MemoryKind, MemoryRecord, RecordBuilder, TtlChoice,
    DEFAULT_TTL_DAYS, MAX_TTL_DAYS,
};
pub use store::{Change, RecordStore, Scan, ScanFilter, StoreCounts, Tombstone};
