//! Memory record data types
//!
//! A `MemoryRecord` is one unit of stored memory: a conversational turn, a
//! document chunk, a user preference. Its `kind` comes from a closed set and
//! selects a row of the capability table (`KindTable`) that drives default
//! TTL and the kind term of the importance score.

use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default time-to-live applied to kinds that expire
pub const DEFAULT_TTL_DAYS: u32 = 30;

/// Longest accepted TTL; use `Never` for records that must not expire
pub const MAX_TTL_DAYS: u32 = 365_000;

/// The fixed set of record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Something that happened (an event, a session)
    Episodic,
    /// Facts and document knowledge
    Semantic,
    /// How to do something
    Procedural,
    /// Short-lived scratch context
    Working,
    /// A conversational turn
    Interaction,
    /// A user preference
    Preference,
}

impl MemoryKind {
    /// Every kind, in table order
    pub const ALL: [MemoryKind; 6] = [
        MemoryKind::Episodic,
        MemoryKind::Semantic,
        MemoryKind::Procedural,
        MemoryKind::Working,
        MemoryKind::Interaction,
        MemoryKind::Preference,
    ];

    /// Stable lowercase name, also used in cold storage keys
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Working => "working",
            MemoryKind::Interaction => "interaction",
            MemoryKind::Preference => "preference",
        }
    }

    fn table_index(&self) -> usize {
        match self {
            MemoryKind::Episodic => 0,
            MemoryKind::Semantic => 1,
            MemoryKind::Procedural => 2,
            MemoryKind::Working => 3,
            MemoryKind::Interaction => 4,
            MemoryKind::Preference => 5,
        }
    }

    /// Built-in capability row for this kind
    pub fn default_policy(&self) -> KindPolicy {
        match self {
            MemoryKind::Episodic => KindPolicy::new(KindTtl::Default, 0.5),
            MemoryKind::Semantic => KindPolicy::new(KindTtl::Never, 0.8),
            MemoryKind::Procedural => KindPolicy::new(KindTtl::Default, 0.7),
            MemoryKind::Working => KindPolicy::new(KindTtl::Default, 0.2),
            MemoryKind::Interaction => KindPolicy::new(KindTtl::Default, 0.4),
            MemoryKind::Preference => KindPolicy::new(KindTtl::Never, 1.0),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MemoryKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown memory kind '{}'", s)))
    }
}

/// TTL rule of a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindTtl {
    /// Use the configured `ttl_days`
    Default,
    /// Fixed number of days
    Days(u32),
    /// Never expires
    Never,
}

/// One row of the kind capability table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindPolicy {
    pub ttl: KindTtl,
    /// Kind term of the importance score, in [0, 1]
    pub weight: f32,
}

impl KindPolicy {
    pub const fn new(ttl: KindTtl, weight: f32) -> Self {
        Self { ttl, weight }
    }

    /// Resolve the TTL against the configured default
    pub fn ttl(&self, default_days: u32) -> Option<Duration> {
        match self.ttl {
            KindTtl::Default => Some(Duration::days(default_days as i64)),
            KindTtl::Days(days) => Some(Duration::days(days as i64)),
            KindTtl::Never => None,
        }
    }
}

/// Capability table: kind → (TTL rule, kind weight)
#[derive(Debug, Clone, PartialEq)]
pub struct KindTable {
    rows: [KindPolicy; 6],
}

impl KindTable {
    /// Apply configured overrides on top of the built-in rows
    pub fn from_config(config: &LifecycleConfig) -> Result<Self> {
        let mut table = Self::default();
        for (name, over) in &config.kinds {
            let kind: MemoryKind = name.parse()?;
            let row = &mut table.rows[kind.table_index()];
            if let Some(weight) = over.weight {
                row.weight = weight.clamp(0.0, 1.0);
            }
            if let Some(days) = over.ttl_days {
                row.ttl = KindTtl::Days(days);
            }
            if over.never_expires == Some(true) {
                row.ttl = KindTtl::Never;
            }
        }
        Ok(table)
    }

    pub fn get(&self, kind: MemoryKind) -> KindPolicy {
        self.rows[kind.table_index()]
    }

    pub fn set(&mut self, kind: MemoryKind, policy: KindPolicy) {
        self.rows[kind.table_index()] = policy;
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self {
            rows: MemoryKind::ALL.map(|k| k.default_policy()),
        }
    }
}

/// Position of a chunk inside its source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub source_doc_id: String,
    /// Offset of the chunk's first character in the source document
    pub chunk_offset: usize,
}

/// A stored memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier, immutable
    pub id: Uuid,
    pub kind: MemoryKind,
    pub content: String,
    /// Derived from `content`; fixed length within an index generation
    pub embedding: Vec<f32>,
    /// Importance score (0.0–1.0), written only by the lifecycle manager
    pub importance: f32,
    /// When `importance` was last computed
    pub importance_scored_at: DateTime<Utc>,
    /// Number of retrieval hits
    pub access_count: u64,
    /// Time of the latest retrieval hit
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// `None` means the record never expires
    pub expires_at: Option<DateTime<Utc>>,
    /// Archived records leave the hot index but stay addressable by id
    pub archived: bool,
    /// Set for document chunks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkRef>,
    /// Archived original this record was reactivated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryRecord {
    /// Whether the TTL has run out at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Record a retrieval hit
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = Some(now);
    }

    /// Latest activity: last access, or creation if never accessed
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }
}

/// TTL requested at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "days")]
pub enum TtlChoice {
    /// Follow the kind's capability row
    #[default]
    Policy,
    /// Expire after this many days (0 = already expired)
    Days(u32),
    /// Never expire
    Never,
}

/// Builder for constructing `MemoryRecord` instances
pub struct RecordBuilder {
    kind: MemoryKind,
    content: Option<String>,
    embedding: Vec<f32>,
    importance: f32,
    ttl: TtlChoice,
    default_ttl_days: u32,
    kinds: KindTable,
    created_at: Option<DateTime<Utc>>,
    chunk: Option<ChunkRef>,
    restored_from: Option<Uuid>,
    metadata: HashMap<String, serde_json::Value>,
}

impl RecordBuilder {
    /// Create a new builder with the required kind
    pub fn new(kind: MemoryKind) -> Self {
        Self {
            kind,
            content: None,
            embedding: Vec::new(),
            importance: 0.0,
            ttl: TtlChoice::Policy,
            default_ttl_days: DEFAULT_TTL_DAYS,
            kinds: KindTable::default(),
            created_at: None,
            chunk: None,
            restored_from: None,
            metadata: HashMap::new(),
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Set the initial importance (clamped to 0.0–1.0)
    pub fn importance(mut self, score: f32) -> Self {
        self.importance = score.clamp(0.0, 1.0);
        self
    }

    pub fn ttl(mut self, ttl: TtlChoice) -> Self {
        self.ttl = ttl;
        self
    }

    /// Capability table and default TTL used when `ttl` is `Policy`
    pub fn policy(mut self, kinds: &KindTable, default_ttl_days: u32) -> Self {
        self.kinds = kinds.clone();
        self.default_ttl_days = default_ttl_days;
        self
    }

    /// Override the creation time (restores, tests)
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn chunk(mut self, source_doc_id: impl Into<String>, chunk_offset: usize) -> Self {
        self.chunk = Some(ChunkRef {
            source_doc_id: source_doc_id.into(),
            chunk_offset,
        });
        self
    }

    pub fn restored_from(mut self, original: Uuid) -> Self {
        self.restored_from = Some(original);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn metadata_map(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Build the record, returning an error if content is missing
    pub fn build(self) -> Result<MemoryRecord> {
        let content = self
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Validation("record content is required".to_string()))?;

        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let ttl = match self.ttl {
            TtlChoice::Policy => self.kinds.get(self.kind).ttl(self.default_ttl_days),
            TtlChoice::Days(days) if days > MAX_TTL_DAYS => {
                return Err(Error::Validation(format!(
                    "ttl of {} days exceeds the {} day limit",
                    days, MAX_TTL_DAYS
                )));
            }
            TtlChoice::Days(days) => Some(Duration::days(days as i64)),
            TtlChoice::Never => None,
        };

        let expires_at = match ttl {
            Some(ttl) => Some(created_at.checked_add_signed(ttl).ok_or_else(|| {
                Error::Validation(format!("ttl of {} days is out of range", ttl.num_days()))
            })?),
            None => None,
        };

        Ok(MemoryRecord {
            id: Uuid::new_v4(),
            kind: self.kind,
            content,
            embedding: self.embedding,
            importance: self.importance,
            importance_scored_at: created_at,
            access_count: 0,
            last_accessed_at: None,
            created_at,
            expires_at,
            archived: false,
            chunk: self.chunk,
            restored_from: self.restored_from,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindOverride;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in MemoryKind::ALL {
            assert_eq!(kind.as_str().parse::<MemoryKind>().unwrap(), kind);
        }
        assert!("dream".parse::<MemoryKind>().is_err());
        assert_eq!(
            serde_json::to_string(&MemoryKind::Interaction).unwrap(),
            "\"interaction\""
        );
    }

    #[test]
    fn test_builder_applies_kind_ttl() {
        let episodic = RecordBuilder::new(MemoryKind::Episodic)
            .content("went hiking")
            .build()
            .unwrap();
        let expires = episodic.expires_at.unwrap();
        assert_eq!(expires - episodic.created_at, Duration::days(30));

        let preference = RecordBuilder::new(MemoryKind::Preference)
            .content("prefers dark mode")
            .build()
            .unwrap();
        assert!(preference.expires_at.is_none());
    }

    #[test]
    fn test_zero_ttl_is_expired_immediately() {
        let record = RecordBuilder::new(MemoryKind::Working)
            .content("scratch")
            .ttl(TtlChoice::Days(0))
            .build()
            .unwrap();
        assert!(record.is_expired(Utc::now()));
    }

    #[test]
    fn test_oversized_ttl_is_rejected() {
        let result = RecordBuilder::new(MemoryKind::Episodic)
            .content("x")
            .ttl(TtlChoice::Days(u32::MAX))
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));

        let mut kinds = KindTable::default();
        kinds.set(MemoryKind::Episodic, KindPolicy::new(KindTtl::Days(u32::MAX), 0.5));
        let result = RecordBuilder::new(MemoryKind::Episodic)
            .content("x")
            .policy(&kinds, DEFAULT_TTL_DAYS)
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));

        let record = RecordBuilder::new(MemoryKind::Episodic)
            .content("x")
            .ttl(TtlChoice::Days(MAX_TTL_DAYS))
            .build()
            .unwrap();
        assert!(record.expires_at.is_some());
    }

    #[test]
    fn test_builder_requires_content() {
        let result = RecordBuilder::new(MemoryKind::Semantic).content("   ").build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_kind_table_overrides() {
        let mut config = LifecycleConfig::default();
        config.kinds.insert(
            "working".to_string(),
            KindOverride {
                weight: Some(2.0),
                ttl_days: Some(1),
                never_expires: None,
            },
        );
        config.kinds.insert(
            "episodic".to_string(),
            KindOverride {
                never_expires: Some(true),
                ..Default::default()
            },
        );
        let table = KindTable::from_config(&config).unwrap();
        assert_eq!(table.get(MemoryKind::Working).weight, 1.0);
        assert_eq!(table.get(MemoryKind::Working).ttl, KindTtl::Days(1));
        assert_eq!(table.get(MemoryKind::Episodic).ttl, KindTtl::Never);
        assert_eq!(table.get(MemoryKind::Semantic), MemoryKind::Semantic.default_policy());
    }

    #[test]
    fn test_record_access() {
        let mut record = RecordBuilder::new(MemoryKind::Interaction)
            .content("hello")
            .build()
            .unwrap();
        assert_eq!(record.last_activity(), record.created_at);
        let now = Utc::now();
        record.record_access(now);
        assert_eq!(record.access_count, 1);
        assert_eq!(record.last_accessed_at, Some(now));
    }

    #[test]
    fn test_record_serde_round_trip() {
        let record = RecordBuilder::new(MemoryKind::Semantic)
            .content("chunk text")
            .embedding(vec![0.1, 0.2])
            .chunk("doc-1", 800)
            .metadata("source", serde_json::json!("upload"))
            .build()
            .unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: MemoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
