//! Query path: embed, search, re-rank, record access
//!
//! The index returns a wider candidate set than asked for; a
//! `RankingStrategy` then blends similarity with the lifecycle signals
//! (importance, recency) and the top `k` are returned. The strategy is
//! chosen per query through `RankingMode`, never from ambient state, so the
//! same request always ranks the same way.
//!
//! When the embedding provider is unavailable the engine falls back to
//! token overlap over the active records and flags the result as degraded.

use crate::deadline::Deadline;
use crate::embedding::{tokenize, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::index::EmbeddingIndex;
use crate::lifecycle::LifecycleManager;
use crate::memory::{MemoryKind, MemoryRecord, RecordStore, ScanFilter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Candidates pulled from the index per requested result
const CANDIDATE_FACTOR: usize = 4;

/// Which ranking strategy a query uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMode {
    /// Similarity first, light importance and recency
    #[default]
    Balanced,
    /// Conversational assistant: favours recent interactions and preferences
    Assistant,
    /// Teaching: favours durable knowledge and procedures
    Tutor,
}

impl RankingMode {
    pub const ALL: [RankingMode; 3] = [
        RankingMode::Balanced,
        RankingMode::Assistant,
        RankingMode::Tutor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RankingMode::Balanced => "balanced",
            RankingMode::Assistant => "assistant",
            RankingMode::Tutor => "tutor",
        }
    }
}

impl fmt::Display for RankingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RankingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RankingMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown ranking mode '{}'", s)))
    }
}

/// A record under consideration with its similarity to the query
pub struct Candidate<'a> {
    pub record: &'a MemoryRecord,
    pub similarity: f32,
}

/// Final ordering of search candidates
pub trait RankingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Higher ranks first
    fn score(&self, candidate: &Candidate<'_>, now: DateTime<Utc>) -> f32;
}

/// Linear blend of similarity, importance and recency with per-kind boosts
#[derive(Debug, Clone)]
pub struct WeightedRanking {
    name: String,
    similarity: f32,
    importance: f32,
    recency: f32,
    recency_half_life_days: f32,
    kind_boost: HashMap<MemoryKind, f32>,
}

impl WeightedRanking {
    pub fn new(name: impl Into<String>, similarity: f32, importance: f32, recency: f32) -> Self {
        Self {
            name: name.into(),
            similarity,
            importance,
            recency,
            recency_half_life_days: 7.0,
            kind_boost: HashMap::new(),
        }
    }

    pub fn boost(mut self, kind: MemoryKind, amount: f32) -> Self {
        self.kind_boost.insert(kind, amount);
        self
    }

    pub fn balanced() -> Self {
        Self::new("balanced", 0.7, 0.2, 0.1)
    }

    pub fn assistant() -> Self {
        Self::new("assistant", 0.6, 0.15, 0.25)
            .boost(MemoryKind::Preference, 0.05)
            .boost(MemoryKind::Interaction, 0.03)
    }

    pub fn tutor() -> Self {
        Self::new("tutor", 0.6, 0.3, 0.1)
            .boost(MemoryKind::Semantic, 0.05)
            .boost(MemoryKind::Procedural, 0.05)
    }

    /// Built-in strategy for a mode
    pub fn for_mode(mode: RankingMode) -> Self {
        match mode {
            RankingMode::Balanced => Self::balanced(),
            RankingMode::Assistant => Self::assistant(),
            RankingMode::Tutor => Self::tutor(),
        }
    }

    fn recency_term(&self, record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
        let age_days = (now - record.last_activity()).num_seconds().max(0) as f32 / 86_400.0;
        0.5f32.powf(age_days / self.recency_half_life_days)
    }
}

impl RankingStrategy for WeightedRanking {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, candidate: &Candidate<'_>, now: DateTime<Utc>) -> f32 {
        let record = candidate.record;
        self.similarity * candidate.similarity
            + self.importance * record.importance
            + self.recency * self.recency_term(record, now)
            + self.kind_boost.get(&record.kind).copied().unwrap_or(0.0)
    }
}

/// A query as submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub kinds: Option<Vec<MemoryKind>>,
    /// Time budget; the search returns what it has when it runs out
    #[serde(default, with = "duration_ms")]
    pub deadline: Option<Duration>,
    #[serde(default)]
    pub mode: RankingMode,
    /// Overrides the configured similarity floor
    #[serde(default)]
    pub similarity_floor: Option<f32>,
}

fn default_k() -> usize {
    5
}

impl QueryRequest {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            kinds: None,
            deadline: None,
            mode: RankingMode::default(),
            similarity_floor: None,
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = MemoryKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn mode(mut self, mode: RankingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn similarity_floor(mut self, floor: f32) -> Self {
        self.similarity_floor = Some(floor);
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One ranked result
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedRecord {
    pub record: MemoryRecord,
    /// Cosine similarity, or token overlap on the degraded path
    pub similarity: f32,
    /// Ranking score
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub hits: Vec<RetrievedRecord>,
    /// The deadline cut the search short
    pub truncated: bool,
    /// Embedding was unavailable; results come from text matching
    pub degraded: bool,
    pub mode: RankingMode,
}

/// Orchestrates a query across the embedder, index, store and lifecycle
pub struct RetrievalEngine {
    store: Arc<RecordStore>,
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    lifecycle: Arc<LifecycleManager>,
    rankers: HashMap<RankingMode, Arc<dyn RankingStrategy>>,
    default_floor: f32,
    queries: AtomicU64,
    answered: AtomicU64,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<RecordStore>,
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        lifecycle: Arc<LifecycleManager>,
        rankers: HashMap<RankingMode, Arc<dyn RankingStrategy>>,
        default_floor: f32,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            lifecycle,
            rankers,
            default_floor,
            queries: AtomicU64::new(0),
            answered: AtomicU64::new(0),
        }
    }

    /// Fraction of queries that returned at least one record
    pub fn hit_rate(&self) -> f64 {
        let queries = self.queries.load(AtomicOrdering::Relaxed);
        if queries == 0 {
            return 0.0;
        }
        self.answered.load(AtomicOrdering::Relaxed) as f64 / queries as f64
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(AtomicOrdering::Relaxed)
    }

    fn ranker(&self, mode: RankingMode) -> Arc<dyn RankingStrategy> {
        self.rankers
            .get(&mode)
            .cloned()
            .unwrap_or_else(|| Arc::new(WeightedRanking::for_mode(mode)))
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        if request.text.trim().is_empty() {
            return Err(Error::Validation("query text is empty".to_string()));
        }
        let mut result = QueryResult {
            mode: request.mode,
            ..Default::default()
        };
        if request.k == 0 {
            return Ok(result);
        }
        self.queries.fetch_add(1, AtomicOrdering::Relaxed);

        let deadline = request.deadline.map(Deadline::after);
        let kinds = request.kinds.as_deref();
        let floor = request.similarity_floor.unwrap_or(self.default_floor);

        let candidates = match self.embedder.embed(&request.text).await {
            Ok(vector) => {
                let outcome = self
                    .index
                    .search(
                        &vector,
                        request.k.saturating_mul(CANDIDATE_FACTOR),
                        floor,
                        kinds,
                        deadline.as_ref(),
                    )
                    .await?;
                result.truncated = outcome.truncated;
                let mut records = Vec::with_capacity(outcome.hits.len());
                for hit in outcome.hits {
                    match self.store.get(&hit.id).await {
                        Ok(record) if !record.archived => records.push((record, hit.similarity)),
                        _ => {}
                    }
                }
                records
            }
            Err(Error::EmbeddingUnavailable(reason)) => {
                warn!(reason = %reason, "Embedding unavailable, falling back to text match");
                result.degraded = true;
                let (records, truncated) = self.text_match(&request.text, kinds, deadline).await;
                result.truncated = truncated;
                records
            }
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let ranker = self.ranker(request.mode);
        let mut ranked: Vec<RetrievedRecord> = candidates
            .into_iter()
            .map(|(record, similarity)| {
                let score = ranker.score(
                    &Candidate {
                        record: &record,
                        similarity,
                    },
                    now,
                );
                RetrievedRecord {
                    record,
                    similarity,
                    score,
                }
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked.truncate(request.k);

        for hit in &mut ranked {
            if let Some(touched) = self.store.touch(&hit.record.id, now).await {
                self.lifecycle.refresh_on_access(&touched, now).await;
                hit.record = self.store.get(&touched.id).await.unwrap_or(touched);
            }
        }

        if !ranked.is_empty() {
            self.answered.fetch_add(1, AtomicOrdering::Relaxed);
        }
        debug!(
            mode = %request.mode,
            hits = ranked.len(),
            truncated = result.truncated,
            degraded = result.degraded,
            "Query served"
        );
        result.hits = ranked;
        Ok(result)
    }

    /// Token overlap against active records, for when no query vector exists
    async fn text_match(
        &self,
        text: &str,
        kinds: Option<&[MemoryKind]>,
        deadline: Option<Deadline>,
    ) -> (Vec<(MemoryRecord, f32)>, bool) {
        let query: HashSet<String> = tokenize(text).into_iter().collect();
        if query.is_empty() {
            return (Vec::new(), false);
        }
        let mut filter = ScanFilter::active();
        if let Some(kinds) = kinds {
            filter = filter.kinds(kinds.iter().copied());
        }
        let mut scan = self.store.scan(filter).await;
        if let Some(deadline) = deadline {
            scan = scan.with_deadline(deadline);
        }
        let (records, truncated) = scan.collect_records();
        let matches = records
            .into_iter()
            .filter_map(|record| {
                let tokens: HashSet<String> = tokenize(&record.content).into_iter().collect();
                let shared = query.intersection(&tokens).count();
                (shared > 0).then(|| {
                    let overlap = shared as f32 / query.len() as f32;
                    (record.as_ref().clone(), overlap)
                })
            })
            .collect();
        (matches, truncated)
    }
}

fn compare_ranked(a: &RetrievedRecord, b: &RetrievedRecord) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| {
            b.record
                .importance
                .partial_cmp(&a.record.importance)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemRagConfig;
    use crate::embedding::testing::FlakyEmbedder;
    use crate::embedding::HashEmbedder;
    use crate::memory::{RecordBuilder, TtlChoice};

    const DIM: usize = 64;

    struct Fixture {
        store: Arc<RecordStore>,
        index: Arc<EmbeddingIndex>,
        embedder: Arc<FlakyEmbedder>,
        engine: RetrievalEngine,
    }

    fn fixture() -> Fixture {
        let mut config = MemRagConfig::default();
        config.memory.embedding_dimension = DIM;
        let store = Arc::new(RecordStore::new("p", DIM));
        let index = Arc::new(EmbeddingIndex::new(DIM));
        let embedder = Arc::new(FlakyEmbedder::new(DIM));
        let lifecycle =
            Arc::new(LifecycleManager::new(&config, store.clone(), index.clone()).unwrap());
        let engine = RetrievalEngine::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            lifecycle,
            HashMap::new(),
            0.7,
        );
        Fixture {
            store,
            index,
            embedder,
            engine,
        }
    }

    async fn insert(f: &Fixture, kind: MemoryKind, content: &str, importance: f32) -> MemoryRecord {
        let record = RecordBuilder::new(kind)
            .content(content)
            .embedding(HashEmbedder::new(DIM).embed_sync(content))
            .importance(importance)
            .ttl(TtlChoice::Never)
            .build()
            .unwrap();
        f.store.put(record.clone()).await.unwrap();
        f.index.index(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_query_ranks_closest_first_and_touches() {
        let f = fixture();
        insert(&f, MemoryKind::Semantic, "rust borrow checker rules", 0.5).await;
        let target = insert(&f, MemoryKind::Semantic, "paris is the capital of france", 0.5).await;

        let result = f
            .engine
            .query(&QueryRequest::new("paris is the capital of france", 3))
            .await
            .unwrap();
        assert!(!result.degraded);
        assert_eq!(result.hits[0].record.id, target.id);
        assert!(result.hits[0].similarity > 0.99);
        assert_eq!(result.hits[0].record.access_count, 1);
        assert_eq!(f.store.get(&target.id).await.unwrap().access_count, 1);
        assert_eq!(f.engine.hit_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_kind_filter_and_floor() {
        let f = fixture();
        insert(&f, MemoryKind::Semantic, "green tea", 0.5).await;
        let pref = insert(&f, MemoryKind::Preference, "green tea", 0.5).await;

        let result = f
            .engine
            .query(&QueryRequest::new("green tea", 5).kinds([MemoryKind::Preference]))
            .await
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].record.id, pref.id);

        let none = f
            .engine
            .query(&QueryRequest::new("volcano eruption", 5))
            .await
            .unwrap();
        assert!(none.hits.is_empty());
        assert_eq!(f.engine.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_mode_changes_ordering() {
        let f = fixture();
        let fact = insert(&f, MemoryKind::Semantic, "coffee brewing", 0.5).await;
        let pref = insert(&f, MemoryKind::Preference, "coffee brewing", 0.5).await;

        let tutor = f
            .engine
            .query(&QueryRequest::new("coffee brewing", 2).mode(RankingMode::Tutor))
            .await
            .unwrap();
        assert_eq!(tutor.hits[0].record.id, fact.id);

        let assistant = f
            .engine
            .query(&QueryRequest::new("coffee brewing", 2).mode(RankingMode::Assistant))
            .await
            .unwrap();
        assert_eq!(assistant.hits[0].record.id, pref.id);
    }

    #[tokio::test]
    async fn test_degraded_text_fallback() {
        let f = fixture();
        let target = insert(&f, MemoryKind::Semantic, "the launch code is blue", 0.5).await;
        insert(&f, MemoryKind::Semantic, "unrelated words entirely", 0.5).await;
        f.embedder.set_down(true);

        let result = f
            .engine
            .query(&QueryRequest::new("launch code", 5))
            .await
            .unwrap();
        assert!(result.degraded);
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].record.id, target.id);
        assert!((result.hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_archived_records_not_returned() {
        let f = fixture();
        let record = insert(&f, MemoryKind::Semantic, "old news", 0.5).await;
        f.store.archive(&[record.id]).await;
        f.index.remove(&record.id).await;

        let result = f.engine.query(&QueryRequest::new("old news", 5)).await.unwrap();
        assert!(result.hits.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let f = fixture();
        assert!(matches!(
            f.engine.query(&QueryRequest::new("  ", 5)).await,
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"text":"hi","deadline":250,"mode":"tutor"}"#).unwrap();
        assert_eq!(request.k, 5);
        assert_eq!(request.deadline, Some(Duration::from_millis(250)));
        assert_eq!(request.mode, RankingMode::Tutor);
        assert_eq!("assistant".parse::<RankingMode>().unwrap(), RankingMode::Assistant);
    }
}
