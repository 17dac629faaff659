//! Retrieval Engine - 벡터 + 그래프 + 계층 요약 검색
//!
//! 파이프라인:
//! 1. 쿼리 임베딩
//! 2. 활성 리프 top-(k × multiplier) 벡터 검색
//! 3. 1홉 그래프 확장 (relates-to / summarizes, 스코어 × hop_decay)
//! 4. 상위 요약 노드 중 쿼리와 직접 유사한 것 포함 (coarse-to-fine)
//! 5. 노드 ID 기준 최대 스코어로 중복 제거
//! 6. 스코어 → 중요도 → 최근 접근 순 정렬, k개로 자르기
//! 7. 로그 기록 + 반환 노드 보강 (접근 횟수, 중요도, 동시 검색 엣지)
//!
//! 임베딩 호출 이후에는 await가 없으므로, 호출자가 future를 drop하면
//! 부수 효과 없이 취소됩니다.

mod log;

pub use log::RetrievalLog;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::{KbError, KbResult};
use crate::knowledge::{
    cosine_similarity, Direction, EdgeKind, KnowledgeNode, KnowledgeStore, NodeFilter, NodeId,
    SourceKind,
};

/// 조상 탐색 최대 깊이
const MAX_ANCESTOR_DEPTH: usize = 8;

// ============================================================================
// Types
// ============================================================================

/// 쿼리 옵션
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub k: usize,
    /// 리프 출처 종류 제한
    pub source_kind: Option<SourceKind>,
    pub expand_graph: bool,
    pub include_ancestors: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            k: 5,
            source_kind: None,
            expand_graph: true,
            include_ancestors: true,
        }
    }
}

impl QueryOptions {
    pub fn top(k: usize) -> Self {
        Self {
            k,
            ..Default::default()
        }
    }
}

/// 후보가 들어온 경로
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HitOrigin {
    Vector,
    Neighbor { via: NodeId, edge: EdgeKind },
    Ancestor { of: NodeId },
}

/// 검색 결과 항목
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub node: KnowledgeNode,
    pub score: f32,
    pub origin: HitOrigin,
}

/// 검색 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub hits: Vec<RetrievalHit>,
    /// 벡터 검색 최고 유사도 (신뢰도)
    pub top_score: f32,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

// ============================================================================
// RetrievalEngine
// ============================================================================

pub struct RetrievalEngine {
    store: Arc<KnowledgeStore>,
    gateway: EmbeddingGateway,
    log: RetrievalLog,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<KnowledgeStore>,
        gateway: EmbeddingGateway,
        log: RetrievalLog,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            log,
            config,
        }
    }

    /// 쿼리 실행
    pub async fn query(&self, text: &str, options: &QueryOptions) -> KbResult<QueryResult> {
        let text = text.trim();
        if text.is_empty() {
            return Err(KbError::Validation("query text is empty".into()));
        }
        if options.k == 0 {
            return Ok(QueryResult::default());
        }

        let embedding = self.gateway.embed(text).await?;

        // 여기부터는 동기 구간
        let mut result = self.rank(&embedding, options)?;
        self.record(text, &embedding, &mut result);
        Ok(result)
    }

    /// 후보 수집 + 정렬 (부수 효과 없음)
    pub fn rank(&self, embedding: &[f32], options: &QueryOptions) -> KbResult<QueryResult> {
        let mut leaf_filter = NodeFilter::active_leaves();
        leaf_filter.source_kind = options.source_kind;

        let limit = options.k.saturating_mul(self.config.candidate_multiplier.max(1));
        let vector_hits: Vec<_> = self
            .store
            .find_similar(embedding, limit, &leaf_filter)?
            .into_iter()
            .filter(|h| h.similarity > 0.0)
            .collect();
        let top_score = vector_hits.first().map(|h| h.similarity).unwrap_or(0.0);

        let mut candidates: HashMap<NodeId, RetrievalHit> = HashMap::new();
        for hit in &vector_hits {
            offer(
                &mut candidates,
                RetrievalHit {
                    node: hit.node.clone(),
                    score: hit.similarity,
                    origin: HitOrigin::Vector,
                },
            );
        }

        if options.expand_graph {
            let seeds: Vec<(NodeId, f32)> = vector_hits
                .iter()
                .map(|h| (h.node.id.clone(), h.similarity))
                .collect();
            match self.expand(&seeds, options) {
                Ok(expanded) => expanded.into_iter().for_each(|h| offer(&mut candidates, h)),
                Err(e) => tracing::warn!("Graph expansion failed, using vector results: {}", e),
            }
        }

        if options.include_ancestors {
            let seeds: Vec<NodeId> = vector_hits.iter().map(|h| h.node.id.clone()).collect();
            match self.ancestors(embedding, &seeds) {
                Ok(found) => found.into_iter().for_each(|h| offer(&mut candidates, h)),
                Err(e) => tracing::warn!("Ancestor lookup failed, skipping summaries: {}", e),
            }
        }

        let mut hits: Vec<RetrievalHit> = candidates.into_values().collect();
        hits.sort_by(compare_hits);
        hits.truncate(options.k);

        Ok(QueryResult { hits, top_score })
    }

    /// 1홉 이웃 확장
    fn expand(&self, seeds: &[(NodeId, f32)], options: &QueryOptions) -> KbResult<Vec<RetrievalHit>> {
        let mut out = Vec::new();
        for (seed, score) in seeds {
            for neighbor in self.store.neighbors(seed, None, Direction::Both)? {
                if !matches!(neighbor.edge.kind, EdgeKind::RelatesTo | EdgeKind::Summarizes) {
                    continue;
                }
                // 대체된 노드는 현재 버전으로
                let Some(node) = self.store.resolve(&neighbor.node.id)? else {
                    continue;
                };
                if !node.is_active() {
                    continue;
                }
                if node.is_leaf() {
                    if let Some(kind) = options.source_kind {
                        if node.source.kind != kind {
                            continue;
                        }
                    }
                }
                out.push(RetrievalHit {
                    node,
                    score: score * self.config.hop_decay,
                    origin: HitOrigin::Neighbor {
                        via: seed.clone(),
                        edge: neighbor.edge.kind,
                    },
                });
            }
        }
        Ok(out)
    }

    /// 쿼리와 직접 유사한 상위 요약 노드
    fn ancestors(&self, embedding: &[f32], seeds: &[NodeId]) -> KbResult<Vec<RetrievalHit>> {
        let mut out = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();

        for seed in seeds {
            let mut queue = VecDeque::from([(seed.clone(), 0usize)]);
            while let Some((current, depth)) = queue.pop_front() {
                if depth >= MAX_ANCESTOR_DEPTH {
                    continue;
                }
                for parent in self
                    .store
                    .neighbors(&current, Some(EdgeKind::Summarizes), Direction::Incoming)?
                {
                    let id = parent.node.id.clone();
                    if !visited.insert(id.clone()) || !parent.node.is_active() {
                        continue;
                    }
                    let similarity = cosine_similarity(embedding, &parent.node.embedding);
                    if similarity >= self.config.ancestor_threshold {
                        out.push(RetrievalHit {
                            node: parent.node,
                            score: similarity,
                            origin: HitOrigin::Ancestor { of: seed.clone() },
                        });
                    }
                    queue.push_back((id, depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// 로그 + 보강 (실패는 결과에 영향 없음)
    fn record(&self, query: &str, embedding: &[f32], result: &mut QueryResult) {
        let now = Utc::now();

        if let Err(e) = self
            .log
            .record(query, embedding, result.top_score, result.hits.len(), now)
        {
            tracing::warn!("Failed to record retrieval log: {}", e);
        }

        for hit in result.hits.iter_mut() {
            match self
                .store
                .record_access(&hit.node.id, self.config.reinforcement, now)
            {
                Ok(Some(updated)) => hit.node = updated,
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to reinforce node {}: {}", hit.node.id, e),
            }
        }

        if self.config.co_retrieval_boost > 0.0 {
            let ids: Vec<&NodeId> = result.hits.iter().map(|h| &h.node.id).collect();
            for (i, a) in ids.iter().enumerate() {
                for b in ids.iter().skip(i + 1) {
                    for (source, target) in [(*a, *b), (*b, *a)] {
                        if let Err(e) = self.store.adjust_edge_weight(
                            source,
                            target,
                            EdgeKind::RelatesTo,
                            self.config.co_retrieval_boost,
                        ) {
                            tracing::warn!("Failed to boost edge {} -> {}: {}", source, target, e);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            "Query '{}' returned {} hits (top score {:.3})",
            query,
            result.hits.len(),
            result.top_score
        );
    }
}

/// 최대 스코어 유지
fn offer(candidates: &mut HashMap<NodeId, RetrievalHit>, hit: RetrievalHit) {
    match candidates.get_mut(&hit.node.id) {
        Some(existing) if existing.score >= hit.score => {}
        Some(existing) => *existing = hit,
        None => {
            candidates.insert(hit.node.id.clone(), hit);
        }
    }
}

fn compare_hits(a: &RetrievalHit, b: &RetrievalHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.node
                .importance
                .partial_cmp(&a.node.importance)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.node.last_accessed_at.cmp(&a.node.last_accessed_at))
        .then_with(|| a.node.id.cmp(&b.node.id))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::EmbeddingConfig;
    use crate::embedding::testing::ScriptedEmbedding;
    use crate::knowledge::{Edge, NodeStatus, SourceRef};

    struct Fixture {
        store: Arc<KnowledgeStore>,
        embedder: Arc<ScriptedEmbedding>,
        log: RetrievalLog,
        engine: RetrievalEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(KnowledgeStore::open_in_memory().unwrap());
        let log = RetrievalLog::new(store.database().clone());
        let embedder = Arc::new(ScriptedEmbedding::new(3));
        let gateway = EmbeddingGateway::new(embedder.clone(), &EmbeddingConfig::default());
        let engine = RetrievalEngine::new(
            store.clone(),
            gateway,
            log.clone(),
            RetrievalConfig::default(),
        );
        Fixture {
            store,
            embedder,
            log,
            engine,
        }
    }

    fn put_leaf(store: &KnowledgeStore, content: &str, embedding: Vec<f32>, importance: f32) -> NodeId {
        store
            .put(KnowledgeNode::leaf(
                content,
                embedding,
                SourceRef::document(SourceKind::Wiki, "confluence", content),
                importance,
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_reinforces_returned_nodes() {
        let fx = fixture();
        fx.embedder.script("restart pod", vec![1.0, 0.0, 0.0]);
        let id = put_leaf(&fx.store, "Restart pod X via kubectl", vec![1.0, 0.1, 0.0], 0.5);

        let result = fx.engine.query("restart pod", &QueryOptions::top(3)).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].node.id, id);
        assert!(result.top_score > 0.99);

        let node = fx.store.get(&id).unwrap().unwrap();
        assert_eq!(node.access_count, 1);
        assert!((node.importance - 0.52).abs() < 1e-5);
        assert_eq!(fx.log.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty_and_logs() {
        let fx = fixture();
        let result = fx.engine.query("kafka consumer lag", &QueryOptions::default()).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.top_score, 0.0);
        assert_eq!(fx.log.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_neighbor_scores_are_discounted() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let direct = put_leaf(&fx.store, "direct", vec![1.0, 0.0, 0.0], 0.5);
        let linked = put_leaf(&fx.store, "linked", vec![0.0, 1.0, 0.0], 0.5);
        fx.store
            .add_edge(Edge::new(direct.clone(), linked.clone(), EdgeKind::RelatesTo, 0.8))
            .unwrap();

        let result = fx.engine.query("q", &QueryOptions::top(5)).await.unwrap();
        let ids: Vec<_> = result.hits.iter().map(|h| h.node.id.clone()).collect();
        assert_eq!(ids, vec![direct.clone(), linked.clone()]);
        assert!((result.hits[1].score - 0.5).abs() < 1e-5);
        assert_eq!(
            result.hits[1].origin,
            HitOrigin::Neighbor {
                via: direct,
                edge: EdgeKind::RelatesTo
            }
        );
    }

    #[test]
    fn test_closer_hop_never_scores_lower() {
        let fx = fixture();
        // 원시 유사도 0.6인 두 노드: near는 직접 적중, far는 요약 노드라 이웃으로만 도달
        let seed = put_leaf(&fx.store, "seed", vec![1.0, 0.0, 0.0], 0.5);
        let near = put_leaf(&fx.store, "near", vec![0.6, 0.8, 0.0], 0.5);
        let far = fx
            .store
            .put(KnowledgeNode::summary("far", vec![0.6, -0.8, 0.0], 1, vec![seed.clone()], 0.5))
            .unwrap();
        fx.store
            .add_edge(Edge::new(far.clone(), seed.clone(), EdgeKind::Summarizes, 1.0))
            .unwrap();

        let options = QueryOptions {
            k: 5,
            include_ancestors: false,
            ..Default::default()
        };
        let result = fx.engine.rank(&[1.0, 0.0, 0.0], &options).unwrap();
        let score = |id: &NodeId| result.hits.iter().find(|h| &h.node.id == id).unwrap().score;
        assert!((score(&near) - 0.6).abs() < 1e-5);
        assert!((score(&far) - 0.5).abs() < 1e-5);
        assert!(score(&near) >= score(&far));
    }

    #[tokio::test]
    async fn test_archived_nodes_excluded() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let id = put_leaf(&fx.store, "stale", vec![1.0, 0.0, 0.0], 0.5);
        fx.store.mark_status(&id, NodeStatus::Archived).unwrap();

        let result = fx.engine.query("q", &QueryOptions::default()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_ancestor_summary_included() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let leaf = put_leaf(&fx.store, "leaf", vec![1.0, 0.2, 0.0], 0.5);
        let summary = fx
            .store
            .put(KnowledgeNode::summary("summary", vec![0.9, 0.3, 0.0], 1, vec![leaf.clone()], 0.5))
            .unwrap();
        fx.store
            .add_edge(Edge::new(summary.clone(), leaf.clone(), EdgeKind::Summarizes, 1.0))
            .unwrap();

        let result = fx.engine.query("q", &QueryOptions::top(5)).await.unwrap();
        let hit = result.hits.iter().find(|h| h.node.id == summary).unwrap();
        assert_eq!(hit.origin, HitOrigin::Ancestor { of: leaf });
        assert!(hit.score > 0.9);
    }

    #[tokio::test]
    async fn test_ties_break_on_importance() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let low = put_leaf(&fx.store, "low", vec![1.0, 0.0, 0.0], 0.2);
        let high = put_leaf(&fx.store, "high", vec![1.0, 0.0, 0.0], 0.8);

        let result = fx.engine.query("q", &QueryOptions::top(2)).await.unwrap();
        assert_eq!(result.hits[0].node.id, high);
        assert_eq!(result.hits[1].node.id, low);
    }

    #[tokio::test]
    async fn test_co_retrieval_boosts_existing_edges() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let a = put_leaf(&fx.store, "a", vec![1.0, 0.0, 0.0], 0.5);
        let b = put_leaf(&fx.store, "b", vec![0.9, 0.1, 0.0], 0.5);
        fx.store
            .add_edge(Edge::new(a.clone(), b.clone(), EdgeKind::RelatesTo, 0.5))
            .unwrap();

        fx.engine.query("q", &QueryOptions::top(5)).await.unwrap();
        let edges = fx.store.edges(&a, Some(EdgeKind::RelatesTo), Direction::Outgoing).unwrap();
        assert!((edges[0].weight - 0.55).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_superseded_neighbor_resolves_to_current_version() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let seed = put_leaf(&fx.store, "seed", vec![1.0, 0.0, 0.0], 0.5);
        let old = put_leaf(&fx.store, "old", vec![0.0, 1.0, 0.0], 0.5);
        fx.store
            .add_edge(Edge::new(seed.clone(), old.clone(), EdgeKind::RelatesTo, 0.8))
            .unwrap();
        let new = fx.store.replace_content(&old, "new", vec![0.0, 0.9, 0.1]).unwrap();

        let result = fx.engine.query("q", &QueryOptions::top(5)).await.unwrap();
        let ids: Vec<_> = result.hits.iter().map(|h| h.node.id.clone()).collect();
        assert!(ids.contains(&new));
        assert!(!ids.contains(&old));
    }

    #[tokio::test]
    async fn test_cancelled_query_leaves_no_trace() {
        let store = Arc::new(KnowledgeStore::open_in_memory().unwrap());
        let log = RetrievalLog::new(store.database().clone());
        let embedder = ScriptedEmbedding::new(3).with_delay(Duration::from_millis(200));
        embedder.script("restart pod", vec![1.0, 0.0, 0.0]);
        let engine = RetrievalEngine::new(
            store.clone(),
            EmbeddingGateway::new(Arc::new(embedder), &EmbeddingConfig::default()),
            log.clone(),
            RetrievalConfig::default(),
        );
        let id = put_leaf(&store, "Restart pod X via kubectl", vec![1.0, 0.0, 0.0], 0.5);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            engine.query("restart pod", &QueryOptions::top(3)),
        )
        .await;
        assert!(cancelled.is_err());

        // 드롭된 future가 뒤늦게 실행되지 않는지 확인
        tokio::time::sleep(Duration::from_millis(300)).await;
        let node = store.get(&id).unwrap().unwrap();
        assert_eq!(node.access_count, 0);
        assert!((node.importance - 0.5).abs() < 1e-6);
        assert_eq!(log.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expansion_failure_falls_back_to_vector_hits() {
        let fx = fixture();
        fx.embedder.script("q", vec![1.0, 0.0, 0.0]);
        let seed = put_leaf(&fx.store, "seed", vec![1.0, 0.0, 0.0], 0.5);
        let first = put_leaf(&fx.store, "v0", vec![0.0, 1.0, 0.0], 0.5);
        fx.store
            .add_edge(Edge::new(seed.clone(), first.clone(), EdgeKind::RelatesTo, 0.8))
            .unwrap();

        // 대체 체인이 추적 한도(64)를 넘으면 이웃 확인이 InvariantViolation으로 실패
        let mut current = first;
        for i in 1..=70 {
            current = fx
                .store
                .replace_content(&current, &format!("v{}", i), vec![0.0, 1.0, 0.0])
                .unwrap();
        }

        let result = fx.engine.query("q", &QueryOptions::top(5)).await.unwrap();
        let ids: Vec<_> = result.hits.iter().map(|h| h.node.id.clone()).collect();
        assert_eq!(ids, vec![seed.clone()]);
        assert_eq!(result.hits[0].origin, HitOrigin::Vector);
        assert_eq!(fx.store.get(&seed).unwrap().unwrap().access_count, 1);
    }
}
