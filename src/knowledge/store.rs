//! Knowledge Store - 노드/엣지 그래프 저장소
//!
//! SQLite에 영속화하고, 검색용으로 노드 스냅샷을 메모리에 유지합니다.
//!
//! 동시성 규칙:
//! - 노드마다 `Mutex` 슬롯을 두고, 모든 변경은 슬롯 락 아래에서
//!   사본 수정 → DB 기록 → 교체 순서로 진행합니다. 읽기는 항상 완성된 노드만 봅니다.
//! - 노드 맵 락을 잡은 채로 슬롯 락을 기다리지 않습니다 (슬롯 목록을 먼저 복사).
//! - 엣지 인덱스 락은 슬롯 락보다 먼저 잡습니다. DB 커넥션 락은 항상 마지막입니다.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::config::DATABASE_FILE_NAME;
use crate::error::{KbError, KbResult};

use super::db::{format_ts, parse_opt_ts, parse_ts, Database};
use super::similarity::{blob_to_embedding, cosine_similarity, embedding_to_blob, is_valid_embedding};
use super::types::{
    Direction, Edge, EdgeKind, KnowledgeNode, Neighbor, NodeFilter, NodeId, NodeStatus,
    ScoredNode, SourceRef,
};

/// supersede 체인 추적 최대 깊이
const MAX_SUPERSEDE_HOPS: usize = 64;

type NodeSlot = Arc<Mutex<KnowledgeNode>>;

// ============================================================================
// Types
// ============================================================================

/// 병합(provenance 추가) 결과
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// 새 출처 기록 + 중요도 보강
    Reinforced { importance: f32 },
    /// 이미 기록된 출처 (재처리)
    AlreadyRecorded,
    /// 대상이 활성 노드가 아님
    Inactive,
}

/// 감쇠 정책 (노드 하나에 적용)
#[derive(Debug, Clone, Copy)]
pub struct DecayPolicy {
    pub rate_per_day: f32,
    pub retirement_threshold: f32,
    pub grace: chrono::Duration,
}

/// 감쇠 적용 결과
#[derive(Debug, Clone, PartialEq)]
pub enum DecayOutcome {
    /// 활성 리프가 아니거나 경과 시간 없음
    Unchanged,
    Decayed { before: f32, after: f32 },
    Archived { before: f32, after: f32 },
}

/// 저장소 통계
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub active_leaves: usize,
    pub active_summaries: usize,
    pub archived: usize,
    pub superseded: usize,
    pub edge_count: usize,
}

impl StoreStats {
    pub fn total_nodes(&self) -> usize {
        self.active_leaves + self.active_summaries + self.archived + self.superseded
    }
}

#[derive(Default)]
struct EdgeIndex {
    outgoing: HashMap<NodeId, Vec<Edge>>,
    incoming: HashMap<NodeId, Vec<Edge>>,
}

impl EdgeIndex {
    fn find_mut(&mut self, source: &NodeId, target: &NodeId, kind: EdgeKind) -> Option<&mut Edge> {
        self.outgoing
            .get_mut(source)
            .and_then(|edges| edges.iter_mut().find(|e| &e.target == target && e.kind == kind))
    }

    fn insert(&mut self, edge: Edge) {
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .push(edge.clone());
        self.outgoing.entry(edge.source.clone()).or_default().push(edge);
    }

    fn set_weight(&mut self, source: &NodeId, target: &NodeId, kind: EdgeKind, weight: f32) {
        if let Some(e) = self.find_mut(source, target, kind) {
            e.weight = weight;
        }
        if let Some(e) = self
            .incoming
            .get_mut(target)
            .and_then(|edges| edges.iter_mut().find(|e| &e.source == source && e.kind == kind))
        {
            e.weight = weight;
        }
    }

    /// `from`에서 summarizes 엣지를 따라 `to`에 도달 가능한지
    fn summarizes_path_exists(&self, from: &NodeId, to: &NodeId) -> bool {
        let mut queue = VecDeque::from([from.clone()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if &current == to {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(edges) = self.outgoing.get(&current) {
                queue.extend(
                    edges
                        .iter()
                        .filter(|e| e.kind == EdgeKind::Summarizes)
                        .map(|e| e.target.clone()),
                );
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.outgoing.values().map(Vec::len).sum()
    }
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// 지식 그래프 저장소
pub struct KnowledgeStore {
    db: Database,
    nodes: RwLock<HashMap<NodeId, NodeSlot>>,
    edges: RwLock<EdgeIndex>,
}

impl KnowledgeStore {
    /// 데이터 디렉토리에서 열기 (knowledge.db)
    pub fn open(data_dir: &Path) -> KbResult<Self> {
        let db = Database::open(&data_dir.join(DATABASE_FILE_NAME))?;
        Self::with_database(db)
    }

    /// 인메모리 저장소
    pub fn open_in_memory() -> KbResult<Self> {
        Self::with_database(Database::open_in_memory()?)
    }

    /// 기존 DB 핸들로 생성 (노드/엣지를 메모리로 로드)
    pub fn with_database(db: Database) -> KbResult<Self> {
        let (nodes, edges) = db.with_conn(|conn| Ok((load_nodes(conn)?, load_edges(conn)?)))?;

        let mut index = EdgeIndex::default();
        let edge_count = edges.len();
        for edge in edges {
            index.insert(edge);
        }

        let node_count = nodes.len();
        let nodes = nodes
            .into_iter()
            .map(|n| (n.id.clone(), Arc::new(Mutex::new(n))))
            .collect();

        tracing::info!(
            "Knowledge store loaded: {} nodes, {} edges",
            node_count,
            edge_count
        );

        Ok(Self {
            db,
            nodes: RwLock::new(nodes),
            edges: RwLock::new(index),
        })
    }

    /// 내부 DB 핸들 (큐/로그가 같은 파일을 공유)
    pub fn database(&self) -> &Database {
        &self.db
    }

    // ------------------------------------------------------------------
    // Slot helpers
    // ------------------------------------------------------------------

    fn slot(&self, id: &NodeId) -> KbResult<Option<NodeSlot>> {
        let nodes = self.nodes.read().map_err(KbError::poisoned)?;
        Ok(nodes.get(id).cloned())
    }

    fn slots(&self) -> KbResult<Vec<NodeSlot>> {
        let nodes = self.nodes.read().map_err(KbError::poisoned)?;
        Ok(nodes.values().cloned().collect())
    }

    /// 노드 하나를 원자적으로 변경
    ///
    /// 사본에 클로저를 적용하고 DB에 기록한 뒤에만 교체합니다.
    /// 내용/임베딩/ID 변경은 거부합니다.
    fn mutate<R>(
        &self,
        id: &NodeId,
        f: impl FnOnce(&mut KnowledgeNode) -> KbResult<R>,
    ) -> KbResult<Option<R>> {
        let Some(slot) = self.slot(id)? else {
            return Ok(None);
        };
        let mut guard = slot.lock().map_err(KbError::poisoned)?;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;

        if draft.id != guard.id || draft.content != guard.content || draft.embedding != guard.embedding {
            return Err(KbError::invariant(format!(
                "in-place content mutation attempted on node {}",
                guard.id
            )));
        }

        if draft != *guard {
            self.db.with_conn(|conn| update_node_row(conn, &draft))?;
            *guard = draft;
        }
        Ok(Some(out))
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// 노드 저장
    ///
    /// 완성된 노드만 맵에 삽입되므로 부분 기록이 보이지 않습니다.
    /// 이미 사용된 ID(보관/대체된 노드 포함)는 재사용할 수 없습니다.
    pub fn put(&self, node: KnowledgeNode) -> KbResult<NodeId> {
        if !is_valid_embedding(&node.embedding) {
            return Err(KbError::invariant(format!(
                "node {} has no valid embedding",
                node.id
            )));
        }
        if !(0.0..=1.0).contains(&node.importance) {
            return Err(KbError::invariant(format!(
                "node {} importance {} outside [0, 1]",
                node.id, node.importance
            )));
        }
        if node.content_hash != super::types::content_hash(&node.content) {
            return Err(KbError::invariant(format!(
                "node {} content hash does not match content",
                node.id
            )));
        }

        let id = node.id.clone();
        let mut nodes = self.nodes.write().map_err(KbError::poisoned)?;
        if nodes.contains_key(&id) {
            return Err(KbError::invariant(format!("node id {} already used", id)));
        }
        self.db.with_conn(|conn| insert_node_row(conn, &node))?;
        nodes.insert(id.clone(), Arc::new(Mutex::new(node)));
        drop(nodes);

        tracing::debug!("Stored node {}", id);
        Ok(id)
    }

    /// ID로 노드 조회 (스냅샷)
    pub fn get(&self, id: &NodeId) -> KbResult<Option<KnowledgeNode>> {
        match self.slot(id)? {
            Some(slot) => Ok(Some(slot.lock().map_err(KbError::poisoned)?.clone())),
            None => Ok(None),
        }
    }

    /// supersede 체인을 따라 현재 버전 조회
    pub fn resolve(&self, id: &NodeId) -> KbResult<Option<KnowledgeNode>> {
        let mut current = match self.get(id)? {
            Some(node) => node,
            None => return Ok(None),
        };

        for _ in 0..MAX_SUPERSEDE_HOPS {
            let next = match (&current.status, &current.superseded_by) {
                (NodeStatus::Superseded, Some(next)) => next.clone(),
                _ => return Ok(Some(current)),
            };
            match self.get(&next)? {
                Some(node) => current = node,
                None => return Ok(Some(current)),
            }
        }

        Err(KbError::invariant(format!(
            "supersede chain from {} exceeds {} hops",
            id, MAX_SUPERSEDE_HOPS
        )))
    }

    /// 필터에 맞는 노드 목록 (상태 스캔)
    pub fn list(&self, filter: &NodeFilter) -> KbResult<Vec<KnowledgeNode>> {
        let mut out = Vec::new();
        for slot in self.slots()? {
            let node = slot.lock().map_err(KbError::poisoned)?;
            if filter.matches(&node) {
                out.push(node.clone());
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// 필터에 맞는 노드 ID 목록
    pub fn ids(&self, filter: &NodeFilter) -> KbResult<Vec<NodeId>> {
        Ok(self.list(filter)?.into_iter().map(|n| n.id).collect())
    }

    /// 내용 해시가 같은 노드 검색
    pub fn find_by_hash(&self, hash: &str, filter: &NodeFilter) -> KbResult<Option<KnowledgeNode>> {
        for slot in self.slots()? {
            let node = slot.lock().map_err(KbError::poisoned)?;
            if node.content_hash == hash && filter.matches(&node) {
                return Ok(Some(node.clone()));
            }
        }
        Ok(None)
    }

    /// 코사인 유사도 top-k
    ///
    /// 노드마다 슬롯 락 아래에서 스냅샷을 떠서 비교하므로
    /// content/embedding/importance가 항상 일관됩니다.
    pub fn find_similar(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &NodeFilter,
    ) -> KbResult<Vec<ScoredNode>> {
        if k == 0 || embedding.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = Vec::new();
        let mut mismatched = 0usize;
        for slot in self.slots()? {
            let node = slot.lock().map_err(KbError::poisoned)?;
            if !filter.matches(&node) {
                continue;
            }
            if node.embedding.len() != embedding.len() {
                mismatched += 1;
                continue;
            }
            let similarity = cosine_similarity(embedding, &node.embedding);
            scored.push(ScoredNode {
                node: node.clone(),
                similarity,
            });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.node
                        .importance
                        .partial_cmp(&a.node.importance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        scored.truncate(k);

        if mismatched > 0 {
            tracing::warn!(
                "Similarity search skipped {} nodes whose embedding dimension differs from {}",
                mismatched,
                embedding.len()
            );
        }
        Ok(scored)
    }

    /// 저장된 활성 노드의 임베딩 차원 (노드가 없으면 `None`)
    pub fn embedding_dimension(&self) -> KbResult<Option<usize>> {
        for slot in self.slots()? {
            let node = slot.lock().map_err(KbError::poisoned)?;
            if node.is_active() {
                return Ok(Some(node.embedding.len()));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Per-node mutations
    // ------------------------------------------------------------------

    /// 중요도 변경 ([0, 1]로 클램프)
    ///
    /// 슬롯 락으로 직렬화되므로 동시 호출의 델타가 모두 누적됩니다.
    pub fn update_importance(&self, id: &NodeId, delta: f32) -> KbResult<Option<f32>> {
        self.mutate(id, |node| {
            node.importance = (node.importance + delta).clamp(0.0, 1.0);
            Ok(node.importance)
        })
    }

    /// 상태 변경
    ///
    /// `Superseded`는 [`KnowledgeStore::supersede`]나 [`KnowledgeStore::mark_superseded`]로만 설정할 수 있고,
    /// 대체된 노드는 다시 바꿀 수 없습니다.
    pub fn mark_status(&self, id: &NodeId, status: NodeStatus) -> KbResult<bool> {
        if status == NodeStatus::Superseded {
            return Err(KbError::Validation(
                "use supersede() to mark a node superseded".into(),
            ));
        }
        let changed = self.mutate(id, |node| {
            if node.status == NodeStatus::Superseded {
                return Err(KbError::invariant(format!(
                    "node {} is superseded and cannot change status",
                    node.id
                )));
            }
            let changed = node.status != status;
            node.status = status;
            Ok(changed)
        })?;

        if changed == Some(true) {
            tracing::info!("Node {} -> {}", id, status);
        }
        Ok(changed.unwrap_or(false))
    }

    /// 검색 적중 기록: 접근 횟수 +1, 접근 시각 갱신, 중요도 보강
    pub fn record_access(
        &self,
        id: &NodeId,
        reinforcement: f32,
        now: DateTime<Utc>,
    ) -> KbResult<Option<KnowledgeNode>> {
        self.mutate(id, |node| {
            node.access_count += 1;
            if now > node.last_accessed_at {
                node.last_accessed_at = now;
            }
            node.importance = (node.importance + reinforcement.max(0.0)).clamp(0.0, 1.0);
            Ok(node.clone())
        })
    }

    /// 중복 병합: 출처 추가 + 중요도 보강
    ///
    /// 같은 출처를 두 번 병합하면 아무것도 바꾸지 않습니다 (재처리 멱등성).
    pub fn merge_provenance(
        &self,
        id: &NodeId,
        source: &SourceRef,
        boost: f32,
    ) -> KbResult<Option<MergeOutcome>> {
        self.mutate(id, |node| {
            if !node.is_active() {
                return Ok(MergeOutcome::Inactive);
            }
            if node.has_source(source) {
                return Ok(MergeOutcome::AlreadyRecorded);
            }
            node.provenance.push(source.clone());
            node.importance = (node.importance + boost.max(0.0)).clamp(0.0, 1.0);
            Ok(MergeOutcome::Reinforced {
                importance: node.importance,
            })
        })
    }

    /// 감쇠 적용 (필요 시 보관까지 한 번에)
    ///
    /// 경과 시간은 마지막 접근과 마지막 감쇠 중 늦은 시점부터 계산합니다.
    pub fn apply_decay(
        &self,
        id: &NodeId,
        policy: DecayPolicy,
        now: DateTime<Utc>,
    ) -> KbResult<Option<DecayOutcome>> {
        self.mutate(id, |node| {
            if !node.is_active() || !node.is_leaf() {
                return Ok(DecayOutcome::Unchanged);
            }

            let since = match node.last_decayed_at {
                Some(decayed) if decayed > node.last_accessed_at => decayed,
                _ => node.last_accessed_at,
            };
            let elapsed_ms = (now - since).num_milliseconds();
            if elapsed_ms <= 0 {
                return Ok(DecayOutcome::Unchanged);
            }

            let elapsed_days = elapsed_ms as f64 / 86_400_000.0;
            let before = node.importance;
            let after = (before as f64 - policy.rate_per_day.max(0.0) as f64 * elapsed_days)
                .clamp(0.0, 1.0) as f32;
            node.importance = after.min(before);
            node.last_decayed_at = Some(now);

            let idle = now - node.last_accessed_at;
            if node.importance < policy.retirement_threshold && idle >= policy.grace {
                node.status = NodeStatus::Archived;
                return Ok(DecayOutcome::Archived {
                    before,
                    after: node.importance,
                });
            }
            Ok(DecayOutcome::Decayed {
                before,
                after: node.importance,
            })
        })
    }

    /// 새 버전 노드를 저장하고 기존 노드를 `Superseded`로 표시
    ///
    /// 기존 노드를 가리키는 엣지는 그대로 남으며 `resolve()`로 새 버전을 찾습니다.
    pub fn supersede(&self, old_id: &NodeId, replacement: KnowledgeNode) -> KbResult<NodeId> {
        let Some(slot) = self.slot(old_id)? else {
            return Err(KbError::Validation(format!("unknown node {}", old_id)));
        };
        let mut guard = slot.lock().map_err(KbError::poisoned)?;
        if !guard.is_active() {
            return Err(KbError::invariant(format!(
                "cannot supersede node {} in status {}",
                old_id, guard.status
            )));
        }

        let new_id = self.put(replacement)?;

        let mut draft = guard.clone();
        draft.status = NodeStatus::Superseded;
        draft.superseded_by = Some(new_id.clone());
        self.db.with_conn(|conn| update_node_row(conn, &draft))?;
        *guard = draft;

        tracing::info!("Node {} superseded by {}", old_id, new_id);
        Ok(new_id)
    }

    /// 이미 저장된 노드를 기존 노드의 새 버전으로 연결
    ///
    /// 새 노드의 엣지를 먼저 만든 뒤 마지막에 호출하면 읽기 쪽에서 빈 구간이 보이지 않습니다.
    pub fn mark_superseded(&self, old_id: &NodeId, new_id: &NodeId) -> KbResult<()> {
        if old_id == new_id {
            return Err(KbError::invariant(format!("node {} cannot supersede itself", old_id)));
        }
        if self.slot(new_id)?.is_none() {
            return Err(KbError::Validation(format!("unknown replacement node {}", new_id)));
        }

        let marked = self.mutate(old_id, |node| {
            if !node.is_active() {
                return Err(KbError::invariant(format!(
                    "cannot supersede node {} in status {}",
                    node.id, node.status
                )));
            }
            node.status = NodeStatus::Superseded;
            node.superseded_by = Some(new_id.clone());
            Ok(())
        })?;

        if marked.is_none() {
            return Err(KbError::Validation(format!("unknown node {}", old_id)));
        }
        tracing::info!("Node {} superseded by {}", old_id, new_id);
        Ok(())
    }

    /// 내용 교체: 임베딩을 받아 새 버전 생성
    pub fn replace_content(
        &self,
        id: &NodeId,
        content: &str,
        embedding: Vec<f32>,
    ) -> KbResult<NodeId> {
        let Some(current) = self.get(id)? else {
            return Err(KbError::Validation(format!("unknown node {}", id)));
        };
        let replacement = current.new_version(content, embedding);
        self.supersede(id, replacement)
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    /// 엣지 추가 (이미 있으면 가중치를 큰 값으로 유지)
    ///
    /// summarizes 엣지는 상위 레벨 → 하위 레벨만 허용하며,
    /// 순환이 생기면 `InvariantViolation`을 반환합니다.
    pub fn add_edge(&self, edge: Edge) -> KbResult<()> {
        if edge.source == edge.target {
            return Err(KbError::invariant(format!("self-loop edge on {}", edge.source)));
        }

        let mut index = self.edges.write().map_err(KbError::poisoned)?;

        let source = self
            .get(&edge.source)?
            .ok_or_else(|| KbError::Validation(format!("unknown edge source {}", edge.source)))?;
        let target = self
            .get(&edge.target)?
            .ok_or_else(|| KbError::Validation(format!("unknown edge target {}", edge.target)))?;

        if edge.kind == EdgeKind::Summarizes {
            if source.summary_level <= target.summary_level {
                return Err(KbError::invariant(format!(
                    "summarizes edge must point down the hierarchy ({} L{} -> {} L{})",
                    source.id, source.summary_level, target.id, target.summary_level
                )));
            }
            if index.summarizes_path_exists(&edge.target, &edge.source) {
                return Err(KbError::invariant(format!(
                    "summarizes edge {} -> {} would create a cycle",
                    edge.source, edge.target
                )));
            }
        }

        if let Some(existing) = index.find_mut(&edge.source, &edge.target, edge.kind) {
            if edge.weight > existing.weight {
                let weight = edge.weight;
                self.db.with_conn(|conn| update_edge_weight(conn, &edge, weight))?;
                index.set_weight(&edge.source, &edge.target, edge.kind, weight);
            }
            return Ok(());
        }

        self.db.with_conn(|conn| insert_edge_row(conn, &edge))?;
        tracing::debug!("Edge {} -{}-> {}", edge.source, edge.kind, edge.target);
        index.insert(edge);
        Ok(())
    }

    /// 엣지 가중치 조정 ([0, 1] 클램프). 엣지가 없으면 None
    pub fn adjust_edge_weight(
        &self,
        source: &NodeId,
        target: &NodeId,
        kind: EdgeKind,
        delta: f32,
    ) -> KbResult<Option<f32>> {
        let mut index = self.edges.write().map_err(KbError::poisoned)?;
        let Some(existing) = index.find_mut(source, target, kind) else {
            return Ok(None);
        };
        let weight = (existing.weight + delta).clamp(0.0, 1.0);
        let edge = existing.clone();
        self.db.with_conn(|conn| update_edge_weight(conn, &edge, weight))?;
        index.set_weight(source, target, kind, weight);
        Ok(Some(weight))
    }

    /// 엣지 목록 (방향/종류 필터)
    pub fn edges(&self, id: &NodeId, kind: Option<EdgeKind>, direction: Direction) -> KbResult<Vec<Edge>> {
        let index = self.edges.read().map_err(KbError::poisoned)?;
        let mut out = Vec::new();
        let wanted = |e: &&Edge| kind.map_or(true, |k| e.kind == k);

        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(edges) = index.outgoing.get(id) {
                out.extend(edges.iter().filter(wanted).cloned());
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(edges) = index.incoming.get(id) {
                out.extend(edges.iter().filter(wanted).cloned());
            }
        }
        Ok(out)
    }

    /// 이웃 노드 조회
    ///
    /// 엣지 반대편 노드의 현재 스냅샷을 반환합니다 (상태 필터 없음).
    pub fn neighbors(
        &self,
        id: &NodeId,
        kind: Option<EdgeKind>,
        direction: Direction,
    ) -> KbResult<Vec<Neighbor>> {
        let edges = self.edges(id, kind, direction)?;
        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            let other = if &edge.source == id { &edge.target } else { &edge.source };
            if let Some(node) = self.get(other)? {
                out.push(Neighbor { edge, node });
            }
        }
        Ok(out)
    }

    /// summarizes 그래프에 순환이 있는지 전체 검사
    pub fn has_summarizes_cycle(&self) -> KbResult<bool> {
        let index = self.edges.read().map_err(KbError::poisoned)?;

        // Kahn 위상 정렬
        let mut indegree: HashMap<&NodeId, usize> = HashMap::new();
        for edges in index.outgoing.values() {
            for e in edges.iter().filter(|e| e.kind == EdgeKind::Summarizes) {
                indegree.entry(&e.source).or_insert(0);
                *indegree.entry(&e.target).or_insert(0) += 1;
            }
        }

        let total = indegree.len();
        let mut queue: VecDeque<&NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(edges) = index.outgoing.get(id) {
                for e in edges.iter().filter(|e| e.kind == EdgeKind::Summarizes) {
                    if let Some(d) = indegree.get_mut(&e.target) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(&e.target);
                        }
                    }
                }
            }
        }

        Ok(visited != total)
    }

    /// 저장소 통계
    pub fn stats(&self) -> KbResult<StoreStats> {
        let mut stats = StoreStats::default();
        for slot in self.slots()? {
            let node = slot.lock().map_err(KbError::poisoned)?;
            match (node.status, node.is_leaf()) {
                (NodeStatus::Active, true) => stats.active_leaves += 1,
                (NodeStatus::Active, false) => stats.active_summaries += 1,
                (NodeStatus::Archived, _) => stats.archived += 1,
                (NodeStatus::Superseded, _) => stats.superseded += 1,
            }
        }
        stats.edge_count = self.edges.read().map_err(KbError::poisoned)?.len();
        Ok(stats)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

const NODE_COLUMNS: &str = "id, content, embedding, content_hash, importance, created_at, \
     last_accessed_at, last_decayed_at, access_count, source, provenance, summary_level, \
     status, superseded_by, summary_basis";

fn insert_node_row(conn: &Connection, node: &KnowledgeNode) -> KbResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            NODE_COLUMNS
        ),
        params![
            node.id.to_string(),
            node.content,
            embedding_to_blob(&node.embedding),
            node.content_hash,
            node.importance as f64,
            format_ts(node.created_at),
            format_ts(node.last_accessed_at),
            node.last_decayed_at.map(format_ts),
            node.access_count as i64,
            serde_json::to_string(&node.source)?,
            serde_json::to_string(&node.provenance)?,
            node.summary_level as i64,
            node.status.as_str(),
            node.superseded_by.as_ref().map(|id| id.to_string()),
            serde_json::to_string(&node.summary_basis)?,
        ],
    )?;
    Ok(())
}

/// 가변 필드만 갱신 (content/embedding은 불변)
fn update_node_row(conn: &Connection, node: &KnowledgeNode) -> KbResult<()> {
    let rows = conn.execute(
        "UPDATE nodes SET importance = ?2, last_accessed_at = ?3, last_decayed_at = ?4,
                access_count = ?5, provenance = ?6, status = ?7, superseded_by = ?8
         WHERE id = ?1",
        params![
            node.id.to_string(),
            node.importance as f64,
            format_ts(node.last_accessed_at),
            node.last_decayed_at.map(format_ts),
            node.access_count as i64,
            serde_json::to_string(&node.provenance)?,
            node.status.as_str(),
            node.superseded_by.as_ref().map(|id| id.to_string()),
        ],
    )?;
    if rows == 0 {
        return Err(KbError::invariant(format!("node {} missing from storage", node.id)));
    }
    Ok(())
}

struct RawNode {
    id: String,
    content: String,
    embedding: Vec<u8>,
    content_hash: String,
    importance: f64,
    created_at: String,
    last_accessed_at: String,
    last_decayed_at: Option<String>,
    access_count: i64,
    source: String,
    provenance: String,
    summary_level: i64,
    status: String,
    superseded_by: Option<String>,
    summary_basis: String,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            embedding: row.get(2)?,
            content_hash: row.get(3)?,
            importance: row.get(4)?,
            created_at: row.get(5)?,
            last_accessed_at: row.get(6)?,
            last_decayed_at: row.get(7)?,
            access_count: row.get(8)?,
            source: row.get(9)?,
            provenance: row.get(10)?,
            summary_level: row.get(11)?,
            status: row.get(12)?,
            superseded_by: row.get(13)?,
            summary_basis: row.get(14)?,
        })
    }

    fn into_node(self) -> KbResult<KnowledgeNode> {
        Ok(KnowledgeNode {
            id: self.id.parse()?,
            content: self.content,
            embedding: blob_to_embedding(&self.embedding),
            content_hash: self.content_hash,
            importance: self.importance as f32,
            created_at: parse_ts(&self.created_at)?,
            last_accessed_at: parse_ts(&self.last_accessed_at)?,
            last_decayed_at: parse_opt_ts(self.last_decayed_at)?,
            access_count: self.access_count.max(0) as u64,
            source: serde_json::from_str(&self.source)?,
            provenance: serde_json::from_str(&self.provenance)?,
            summary_level: self.summary_level.max(0) as u32,
            status: self.status.parse()?,
            superseded_by: self.superseded_by.map(|s| s.parse()).transpose()?,
            summary_basis: serde_json::from_str(&self.summary_basis)?,
        })
    }
}

fn load_nodes(conn: &Connection) -> KbResult<Vec<KnowledgeNode>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM nodes", NODE_COLUMNS))?;
    let raws = stmt
        .query_map([], RawNode::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawNode::into_node).collect()
}

fn insert_edge_row(conn: &Connection, edge: &Edge) -> KbResult<()> {
    conn.execute(
        "INSERT INTO edges (source_id, target_id, kind, weight, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            edge.source.to_string(),
            edge.target.to_string(),
            edge.kind.as_str(),
            edge.weight as f64,
            format_ts(edge.created_at),
        ],
    )?;
    Ok(())
}

fn update_edge_weight(conn: &Connection, edge: &Edge, weight: f32) -> KbResult<()> {
    conn.execute(
        "UPDATE edges SET weight = ?4 WHERE source_id = ?1 AND target_id = ?2 AND kind = ?3",
        params![
            edge.source.to_string(),
            edge.target.to_string(),
            edge.kind.as_str(),
            weight as f64,
        ],
    )?;
    Ok(())
}

fn load_edges(conn: &Connection) -> KbResult<Vec<Edge>> {
    let mut stmt =
        conn.prepare("SELECT source_id, target_id, kind, weight, created_at FROM edges")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(source, target, kind, weight, created_at)| -> KbResult<Edge> {
            Ok(Edge {
                source: source.parse()?,
                target: target.parse()?,
                kind: kind.parse()?,
                weight: weight as f32,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
