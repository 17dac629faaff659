//! Knowledge Extractor - 티칭/문서 → 지식 노드
//!
//! 입력을 콘텐츠 종류별로 지식 단위로 나눈 뒤, 단위마다
//! 1. 정규화 해시가 같은 활성 리프가 있으면 임베딩 없이 병합
//! 2. 임베딩 후 활성 리프 top-k와 비교, τ_dup 이상이면 병합
//! 3. 아니면 새 리프 생성 + relates-to 엣지 연결 + 열린 공백 리포트 해소
//!
//! 병합은 출처 단위로 멱등이므로, 커밋 전에 크래시한 티칭을 다시 처리해도
//! 노드가 늘어나지 않습니다.

mod segment;

pub use segment::{SegmentLimits, Segmenter};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::config::ExtractorConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::{KbError, KbResult};
use crate::knowledge::{
    content_hash, Edge, EdgeKind, GapId, KnowledgeNode, KnowledgeStore, MergeOutcome, NodeFilter,
    NodeId, ScoredNode, SourceKind, SourceRef, Teaching, TeachingId,
};
use crate::maintenance::GapLog;
use crate::teaching::{TeachingClaim, TeachingOutcome, TeachingQueue};

// ============================================================================
// Content kinds
// ============================================================================

/// 입력 콘텐츠 종류 (분할 전략 선택)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentKind {
    Teaching,
    ChatTranscript,
    WikiPage,
    CodeSnippet,
    PlainText,
}

impl ContentKind {
    pub fn segmenter(&self) -> Segmenter {
        match self {
            ContentKind::Teaching | ContentKind::PlainText => Segmenter::Paragraph,
            ContentKind::ChatTranscript => Segmenter::Transcript,
            ContentKind::WikiPage => Segmenter::Markdown,
            ContentKind::CodeSnippet => Segmenter::Code,
        }
    }

    /// 이 종류의 기본 출처 종류
    pub fn source_kind(&self) -> SourceKind {
        match self {
            ContentKind::Teaching => SourceKind::Teaching,
            ContentKind::ChatTranscript => SourceKind::Chat,
            ContentKind::WikiPage => SourceKind::Wiki,
            ContentKind::CodeSnippet => SourceKind::Repository,
            ContentKind::PlainText => SourceKind::Document,
        }
    }
}

/// 추출기 입력 문서 (이미 평문으로 변환된 상태)
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub text: String,
    pub kind: ContentKind,
    pub source: SourceRef,
    pub received_at: DateTime<Utc>,
}

impl SourceDocument {
    /// 커넥터 문서
    pub fn new(
        text: impl Into<String>,
        kind: ContentKind,
        connector: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            kind,
            source: SourceRef::document(kind.source_kind(), connector, document_id),
            received_at: Utc::now(),
        }
    }

    /// 티칭 → 문서
    pub fn from_teaching(teaching: &Teaching) -> Self {
        Self {
            text: teaching.raw_text.clone(),
            kind: ContentKind::Teaching,
            source: SourceRef::teaching(teaching.id.clone()),
            received_at: teaching.received_at,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

/// 문서 하나의 추출 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    pub units: usize,
    pub created: Vec<NodeId>,
    pub merged: Vec<NodeId>,
    /// 같은 출처로 이미 병합된 단위 (재처리)
    pub already_recorded: Vec<NodeId>,
    /// 병합 직전에 비활성화되어 건너뛴 후보
    pub skipped_inactive: Vec<NodeId>,
    pub edges_added: usize,
    pub resolved_gaps: Vec<GapId>,
}

impl ExtractionReport {
    fn absorb(&mut self, other: ExtractionReport) {
        self.created.extend(other.created);
        self.merged.extend(other.merged);
        self.already_recorded.extend(other.already_recorded);
        self.skipped_inactive.extend(other.skipped_inactive);
        self.edges_added += other.edges_added;
        self.resolved_gaps.extend(other.resolved_gaps);
    }
}

/// 워커 배치 결과
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerReport {
    pub processed: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl WorkerReport {
    pub fn total(&self) -> usize {
        self.processed + self.rejected + self.failed
    }
}

// ============================================================================
// KnowledgeExtractor
// ============================================================================

/// 지식 추출기
pub struct KnowledgeExtractor {
    store: Arc<KnowledgeStore>,
    gateway: EmbeddingGateway,
    gaps: GapLog,
    config: ExtractorConfig,
    gap_resolve_threshold: f32,
    max_attempts: u32,
    /// 중복 검사 ~ 노드 생성 구간 직렬화 (동시 추출 간 중복 생성 방지)
    dedup_guard: Mutex<()>,
}

impl KnowledgeExtractor {
    pub fn new(
        store: Arc<KnowledgeStore>,
        gateway: EmbeddingGateway,
        gaps: GapLog,
        config: ExtractorConfig,
        gap_resolve_threshold: f32,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            gaps,
            config,
            gap_resolve_threshold,
            max_attempts,
            dedup_guard: Mutex::new(()),
        }
    }

    fn limits(&self) -> SegmentLimits {
        SegmentLimits {
            min_chars: self.config.min_unit_chars,
            max_chars: self.config.max_unit_chars,
        }
    }

    /// 문서를 지식 단위로 분할
    pub fn segment(&self, document: &SourceDocument) -> KbResult<Vec<String>> {
        if document.text.trim().is_empty() {
            return Err(KbError::Validation("document text is empty".into()));
        }
        let chars = document.text.chars().count();
        if chars > self.config.max_input_chars {
            return Err(KbError::Validation(format!(
                "document has {} characters (limit {})",
                chars, self.config.max_input_chars
            )));
        }

        let mut seen = HashSet::new();
        let units: Vec<String> = document
            .kind
            .segmenter()
            .segment(&document.text, self.limits())
            .into_iter()
            .filter(|u| seen.insert(content_hash(u)))
            .collect();

        if units.is_empty() {
            return Err(KbError::Validation("no extractable knowledge unit".into()));
        }
        Ok(units)
    }

    /// 문서 추출
    ///
    /// 입력 검증 실패는 `Validation`, 임베딩 장애는 `TransientDependency`로 반환합니다.
    /// 일시 장애로 중단되면 이미 처리된 단위는 남고, 재시도 시 병합으로 흡수됩니다.
    pub async fn ingest_document(&self, document: &SourceDocument) -> KbResult<ExtractionReport> {
        let units = self.segment(document)?;
        let importance = self.config.initial_importance(document.source.class());

        let mut report = ExtractionReport {
            units: units.len(),
            ..Default::default()
        };
        for unit in &units {
            let unit_report = self.ingest_unit(unit, &document.source, importance).await?;
            report.absorb(unit_report);
        }

        tracing::info!(
            "Extracted {} units from {} ({} created, {} merged, {} already recorded)",
            report.units,
            document.source.connector,
            report.created.len(),
            report.merged.len(),
            report.already_recorded.len()
        );
        Ok(report)
    }

    async fn ingest_unit(
        &self,
        unit: &str,
        source: &SourceRef,
        importance: f32,
    ) -> KbResult<ExtractionReport> {
        let hash = content_hash(unit);
        let mut skipped = Vec::new();

        // 정확 중복: 임베딩 호출 없이 병합
        {
            let _guard = self.dedup_guard.lock().await;
            if let Some(report) = self.merge_exact(&hash, source, &mut skipped)? {
                return Ok(report);
            }
        }

        let embedding = self.gateway.embed(unit).await?;

        let _guard = self.dedup_guard.lock().await;
        if let Some(report) = self.merge_exact(&hash, source, &mut skipped)? {
            return Ok(report);
        }

        let candidates = self.store.find_similar(
            &embedding,
            self.config.candidate_k,
            &NodeFilter::active_leaves(),
        )?;
        if let Some(report) = self.merge_near_duplicate(&candidates, source, &mut skipped)? {
            return Ok(report);
        }

        let node = KnowledgeNode::leaf(unit, embedding.clone(), source.clone(), importance);
        let id = self.store.put(node)?;
        let mut report = ExtractionReport {
            created: vec![id.clone()],
            ..Default::default()
        };

        for candidate in candidates
            .iter()
            .filter(|c| c.similarity >= self.config.relate_threshold)
            .filter(|c| !skipped.contains(&c.node.id))
        {
            let edge = Edge::new(
                id.clone(),
                candidate.node.id.clone(),
                EdgeKind::RelatesTo,
                candidate.similarity,
            );
            match self.store.add_edge(edge) {
                Ok(()) => report.edges_added += 1,
                Err(e) => tracing::warn!("Failed to link {} -> {}: {}", id, candidate.node.id, e),
            }
        }

        // 공백 해소 실패는 추출 결과에 영향 없음
        match self
            .gaps
            .resolve_matching(&embedding, &id, self.gap_resolve_threshold)
        {
            Ok(resolved) => report.resolved_gaps = resolved,
            Err(e) => tracing::warn!("Gap resolution check failed for {}: {}", id, e),
        }

        report.skipped_inactive = skipped;
        Ok(report)
    }

    fn merge_exact(
        &self,
        hash: &str,
        source: &SourceRef,
        skipped: &mut Vec<NodeId>,
    ) -> KbResult<Option<ExtractionReport>> {
        let Some(existing) = self.store.find_by_hash(hash, &NodeFilter::active_leaves())? else {
            return Ok(None);
        };
        self.merge_into(existing.id, source, skipped)
    }

    /// τ_dup 이상 후보 중 아직 활성인 첫 노드로 병합
    ///
    /// 후보가 모두 병합 직전에 보관되었다면 `None`을 반환하고, 호출자는 새 리프를 만듭니다.
    fn merge_near_duplicate(
        &self,
        candidates: &[ScoredNode],
        source: &SourceRef,
        skipped: &mut Vec<NodeId>,
    ) -> KbResult<Option<ExtractionReport>> {
        for best in candidates
            .iter()
            .take_while(|c| c.similarity >= self.config.duplicate_threshold)
        {
            tracing::debug!(
                "Unit is a near-duplicate of {} (similarity {:.3})",
                best.node.id,
                best.similarity
            );
            if let Some(report) = self.merge_into(best.node.id.clone(), source, skipped)? {
                return Ok(Some(report));
            }
        }
        Ok(None)
    }

    fn merge_into(
        &self,
        id: NodeId,
        source: &SourceRef,
        skipped: &mut Vec<NodeId>,
    ) -> KbResult<Option<ExtractionReport>> {
        let mut report = ExtractionReport::default();
        match self.store.merge_provenance(&id, source, self.config.merge_boost)? {
            Some(MergeOutcome::Reinforced { .. }) => report.merged.push(id),
            Some(MergeOutcome::AlreadyRecorded) => report.already_recorded.push(id),
            Some(MergeOutcome::Inactive) | None => {
                tracing::debug!("Merge target {} is no longer active, skipping", id);
                skipped.push(id);
                return Ok(None);
            }
        }
        report.skipped_inactive = std::mem::take(skipped);
        Ok(Some(report))
    }

    // ------------------------------------------------------------------
    // Teaching queue
    // ------------------------------------------------------------------

    /// 클레임한 티칭 처리 + 커밋
    ///
    /// 검증 실패는 `rejected`로 커밋합니다. 일시 장애는 리스를 바로 반환해 다음 폴링에서 재시도하고,
    /// 그 외 실패는 리스가 만료될 때까지 claim 상태로 두어 다른 티칭이 먼저 처리되게 합니다.
    pub async fn process_claim(
        &self,
        queue: &TeachingQueue,
        claim: &TeachingClaim,
    ) -> KbResult<TeachingOutcome> {
        let document = SourceDocument::from_teaching(&claim.teaching);

        match self.ingest_document(&document).await {
            Ok(_) => {
                queue.complete(claim, TeachingOutcome::Processed)?;
                Ok(TeachingOutcome::Processed)
            }
            Err(KbError::Validation(reason)) => {
                let outcome = TeachingOutcome::Rejected(reason);
                queue.complete(claim, outcome.clone())?;
                Ok(outcome)
            }
            Err(e) => {
                if claim.teaching.attempts >= self.max_attempts {
                    tracing::warn!(
                        "Teaching {} failed {} times, leaving pending: {}",
                        claim.id(),
                        claim.teaching.attempts,
                        e
                    );
                }
                if e.is_retryable() {
                    if let Err(release_err) = queue.release(claim) {
                        tracing::warn!("Failed to release teaching {}: {}", claim.id(), release_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// pending 티칭을 최대 `limit`개까지 처리
    pub async fn process_pending(
        &self,
        queue: &TeachingQueue,
        worker: &str,
        limit: usize,
    ) -> KbResult<WorkerReport> {
        self.drain(queue, worker, limit, None).await
    }

    async fn drain(
        &self,
        queue: &TeachingQueue,
        worker: &str,
        limit: usize,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> KbResult<WorkerReport> {
        let mut report = WorkerReport::default();
        let mut claimed: HashSet<TeachingId> = HashSet::new();

        while report.total() < limit {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                break;
            }
            let Some(claim) = queue.claim(worker)? else {
                break;
            };
            // 한 배치에서 같은 티칭은 한 번만
            if !claimed.insert(claim.id().clone()) {
                if let Err(e) = queue.release(&claim) {
                    tracing::warn!("Failed to release teaching {}: {}", claim.id(), e);
                }
                break;
            }
            match self.process_claim(queue, &claim).await {
                Ok(TeachingOutcome::Processed) => report.processed += 1,
                Ok(TeachingOutcome::Rejected(_)) => report.rejected += 1,
                Err(e) => {
                    tracing::warn!("Teaching {} not processed: {}", claim.id(), e);
                    report.failed += 1;
                    // 일시 장애는 배치를 멈추고 다음 폴링에서 재시도
                    if e.is_retryable() {
                        break;
                    }
                }
            }
        }

        if report.total() > 0 {
            tracing::info!(
                "Worker {}: {} processed, {} rejected, {} failed",
                worker,
                report.processed,
                report.rejected,
                report.failed
            );
        }
        Ok(report)
    }

    /// 큐 폴링 루프 (shutdown 신호까지)
    pub async fn run_worker(
        &self,
        queue: TeachingQueue,
        worker: String,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("Extraction worker {} started", worker);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.drain(&queue, &worker, usize::MAX, Some(&shutdown)).await {
                tracing::warn!("Extraction worker {} error: {}", worker, e);
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Extraction worker {} stopped", worker);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, KbConfig};
    use crate::embedding::testing::ScriptedEmbedding;
    use crate::knowledge::{Direction, GapEvidence, GapReport, GapStatus, NodeStatus, TeachingStatus};

    struct Fixture {
        store: Arc<KnowledgeStore>,
        queue: TeachingQueue,
        gaps: GapLog,
        embedder: Arc<ScriptedEmbedding>,
        extractor: KnowledgeExtractor,
    }

    fn fixture() -> Fixture {
        let config = KbConfig::default();
        let store = Arc::new(KnowledgeStore::open_in_memory().unwrap());
        let db = store.database().clone();
        let queue = TeachingQueue::new(db.clone(), Duration::from_secs(60));
        let gaps = GapLog::new(db);
        let embedder = Arc::new(ScriptedEmbedding::new(3));
        let gateway = EmbeddingGateway::new(
            embedder.clone(),
            &EmbeddingConfig {
                initial_backoff_ms: 1,
                max_attempts: 2,
                ..Default::default()
            },
        );
        let extractor = KnowledgeExtractor::new(
            store.clone(),
            gateway,
            gaps.clone(),
            config.extractor.clone(),
            config.gaps.cluster_threshold,
            3,
        );
        Fixture {
            store,
            queue,
            gaps,
            embedder,
            extractor,
        }
    }

    fn leaf_count(store: &KnowledgeStore) -> usize {
        store.list(&NodeFilter::active_leaves()).unwrap().len()
    }

    #[tokio::test]
    async fn test_identical_teaching_twice_creates_one_node() {
        let fx = fixture();
        fx.queue.submit("Restart pod X via kubectl", "alice").unwrap();
        fx.queue.submit("Restart pod X via kubectl", "bob").unwrap();

        let report = fx.extractor.process_pending(&fx.queue, "w", 10).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(leaf_count(&fx.store), 1);

        let node = &fx.store.list(&NodeFilter::active_leaves()).unwrap()[0];
        assert_eq!(node.provenance.len(), 1);
        assert!((node.importance - 0.7).abs() < 1e-5);
        // 두 번째는 해시 경로로 병합되어 임베딩 호출이 한 번뿐
        assert_eq!(fx.embedder.calls(), 1);
    }

    #[tokio::test]
    async fn test_near_duplicate_teachings_merge() {
        let fx = fixture();
        fx.embedder.script("Restart pod X via kubectl", vec![1.0, 0.0, 0.0]);
        fx.embedder.script("Restart pod X using kubectl", vec![0.98, 0.1, 0.0]);

        fx.queue.submit("Restart pod X via kubectl", "alice").unwrap();
        fx.queue.submit("Restart pod X using kubectl", "bob").unwrap();
        fx.extractor.process_pending(&fx.queue, "w", 10).await.unwrap();

        let leaves = fx.store.list(&NodeFilter::active_leaves()).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].content, "Restart pod X via kubectl");
        assert!((leaves[0].importance - 0.7).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_reprocessing_same_teaching_is_idempotent() {
        let fx = fixture();
        let id = fx.queue.submit("Failover the primary with patronictl", "alice").unwrap();
        let teaching = fx.queue.get(&id).unwrap().unwrap();
        let document = SourceDocument::from_teaching(&teaching);

        // 커밋 전 크래시를 가정하고 같은 티칭을 두 번 추출
        let first = fx.extractor.ingest_document(&document).await.unwrap();
        let second = fx.extractor.ingest_document(&document).await.unwrap();

        assert_eq!(first.created.len(), 1);
        assert!(second.created.is_empty());
        assert_eq!(second.already_recorded, first.created);
        let node = fx.store.get(&first.created[0]).unwrap().unwrap();
        assert!((node.importance - 0.6).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_related_units_get_edges() {
        let fx = fixture();
        fx.embedder.script("Payments API runs on cluster A", vec![1.0, 0.0, 0.0]);
        fx.embedder.script("Payments API logs live in Loki", vec![0.8, 0.6, 0.0]);

        let doc_a = SourceDocument::new("Payments API runs on cluster A", ContentKind::WikiPage, "confluence", "p1");
        let doc_b = SourceDocument::new("Payments API logs live in Loki", ContentKind::WikiPage, "confluence", "p2");
        let a = fx.extractor.ingest_document(&doc_a).await.unwrap();
        let b = fx.extractor.ingest_document(&doc_b).await.unwrap();

        assert_eq!(b.edges_added, 1);
        let neighbors = fx
            .store
            .neighbors(&b.created[0], Some(EdgeKind::RelatesTo), Direction::Outgoing)
            .unwrap();
        assert_eq!(neighbors[0].node.id, a.created[0]);
        assert!((neighbors[0].edge.weight - 0.8).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_empty_teaching_rejected() {
        let fx = fixture();
        let id = fx.queue.submit("ok", "alice").unwrap();
        let report = fx.extractor.process_pending(&fx.queue, "w", 10).await.unwrap();

        assert_eq!(report.rejected, 1);
        let teaching = fx.queue.get(&id).unwrap().unwrap();
        assert_eq!(teaching.status, TeachingStatus::Rejected);
        assert_eq!(leaf_count(&fx.store), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_teaching_pending() {
        let fx = fixture();
        let id = fx.queue.submit("Rotate vault credentials monthly", "alice").unwrap();
        fx.embedder.fail_next(2);

        let report = fx.extractor.process_pending(&fx.queue, "w", 10).await.unwrap();
        assert_eq!(report.failed, 1);
        let teaching = fx.queue.get(&id).unwrap().unwrap();
        assert_eq!(teaching.status, TeachingStatus::Pending);

        // 장애 해소 후 재처리
        let report = fx.extractor.process_pending(&fx.queue, "w", 10).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(leaf_count(&fx.store), 1);
    }

    #[tokio::test]
    async fn test_new_leaf_resolves_matching_gap() {
        let fx = fixture();
        fx.embedder.script("Kafka consumer lag runbook step", vec![0.0, 0.0, 1.0]);
        let gap = GapReport {
            id: GapId::new(),
            topic_descriptor: "kafka lag".into(),
            detected_at: Utc::now(),
            evidence: vec![GapEvidence {
                query: "kafka lag".into(),
                top_score: 0.1,
                recorded_at: Utc::now(),
            }],
            centroid: vec![0.0, 0.1, 1.0],
            status: GapStatus::Open,
            resolved_at: None,
            resolved_by: None,
        };
        fx.gaps.insert(&gap).unwrap();

        let doc = SourceDocument::new("Kafka consumer lag runbook step", ContentKind::PlainText, "drive", "doc-1");
        let report = fx.extractor.ingest_document(&doc).await.unwrap();

        assert_eq!(report.resolved_gaps, vec![gap.id.clone()]);
        let stored = fx.gaps.get(&gap.id).unwrap().unwrap();
        assert_eq!(stored.status, GapStatus::Resolved);
        assert_eq!(stored.resolved_by, Some(report.created[0].clone()));
    }

    #[tokio::test]
    async fn test_archived_duplicate_does_not_absorb() {
        let fx = fixture();
        let doc = SourceDocument::new("Drain node before kernel patching", ContentKind::PlainText, "drive", "d1");
        let first = fx.extractor.ingest_document(&doc).await.unwrap();
        fx.store.mark_status(&first.created[0], NodeStatus::Archived).unwrap();

        let doc2 = SourceDocument::new("Drain node before kernel patching", ContentKind::PlainText, "drive", "d2");
        let second = fx.extractor.ingest_document(&doc2).await.unwrap();
        assert_eq!(second.created.len(), 1);
        assert_ne!(second.created[0], first.created[0]);
    }

    #[tokio::test]
    async fn test_failing_teaching_does_not_block_queue() {
        let fx = fixture();
        // 3차원 프로바이더가 2차원 벡터를 돌려주면 InvariantViolation
        fx.embedder.script("Broken vector teaching text", vec![1.0, 0.0]);
        let bad = fx.queue.submit("Broken vector teaching text", "alice").unwrap();
        let good = fx.queue.submit("Scale the ingress deployment to 4 replicas", "bob").unwrap();

        let report = fx.extractor.process_pending(&fx.queue, "w", 50).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);

        let bad = fx.queue.get(&bad).unwrap().unwrap();
        assert_eq!(bad.status, TeachingStatus::Pending);
        assert_eq!(bad.attempts, 1);
        let good = fx.queue.get(&good).unwrap().unwrap();
        assert_eq!(good.status, TeachingStatus::Processed);

        // 실패한 티칭은 리스 만료 전까지 다시 클레임되지 않음
        let again = fx.extractor.process_pending(&fx.queue, "w", 50).await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_with_failing_teaching_queued() {
        let fx = fixture();
        fx.embedder.script("Broken vector teaching text", vec![1.0, 0.0]);
        fx.queue.submit("Broken vector teaching text", "alice").unwrap();

        let extractor = Arc::new(fx.extractor);
        let (tx, rx) = watch::channel(false);
        let handle = {
            let extractor = extractor.clone();
            let queue = fx.queue.clone();
            tokio::spawn(async move {
                extractor
                    .run_worker(queue, "w".into(), Duration::from_millis(10), rx)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_candidate_archived_before_merge_is_skipped() {
        let fx = fixture();
        fx.embedder.script("Flush the CDN cache after deploy", vec![1.0, 0.0, 0.0]);
        let doc = SourceDocument::new("Flush the CDN cache after deploy", ContentKind::PlainText, "drive", "d1");
        let first = fx.extractor.ingest_document(&doc).await.unwrap();
        let id = first.created[0].clone();

        let candidates = fx
            .store
            .find_similar(&[1.0, 0.0, 0.0], 5, &NodeFilter::active_leaves())
            .unwrap();
        // 후보 조회와 병합 사이에 감쇠 패스가 보관한 상황
        fx.store.mark_status(&id, NodeStatus::Archived).unwrap();

        let source = SourceRef::document(SourceKind::Document, "drive", "d2");
        let mut skipped = Vec::new();
        let merged = fx
            .extractor
            .merge_near_duplicate(&candidates, &source, &mut skipped)
            .unwrap();
        assert!(merged.is_none());
        assert_eq!(skipped, vec![id.clone()]);
        assert!(fx.store.get(&id).unwrap().unwrap().provenance.is_empty());
    }

    #[test]
    fn test_oversized_document_rejected() {
        let fx = fixture();
        let text = "a".repeat(KbConfig::default().extractor.max_input_chars + 1);
        let doc = SourceDocument::new(text, ContentKind::PlainText, "drive", "big");
        assert!(matches!(fx.extractor.segment(&doc), Err(KbError::Validation(_))));
    }
}
