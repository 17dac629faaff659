//! 요약 계층 재구성 패스
//!
//! 레벨 1부터 위로 올라가며:
//! 1. 기존 요약의 현재 자식 집합을 계산해 비었으면 보관, fanout을 넘으면 분할,
//!    요약 당시와 많이 달라졌으면 재생성
//! 2. 부모 요약이 없는 하위 노드를 가장 가까운 요약에 붙이거나, 충분히 모이면 새 요약 생성
//!
//! 새 요약은 저장과 엣지 연결을 모두 마친 뒤에 기존 요약을 superseded로 표시합니다.
//! 자식 노드는 절대 삭제하거나 상태를 바꾸지 않습니다.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::MaintenanceConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::{KbError, KbResult};
use crate::knowledge::{
    cosine_similarity, Direction, Edge, EdgeKind, KnowledgeNode, KnowledgeStore, NodeFilter,
    NodeId, NodeStatus,
};

use super::PassReport;

/// 요약 본문 최대 길이 (문자)
const MAX_SUMMARY_CHARS: usize = 2000;

/// 자식 하나에서 가져올 문장 최대 길이 (문자)
const MAX_LINE_CHARS: usize = 200;

// ============================================================================
// Summarizer
// ============================================================================

/// 자식 노드 내용으로 요약문 생성 (외부 LLM 등)
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, texts: &[String]) -> Result<String>;

    fn name(&self) -> &str;
}

/// 자식마다 첫 문장을 뽑아 목록으로 묶는 추출 요약
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self
    }

    fn first_sentence(text: &str) -> String {
        let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        let end = line
            .char_indices()
            .find(|&(i, c)| matches!(c, '.' | '!' | '?') && line[i + c.len_utf8()..].starts_with(' '))
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(line.len());
        line[..end].chars().take(MAX_LINE_CHARS).collect()
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, texts: &[String]) -> Result<String> {
        let mut out = String::new();
        for text in texts {
            let sentence = Self::first_sentence(text);
            if sentence.is_empty() {
                continue;
            }
            let line = format!("- {}\n", sentence);
            if out.chars().count() + line.chars().count() > MAX_SUMMARY_CHARS {
                break;
            }
            out.push_str(&line);
        }
        if out.is_empty() {
            anyhow::bail!("nothing to summarize");
        }
        Ok(out.trim_end().to_string())
    }

    fn name(&self) -> &str {
        "extractive"
    }
}

// ============================================================================
// Rebalancer
// ============================================================================

/// 요약 하나에 대해 내린 결정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SummaryAction {
    Keep,
    Archived,
    Split,
    Regenerated,
}

pub(crate) struct Rebalancer<'a> {
    pub store: &'a KnowledgeStore,
    pub gateway: &'a EmbeddingGateway,
    pub summarizer: &'a dyn Summarizer,
    pub config: &'a MaintenanceConfig,
}

impl<'a> Rebalancer<'a> {
    pub async fn run(&self, shutdown: &watch::Receiver<bool>) -> KbResult<PassReport> {
        let mut report = PassReport::new("rebalance");
        let max_level = self.config.max_summary_level.max(1);

        'levels: for level in 1..=max_level {
            for summary in self.active_at(level)? {
                if *shutdown.borrow() {
                    report.cancelled = true;
                    break 'levels;
                }
                report.visited += 1;
                match self.rebalance_summary(&summary).await {
                    Ok(SummaryAction::Keep) => {}
                    Ok(action) => {
                        tracing::debug!("Summary {} (L{}): {:?}", summary.id, level, action);
                        report.changed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Rebalance failed for summary {}: {}", summary.id, e);
                        report.failed += 1;
                    }
                }
            }

            if *shutdown.borrow() {
                report.cancelled = true;
                break;
            }
            if let Err(e) = self.adopt_orphans(level, shutdown, &mut report).await {
                tracing::warn!("Orphan grouping failed at level {}: {}", level, e);
                report.failed += 1;
            }
            if report.cancelled {
                break;
            }
        }

        Ok(report)
    }

    fn active_at(&self, level: u32) -> KbResult<Vec<KnowledgeNode>> {
        self.store
            .list(&NodeFilter::any().with_level(level).with_status(NodeStatus::Active))
    }

    /// supersede를 따라간 현재 활성 자식들 (중복 제거)
    fn current_children(&self, summary: &KnowledgeNode) -> KbResult<Vec<KnowledgeNode>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for edge in self
            .store
            .edges(&summary.id, Some(EdgeKind::Summarizes), Direction::Outgoing)?
        {
            let Some(child) = self.store.resolve(&edge.target)? else {
                continue;
            };
            if child.is_active()
                && child.summary_level < summary.summary_level
                && seen.insert(child.id.clone())
            {
                out.push(child);
            }
        }
        Ok(out)
    }

    fn active_parents(&self, node: &NodeId) -> KbResult<Vec<KnowledgeNode>> {
        Ok(self
            .store
            .neighbors(node, Some(EdgeKind::Summarizes), Direction::Incoming)?
            .into_iter()
            .map(|n| n.node)
            .filter(KnowledgeNode::is_active)
            .collect())
    }

    async fn rebalance_summary(&self, summary: &KnowledgeNode) -> KbResult<SummaryAction> {
        let children = self.current_children(summary)?;

        if children.is_empty() {
            self.store.mark_status(&summary.id, NodeStatus::Archived)?;
            tracing::info!("Archived empty summary {}", summary.id);
            return Ok(SummaryAction::Archived);
        }

        if children.len() > self.config.fanout_limit.max(2) {
            self.split(summary, children).await?;
            return Ok(SummaryAction::Split);
        }

        if change_fraction(&summary.summary_basis, &children) >= self.config.rebalance_change_fraction {
            let parents = self.active_parents(&summary.id)?;
            let fresh = self.build_summary(summary.summary_level, &children).await?;
            self.link_parents(&parents, &fresh.id)?;
            self.store.mark_superseded(&summary.id, &fresh.id)?;
            tracing::info!(
                "Regenerated summary {} -> {} ({} children)",
                summary.id,
                fresh.id,
                children.len()
            );
            return Ok(SummaryAction::Regenerated);
        }

        Ok(SummaryAction::Keep)
    }

    /// 가장 먼 두 자식을 씨앗으로 두 그룹으로 나눔
    async fn split(&self, summary: &KnowledgeNode, children: Vec<KnowledgeNode>) -> KbResult<()> {
        let (left, right) = split_by_seeds(children);
        let parents = self.active_parents(&summary.id)?;

        let first = self.build_summary(summary.summary_level, &left).await?;
        let second = self.build_summary(summary.summary_level, &right).await?;
        self.link_parents(&parents, &first.id)?;
        self.link_parents(&parents, &second.id)?;
        self.store.mark_superseded(&summary.id, &first.id)?;

        tracing::info!(
            "Split summary {} into {} ({}) and {} ({})",
            summary.id,
            first.id,
            left.len(),
            second.id,
            right.len()
        );
        Ok(())
    }

    fn link_parents(&self, parents: &[KnowledgeNode], child: &NodeId) -> KbResult<()> {
        for parent in parents {
            self.store.add_edge(Edge::new(
                parent.id.clone(),
                child.clone(),
                EdgeKind::Summarizes,
                1.0,
            ))?;
        }
        Ok(())
    }

    /// 요약 노드 생성: 요약문 → 임베딩 → 저장 → 자식 엣지
    async fn build_summary(&self, level: u32, children: &[KnowledgeNode]) -> KbResult<KnowledgeNode> {
        let texts: Vec<String> = children.iter().map(|c| c.content.clone()).collect();
        let content =
            match tokio::time::timeout(self.gateway.timeout(), self.summarizer.summarize(&texts)).await {
                Ok(Ok(content)) => content,
                Ok(Err(e)) => return Err(KbError::transient("summarize", e.to_string())),
                Err(_) => {
                    return Err(KbError::transient(
                        "summarize",
                        format!("{} timed out after {:?}", self.summarizer.name(), self.gateway.timeout()),
                    ))
                }
            };
        if content.trim().is_empty() {
            return Err(KbError::Validation("summarizer returned empty text".into()));
        }
        let embedding = self.gateway.embed(&content).await?;

        let importance = children.iter().map(|c| c.importance).sum::<f32>() / children.len() as f32;
        let node = KnowledgeNode::summary(
            content,
            embedding,
            level,
            children.iter().map(|c| c.id.clone()).collect(),
            importance.clamp(0.0, 1.0),
        );
        self.store.put(node.clone())?;
        for child in children {
            self.store.add_edge(Edge::new(
                node.id.clone(),
                child.id.clone(),
                EdgeKind::Summarizes,
                1.0,
            ))?;
        }
        Ok(node)
    }

    /// 부모 요약이 없는 `level - 1` 노드 처리
    async fn adopt_orphans(
        &self,
        level: u32,
        shutdown: &watch::Receiver<bool>,
        report: &mut PassReport,
    ) -> KbResult<()> {
        let mut orphans = Vec::new();
        for node in self.active_at(level - 1)? {
            if self.active_parents(&node.id)?.is_empty() {
                orphans.push(node);
            }
        }
        if orphans.is_empty() {
            return Ok(());
        }

        let fanout = self.config.fanout_limit.max(2);
        let mut targets = Vec::new();
        for summary in self.active_at(level)? {
            let count = self.current_children(&summary)?.len();
            targets.push((summary, count));
        }

        // 기존 요약에 붙이기
        let mut remaining = Vec::new();
        for orphan in orphans {
            if *shutdown.borrow() {
                report.cancelled = true;
                return Ok(());
            }
            let best = targets
                .iter_mut()
                .filter(|(s, count)| *count < fanout && s.embedding.len() == orphan.embedding.len())
                .map(|(s, count)| (cosine_similarity(&s.embedding, &orphan.embedding), s, count))
                .filter(|(sim, _, _)| *sim >= self.config.attach_threshold)
                .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

            match best {
                Some((sim, summary, count)) => {
                    match self.store.add_edge(Edge::new(
                        summary.id.clone(),
                        orphan.id.clone(),
                        EdgeKind::Summarizes,
                        sim,
                    )) {
                        Ok(()) => {
                            *count += 1;
                            report.changed += 1;
                            tracing::debug!("Attached {} under summary {}", orphan.id, summary.id);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to attach {}: {}", orphan.id, e);
                            report.failed += 1;
                        }
                    }
                }
                None => remaining.push(orphan),
            }
        }

        // 남은 노드끼리 묶어서 새 요약
        let min_children = self.config.min_summary_children.max(2);
        for group in group_nodes(remaining, self.config.attach_threshold) {
            for chunk in group.chunks(fanout) {
                if chunk.len() < min_children {
                    continue;
                }
                if *shutdown.borrow() {
                    report.cancelled = true;
                    return Ok(());
                }
                match self.build_summary(level, chunk).await {
                    Ok(summary) => {
                        tracing::info!(
                            "Created L{} summary {} over {} nodes",
                            level,
                            summary.id,
                            chunk.len()
                        );
                        report.changed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to create L{} summary: {}", level, e);
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 요약 당시 자식 집합과 현재 자식 집합의 대칭차 비율
fn change_fraction(basis: &[NodeId], children: &[KnowledgeNode]) -> f32 {
    let basis: HashSet<&NodeId> = basis.iter().collect();
    let current: HashSet<&NodeId> = children.iter().map(|c| &c.id).collect();
    let changed = basis.symmetric_difference(&current).count();
    changed as f32 / basis.len().max(1) as f32
}

/// 가장 유사도가 낮은 두 노드를 씨앗으로 나머지를 가까운 쪽에 배정
fn split_by_seeds(children: Vec<KnowledgeNode>) -> (Vec<KnowledgeNode>, Vec<KnowledgeNode>) {
    let mut seeds = (0, 1);
    let mut lowest = f32::INFINITY;
    for i in 0..children.len() {
        for j in (i + 1)..children.len() {
            let sim = cosine_similarity(&children[i].embedding, &children[j].embedding);
            if sim < lowest {
                lowest = sim;
                seeds = (i, j);
            }
        }
    }

    let left_seed = children[seeds.0].embedding.clone();
    let right_seed = children[seeds.1].embedding.clone();
    let (mut left, mut right) = (Vec::new(), Vec::new());
    for (i, child) in children.into_iter().enumerate() {
        if i == seeds.0 {
            left.push(child);
        } else if i == seeds.1 {
            right.push(child);
        } else {
            let to_left = cosine_similarity(&child.embedding, &left_seed);
            let to_right = cosine_similarity(&child.embedding, &right_seed);
            if to_left > to_right || (to_left == to_right && left.len() <= right.len()) {
                left.push(child);
            } else {
                right.push(child);
            }
        }
    }
    (left, right)
}

/// 리더 군집화: 첫 멤버와의 유사도로 묶음 (입력 순서 유지)
fn group_nodes(nodes: Vec<KnowledgeNode>, threshold: f32) -> Vec<Vec<KnowledgeNode>> {
    let mut groups: Vec<Vec<KnowledgeNode>> = Vec::new();
    for node in nodes {
        let slot = groups.iter_mut().find(|g| {
            g[0].embedding.len() == node.embedding.len()
                && cosine_similarity(&g[0].embedding, &node.embedding) >= threshold
        });
        match slot {
            Some(group) => group.push(node),
            None => groups.push(vec![node]),
        }
    }
    groups
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::EmbeddingConfig;
    use crate::embedding::testing::ScriptedEmbedding;
    use crate::knowledge::{SourceRef, TeachingId};

    struct Fixture {
        store: KnowledgeStore,
        gateway: EmbeddingGateway,
        summarizer: ExtractiveSummarizer,
        config: MaintenanceConfig,
    }

    impl Fixture {
        fn new(config: MaintenanceConfig) -> Self {
            let embedder = Arc::new(ScriptedEmbedding::new(4));
            Self {
                store: KnowledgeStore::open_in_memory().unwrap(),
                gateway: EmbeddingGateway::new(embedder, &EmbeddingConfig::default()),
                summarizer: ExtractiveSummarizer::new(),
                config,
            }
        }

        fn rebalancer(&self) -> Rebalancer<'_> {
            Rebalancer {
                store: &self.store,
                gateway: &self.gateway,
                summarizer: &self.summarizer,
                config: &self.config,
            }
        }

        fn leaf(&self, text: &str, embedding: Vec<f32>) -> NodeId {
            let node = KnowledgeNode::leaf(text, embedding, SourceRef::teaching(TeachingId::new()), 0.5);
            self.store.put(node).unwrap()
        }

        async fn run(&self) -> PassReport {
            let (_tx, rx) = watch::channel(false);
            self.rebalancer().run(&rx).await.unwrap()
        }

        fn summaries(&self, level: u32) -> Vec<KnowledgeNode> {
            self.store
                .list(&NodeFilter::any().with_level(level).with_status(NodeStatus::Active))
                .unwrap()
        }
    }

    struct StalledSummarizer;

    #[async_trait]
    impl Summarizer for StalledSummarizer {
        async fn summarize(&self, _texts: &[String]) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_stalled_summarizer_times_out() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        let gateway = EmbeddingGateway::new(
            Arc::new(ScriptedEmbedding::new(4)),
            &EmbeddingConfig {
                timeout_ms: 20,
                ..EmbeddingConfig::default()
            },
        );
        let config = MaintenanceConfig::default();
        let rebalancer = Rebalancer {
            store: &store,
            gateway: &gateway,
            summarizer: &StalledSummarizer,
            config: &config,
        };
        let children: Vec<KnowledgeNode> = (0..3)
            .map(|i| {
                let node = KnowledgeNode::leaf(
                    format!("Check replica lag {}.", i),
                    vec![1.0, 0.0, 0.0, 0.1 * i as f32],
                    SourceRef::teaching(TeachingId::new()),
                    0.5,
                );
                store.put(node.clone()).unwrap();
                node
            })
            .collect();

        let result = tokio::time::timeout(Duration::from_secs(5), rebalancer.build_summary(1, &children))
            .await
            .unwrap();
        assert!(matches!(result, Err(KbError::TransientDependency { .. })));
        assert!(store.list(&NodeFilter::any().with_level(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extractive_summary_takes_first_sentences() {
        let s = ExtractiveSummarizer::new();
        let out = s
            .summarize(&[
                "Restart the pod. Then check logs.".to_string(),
                "\nScale the deployment to 3.".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(out, "- Restart the pod.\n- Scale the deployment to 3.");
        assert!(s.summarize(&[String::new()]).await.is_err());
    }

    #[tokio::test]
    async fn test_orphans_grouped_into_summary() {
        let fx = Fixture::new(MaintenanceConfig::default());
        let a = fx.leaf("Kafka lag alert fires.", vec![1.0, 0.1, 0.0, 0.0]);
        let b = fx.leaf("Kafka consumer restart fixes lag.", vec![1.0, 0.0, 0.1, 0.0]);
        let c = fx.leaf("Kafka partitions rebalance slowly.", vec![0.9, 0.1, 0.1, 0.0]);
        fx.leaf("DNS is unrelated.", vec![0.0, 0.0, 0.0, 1.0]);

        let report = fx.run().await;
        assert_eq!(report.failed, 0);

        let summaries = fx.summaries(1);
        assert_eq!(summaries.len(), 1);
        let children: HashSet<NodeId> = fx
            .store
            .edges(&summaries[0].id, Some(EdgeKind::Summarizes), Direction::Outgoing)
            .unwrap()
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(children, HashSet::from([a, b, c]));
        assert!(!fx.store.has_summarizes_cycle().unwrap());
    }

    #[tokio::test]
    async fn test_archived_children_trigger_regeneration_without_touching_children() {
        let fx = Fixture::new(MaintenanceConfig::default());
        let ids: Vec<NodeId> = (0..3)
            .map(|i| fx.leaf(&format!("Disk alert {}.", i), vec![1.0, 0.0, 0.05 * i as f32, 0.0]))
            .collect();
        fx.run().await;
        let original = fx.summaries(1).remove(0);

        fx.store.mark_status(&ids[0], NodeStatus::Archived).unwrap();
        let report = fx.run().await;
        assert!(report.changed >= 1);

        let old = fx.store.get(&original.id).unwrap().unwrap();
        assert_eq!(old.status, NodeStatus::Superseded);
        let fresh = fx.store.resolve(&original.id).unwrap().unwrap();
        assert_eq!(fresh.summary_basis.len(), 2);

        // 자식은 그대로 남음
        assert_eq!(fx.store.get(&ids[0]).unwrap().unwrap().status, NodeStatus::Archived);
        for id in &ids[1..] {
            assert!(fx.store.get(id).unwrap().unwrap().is_active());
        }
        assert!(!fx.store.has_summarizes_cycle().unwrap());
    }

    #[tokio::test]
    async fn test_overgrown_summary_is_split() {
        let fx = Fixture::new(MaintenanceConfig {
            fanout_limit: 4,
            attach_threshold: 0.99,
            ..MaintenanceConfig::default()
        });
        let mut children = Vec::new();
        for i in 0..3 {
            let offset = 0.01 * i as f32;
            let left = fx.leaf(&format!("Left {}.", i), vec![1.0, 0.0, offset, 0.0]);
            let right = fx.leaf(&format!("Right {}.", i), vec![0.0, 1.0, offset, 0.0]);
            children.push(fx.store.get(&left).unwrap().unwrap());
            children.push(fx.store.get(&right).unwrap().unwrap());
        }
        // 6개 자식을 가진 요약을 직접 구성
        let big = fx.rebalancer().build_summary(1, &children).await.unwrap();

        let report = fx.run().await;
        assert_eq!(report.failed, 0);

        let old = fx.store.get(&big.id).unwrap().unwrap();
        assert_eq!(old.status, NodeStatus::Superseded);
        let halves = fx.summaries(1);
        assert_eq!(halves.len(), 2);
        for half in &halves {
            assert_eq!(half.summary_basis.len(), 3);
        }
        for child in &children {
            assert!(fx.store.get(&child.id).unwrap().unwrap().is_active());
        }
        assert!(!fx.store.has_summarizes_cycle().unwrap());
    }

    #[tokio::test]
    async fn test_empty_summary_archived() {
        let fx = Fixture::new(MaintenanceConfig::default());
        let ids: Vec<NodeId> = (0..3)
            .map(|i| fx.leaf(&format!("Cert expiry {}.", i), vec![0.0, 1.0, 0.05 * i as f32, 0.0]))
            .collect();
        fx.run().await;
        let summary = fx.summaries(1).remove(0);
        for id in &ids {
            fx.store.mark_status(id, NodeStatus::Archived).unwrap();
        }

        fx.run().await;
        assert_eq!(fx.store.get(&summary.id).unwrap().unwrap().status, NodeStatus::Archived);
    }

    #[test]
    fn test_change_fraction() {
        let leaf = |e: f32| KnowledgeNode::leaf("x", vec![e, 1.0], SourceRef::synthesized(), 0.5);
        let (a, b, c) = (leaf(1.0), leaf(2.0), leaf(3.0));
        let basis = vec![a.id.clone(), b.id.clone()];
        assert_eq!(change_fraction(&basis, &[a.clone(), b.clone()]), 0.0);
        assert_eq!(change_fraction(&basis, &[a.clone(), b, c]), 0.5);
        assert_eq!(change_fraction(&basis, &[a]), 0.5);
    }
}
