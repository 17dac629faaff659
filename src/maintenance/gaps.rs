//! 지식 공백 탐지
//!
//! 최근 검색 로그에서 저신뢰 쿼리를 임베딩 유사도로 군집화하고,
//! 같은 주제가 반복되면 `GapReport`를 만듭니다. 그래프는 변경하지 않습니다.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::watch;

use crate::config::GapConfig;
use crate::error::KbResult;
use crate::knowledge::{
    blob_to_embedding, centroid, cosine_similarity, embedding_to_blob, format_ts, parse_opt_ts,
    parse_ts, Database, GapEvidence, GapId, GapReport, GapStatus, NodeId, RetrievalLogEntry,
};
use crate::retrieval::RetrievalLog;

use super::PassReport;

// ============================================================================
// GapLog
// ============================================================================

/// 공백 리포트 저장소
#[derive(Clone)]
pub struct GapLog {
    db: Database,
}

impl GapLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, report: &GapReport) -> KbResult<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO gap_reports (id, topic, detected_at, evidence, centroid, status, resolved_at, resolved_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    report.id.to_string(),
                    report.topic_descriptor,
                    format_ts(report.detected_at),
                    serde_json::to_string(&report.evidence)?,
                    embedding_to_blob(&report.centroid),
                    report.status.as_str(),
                    report.resolved_at.map(format_ts),
                    report.resolved_by.as_ref().map(|id| id.to_string()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &GapId) -> KbResult<Option<GapReport>> {
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM gap_reports WHERE id = ?1", GAP_COLUMNS),
                    params![id.to_string()],
                    RawGap::from_row,
                )
                .optional()?;
            raw.map(RawGap::into_report).transpose()
        })
    }

    /// 상태별 목록 (최신순)
    pub fn list(&self, status: Option<GapStatus>) -> KbResult<Vec<GapReport>> {
        self.db.with_conn(|conn| load_gaps(conn, status))
    }

    /// 공백 리포트를 수동으로 해소
    pub fn resolve(&self, id: &GapId, resolved_by: Option<&NodeId>) -> KbResult<bool> {
        let resolved = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE gap_reports SET status = 'resolved', resolved_at = ?2, resolved_by = ?3
                 WHERE id = ?1 AND status = 'open'",
                params![
                    id.to_string(),
                    format_ts(Utc::now()),
                    resolved_by.map(|n| n.to_string())
                ],
            )? == 1)
        })?;
        if resolved {
            tracing::info!("Gap {} resolved", id);
        }
        Ok(resolved)
    }

    /// 새 노드와 중심이 가까운 열린 공백을 해소
    pub fn resolve_matching(
        &self,
        embedding: &[f32],
        node: &NodeId,
        threshold: f32,
    ) -> KbResult<Vec<GapId>> {
        let mut resolved = Vec::new();
        for gap in self.list(Some(GapStatus::Open))? {
            if cosine_similarity(embedding, &gap.centroid) >= threshold && self.resolve(&gap.id, Some(node))? {
                tracing::info!("Gap '{}' closed by node {}", gap.topic_descriptor, node);
                resolved.push(gap.id);
            }
        }
        Ok(resolved)
    }
}

const GAP_COLUMNS: &str =
    "id, topic, detected_at, evidence, centroid, status, resolved_at, resolved_by";

struct RawGap {
    id: String,
    topic: String,
    detected_at: String,
    evidence: String,
    centroid: Vec<u8>,
    status: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
}

impl RawGap {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            detected_at: row.get(2)?,
            evidence: row.get(3)?,
            centroid: row.get(4)?,
            status: row.get(5)?,
            resolved_at: row.get(6)?,
            resolved_by: row.get(7)?,
        })
    }

    fn into_report(self) -> KbResult<GapReport> {
        Ok(GapReport {
            id: self.id.parse()?,
            topic_descriptor: self.topic,
            detected_at: parse_ts(&self.detected_at)?,
            evidence: serde_json::from_str(&self.evidence)?,
            centroid: blob_to_embedding(&self.centroid),
            status: self.status.parse()?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
            resolved_by: self.resolved_by.map(|s| s.parse()).transpose()?,
        })
    }
}

fn load_gaps(conn: &Connection, status: Option<GapStatus>) -> KbResult<Vec<GapReport>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM gap_reports WHERE (?1 IS NULL OR status = ?1) ORDER BY detected_at DESC",
        GAP_COLUMNS
    ))?;
    let raws = stmt
        .query_map(params![status.map(|s| s.as_str())], RawGap::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawGap::into_report).collect()
}

// ============================================================================
// Detection
// ============================================================================

/// 저신뢰 쿼리 군집
struct QueryCluster<'a> {
    members: Vec<&'a RetrievalLogEntry>,
    centroid: Vec<f32>,
}

impl<'a> QueryCluster<'a> {
    fn new(entry: &'a RetrievalLogEntry) -> Self {
        Self {
            members: vec![entry],
            centroid: entry.embedding.clone(),
        }
    }

    fn push(&mut self, entry: &'a RetrievalLogEntry) {
        self.members.push(entry);
        let vectors: Vec<&[f32]> = self.members.iter().map(|m| m.embedding.as_slice()).collect();
        self.centroid = centroid(&vectors);
    }

    /// 가장 자주 나온 쿼리 문자열 (동률이면 먼저 나온 것)
    fn topic(&self) -> String {
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (i, m) in self.members.iter().enumerate() {
            let entry = counts.entry(m.query.as_str()).or_insert((0, i));
            entry.0 += 1;
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.1 .1.cmp(&a.1 .1)))
            .map(|(q, _)| q.to_string())
            .unwrap_or_default()
    }
}

/// 저신뢰 쿼리 리더 군집화 (입력 순서 유지)
fn cluster_queries(entries: &[RetrievalLogEntry], threshold: f32) -> Vec<QueryCluster<'_>> {
    let mut clusters: Vec<QueryCluster<'_>> = Vec::new();
    for entry in entries {
        let best = clusters
            .iter_mut()
            .map(|c| (cosine_similarity(&c.centroid, &entry.embedding), c))
            .filter(|(sim, _)| *sim >= threshold)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        match best {
            Some((_, cluster)) => cluster.push(entry),
            None => clusters.push(QueryCluster::new(entry)),
        }
    }
    clusters
}

/// 공백 탐지 패스
pub(crate) fn detect_gaps(
    log: &RetrievalLog,
    gaps: &GapLog,
    config: &GapConfig,
    now: DateTime<Utc>,
    shutdown: &watch::Receiver<bool>,
) -> KbResult<(PassReport, Vec<GapReport>)> {
    let mut report = PassReport::new("gaps");
    let since = now - chrono::Duration::days(config.window_days.max(1));

    let entries = log.low_confidence_since(since, config.confidence_floor)?;
    let open = gaps.list(Some(GapStatus::Open))?;
    let resolved = gaps.list(Some(GapStatus::Resolved))?;
    let mut created = Vec::new();

    for cluster in cluster_queries(&entries, config.cluster_threshold) {
        if *shutdown.borrow() {
            report.cancelled = true;
            break;
        }
        report.visited += 1;

        if open
            .iter()
            .chain(created.iter())
            .any(|g: &GapReport| cosine_similarity(&g.centroid, &cluster.centroid) >= config.cluster_threshold)
        {
            continue;
        }

        // 이미 해소된 주제는 해소 이후의 근거만 센다
        let resolved_cutoff = resolved
            .iter()
            .filter(|g| cosine_similarity(&g.centroid, &cluster.centroid) >= config.cluster_threshold)
            .filter_map(|g| g.resolved_at)
            .max();
        let evidence: Vec<GapEvidence> = cluster
            .members
            .iter()
            .filter(|m| resolved_cutoff.map_or(true, |cutoff| m.recorded_at > cutoff))
            .map(|m| GapEvidence {
                query: m.query.clone(),
                top_score: m.top_score,
                recorded_at: m.recorded_at,
            })
            .collect();
        if evidence.len() < config.min_occurrences.max(1) {
            continue;
        }

        let gap = GapReport {
            id: GapId::new(),
            topic_descriptor: cluster.topic(),
            detected_at: now,
            evidence,
            centroid: cluster.centroid.clone(),
            status: GapStatus::Open,
            resolved_at: None,
            resolved_by: None,
        };
        match gaps.insert(&gap) {
            Ok(()) => {
                tracing::info!(
                    "Knowledge gap detected: '{}' ({} low-confidence queries)",
                    gap.topic_descriptor,
                    gap.evidence.len()
                );
                report.changed += 1;
                created.push(gap);
            }
            Err(e) => {
                tracing::warn!("Failed to store gap report: {}", e);
                report.failed += 1;
            }
        }
    }

    // 기간 밖 로그는 더 이상 근거가 되지 않음
    if !report.cancelled {
        if let Err(e) = log.prune_before(since) {
            tracing::warn!("Failed to prune retrieval log: {}", e);
        }
    }

    Ok((report, created))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (RetrievalLog, GapLog, watch::Sender<bool>, watch::Receiver<bool>) {
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = watch::channel(false);
        (RetrievalLog::new(db.clone()), GapLog::new(db), tx, rx)
    }

    #[test]
    fn test_repeated_low_confidence_queries_create_gap() {
        let (log, gaps, _tx, rx) = setup();
        let now = Utc::now();
        for _ in 0..3 {
            log.record("kafka consumer lag", &[1.0, 0.0], 0.1, 0, now).unwrap();
        }
        log.record("unrelated", &[0.0, 1.0], 0.1, 0, now).unwrap();
        log.record("confident", &[1.0, 0.0], 0.9, 2, now).unwrap();

        let (report, created) = detect_gaps(&log, &gaps, &GapConfig::default(), now, &rx).unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].topic_descriptor, "kafka consumer lag");
        assert_eq!(created[0].evidence.len(), 3);
        assert_eq!(gaps.list(Some(GapStatus::Open)).unwrap().len(), 1);

        // 같은 주제로 다시 돌려도 중복 리포트 없음
        let (again, _) = detect_gaps(&log, &gaps, &GapConfig::default(), now, &rx).unwrap();
        assert_eq!(again.changed, 0);
    }

    #[test]
    fn test_below_min_occurrences_is_ignored() {
        let (log, gaps, _tx, rx) = setup();
        let now = Utc::now();
        log.record("dns outage", &[1.0, 0.0], 0.1, 0, now).unwrap();
        log.record("dns outage", &[1.0, 0.0], 0.1, 0, now).unwrap();

        let (report, _) = detect_gaps(&log, &gaps, &GapConfig::default(), now, &rx).unwrap();
        assert_eq!(report.changed, 0);
    }

    #[test]
    fn test_resolved_topic_needs_fresh_evidence() {
        let (log, gaps, _tx, rx) = setup();
        let now = Utc::now();
        let before = now - chrono::Duration::hours(2);
        for _ in 0..3 {
            log.record("cert expiry", &[1.0, 0.0], 0.1, 0, before).unwrap();
        }
        let (_, created) = detect_gaps(&log, &gaps, &GapConfig::default(), now, &rx).unwrap();
        gaps.resolve(&created[0].id, None).unwrap();

        let (report, _) = detect_gaps(&log, &gaps, &GapConfig::default(), now, &rx).unwrap();
        assert_eq!(report.changed, 0);

        let later = Utc::now() + chrono::Duration::minutes(1);
        for _ in 0..3 {
            log.record("cert expiry", &[1.0, 0.0], 0.1, 0, later).unwrap();
        }
        let (report, _) = detect_gaps(&log, &gaps, &GapConfig::default(), later, &rx).unwrap();
        assert_eq!(report.changed, 1);
    }

    #[test]
    fn test_resolve_matching_closes_only_near_gaps() {
        let (_log, gaps, _tx, _rx) = setup();
        let make = |centroid: Vec<f32>| GapReport {
            id: GapId::new(),
            topic_descriptor: "topic".into(),
            detected_at: Utc::now(),
            evidence: Vec::new(),
            centroid,
            status: GapStatus::Open,
            resolved_at: None,
            resolved_by: None,
        };
        let near = make(vec![1.0, 0.0]);
        let far = make(vec![0.0, 1.0]);
        gaps.insert(&near).unwrap();
        gaps.insert(&far).unwrap();

        let node = NodeId::new();
        let closed = gaps.resolve_matching(&[0.99, 0.05], &node, 0.85).unwrap();
        assert_eq!(closed, vec![near.id.clone()]);
        assert_eq!(gaps.get(&far.id).unwrap().unwrap().status, GapStatus::Open);
        assert_eq!(gaps.get(&near.id).unwrap().unwrap().resolved_by, Some(node));
    }

    #[test]
    fn test_cancelled_pass_stops_early() {
        let (log, gaps, tx, rx) = setup();
        let now = Utc::now();
        for _ in 0..3 {
            log.record("disk full", &[1.0, 0.0], 0.1, 0, now).unwrap();
        }
        tx.send(true).unwrap();

        let (report, created) = detect_gaps(&log, &gaps, &GapConfig::default(), now, &rx).unwrap();
        assert!(report.cancelled);
        assert!(created.is_empty());
    }
}
