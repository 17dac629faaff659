//! 검색 로그 (공백 탐지 입력)

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::KbResult;
use crate::knowledge::{blob_to_embedding, embedding_to_blob, format_ts, parse_ts, Database, RetrievalLogEntry};

/// 쿼리별 최고 스코어 기록
#[derive(Clone)]
pub struct RetrievalLog {
    db: Database,
}

impl RetrievalLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 쿼리 기록
    pub fn record(
        &self,
        query: &str,
        embedding: &[f32],
        top_score: f32,
        result_count: usize,
        recorded_at: DateTime<Utc>,
    ) -> KbResult<i64> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO retrieval_log (query, embedding, top_score, result_count, recorded_at, recorded_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    query,
                    embedding_to_blob(embedding),
                    top_score as f64,
                    result_count as i64,
                    format_ts(recorded_at),
                    recorded_at.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// `since` 이후 최고 스코어가 `floor` 미만인 쿼리 (오래된 순)
    pub fn low_confidence_since(&self, since: DateTime<Utc>, floor: f32) -> KbResult<Vec<RetrievalLogEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, query, embedding, top_score, result_count, recorded_at
                 FROM retrieval_log
                 WHERE recorded_at_ms >= ?1 AND top_score < ?2
                 ORDER BY recorded_at_ms, id",
            )?;
            let rows = stmt
                .query_map(params![since.timestamp_millis(), floor as f64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, query, blob, top_score, count, recorded_at)| -> KbResult<RetrievalLogEntry> {
                    Ok(RetrievalLogEntry {
                        id,
                        query,
                        embedding: blob_to_embedding(&blob),
                        top_score: top_score as f32,
                        result_count: count.max(0) as usize,
                        recorded_at: parse_ts(&recorded_at)?,
                    })
                })
                .collect()
        })
    }

    /// `before` 이전 로그 삭제
    pub fn prune_before(&self, before: DateTime<Utc>) -> KbResult<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM retrieval_log WHERE recorded_at_ms < ?1",
                params![before.timestamp_millis()],
            )?)
        })
    }

    pub fn count(&self) -> KbResult<usize> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM retrieval_log", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }
}
