//! Teaching Queue - 리스 기반 티칭 대기열
//!
//! 제출된 티칭은 `pending` 상태로 저장되고, 워커는 `claim()`으로 리스를 얻어 처리합니다.
//! 리스가 만료되면 다른 워커가 다시 클레임할 수 있으며(워커 크래시 복구),
//! `complete()`는 리스 토큰이 일치할 때만 커밋됩니다.
//!
//! 상태 전이: pending → processed | rejected (단 한 번)

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{KbError, KbResult};
use crate::knowledge::{format_ts, parse_opt_ts, parse_ts, Database, Teaching, TeachingId, TeachingStatus};

/// 티칭 본문 최대 길이
const MAX_TEACHING_CHARS: usize = 100_000;

// ============================================================================
// Types
// ============================================================================

/// 클레임된 티칭 (리스 토큰 포함)
#[derive(Debug, Clone)]
pub struct TeachingClaim {
    pub teaching: Teaching,
    pub worker: String,
    pub expires_at: DateTime<Utc>,
    token: String,
}

impl TeachingClaim {
    pub fn id(&self) -> &TeachingId {
        &self.teaching.id
    }
}

/// 처리 결과 (커밋 시점)
#[derive(Debug, Clone, PartialEq)]
pub enum TeachingOutcome {
    Processed,
    Rejected(String),
}

// ============================================================================
// TeachingQueue
// ============================================================================

/// 티칭 큐 (SQLite 영속)
#[derive(Clone)]
pub struct TeachingQueue {
    db: Database,
    lease: chrono::Duration,
}

impl TeachingQueue {
    pub fn new(db: Database, lease: Duration) -> Self {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self { db, lease }
    }

    /// 티칭 제출
    pub fn submit(&self, raw_text: &str, submitter: &str) -> KbResult<TeachingId> {
        if raw_text.trim().is_empty() {
            return Err(KbError::Validation("teaching text is empty".into()));
        }
        if raw_text.chars().count() > MAX_TEACHING_CHARS {
            return Err(KbError::Validation(format!(
                "teaching exceeds {} characters",
                MAX_TEACHING_CHARS
            )));
        }
        let submitter = submitter.trim();
        if submitter.is_empty() {
            return Err(KbError::Validation("submitter is required".into()));
        }

        let id = TeachingId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO teachings (id, raw_text, submitter, received_at, status, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    id.to_string(),
                    raw_text,
                    submitter,
                    format_ts(Utc::now()),
                    TeachingStatus::Pending.as_str(),
                ],
            )?;
            Ok(())
        })?;

        tracing::info!("Teaching {} submitted by {}", id, submitter);
        Ok(id)
    }

    /// 다음 티칭 클레임 (없으면 None)
    pub fn claim(&self, worker: &str) -> KbResult<Option<TeachingClaim>> {
        self.claim_at(worker, Utc::now())
    }

    /// 지정 시각 기준 클레임
    ///
    /// 리스가 없거나 만료된 pending 티칭 중 가장 오래된 것을 가져옵니다.
    pub fn claim_at(&self, worker: &str, now: DateTime<Utc>) -> KbResult<Option<TeachingClaim>> {
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = now + self.lease;

        let claimed = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id: Option<String> = tx
                .query_row(
                    "SELECT id FROM teachings
                     WHERE status = ?1 AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)
                     ORDER BY received_at, rowid
                     LIMIT 1",
                    params![TeachingStatus::Pending.as_str(), now.timestamp_millis()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = id else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE teachings SET lease_token = ?2, lease_expires_at = ?3, attempts = attempts + 1
                 WHERE id = ?1",
                params![id, token, expires_at.timestamp_millis()],
            )?;
            let teaching = load_teaching(&tx, &id)?;
            tx.commit()?;
            Ok(teaching)
        })?;

        let Some(teaching) = claimed else {
            return Ok(None);
        };
        tracing::debug!(
            "Teaching {} claimed by {} (attempt {})",
            teaching.id,
            worker,
            teaching.attempts
        );
        Ok(Some(TeachingClaim {
            teaching,
            worker: worker.to_string(),
            expires_at,
            token,
        }))
    }

    /// 처리 결과 커밋
    ///
    /// 리스 토큰이 일치하지 않으면 (다른 워커가 재클레임) `LeaseLost`,
    /// 이미 pending을 벗어난 티칭이면 `InvariantViolation`입니다.
    pub fn complete(&self, claim: &TeachingClaim, outcome: TeachingOutcome) -> KbResult<()> {
        let (status, reason) = match &outcome {
            TeachingOutcome::Processed => (TeachingStatus::Processed, None),
            TeachingOutcome::Rejected(reason) => (TeachingStatus::Rejected, Some(reason.as_str())),
        };
        let id = claim.id().to_string();

        self.db.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE teachings
                 SET status = ?3, processed_at = ?4, rejection_reason = ?5,
                     lease_token = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_token = ?2 AND status = 'pending'",
                params![id, claim.token, status.as_str(), format_ts(Utc::now()), reason],
            )?;
            if rows == 1 {
                return Ok(());
            }

            let current: Option<String> = conn
                .query_row("SELECT status FROM teachings WHERE id = ?1", params![id], |r| r.get(0))
                .optional()?;
            match current.as_deref() {
                Some("pending") => Err(KbError::LeaseLost(id.clone())),
                Some(other) => Err(KbError::invariant(format!(
                    "teaching {} already left pending (status {})",
                    id, other
                ))),
                None => Err(KbError::invariant(format!("teaching {} vanished", id))),
            }
        })?;

        match outcome {
            TeachingOutcome::Processed => tracing::info!("Teaching {} processed", claim.id()),
            TeachingOutcome::Rejected(reason) => {
                tracing::warn!("Teaching {} rejected: {}", claim.id(), reason)
            }
        }
        Ok(())
    }

    /// 리스 반환 (일시 장애로 처리 실패 시)
    ///
    /// 토큰이 이미 바뀌었으면 아무것도 하지 않습니다.
    pub fn release(&self, claim: &TeachingClaim) -> KbResult<bool> {
        let released = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE teachings SET lease_token = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_token = ?2 AND status = 'pending'",
                params![claim.id().to_string(), claim.token],
            )? == 1)
        })?;
        if released {
            tracing::debug!("Teaching {} released back to pending", claim.id());
        }
        Ok(released)
    }

    /// ID로 조회
    pub fn get(&self, id: &TeachingId) -> KbResult<Option<Teaching>> {
        self.db.with_conn(|conn| load_teaching(conn, &id.to_string()))
    }

    /// 상태별 목록 (최신순)
    pub fn list(&self, status: Option<TeachingStatus>, limit: usize) -> KbResult<Vec<Teaching>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM teachings
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY received_at DESC, rowid DESC
                 LIMIT ?2",
                TEACHING_COLUMNS
            ))?;
            let raws = stmt
                .query_map(
                    params![status.map(|s| s.as_str()), limit as i64],
                    RawTeaching::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(RawTeaching::into_teaching).collect()
        })
    }

    /// pending 티칭 수 (리스 중인 것 포함)
    pub fn pending_count(&self) -> KbResult<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM teachings WHERE status = 'pending'",
                [],
                |r| r.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

// ============================================================================
// Row mapping
// ============================================================================

const TEACHING_COLUMNS: &str =
    "id, raw_text, submitter, received_at, status, attempts, processed_at, rejection_reason";

struct RawTeaching {
    id: String,
    raw_text: String,
    submitter: String,
    received_at: String,
    status: String,
    attempts: i64,
    processed_at: Option<String>,
    rejection_reason: Option<String>,
}

impl RawTeaching {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            raw_text: row.get(1)?,
            submitter: row.get(2)?,
            received_at: row.get(3)?,
            status: row.get(4)?,
            attempts: row.get(5)?,
            processed_at: row.get(6)?,
            rejection_reason: row.get(7)?,
        })
    }

    fn into_teaching(self) -> KbResult<Teaching> {
        Ok(Teaching {
            id: self.id.parse()?,
            raw_text: self.raw_text,
            submitter: self.submitter,
            received_at: parse_ts(&self.received_at)?,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            processed_at: parse_opt_ts(self.processed_at)?,
            rejection_reason: self.rejection_reason,
        })
    }
}

fn load_teaching(conn: &Connection, id: &str) -> KbResult<Option<Teaching>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM teachings WHERE id = ?1", TEACHING_COLUMNS),
            params![id],
            RawTeaching::from_row,
        )
        .optional()?;
    raw.map(RawTeaching::into_teaching).transpose()
}

// ============================================================================
// Tests
// ============================================================================
