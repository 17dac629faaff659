//! SQLite 데이터베이스 핸들 및 스키마
//!
//! 노드/엣지/티칭/공백 리포트/검색 로그를 하나의 DB 파일에 저장합니다.
//! 저장 위치: ~/.incident-kb/knowledge.db

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};

use crate::error::{KbError, KbResult};

/// 현재 스키마 버전
pub const SCHEMA_VERSION: i64 = 1;

/// 공유 DB 핸들 (복제 가능)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// DB 열기 (없으면 생성)
    pub fn open(path: &Path) -> KbResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // journal_mode는 결과 행을 반환하므로 query_row 사용
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!("SQLite journal mode: {}", mode);

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        };
        db.initialize()?;
        Ok(db)
    }

    /// 인메모리 DB (테스트/임시 용도)
    pub fn open_in_memory() -> KbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        db.initialize()?;
        Ok(db)
    }

    /// DB 파일 경로 (인메모리는 None)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 커넥션 락을 잡고 클로저 실행
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> KbResult<T>) -> KbResult<T> {
        let mut conn = self.conn.lock().map_err(KbError::poisoned)?;
        f(&mut conn)
    }

    /// 스키마 초기화
    fn initialize(&self) -> KbResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute(
                "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![SCHEMA_VERSION, format_ts(Utc::now())],
            )?;
            Ok(())
        })?;

        tracing::debug!("Knowledge database initialized at {:?}", self.path);
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    importance REAL NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    last_decayed_at TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    source TEXT NOT NULL,
    provenance TEXT NOT NULL DEFAULT '[]',
    summary_level INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    superseded_by TEXT,
    summary_basis TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_nodes_status_level ON nodes(status, summary_level);
CREATE INDEX IF NOT EXISTS idx_nodes_content_hash ON nodes(content_hash);

CREATE TABLE IF NOT EXISTS edges (
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    weight REAL NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id, kind);

CREATE TABLE IF NOT EXISTS teachings (
    id TEXT PRIMARY KEY,
    raw_text TEXT NOT NULL,
    submitter TEXT NOT NULL,
    received_at TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    lease_token TEXT,
    lease_expires_at INTEGER,
    processed_at TEXT,
    rejection_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_teachings_status ON teachings(status, received_at);

CREATE TABLE IF NOT EXISTS gap_reports (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    evidence TEXT NOT NULL,
    centroid BLOB NOT NULL,
    status TEXT NOT NULL,
    resolved_at TEXT,
    resolved_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_gap_reports_status ON gap_reports(status);

CREATE TABLE IF NOT EXISTS retrieval_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query TEXT NOT NULL,
    embedding BLOB NOT NULL,
    top_score REAL NOT NULL,
    result_count INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    recorded_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_retrieval_log_time ON retrieval_log(recorded_at_ms);
"#;

// ============================================================================
// Helper Functions
// ============================================================================

/// DateTime<Utc> → RFC3339 문자열
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// RFC3339 문자열 → DateTime<Utc>
pub(crate) fn parse_ts(s: &str) -> KbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KbError::invariant(format!("corrupt timestamp '{}': {}", s, e)))
}

/// 선택적 RFC3339 문자열 파싱
pub(crate) fn parse_opt_ts(s: Option<String>) -> KbResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

// ============================================================================
// Tests
// ============================================================================
