//! 설정 모듈
//!
//! `~/.incident-kb/config.toml` (또는 `--config` 경로)에서 설정을 읽습니다.
//! 파일이 없거나 섹션이 빠져 있으면 기본값을 사용합니다.
//!
//! ```toml
//! [extractor]
//! duplicate_threshold = 0.92
//!
//! [maintenance.decay_per_day]
//! manual = 0.01
//! scanned = 0.03
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::knowledge::SourceClass;

/// 설정 파일 이름
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// 데이터베이스 파일 이름
pub const DATABASE_FILE_NAME: &str = "knowledge.db";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.incident-kb/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".incident-kb")
}

// ============================================================================
// KbConfig
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    pub embedding: EmbeddingConfig,
    pub extractor: ExtractorConfig,
    pub retrieval: RetrievalConfig,
    pub maintenance: MaintenanceConfig,
    pub gaps: GapConfig,
    pub queue: QueueConfig,
}

impl KbConfig {
    /// 설정 로드
    ///
    /// 경로를 지정하지 않으면 데이터 디렉토리의 `config.toml`을 찾고,
    /// 없으면 기본값을 반환합니다. 명시적으로 지정한 파일이 없으면 에러입니다.
    pub fn load(path: Option<&Path>) -> KbResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (get_data_dir().join(CONFIG_FILE_NAME), false),
        };

        if !path.exists() {
            if explicit {
                return Err(KbError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&raw)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// TOML 문자열 파싱 + 검증
    pub fn from_toml(raw: &str) -> KbResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| KbError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> KbResult<()> {
        let unit = |name: &str, v: f32| -> KbResult<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(KbError::Config(format!("{} must be within [0, 1], got {}", name, v)));
            }
            Ok(())
        };

        unit("extractor.duplicate_threshold", self.extractor.duplicate_threshold)?;
        unit("extractor.relate_threshold", self.extractor.relate_threshold)?;
        unit("extractor.merge_boost", self.extractor.merge_boost)?;
        unit("retrieval.hop_decay", self.retrieval.hop_decay)?;
        unit("retrieval.reinforcement", self.retrieval.reinforcement)?;
        unit("retrieval.ancestor_threshold", self.retrieval.ancestor_threshold)?;
        unit("maintenance.retirement_threshold", self.maintenance.retirement_threshold)?;
        unit("maintenance.rebalance_change_fraction", self.maintenance.rebalance_change_fraction)?;
        unit("maintenance.attach_threshold", self.maintenance.attach_threshold)?;
        unit("gaps.confidence_floor", self.gaps.confidence_floor)?;
        unit("gaps.cluster_threshold", self.gaps.cluster_threshold)?;

        if self.extractor.relate_threshold > self.extractor.duplicate_threshold {
            return Err(KbError::Config(
                "extractor.relate_threshold must not exceed duplicate_threshold".into(),
            ));
        }
        if self.maintenance.fanout_limit < 2 {
            return Err(KbError::Config("maintenance.fanout_limit must be >= 2".into()));
        }
        if self.embedding.max_attempts == 0 {
            return Err(KbError::Config("embedding.max_attempts must be >= 1".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

/// 임베딩 프로바이더 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// 로컬 해싱 임베딩 (API 키 불필요)
    Local,
    /// Gemini 임베딩 API
    Gemini,
}

/// 임베딩 게이트웨이 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// 미지정 시 API 키 유무로 결정
    pub provider: Option<ProviderKind>,
    pub dimension: Option<usize>,
    /// 호출당 타임아웃
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: None,
            dimension: None,
            timeout_ms: 10_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
        }
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// 추출기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// 이 유사도 이상이면 중복으로 병합 (τ_dup)
    pub duplicate_threshold: f32,
    /// 이 유사도 이상이면 relates-to 엣지 연결
    pub relate_threshold: f32,
    /// 중복 후보 개수
    pub candidate_k: usize,
    /// 병합 시 기존 노드 중요도 보강량
    pub merge_boost: f32,
    pub min_unit_chars: usize,
    pub max_unit_chars: usize,
    pub max_input_chars: usize,
    pub initial_importance_manual: f32,
    pub initial_importance_scanned: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.92,
            relate_threshold: 0.75,
            candidate_k: 5,
            merge_boost: 0.1,
            min_unit_chars: 8,
            max_unit_chars: 1200,
            max_input_chars: 200_000,
            initial_importance_manual: 0.6,
            initial_importance_scanned: 0.5,
        }
    }
}

impl ExtractorConfig {
    /// 소스 분류별 초기 중요도
    pub fn initial_importance(&self, class: SourceClass) -> f32 {
        match class {
            SourceClass::Manual => self.initial_importance_manual,
            SourceClass::Scanned | SourceClass::Synthesized => self.initial_importance_scanned,
        }
    }
}

/// 검색 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// 그래프 1홉 확장 시 스코어 감쇠
    pub hop_decay: f32,
    /// 검색 적중 시 중요도 보강량
    pub reinforcement: f32,
    /// 상위 요약 노드를 포함할 최소 유사도
    pub ancestor_threshold: f32,
    /// 벡터 검색 시 k의 배수만큼 후보를 가져옴
    pub candidate_multiplier: usize,
    /// 함께 반환된 노드 간 엣지 가중치 보강량
    pub co_retrieval_boost: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hop_decay: 0.5,
            reinforcement: 0.02,
            ancestor_threshold: 0.6,
            candidate_multiplier: 2,
            co_retrieval_boost: 0.05,
        }
    }
}

/// 소스 분류별 일일 감쇠율
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayRates {
    pub manual: f32,
    pub scanned: f32,
    pub synthesized: f32,
}

impl Default for DecayRates {
    fn default() -> Self {
        Self {
            manual: 0.01,
            scanned: 0.03,
            synthesized: 0.02,
        }
    }
}

impl DecayRates {
    pub fn rate_for(&self, class: SourceClass) -> f32 {
        match class {
            SourceClass::Manual => self.manual,
            SourceClass::Scanned => self.scanned,
            SourceClass::Synthesized => self.synthesized,
        }
    }
}

/// 유지보수 스케줄러 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// 실행 주기 (초)
    pub cadence_secs: u64,
    pub decay_per_day: DecayRates,
    /// 이 중요도 미만이면 보관(archive) 후보
    pub retirement_threshold: f32,
    /// 마지막 접근 후 이 기간이 지나야 보관
    pub grace_days: f64,
    /// 자식 집합이 이 비율 이상 바뀌면 요약 재생성
    pub rebalance_change_fraction: f32,
    /// 요약 하나가 가질 수 있는 최대 자식 수
    pub fanout_limit: usize,
    /// 새 요약을 만들기 위한 최소 고아 노드 수
    pub min_summary_children: usize,
    /// 고아 노드를 기존 요약에 붙이기 위한 최소 유사도
    pub attach_threshold: f32,
    pub max_summary_level: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 86_400,
            decay_per_day: DecayRates::default(),
            retirement_threshold: 0.05,
            grace_days: 2.0,
            rebalance_change_fraction: 0.3,
            fanout_limit: 12,
            min_summary_children: 3,
            attach_threshold: 0.7,
            max_summary_level: 3,
        }
    }
}

impl MaintenanceConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs.max(1))
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.grace_days * 86_400_000.0) as i64)
    }
}

/// 지식 공백 탐지 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// 최고 스코어가 이 값 미만이면 저신뢰 쿼리
    pub confidence_floor: f32,
    /// 저신뢰 쿼리 군집화 유사도
    pub cluster_threshold: f32,
    /// 공백 리포트를 만들기 위한 최소 반복 횟수
    pub min_occurrences: usize,
    /// 검사할 검색 로그 기간 (일)
    pub window_days: i64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            cluster_threshold: 0.85,
            min_occurrences: 3,
            window_days: 14,
        }
    }
}

/// 티칭 큐 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 클레임 리스 (초)
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_secs: 300,
            poll_interval_ms: 2000,
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = KbConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.extractor.duplicate_threshold, 0.92);
        assert_eq!(config.retrieval.hop_decay, 0.5);
        assert_eq!(config.retrieval.reinforcement, 0.02);
        assert_eq!(config.maintenance.retirement_threshold, 0.05);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = KbConfig::from_toml(
            r#"
            [extractor]
            duplicate_threshold = 0.95

            [maintenance.decay_per_day]
            scanned = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(config.extractor.duplicate_threshold, 0.95);
        assert_eq!(config.extractor.candidate_k, 5);
        assert_eq!(config.maintenance.decay_per_day.scanned, 0.1);
        assert_eq!(config.maintenance.decay_per_day.manual, 0.01);
        assert_eq!(config.gaps.min_occurrences, 3);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let result = KbConfig::from_toml("[retrieval]\nhop_decay = 1.5\n");
        assert!(matches!(result, Err(KbError::Config(_))));

        let result = KbConfig::from_toml(
            "[extractor]\nduplicate_threshold = 0.5\nrelate_threshold = 0.8\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_decay_rates_by_class() {
        let rates = DecayRates::default();
        assert!(rates.rate_for(SourceClass::Manual) < rates.rate_for(SourceClass::Scanned));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(KbConfig::load(Some(&missing)).is_err());

        let present = dir.path().join("config.toml");
        std::fs::write(&present, "[queue]\nlease_secs = 30\n").unwrap();
        let config = KbConfig::load(Some(&present)).unwrap();
        assert_eq!(config.queue.lease_secs, 30);
    }
}
