//! 에러 타입
//!
//! 지식 그래프 코어의 에러 분류입니다.
//! - `TransientDependency`: 임베딩/저장소 타임아웃 등 재시도 가능한 실패
//! - `Validation`: 잘못된 티칭/문서 (재시도하지 않음)
//! - `InvariantViolation`: 요약 DAG 순환, 임베딩 누락 등 (해당 작업 중단)
//!
//! 존재하지 않는 ID 조회는 에러가 아니라 `None`/빈 결과로 반환합니다.

use std::sync::PoisonError;

use thiserror::Error;

/// 코어 전체에서 사용하는 Result 별칭
pub type KbResult<T> = std::result::Result<T, KbError>;

/// 지식 그래프 에러
#[derive(Error, Debug)]
pub enum KbError {
    /// 외부 의존성(임베딩 게이트웨이 등) 일시 장애
    #[error("transient dependency failure in {operation}: {message}")]
    TransientDependency {
        operation: &'static str,
        message: String,
    },

    /// 입력 검증 실패
    #[error("validation failure: {0}")]
    Validation(String),

    /// 불변식 위반
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// SQLite 에러
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON 직렬화 에러
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 설정 에러
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 티칭 리스가 다른 워커에게 넘어감
    #[error("lease lost for teaching {0}")]
    LeaseLost(String),

    /// 협조적 취소
    #[error("operation cancelled")]
    Cancelled,
}

impl KbError {
    /// 일시 장애 에러 생성
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            operation,
            message: message.into(),
        }
    }

    /// 불변식 위반 에러 생성
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// 재시도 가능 여부
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDependency { .. })
    }

    /// 락 오염(poison)을 불변식 위반으로 변환
    pub(crate) fn poisoned<T>(err: PoisonError<T>) -> Self {
        Self::InvariantViolation(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(KbError::transient("embed", "timeout").is_retryable());
        assert!(!KbError::Validation("empty".into()).is_retryable());
        assert!(!KbError::invariant("cycle").is_retryable());
        assert!(!KbError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = KbError::transient("embed", "timed out after 10000ms");
        assert_eq!(
            err.to_string(),
            "transient dependency failure in embed: timed out after 10000ms"
        );
        assert_eq!(
            KbError::LeaseLost("abc".into()).to_string(),
            "lease lost for teaching abc"
        );
    }
}
