//! 임베딩 모듈 - 텍스트 벡터화 게이트웨이
//!
//! 프로바이더(Gemini API / 로컬 해싱)를 `EmbeddingGateway`로 감싸
//! 타임아웃, 지수 백오프 재시도, 벡터 검증을 한 곳에서 처리합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let provider = create_provider(&config.embedding)?;
//! let gateway = EmbeddingGateway::new(provider, &config.embedding);
//! let embedding = gateway.embed("Restart pod X via kubectl").await?;
//! ```

mod gemini;
mod hashing;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::error::{KbError, KbResult};
use crate::knowledge::is_valid_embedding;

pub use gemini::{get_api_key, has_api_key, GeminiEmbedding, DEFAULT_DIMENSION};
pub use hashing::{HashingEmbedding, DEFAULT_HASHING_DIMENSION};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
/// 재시도/타임아웃은 게이트웨이가 담당하므로 구현체는 한 번만 호출합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// EmbeddingGateway
// ============================================================================

/// 재시도/타임아웃이 적용된 임베딩 게이트웨이
///
/// 모든 실패는 `TransientDependency`로 보고되며,
/// 반환된 벡터가 비었거나 차원이 다르면 `InvariantViolation`입니다.
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
        }
    }

    /// 텍스트 임베딩
    pub async fn embed(&self, text: &str) -> KbResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KbError::Validation("cannot embed empty text".into()));
        }

        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = self.initial_backoff * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(
                    "Embedding failed ({}), retrying in {:?} (attempt {}/{})",
                    last_error,
                    backoff,
                    attempt + 1,
                    self.max_attempts
                );
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(self.timeout, self.provider.embed(text)).await {
                Ok(Ok(vector)) => return self.check(vector),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.timeout),
            }
        }

        Err(KbError::transient(
            "embed",
            format!(
                "{} failed after {} attempts: {}",
                self.provider.name(),
                self.max_attempts,
                last_error
            ),
        ))
    }

    fn check(&self, vector: Vec<f32>) -> KbResult<Vec<f32>> {
        if !is_valid_embedding(&vector) {
            return Err(KbError::invariant(format!(
                "{} returned an empty or degenerate vector",
                self.provider.name()
            )));
        }
        if vector.len() != self.provider.dimension() {
            return Err(KbError::invariant(format!(
                "{} returned dimension {} (expected {})",
                self.provider.name(),
                vector.len(),
                self.provider.dimension()
            )));
        }
        Ok(vector)
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// 외부 호출 한 번의 제한 시간
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 임베딩 프로바이더 생성
///
/// 프로바이더를 지정하지 않으면 API 키가 있을 때 Gemini, 없으면 로컬 해싱을 사용합니다.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let kind = config.provider.unwrap_or(if has_api_key() {
        ProviderKind::Gemini
    } else {
        ProviderKind::Local
    });

    let provider: Arc<dyn EmbeddingProvider> = match kind {
        ProviderKind::Gemini => {
            let dimension = config.dimension.unwrap_or(DEFAULT_DIMENSION);
            Arc::new(GeminiEmbedding::from_env_with_dimension(dimension)?)
        }
        ProviderKind::Local => {
            let dimension = config.dimension.unwrap_or(DEFAULT_HASHING_DIMENSION);
            Arc::new(HashingEmbedding::new(dimension)?)
        }
    };

    tracing::info!(
        "Using {} embedding (dimension: {})",
        provider.name(),
        provider.dimension()
    );
    Ok(provider)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::ScriptedEmbedding;
    use super::*;

    fn fast_config() -> EmbeddingConfig {
        EmbeddingConfig {
            timeout_ms: 50,
            max_attempts: 3,
            initial_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_gateway_retries_then_succeeds() {
        let provider = Arc::new(ScriptedEmbedding::new(4));
        provider.fail_next(2);
        let gateway = EmbeddingGateway::new(provider.clone(), &fast_config());

        let v = gateway.embed("restart pod").await.unwrap();
        assert_eq!(v.len(), 4);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_gateway_reports_transient_after_exhaustion() {
        let provider = Arc::new(ScriptedEmbedding::new(4));
        provider.fail_next(10);
        let gateway = EmbeddingGateway::new(provider, &fast_config());

        let err = gateway.embed("restart pod").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_gateway_times_out_slow_provider() {
        let provider = Arc::new(ScriptedEmbedding::new(4).with_delay(Duration::from_millis(500)));
        let gateway = EmbeddingGateway::new(provider, &fast_config());

        let err = gateway.embed("restart pod").await.unwrap_err();
        assert!(matches!(err, KbError::TransientDependency { .. }));
    }

    #[tokio::test]
    async fn test_gateway_rejects_empty_text_and_bad_vectors() {
        let provider = Arc::new(ScriptedEmbedding::new(2));
        provider.script("zero", vec![0.0, 0.0]);
        provider.script("short", vec![1.0]);
        let gateway = EmbeddingGateway::new(provider, &fast_config());

        assert!(matches!(gateway.embed("  ").await, Err(KbError::Validation(_))));
        assert!(matches!(gateway.embed("zero").await, Err(KbError::InvariantViolation(_))));
        assert!(matches!(gateway.embed("short").await, Err(KbError::InvariantViolation(_))));
    }

    #[test]
    fn test_create_local_provider() {
        let config = EmbeddingConfig {
            provider: Some(ProviderKind::Local),
            dimension: Some(64),
            ..Default::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.dimension(), 64);
    }
}
