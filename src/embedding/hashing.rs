//! 로컬 해싱 임베딩
//!
//! API 키 없이 동작하는 결정적 임베딩입니다. 토큰과 문자 trigram을
//! FNV-1a로 버킷에 해싱한 뒤 L2 정규화합니다. 같은 어휘를 공유하는
//! 텍스트끼리 유사도가 높게 나옵니다.

use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::EmbeddingProvider;
use crate::knowledge::normalize;

/// 기본 차원
pub const DEFAULT_HASHING_DIMENSION: usize = 256;

const TRIGRAM_WEIGHT: f32 = 0.5;

fn token_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}_]+").ok()).as_ref()
}

fn tokenize(text: &str) -> Vec<&str> {
    match token_regex() {
        Some(re) => re.find_iter(text).map(|m| m.as_str()).collect(),
        None => text.split_whitespace().collect(),
    }
}

/// 결정적 특성 해싱 임베딩
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension < 8 {
            anyhow::bail!("Hashing dimension must be >= 8, got {}", dimension);
        }
        Ok(Self { dimension })
    }

    /// 동기 임베딩 (테스트/오프라인 용도)
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let mut tokens = tokenize(&lowered);
        if tokens.is_empty() {
            let trimmed = lowered.trim();
            if trimmed.is_empty() {
                return vector;
            }
            tokens.push(trimmed);
        }

        for token in tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);

            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.add_feature(&mut vector, trigram.as_bytes(), TRIGRAM_WEIGHT);
                }
            }
        }

        normalize(&mut vector);
        vector
    }

    fn add_feature(&self, vector: &mut [f32], bytes: &[u8], weight: f32) {
        let hash = fnv1a(bytes);
        let index = (hash % self.dimension as u64) as usize;
        // 상위 비트로 부호 결정 (충돌 상쇄)
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(PRIME))
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "local-hashing"
    }
}
