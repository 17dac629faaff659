//! 테스트용 임베딩 프로바이더
//!
//! 텍스트별로 벡터를 지정할 수 있고, 지정되지 않은 텍스트는 해싱 임베딩을 사용합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::{EmbeddingProvider, HashingEmbedding};

pub(crate) struct ScriptedEmbedding {
    dimension: usize,
    fallback: HashingEmbedding,
    scripts: Mutex<HashMap<String, Vec<f32>>>,
    failures: AtomicUsize,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedEmbedding {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fallback: HashingEmbedding::new(dimension.max(8)).unwrap(),
            scripts: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 텍스트에 대한 벡터 지정
    pub(crate) fn script(&self, text: &str, vector: Vec<f32>) {
        self.scripts.lock().unwrap().insert(text.to_string(), vector);
    }

    /// 다음 n번의 호출을 실패시킴
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("scripted failure");
        }

        if let Some(v) = self.scripts.lock().unwrap().get(text) {
            return Ok(v.clone());
        }
        let mut v = vec![0.0f32; self.dimension];
        for (i, x) in self.fallback.embed_sync(text).into_iter().enumerate() {
            v[i % self.dimension] += x;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
