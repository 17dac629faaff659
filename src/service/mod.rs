//! KnowledgeBase - 소비자 API와 백그라운드 작업 연결
//!
//! 저장소, 티칭 큐, 추출기, 검색 엔진, 유지보수 스케줄러를 하나의 DB 파일 위에 묶습니다.
//! 외부에서 부르는 연산은 `query`와 `submit_teaching`이 전부이고,
//! 나머지는 CLI와 백그라운드 작업용입니다.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::KbConfig;
use crate::embedding::{create_provider, EmbeddingGateway, EmbeddingProvider};
use crate::error::{KbError, KbResult};
use crate::extractor::{ExtractionReport, KnowledgeExtractor, SourceDocument, WorkerReport};
use crate::knowledge::{GapStatus, KnowledgeStore, StoreStats, TeachingId};
use crate::maintenance::{
    ExtractiveSummarizer, GapLog, MaintenanceReport, MaintenanceScheduler, Summarizer,
};
use crate::retrieval::{QueryOptions, QueryResult, RetrievalEngine, RetrievalLog};
use crate::teaching::TeachingQueue;

/// 전체 통계
#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub store: StoreStats,
    pub pending_teachings: usize,
    pub open_gaps: usize,
    pub logged_queries: usize,
    pub embedding_provider: String,
    pub embedding_dimension: usize,
}

/// 지식 베이스
pub struct KnowledgeBase {
    config: KbConfig,
    store: Arc<KnowledgeStore>,
    gateway: EmbeddingGateway,
    queue: TeachingQueue,
    gaps: GapLog,
    log: RetrievalLog,
    extractor: Arc<KnowledgeExtractor>,
    retrieval: RetrievalEngine,
    scheduler: Arc<MaintenanceScheduler>,
}

impl KnowledgeBase {
    /// 데이터 디렉토리에서 열기 (설정에 맞는 임베딩 프로바이더 사용)
    pub fn open(data_dir: &Path, config: KbConfig) -> anyhow::Result<Self> {
        let provider = create_provider(&config.embedding)?;
        let store = KnowledgeStore::open(data_dir)?;
        Ok(Self::assemble(
            store,
            provider,
            Arc::new(ExtractiveSummarizer::new()),
            config,
        )?)
    }

    /// 인메모리 지식 베이스
    pub fn in_memory(provider: Arc<dyn EmbeddingProvider>, config: KbConfig) -> KbResult<Self> {
        Self::assemble(
            KnowledgeStore::open_in_memory()?,
            provider,
            Arc::new(ExtractiveSummarizer::new()),
            config,
        )
    }

    /// 구성 요소 조립
    pub fn assemble(
        store: KnowledgeStore,
        provider: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn Summarizer>,
        config: KbConfig,
    ) -> KbResult<Self> {
        // 차원이 다른 프로바이더로는 기존 노드와 중복 판정이 불가능
        if let Some(stored) = store.embedding_dimension()? {
            if stored != provider.dimension() {
                return Err(KbError::Config(format!(
                    "stored embeddings have dimension {} but provider {} produces {}",
                    stored,
                    provider.name(),
                    provider.dimension()
                )));
            }
        }
        let store = Arc::new(store);
        let db = store.database().clone();
        let gateway = EmbeddingGateway::new(provider, &config.embedding);
        let queue = TeachingQueue::new(db.clone(), config.queue.lease());
        let gaps = GapLog::new(db.clone());
        let log = RetrievalLog::new(db);

        let extractor = Arc::new(KnowledgeExtractor::new(
            store.clone(),
            gateway.clone(),
            gaps.clone(),
            config.extractor.clone(),
            config.gaps.cluster_threshold,
            config.embedding.max_attempts,
        ));
        let retrieval = RetrievalEngine::new(
            store.clone(),
            gateway.clone(),
            log.clone(),
            config.retrieval.clone(),
        );
        let scheduler = Arc::new(MaintenanceScheduler::new(
            store.clone(),
            gateway.clone(),
            summarizer,
            log.clone(),
            gaps.clone(),
            config.maintenance.clone(),
            config.gaps.clone(),
        ));

        Ok(Self {
            config,
            store,
            gateway,
            queue,
            gaps,
            log,
            extractor,
            retrieval,
            scheduler,
        })
    }

    // ------------------------------------------------------------------
    // Consumer API
    // ------------------------------------------------------------------

    /// 상위 k개 검색
    pub async fn query(&self, text: &str, k: usize) -> KbResult<QueryResult> {
        self.retrieval.query(text, &QueryOptions::top(k)).await
    }

    pub async fn query_with(&self, text: &str, options: &QueryOptions) -> KbResult<QueryResult> {
        self.retrieval.query(text, options).await
    }

    /// 티칭 제출 (pending 상태로 큐에 들어감)
    pub fn submit_teaching(&self, text: &str, submitter: &str) -> KbResult<TeachingId> {
        self.queue.submit(text, submitter)
    }

    // ------------------------------------------------------------------
    // Intake / maintenance
    // ------------------------------------------------------------------

    /// 커넥터 문서 바로 추출
    pub async fn ingest_document(&self, document: &SourceDocument) -> KbResult<ExtractionReport> {
        self.extractor.ingest_document(document).await
    }

    /// pending 티칭을 최대 `limit`개 처리
    pub async fn process_pending(&self, worker: &str, limit: usize) -> KbResult<WorkerReport> {
        self.extractor.process_pending(&self.queue, worker, limit).await
    }

    /// 유지보수 패스를 즉시 한 번 실행
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let (_tx, rx) = watch::channel(false);
        self.scheduler.run_once(&rx).await
    }

    /// 추출 워커와 유지보수 스케줄러를 백그라운드로 시작
    pub fn spawn_background(&self, worker: &str) -> BackgroundTasks {
        let (tx, rx) = watch::channel(false);

        let extractor = self.extractor.clone();
        let queue = self.queue.clone();
        let worker = worker.to_string();
        let poll = self.config.queue.poll_interval();
        let worker_rx = rx.clone();
        let extraction = tokio::spawn(async move {
            extractor.run_worker(queue, worker, poll, worker_rx).await;
        });

        let scheduler = self.scheduler.clone();
        let maintenance = tokio::spawn(async move {
            scheduler.run(rx).await;
        });

        BackgroundTasks {
            shutdown: tx,
            handles: vec![extraction, maintenance],
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn stats(&self) -> KbResult<KbStats> {
        Ok(KbStats {
            store: self.store.stats()?,
            pending_teachings: self.queue.pending_count()?,
            open_gaps: self.gaps.list(Some(GapStatus::Open))?.len(),
            logged_queries: self.log.count()?,
            embedding_provider: self.gateway.provider_name().to_string(),
            embedding_dimension: self.gateway.dimension(),
        })
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn queue(&self) -> &TeachingQueue {
        &self.queue
    }

    pub fn gaps(&self) -> &GapLog {
        &self.gaps
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }
}

/// 실행 중인 백그라운드 작업
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// 종료 신호를 보내고 모든 작업이 끝날 때까지 대기
    ///
    /// 진행 중인 패스는 다음 노드 경계에서 멈춥니다.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Background tasks stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================
