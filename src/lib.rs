//! incident-kb - 장애 대응 어시스턴트용 자기 유지 지식 그래프
//!
//! 티칭/문서에서 지식 노드를 추출해 중복을 병합하고, 벡터 유사도 + 그래프 확장 +
//! 계층 요약으로 검색하며, 백그라운드에서 감쇠/요약 재구성/공백 탐지를 수행합니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod knowledge;
pub mod maintenance;
pub mod retrieval;
pub mod service;
pub mod teaching;

// Re-exports
pub use config::{get_data_dir, KbConfig};
pub use embedding::{
    create_provider, get_api_key, has_api_key, EmbeddingGateway, EmbeddingProvider,
    GeminiEmbedding, HashingEmbedding,
};
pub use error::{KbError, KbResult};
pub use extractor::{ContentKind, ExtractionReport, KnowledgeExtractor, SourceDocument};
pub use knowledge::{
    Edge, EdgeKind, GapReport, KnowledgeNode, KnowledgeStore, NodeFilter, NodeId, NodeStatus,
    SourceKind, SourceRef, StoreStats, Teaching, TeachingId,
};
pub use maintenance::{
    ExtractiveSummarizer, GapLog, MaintenanceReport, MaintenanceScheduler, PassReport, Summarizer,
};
pub use retrieval::{QueryOptions, QueryResult, RetrievalEngine, RetrievalHit};
pub use service::{BackgroundTasks, KbStats, KnowledgeBase};
pub use teaching::{TeachingClaim, TeachingOutcome, TeachingQueue};
