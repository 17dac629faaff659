//! Knowledge 모듈 - 지식 그래프 저장소
//!
//! - types: 노드/엣지/티칭/공백 리포트 데이터 모델
//! - db: SQLite 핸들 + 스키마
//! - store: 노드별 락을 가진 그래프 저장소 (유사도 검색, 엣지, 감쇠)
//! - similarity: 코사인 유사도, 중심 벡터

mod db;
mod similarity;
mod store;
mod types;

// Re-exports
pub use db::{Database, SCHEMA_VERSION};
pub(crate) use db::{format_ts, parse_opt_ts, parse_ts};
pub use similarity::{centroid, cosine_similarity, is_valid_embedding, normalize};
pub(crate) use similarity::{blob_to_embedding, embedding_to_blob};
pub use store::{DecayOutcome, DecayPolicy, KnowledgeStore, MergeOutcome, StoreStats};
pub use types::{
    content_hash, Direction, Edge, EdgeKind, GapEvidence, GapId, GapReport, GapStatus,
    KnowledgeNode, Neighbor, NodeFilter, NodeId, NodeStatus, RetrievalLogEntry, ScoredNode,
    SourceClass, SourceKind, SourceRef, Teaching, TeachingId, TeachingStatus,
};
