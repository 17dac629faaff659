//! 지식 그래프 데이터 모델
//!
//! 노드, 엣지, 티칭, 공백 리포트, 검색 로그 타입을 정의합니다.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::KbError;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// 새 ID 발급 (UUID v4, 재사용되지 않음)
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KbError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|e| KbError::Validation(format!("invalid id '{}': {}", s, e)))
            }
        }
    };
}

define_id!(
    /// 지식 노드 ID
    NodeId
);
define_id!(
    /// 티칭 ID
    TeachingId
);
define_id!(
    /// 공백 리포트 ID
    GapId
);

// ============================================================================
// Enumerations
// ============================================================================

/// 문자열 표현을 가진 enum에 as_str/FromStr/Display 구현
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = KbError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(KbError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// 노드 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    /// 검색에서 제외, 감사용으로 보존
    Archived,
    /// 새 버전으로 대체됨 (`superseded_by` 참조)
    Superseded,
}

string_enum!(NodeStatus {
    Active => "active",
    Archived => "archived",
    Superseded => "superseded",
});

/// 지식의 출처 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// 에이전트/사람이 직접 가르친 내용
    Teaching,
    Chat,
    Wiki,
    Repository,
    Document,
    /// 요약 노드 (유지보수 패스가 합성)
    Synthesized,
}

string_enum!(SourceKind {
    Teaching => "teaching",
    Chat => "chat",
    Wiki => "wiki",
    Repository => "repository",
    Document => "document",
    Synthesized => "synthesized",
});

/// 감쇠율/초기 중요도를 결정하는 출처 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceClass {
    /// 수동 티칭 - 느리게 감쇠
    Manual,
    /// 커넥터 자동 수집
    Scanned,
    Synthesized,
}

impl SourceKind {
    pub fn class(&self) -> SourceClass {
        match self {
            SourceKind::Teaching => SourceClass::Manual,
            SourceKind::Synthesized => SourceClass::Synthesized,
            SourceKind::Chat | SourceKind::Wiki | SourceKind::Repository | SourceKind::Document => {
                SourceClass::Scanned
            }
        }
    }
}

/// 엣지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// 상위 요약 → 하위 노드
    Summarizes,
    RelatesTo,
    Contradicts,
}

string_enum!(EdgeKind {
    Summarizes => "summarizes",
    RelatesTo => "relates-to",
    Contradicts => "contradicts",
});

/// 이웃 조회 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

// ============================================================================
// Provenance
// ============================================================================

/// 출처 정보 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    /// 커넥터 ID (예: "slack", "confluence", "teaching-queue")
    pub connector: String,
    pub document_id: Option<String>,
    pub teaching_id: Option<TeachingId>,
}

impl SourceRef {
    /// 티칭 출처
    pub fn teaching(teaching_id: TeachingId) -> Self {
        Self {
            kind: SourceKind::Teaching,
            connector: "teaching-queue".to_string(),
            document_id: None,
            teaching_id: Some(teaching_id),
        }
    }

    /// 커넥터 문서 출처
    pub fn document(kind: SourceKind, connector: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            kind,
            connector: connector.into(),
            document_id: Some(document_id.into()),
            teaching_id: None,
        }
    }

    /// 요약 노드 출처
    pub fn synthesized() -> Self {
        Self {
            kind: SourceKind::Synthesized,
            connector: "maintenance".to_string(),
            document_id: None,
            teaching_id: None,
        }
    }

    pub fn class(&self) -> SourceClass {
        self.kind.class()
    }
}

// ============================================================================
// KnowledgeNode
// ============================================================================

/// 지식 노드
///
/// `content`/`embedding`은 생성 후 변경되지 않습니다.
/// 내용이 바뀌면 새 버전 노드를 만들고 기존 노드를 `Superseded`로 표시합니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: NodeId,
    pub content: String,
    pub embedding: Vec<f32>,
    /// 정규화된 내용의 SHA-256 (정확 중복 탐지용)
    pub content_hash: String,
    /// [0, 1]
    pub importance: f32,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// 마지막 감쇠 적용 시각 (감쇠 중복 적용 방지)
    pub last_decayed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub source: SourceRef,
    /// 병합으로 추가된 출처 (append-only)
    pub provenance: Vec<SourceRef>,
    /// 0 = 리프 사실, >0 = 요약
    pub summary_level: u32,
    pub status: NodeStatus,
    pub superseded_by: Option<NodeId>,
    /// 요약 생성 시점의 자식 ID 집합
    pub summary_basis: Vec<NodeId>,
}

impl KnowledgeNode {
    /// 리프 노드 생성
    pub fn leaf(content: impl Into<String>, embedding: Vec<f32>, source: SourceRef, importance: f32) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            content_hash: content_hash(&content),
            content,
            embedding,
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
            last_accessed_at: now,
            last_decayed_at: None,
            access_count: 0,
            source,
            provenance: Vec::new(),
            summary_level: 0,
            status: NodeStatus::Active,
            superseded_by: None,
            summary_basis: Vec::new(),
        }
    }

    /// 요약 노드 생성
    pub fn summary(
        content: impl Into<String>,
        embedding: Vec<f32>,
        level: u32,
        children: Vec<NodeId>,
        importance: f32,
    ) -> Self {
        let mut node = Self::leaf(content, embedding, SourceRef::synthesized(), importance);
        node.summary_level = level.max(1);
        node.summary_basis = children;
        node
    }

    /// 같은 메타데이터로 내용만 바꾼 새 버전
    pub fn new_version(&self, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            content_hash: content_hash(&content),
            content,
            embedding,
            importance: self.importance,
            created_at: now,
            last_accessed_at: now,
            last_decayed_at: None,
            access_count: 0,
            source: self.source.clone(),
            provenance: self.provenance.clone(),
            summary_level: self.summary_level,
            status: NodeStatus::Active,
            superseded_by: None,
            summary_basis: self.summary_basis.clone(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.summary_level == 0
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// 이 출처가 이미 기록되어 있는지
    pub fn has_source(&self, source: &SourceRef) -> bool {
        &self.source == source || self.provenance.iter().any(|p| p == source)
    }
}

/// 내용 해시 (소문자 + 공백 정규화 후 SHA-256)
pub fn content_hash(text: &str) -> String {
    let normalized = text
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{:x}", digest)
}

// ============================================================================
// Edge
// ============================================================================

/// 방향성 관계
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    /// [0, 1] - 추출 신뢰도 + 동시 검색 빈도
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId, kind: EdgeKind, weight: f32) -> Self {
        Self {
            source,
            target,
            kind,
            weight: weight.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }
}

/// 이웃 조회 결과
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub edge: Edge,
    pub node: KnowledgeNode,
}

// ============================================================================
// Similarity query
// ============================================================================

/// findSimilar 필터
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub source_kind: Option<SourceKind>,
    pub summary_level: Option<u32>,
    pub status: Option<NodeStatus>,
}

impl NodeFilter {
    /// 모든 노드
    pub fn any() -> Self {
        Self::default()
    }

    /// 활성 리프 노드만
    pub fn active_leaves() -> Self {
        Self {
            source_kind: None,
            summary_level: Some(0),
            status: Some(NodeStatus::Active),
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.summary_level = Some(level);
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = Some(kind);
        self
    }

    pub fn matches(&self, node: &KnowledgeNode) -> bool {
        self.source_kind.map_or(true, |k| node.source.kind == k)
            && self.summary_level.map_or(true, |l| node.summary_level == l)
            && self.status.map_or(true, |s| node.status == s)
    }
}

/// 유사도 검색 결과
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: KnowledgeNode,
    pub similarity: f32,
}

// ============================================================================
// Teaching
// ============================================================================

/// 티칭 상태 (pending → processed | rejected, 한 번만 전이)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeachingStatus {
    Pending,
    Processed,
    Rejected,
}

string_enum!(TeachingStatus {
    Pending => "pending",
    Processed => "processed",
    Rejected => "rejected",
});

/// 처리 대기 중인 지식 기여
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teaching {
    pub id: TeachingId,
    pub raw_text: String,
    pub submitter: String,
    pub received_at: DateTime<Utc>,
    pub status: TeachingStatus,
    /// 클레임 횟수
    pub attempts: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

// ============================================================================
// Gap report
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapStatus {
    Open,
    Resolved,
}

string_enum!(GapStatus {
    Open => "open",
    Resolved => "resolved",
});

/// 저신뢰 쿼리 근거
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapEvidence {
    pub query: String,
    pub top_score: f32,
    pub recorded_at: DateTime<Utc>,
}

/// 지식 공백 리포트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapReport {
    pub id: GapId,
    pub topic_descriptor: String,
    pub detected_at: DateTime<Utc>,
    pub evidence: Vec<GapEvidence>,
    /// 근거 쿼리 임베딩의 중심
    pub centroid: Vec<f32>,
    pub status: GapStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<NodeId>,
}

// ============================================================================
// Retrieval log
// ============================================================================

/// 검색 로그 엔트리 (공백 탐지 입력)
#[derive(Debug, Clone)]
pub struct RetrievalLogEntry {
    pub id: i64,
    pub query: String,
    pub embedding: Vec<f32>,
    pub top_score: f32,
    pub result_count: usize,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_parse() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);

        let parsed: NodeId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("not-a-uuid".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!("archived".parse::<NodeStatus>().unwrap(), NodeStatus::Archived);
        assert_eq!(EdgeKind::RelatesTo.as_str(), "relates-to");
        assert_eq!("relates-to".parse::<EdgeKind>().unwrap(), EdgeKind::RelatesTo);
        assert!("deleted".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_source_classes() {
        assert_eq!(SourceKind::Teaching.class(), SourceClass::Manual);
        assert_eq!(SourceKind::Chat.class(), SourceClass::Scanned);
        assert_eq!(SourceKind::Synthesized.class(), SourceClass::Synthesized);
    }

    #[test]
    fn test_content_hash_normalizes_whitespace_and_case() {
        assert_eq!(
            content_hash("Restart  pod X\nvia kubectl"),
            content_hash("restart pod x via KUBECTL")
        );
        assert_ne!(content_hash("restart pod x"), content_hash("restart pod y"));
    }

    #[test]
    fn test_leaf_clamps_importance() {
        let node = KnowledgeNode::leaf("fact", vec![1.0], SourceRef::synthesized(), 1.7);
        assert_eq!(node.importance, 1.0);
        assert!(node.is_leaf());
        assert!(node.is_active());
    }

    #[test]
    fn test_summary_level_is_positive() {
        let node = KnowledgeNode::summary("s", vec![1.0], 0, vec![], 0.5);
        assert_eq!(node.summary_level, 1);
        assert_eq!(node.source.kind, SourceKind::Synthesized);
    }

    #[test]
    fn test_filter_matching() {
        let leaf = KnowledgeNode::leaf(
            "fact",
            vec![1.0],
            SourceRef::document(SourceKind::Wiki, "confluence", "page-1"),
            0.5,
        );
        assert!(NodeFilter::active_leaves().matches(&leaf));
        assert!(NodeFilter::any().with_source_kind(SourceKind::Wiki).matches(&leaf));
        assert!(!NodeFilter::any().with_source_kind(SourceKind::Chat).matches(&leaf));
        assert!(!NodeFilter::any().with_level(1).matches(&leaf));
    }

    #[test]
    fn test_has_source_checks_origin_and_provenance() {
        let teaching = SourceRef::teaching(TeachingId::new());
        let mut node = KnowledgeNode::leaf("fact", vec![1.0], teaching.clone(), 0.5);
        assert!(node.has_source(&teaching));

        let other = SourceRef::teaching(TeachingId::new());
        assert!(!node.has_source(&other));
        node.provenance.push(other.clone());
        assert!(node.has_source(&other));
    }
}
