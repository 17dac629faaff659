//! 로컬 파일 수집 모듈
//!
//! 폴더를 재귀로 돌며 텍스트/마크다운/코드 파일을 찾아 추출기 입력 문서로 만듭니다.
//! .gitignore 패턴을 존중하고, 지원하는 확장자만 수집합니다.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;

use crate::extractor::{ContentKind, SourceDocument};

/// 수집 문서의 커넥터 이름
pub const LOCAL_CONNECTOR: &str = "local-files";

// ============================================================================
// File Types
// ============================================================================

/// 확장자로 콘텐츠 종류 결정
pub fn content_kind_for_extension(ext: &str) -> Option<ContentKind> {
    let ext = ext.to_lowercase();
    match ext.as_str() {
        // 위키/런북
        "md" | "markdown" => Some(ContentKind::WikiPage),

        // 소스 코드 및 설정
        "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "c" | "cpp" | "h" | "hpp"
        | "sh" | "bash" | "zsh" | "sql" | "toml" | "yaml" | "yml" | "json" => {
            Some(ContentKind::CodeSnippet)
        }

        // 평문, 로그
        "txt" | "log" => Some(ContentKind::PlainText),

        _ => None,
    }
}

/// 파일 경로에서 콘텐츠 종류 결정
pub fn content_kind_for_path(path: &Path) -> Option<ContentKind> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(content_kind_for_extension)
}

// ============================================================================
// Collected File
// ============================================================================

/// 수집된 파일 정보
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// 파일 절대 경로
    pub path: PathBuf,
    pub kind: ContentKind,
    /// 파일 크기 (바이트)
    pub size: u64,
    pub modified_at: Option<SystemTime>,
}

impl CollectedFile {
    pub fn from_path(path: PathBuf) -> Result<Option<Self>> {
        let Some(kind) = content_kind_for_path(&path) else {
            return Ok(None);
        };

        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to read metadata: {:?}", path))?;

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            path,
            kind,
            size: metadata.len(),
            modified_at: metadata.modified().ok(),
        }))
    }

    /// 파일 내용을 읽어 추출기 입력 문서로 변환
    ///
    /// 문서 ID는 파일 경로이며, 수신 시각은 수정 시각입니다.
    pub fn to_document(&self) -> Result<SourceDocument> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read file: {:?}", self.path))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let mut doc = SourceDocument::new(
            text,
            self.kind,
            LOCAL_CONNECTOR,
            self.path.to_string_lossy(),
        );
        if let Some(modified) = self.modified_at {
            doc.received_at = DateTime::<Utc>::from(modified);
        }
        Ok(doc)
    }
}

// ============================================================================
// File Collector
// ============================================================================

/// 파일 수집기 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// .gitignore 패턴 존중 여부
    pub respect_gitignore: bool,
    /// 숨김 파일 포함 여부
    pub include_hidden: bool,
    /// 최대 파일 크기 (바이트, 0이면 제한 없음)
    pub max_file_size: u64,
    /// 특정 확장자만 수집 (비어있으면 모든 지원 확장자)
    pub extensions: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 1024 * 1024, // 1MB
            extensions: vec![],
        }
    }
}

/// 파일 수집기
pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// 단일 파일 수집
    pub fn collect_file(&self, path: &Path) -> Result<Option<CollectedFile>> {
        let abs_path = absolute(path)?;

        if !abs_path.is_file() {
            anyhow::bail!("Not a file: {:?}", abs_path);
        }

        Ok(CollectedFile::from_path(abs_path)?.filter(|f| self.should_include(f)))
    }

    /// 폴더 재귀 수집
    pub fn collect_directory(&self, path: &Path) -> Result<Vec<CollectedFile>> {
        let abs_path = absolute(path)?;

        if !abs_path.is_dir() {
            anyhow::bail!("Not a directory: {:?}", abs_path);
        }

        let mut files = Vec::new();

        // ignore 크레이트로 .gitignore 지원
        let walker = WalkBuilder::new(&abs_path)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            match CollectedFile::from_path(entry.path().to_path_buf()) {
                Ok(Some(file)) if self.should_include(&file) => files.push(file),
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to collect file: {}", e),
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::info!("Collected {} files from {:?}", files.len(), abs_path);
        Ok(files)
    }

    fn should_include(&self, file: &CollectedFile) -> bool {
        if self.config.max_file_size > 0 && file.size > self.config.max_file_size {
            tracing::debug!("Skipping large file: {:?} ({} bytes)", file.path, file.size);
            return false;
        }

        if self.config.extensions.is_empty() {
            return true;
        }
        file.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.config.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if !abs_path.exists() {
        anyhow::bail!("Path not found: {:?}", abs_path);
    }
    Ok(abs_path)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::SourceKind;

    #[test]
    fn test_content_kind_from_extension() {
        assert_eq!(content_kind_for_extension("md"), Some(ContentKind::WikiPage));
        assert_eq!(content_kind_for_extension("RS"), Some(ContentKind::CodeSnippet));
        assert_eq!(content_kind_for_extension("log"), Some(ContentKind::PlainText));
        assert_eq!(content_kind_for_extension("png"), None);
    }

    #[test]
    fn test_collect_directory_respects_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "ignored.md\n").unwrap();
        std::fs::write(dir.path().join("runbook.md"), "# Restart\nRun kubectl.").unwrap();
        std::fs::write(dir.path().join("ignored.md"), "secret").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/fix.sh"), "kubectl rollout restart").unwrap();

        let files = FileCollector::with_defaults().collect_directory(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["runbook.md", "fix.sh"]);
        assert_eq!(files[0].kind, ContentKind::WikiPage);
        assert_eq!(files[1].kind, ContentKind::CodeSnippet);
    }

    #[test]
    fn test_to_document_carries_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "Disk fills up when logs are not rotated.").unwrap();

        let file = FileCollector::with_defaults().collect_file(&path).unwrap().unwrap();
        let doc = file.to_document().unwrap();
        assert_eq!(doc.kind, ContentKind::PlainText);
        assert_eq!(doc.source.kind, SourceKind::Document);
        assert_eq!(doc.source.connector, LOCAL_CONNECTOR);
        assert!(doc.source.document_id.as_deref().unwrap().ends_with("notes.txt"));
    }

    #[test]
    fn test_extension_filter_and_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "short").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x".repeat(64)).unwrap();

        let collector = FileCollector::new(CollectorConfig {
            extensions: vec!["txt".into()],
            max_file_size: 32,
            ..CollectorConfig::default()
        });
        assert!(collector.collect_directory(dir.path()).unwrap().is_empty());
    }
}
