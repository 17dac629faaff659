//! CLI 모듈
//!
//! incident-kb CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::collector::{CollectorConfig, FileCollector};
use crate::config::{get_data_dir, KbConfig, CONFIG_FILE_NAME, DATABASE_FILE_NAME};
use crate::embedding::has_api_key;
use crate::extractor::{ContentKind, ExtractionReport, SourceDocument};
use crate::knowledge::{Direction, GapId, GapStatus, NodeId, SourceKind};
use crate::retrieval::{HitOrigin, QueryOptions};
use crate::service::KnowledgeBase;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "incident-kb")]
#[command(version, about = "장애 대응용 자기 유지 지식 베이스", long_about = None)]
pub struct Cli {
    /// 데이터 디렉토리 (기본: ~/.incident-kb)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// 설정 파일 경로 (기본: <data-dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// --text 입력의 콘텐츠 종류
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Text,
    Wiki,
    Chat,
    Code,
}

impl From<KindArg> for ContentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => ContentKind::PlainText,
            KindArg::Wiki => ContentKind::WikiPage,
            KindArg::Chat => ContentKind::ChatTranscript,
            KindArg::Code => ContentKind::CodeSnippet,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// 티칭 제출 (큐에 pending으로 추가)
    Teach {
        /// 가르칠 내용
        text: String,

        /// 제출자
        #[arg(short, long, default_value = "cli")]
        submitter: String,

        /// 제출 후 바로 처리
        #[arg(long)]
        now: bool,
    },

    /// 텍스트, 파일, 또는 폴더를 바로 추출
    Ingest {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// --text의 콘텐츠 종류
        #[arg(short, long, value_enum, default_value = "text")]
        kind: KindArg,

        /// 수집할 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 수집할 폴더 경로 (재귀, .gitignore 존중)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 특정 확장자만 수집 (쉼표 구분)
        #[arg(long, value_delimiter = ',')]
        ext: Vec<String>,
    },

    /// 지식 베이스 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수
        #[arg(short = 'k', long, default_value = "5")]
        limit: usize,

        /// 리프 출처 종류 필터 (teaching, chat, wiki, repository, document)
        #[arg(short, long)]
        source: Option<String>,

        /// 그래프 확장 끄기
        #[arg(long)]
        no_expand: bool,

        /// 상위 요약 포함 끄기
        #[arg(long)]
        no_ancestors: bool,

        /// JSON 출력
        #[arg(long)]
        json: bool,
    },

    /// pending 티칭 처리
    Work {
        /// 최대 처리 개수
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// 워커 이름
        #[arg(short, long, default_value = "cli")]
        worker: String,
    },

    /// 유지보수 패스 (감쇠, 요약 재구성, 공백 탐지) 한 번 실행
    Maintain,

    /// 추출 워커 + 유지보수 스케줄러 실행 (Ctrl+C로 종료)
    Serve {
        /// 워커 이름
        #[arg(short, long, default_value = "serve")]
        worker: String,
    },

    /// 지식 공백 리포트
    Gaps {
        /// 해소된 리포트도 표시
        #[arg(short, long)]
        all: bool,

        /// 지정한 리포트를 해소 처리
        #[arg(long)]
        resolve: Option<String>,
    },

    /// 노드 상세 정보
    Show {
        /// 노드 ID
        id: String,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(get_data_dir);
    let default_config = data_dir.join(CONFIG_FILE_NAME);
    let config = match cli.config.as_deref() {
        Some(path) => KbConfig::load(Some(path)),
        None if default_config.exists() => KbConfig::load(Some(&default_config)),
        None => Ok(KbConfig::default()),
    }
    .context("설정 로드 실패")?;

    let kb = KnowledgeBase::open(&data_dir, config).context("지식 베이스 열기 실패")?;

    match cli.command {
        Commands::Teach {
            text,
            submitter,
            now,
        } => cmd_teach(&kb, &text, &submitter, now).await,
        Commands::Ingest {
            text,
            kind,
            file,
            dir,
            ext,
        } => cmd_ingest(&kb, text, kind, file, dir, ext).await,
        Commands::Query {
            query,
            limit,
            source,
            no_expand,
            no_ancestors,
            json,
        } => {
            let options = QueryOptions {
                k: limit,
                source_kind: source
                    .map(|s| s.parse::<SourceKind>())
                    .transpose()
                    .context("잘못된 출처 종류")?,
                expand_graph: !no_expand,
                include_ancestors: !no_ancestors,
            };
            cmd_query(&kb, &query, &options, json).await
        }
        Commands::Work { limit, worker } => cmd_work(&kb, &worker, limit).await,
        Commands::Maintain => cmd_maintain(&kb).await,
        Commands::Serve { worker } => cmd_serve(&kb, &worker).await,
        Commands::Gaps { all, resolve } => cmd_gaps(&kb, all, resolve),
        Commands::Show { id } => cmd_show(&kb, &id),
        Commands::Status => cmd_status(&kb, &data_dir),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 티칭 제출 명령어 (teach)
async fn cmd_teach(kb: &KnowledgeBase, text: &str, submitter: &str, now: bool) -> Result<()> {
    let id = kb
        .submit_teaching(text, submitter)
        .context("티칭 제출 실패")?;
    println!("[OK] 티칭이 접수되었습니다 (ID: {})", id);

    if now {
        println!("[*] 티칭 처리 중...");
        let report = kb.process_pending(submitter, usize::MAX).await?;
        println!(
            "[OK] 처리 {}, 거부 {}, 실패 {}",
            report.processed, report.rejected, report.failed
        );
    }
    Ok(())
}

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    kb: &KnowledgeBase,
    text: Option<String>,
    kind: KindArg,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    ext: Vec<String>,
) -> Result<()> {
    if let Some(text) = text {
        let doc = SourceDocument::new(text, kind.into(), "cli", "direct-input");
        let report = kb.ingest_document(&doc).await.context("추출 실패")?;
        print_extraction("direct-input", &report);
        return Ok(());
    }

    let collector = FileCollector::new(CollectorConfig {
        extensions: ext,
        ..Default::default()
    });

    let files = if let Some(ref file_path) = file {
        match collector.collect_file(file_path)? {
            Some(f) => vec![f],
            None => {
                println!("[!] 지원하지 않는 파일 형식: {:?}", file_path);
                return Ok(());
            }
        }
    } else if let Some(ref dir_path) = dir {
        collector.collect_directory(dir_path)?
    } else {
        bail!("--text, --file, --dir 중 하나를 지정해야 합니다");
    };

    if files.is_empty() {
        println!("[!] 수집할 파일이 없습니다.");
        return Ok(());
    }

    let total_size: u64 = files.iter().map(|f| f.size).sum();
    println!(
        "[*] 수집 대상: {} 파일 ({})",
        files.len(),
        format_bytes(total_size as usize)
    );
    println!();

    let mut success_count = 0;
    let mut error_count = 0;

    for (i, collected) in files.iter().enumerate() {
        let file_name = collected
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        print!("[{}/{}] [{:?}] {}... ", i + 1, files.len(), collected.kind, file_name);

        let result = match collected.to_document() {
            Ok(doc) => kb.ingest_document(&doc).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => {
                println!(
                    "완료 (신규 {}, 병합 {})",
                    report.created.len(),
                    report.merged.len() + report.already_recorded.len()
                );
                success_count += 1;
            }
            Err(e) => {
                println!("실패: {}", e);
                error_count += 1;
            }
        }
    }

    println!();
    println!("[OK] 완료: 성공 {}, 실패 {}", success_count, error_count);
    Ok(())
}

fn print_extraction(label: &str, report: &ExtractionReport) {
    println!("[OK] {}: 지식 단위 {}개", label, report.units);
    println!(
        "     신규 {}, 병합 {}, 기존 출처 {}, 연결 {}",
        report.created.len(),
        report.merged.len(),
        report.already_recorded.len(),
        report.edges_added
    );
    if !report.resolved_gaps.is_empty() {
        println!("     해소된 공백: {}", report.resolved_gaps.len());
    }
}

/// 검색 명령어 (query)
async fn cmd_query(kb: &KnowledgeBase, query: &str, options: &QueryOptions, json: bool) -> Result<()> {
    if !json {
        println!("[*] 검색 중: \"{}\"", query);
    }

    let result = kb.query_with(query, options).await.context("검색 실패")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if result.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    let low_confidence = result.top_score < kb.config().gaps.confidence_floor;
    println!(
        "\n[OK] 검색 결과 ({} 건, 신뢰도 {:.3}{}):\n",
        result.hits.len(),
        result.top_score,
        if low_confidence { ", 낮음" } else { "" }
    );

    for (i, hit) in result.hits.iter().enumerate() {
        let origin = match &hit.origin {
            HitOrigin::Vector => "VEC".to_string(),
            HitOrigin::Neighbor { edge, .. } => format!("HOP:{}", edge),
            HitOrigin::Ancestor { .. } => "SUM".to_string(),
        };
        println!(
            "{}. [{}] [점수: {:.4}] [L{}] {}",
            i + 1,
            origin,
            hit.score,
            hit.node.summary_level,
            hit.node.id
        );
        println!(
            "   출처: {} | 중요도: {:.2} | 조회: {}",
            hit.node.source.kind, hit.node.importance, hit.node.access_count
        );
        println!("   내용: {}", truncate_text(&hit.node.content, 200));
        println!();
    }

    Ok(())
}

/// 티칭 처리 명령어 (work)
async fn cmd_work(kb: &KnowledgeBase, worker: &str, limit: usize) -> Result<()> {
    let pending = kb.queue().pending_count()?;
    if pending == 0 {
        println!("[!] 처리할 티칭이 없습니다.");
        return Ok(());
    }

    println!("[*] pending 티칭 {}건 처리 중...", pending);
    let report = kb.process_pending(worker, limit).await?;
    println!(
        "[OK] 처리 {}, 거부 {}, 실패 {}",
        report.processed, report.rejected, report.failed
    );
    Ok(())
}

/// 유지보수 명령어 (maintain)
async fn cmd_maintain(kb: &KnowledgeBase) -> Result<()> {
    println!("[*] 유지보수 패스 실행 중...");
    let report = kb.run_maintenance().await;

    for pass in report.passes() {
        let mark = if pass.failed > 0 { "[!]" } else { "[OK]" };
        println!(
            "{} {:<10} 검사 {}, 변경 {}, 실패 {}",
            mark, pass.pass, pass.visited, pass.changed, pass.failed
        );
    }
    for gap in &report.new_gaps {
        println!("[!] 새 지식 공백: \"{}\" ({})", gap.topic_descriptor, gap.id);
    }
    Ok(())
}

/// 백그라운드 실행 명령어 (serve)
async fn cmd_serve(kb: &KnowledgeBase, worker: &str) -> Result<()> {
    println!(
        "[*] 추출 워커와 유지보수 스케줄러 시작 (주기 {}초)",
        kb.config().maintenance.cadence().as_secs()
    );
    let tasks = kb.spawn_background(worker);

    tokio::signal::ctrl_c()
        .await
        .context("종료 신호 대기 실패")?;

    println!("\n[*] 종료 중...");
    tasks.shutdown().await;
    println!("[OK] 종료되었습니다");
    Ok(())
}

/// 공백 리포트 명령어 (gaps)
fn cmd_gaps(kb: &KnowledgeBase, all: bool, resolve: Option<String>) -> Result<()> {
    if let Some(id) = resolve {
        let id: GapId = id.parse()?;
        if kb.gaps().resolve(&id, None)? {
            println!("[OK] 공백 {} 해소 처리됨", id);
        } else {
            println!("[!] 열린 공백 {}을(를) 찾을 수 없습니다", id);
        }
        return Ok(());
    }

    let status = if all { None } else { Some(GapStatus::Open) };
    let gaps = kb.gaps().list(status)?;
    if gaps.is_empty() {
        println!("[!] 지식 공백이 없습니다.");
        return Ok(());
    }

    println!("[OK] 지식 공백 ({} 건):\n", gaps.len());
    for gap in gaps {
        println!("  [{}] {}", gap.status, gap.topic_descriptor);
        println!(
            "        ID: {} | 탐지: {} | 근거 쿼리 {}건",
            gap.id,
            gap.detected_at.format("%Y-%m-%d %H:%M"),
            gap.evidence.len()
        );
        if let Some(node) = gap.resolved_by {
            println!("        해소 노드: {}", node);
        }
        println!();
    }
    Ok(())
}

/// 노드 상세 명령어 (show)
fn cmd_show(kb: &KnowledgeBase, id: &str) -> Result<()> {
    let id: NodeId = id.parse()?;
    let Some(node) = kb.store().get(&id)? else {
        bail!("ID {}인 노드를 찾을 수 없습니다", id);
    };

    println!("[OK] 노드 {}", node.id);
    println!("     상태: {} | 레벨: L{}", node.status, node.summary_level);
    println!(
        "     중요도: {:.3} | 조회: {} | 최근 접근: {}",
        node.importance,
        node.access_count,
        node.last_accessed_at.format("%Y-%m-%d %H:%M")
    );
    println!(
        "     출처: {} ({})",
        node.source.kind,
        node.source.document_id.as_deref().unwrap_or(&node.source.connector)
    );
    if !node.provenance.is_empty() {
        println!("     추가 출처: {}건", node.provenance.len());
    }
    if let Some(ref next) = node.superseded_by {
        println!("     대체 버전: {}", next);
    }
    println!();
    println!("{}", node.content);
    println!();

    let edges = kb.store().edges(&node.id, None, Direction::Both)?;
    if !edges.is_empty() {
        println!("[*] 엣지 ({} 개):", edges.len());
        for edge in edges {
            let (arrow, other) = if edge.source == node.id {
                ("->", &edge.target)
            } else {
                ("<-", &edge.source)
            };
            println!("     {} {} {} ({:.2})", arrow, edge.kind, other, edge.weight);
        }
    }
    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(kb: &KnowledgeBase, data_dir: &Path) -> Result<()> {
    println!("incident-kb v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", data_dir.display());
    if let Ok(meta) = std::fs::metadata(data_dir.join(DATABASE_FILE_NAME)) {
        println!("    DB 크기: {}", format_bytes(meta.len() as usize));
    }

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정 (로컬 임베딩 사용 가능)");
    }

    let stats = kb.stats().context("통계 조회 실패")?;
    println!(
        "[OK] 임베딩: {} ({}차원)",
        stats.embedding_provider, stats.embedding_dimension
    );
    println!(
        "[OK] 노드: 리프 {}, 요약 {}, 보관 {}, 대체 {}",
        stats.store.active_leaves,
        stats.store.active_summaries,
        stats.store.archived,
        stats.store.superseded
    );
    println!("     엣지: {}", stats.store.edge_count);
    println!("[OK] pending 티칭: {}", stats.pending_teachings);
    println!("[OK] 열린 지식 공백: {}", stats.open_gaps);
    println!("     검색 로그: {}건", stats.logged_queries);

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
