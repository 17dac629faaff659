//! Maintenance Scheduler
//!
//! 감쇠, 요약 재구성, 공백 탐지 세 패스를 주기적으로 실행합니다.
//! 각 패스는 서로 독립적이며, 노드 단위 저장소 연산만 사용하므로
//! 검색/추출과 동시에 돌아도 되고 중간에 멈춰도 그래프는 일관된 상태로 남습니다.

mod decay;
mod gaps;
mod rebalance;

pub use gaps::GapLog;
pub use rebalance::{ExtractiveSummarizer, Summarizer};

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::{GapConfig, MaintenanceConfig};
use crate::embedding::EmbeddingGateway;
use crate::error::KbResult;
use crate::knowledge::{GapReport, KnowledgeStore};
use crate::retrieval::RetrievalLog;

use rebalance::Rebalancer;

// ============================================================================
// Reports
// ============================================================================

/// 패스 한 번의 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub pass: &'static str,
    pub visited: usize,
    pub changed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl PassReport {
    pub fn new(pass: &'static str) -> Self {
        Self {
            pass,
            ..Default::default()
        }
    }

    /// 패스 자체가 실패한 경우
    fn aborted(pass: &'static str) -> Self {
        Self {
            pass,
            failed: 1,
            ..Default::default()
        }
    }

    fn log(&self) {
        tracing::info!(
            "Maintenance pass '{}': visited={}, changed={}, failed={}{}",
            self.pass,
            self.visited,
            self.changed,
            self.failed,
            if self.cancelled { " (cancelled)" } else { "" }
        );
    }
}

/// 유지보수 한 주기의 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub decay: PassReport,
    pub rebalance: PassReport,
    pub gaps: PassReport,
    /// 이번 주기에 새로 만든 공백 리포트
    #[serde(skip)]
    pub new_gaps: Vec<GapReport>,
}

impl MaintenanceReport {
    pub fn passes(&self) -> [&PassReport; 3] {
        [&self.decay, &self.rebalance, &self.gaps]
    }

    pub fn cancelled(&self) -> bool {
        self.passes().iter().any(|p| p.cancelled)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct MaintenanceScheduler {
    store: Arc<KnowledgeStore>,
    gateway: EmbeddingGateway,
    summarizer: Arc<dyn Summarizer>,
    log: RetrievalLog,
    gaps: GapLog,
    config: MaintenanceConfig,
    gap_config: GapConfig,
}

impl MaintenanceScheduler {
    pub fn new(
        store: Arc<KnowledgeStore>,
        gateway: EmbeddingGateway,
        summarizer: Arc<dyn Summarizer>,
        log: RetrievalLog,
        gaps: GapLog,
        config: MaintenanceConfig,
        gap_config: GapConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            summarizer,
            log,
            gaps,
            config,
            gap_config,
        }
    }

    pub fn run_decay(&self, shutdown: &watch::Receiver<bool>) -> KbResult<PassReport> {
        decay::run_decay(&self.store, &self.config, Utc::now(), shutdown)
    }

    pub async fn run_rebalance(&self, shutdown: &watch::Receiver<bool>) -> KbResult<PassReport> {
        Rebalancer {
            store: &self.store,
            gateway: &self.gateway,
            summarizer: self.summarizer.as_ref(),
            config: &self.config,
        }
        .run(shutdown)
        .await
    }

    pub fn run_gap_detection(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> KbResult<(PassReport, Vec<GapReport>)> {
        gaps::detect_gaps(&self.log, &self.gaps, &self.gap_config, Utc::now(), shutdown)
    }

    /// 세 패스를 한 번씩 실행
    ///
    /// 한 패스가 실패해도 나머지는 계속 실행합니다.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            decay: self.run_decay(shutdown).unwrap_or_else(|e| {
                tracing::warn!("Decay pass aborted: {}", e);
                PassReport::aborted("decay")
            }),
            ..Default::default()
        };
        report.decay.log();

        report.rebalance = self.run_rebalance(shutdown).await.unwrap_or_else(|e| {
            tracing::warn!("Rebalance pass aborted: {}", e);
            PassReport::aborted("rebalance")
        });
        report.rebalance.log();

        match self.run_gap_detection(shutdown) {
            Ok((pass, created)) => {
                report.gaps = pass;
                report.new_gaps = created;
            }
            Err(e) => {
                tracing::warn!("Gap detection aborted: {}", e);
                report.gaps = PassReport::aborted("gaps");
            }
        }
        report.gaps.log();

        report
    }

    /// 종료 신호가 올 때까지 주기마다 `run_once` 실행
    ///
    /// 첫 실행은 한 주기 뒤입니다.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let cadence = self.config.cadence();
        let mut interval = interval_at(Instant::now() + cadence, cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Maintenance scheduler started (cadence={:?})", cadence);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_once(&shutdown).await;
                    if report.cancelled() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Maintenance scheduler stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================
