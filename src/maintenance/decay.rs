//! 감쇠 패스

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::config::MaintenanceConfig;
use crate::error::KbResult;
use crate::knowledge::{DecayOutcome, DecayPolicy, KnowledgeStore, NodeFilter};

use super::PassReport;

/// 활성 리프마다 출처 클래스별 감쇠율을 적용하고, 조건을 만족하면 보관
///
/// 노드 하나의 실패는 건너뛰고 기록만 합니다. 취소는 노드 사이에서만 확인합니다.
pub(crate) fn run_decay(
    store: &KnowledgeStore,
    config: &MaintenanceConfig,
    now: DateTime<Utc>,
    shutdown: &watch::Receiver<bool>,
) -> KbResult<PassReport> {
    let mut report = PassReport::new("decay");
    let grace = config.grace();

    for id in store.ids(&NodeFilter::active_leaves())? {
        if *shutdown.borrow() {
            report.cancelled = true;
            break;
        }
        report.visited += 1;

        // 스냅샷 이후 다른 작업이 상태를 바꿨을 수 있으므로 apply_decay가 다시 확인
        let Some(node) = store.get(&id)? else {
            continue;
        };
        let policy = DecayPolicy {
            rate_per_day: config.decay_per_day.rate_for(node.source.class()),
            retirement_threshold: config.retirement_threshold,
            grace,
        };

        match store.apply_decay(&id, policy, now) {
            Ok(Some(DecayOutcome::Archived { before, after })) => {
                tracing::info!("Archived node {} (importance {:.3} -> {:.3})", id, before, after);
                report.changed += 1;
            }
            Ok(Some(DecayOutcome::Decayed { before, after })) => {
                tracing::debug!("Decayed node {} ({:.3} -> {:.3})", id, before, after);
                if after < before {
                    report.changed += 1;
                }
            }
            Ok(Some(DecayOutcome::Unchanged)) | Ok(None) => {}
            Err(e) => {
                tracing::warn!("Decay failed for node {}: {}", id, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
