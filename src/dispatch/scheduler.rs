//! Periodic dispatch maintenance

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::coordinator::TaskDispatchCoordinator;
use crate::throttle::ResourceConstraintThrottle;

/// Counts from one scheduler pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub rebroadcast: usize,
    pub expired: usize,
    pub reclaimed: usize,
}

/// Run one pass. A failing step is logged and the others still run.
pub async fn tick(coordinator: &TaskDispatchCoordinator) -> TickReport {
    let mut report = TickReport::default();

    match coordinator.expire_overdue().await {
        Ok(n) => report.expired = n,
        Err(e) => tracing::error!("Failed to expire overdue tasks: {}", e),
    }
    match coordinator.reclaim_from_inactive_delegates().await {
        Ok(n) => report.reclaimed = n,
        Err(e) => tracing::error!("Failed to reclaim tasks from inactive delegates: {}", e),
    }
    match coordinator.rebroadcast_due().await {
        Ok(n) => report.rebroadcast = n,
        Err(e) => tracing::error!("Failed to rebroadcast tasks: {}", e),
    }

    if report != TickReport::default() {
        tracing::debug!(
            rebroadcast = report.rebroadcast,
            expired = report.expired,
            reclaimed = report.reclaimed,
            "Scheduler pass"
        );
    }
    report
}

/// Promote blocked resource consumers whose unit has room, e.g. after a
/// capacity change made elsewhere. Returns how many were promoted.
pub async fn promote_constraints(throttle: &ResourceConstraintThrottle) -> usize {
    match throttle.promote_all_blocked().await {
        Ok(promoted) => {
            if promoted > 0 {
                tracing::debug!(promoted, "Constraint pass");
            }
            promoted
        }
        Err(e) => {
            tracing::error!("Failed to scan blocked resource constraints: {}", e);
            0
        }
    }
}

/// Spawn the scheduler loop
pub fn spawn(
    coordinator: Arc<TaskDispatchCoordinator>,
    throttle: Arc<ResourceConstraintThrottle>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick(&coordinator).await;
            promote_constraints(&throttle).await;
        }
    })
}
