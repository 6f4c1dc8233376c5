//! Periodic forward-only maintenance: clearing promotion, approval expiry and
//! appeal lapse. Every sweep is safe to run again or from several workers.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use super::Engine;
use crate::external::DomainEvent;
use crate::model::{ApprovalId, EntryId, RequestId};
use crate::payout::AppealOutcome;

/// What one pass of [`Engine::run_sweeps`] moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cleared: Vec<EntryId>,
    pub expired: Vec<ApprovalId>,
    pub lapsed: Vec<RequestId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.cleared.is_empty() && self.expired.is_empty() && self.lapsed.is_empty()
    }
}

impl Engine {
    /// Run every sweep once. Each takes a single table guard.
    pub fn run_sweeps(&self) -> SweepReport {
        let now = self.now();
        let mut events = Vec::new();
        let mut report = SweepReport::default();

        for entry in self.ledger.write().sweep_cleared(now) {
            report.cleared.push(entry.id);
            events.push(DomainEvent::LedgerCleared {
                entry: entry.id,
                creator: entry.creator,
            });
        }

        for approval in self.approvals.write().sweep_expired(now) {
            report.expired.push(approval.id);
            events.push(DomainEvent::ApprovalExpired {
                approval: approval.id,
            });
        }

        {
            let mut payouts = self.payouts.write();
            for request in payouts.lapsed_appeals(now) {
                match payouts.resolve_appeal(request, AppealOutcome::Lapsed, None, now) {
                    Ok(_) => report.lapsed.push(request),
                    Err(e) => info!(request, reason = %e, "appeal lapse skipped"),
                }
            }
        }

        if !report.is_empty() {
            info!(
                cleared = report.cleared.len(),
                expired = report.expired.len(),
                lapsed = report.lapsed.len(),
                "sweep applied"
            );
        }
        self.publish(events);
        report
    }

    /// Run [`Engine::run_sweeps`] every `period` until `shutdown` flips to
    /// true or its sender goes away.
    pub async fn run_sweeper(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_sweeps();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sweeper stopped");
                        return;
                    }
                }
            }
        }
    }
}
