//! Per-source ledger of money owed to creators.
//!
//! Entries move forward only: `accruing -> locked -> cleared -> paid`, with
//! `clawed_back` reachable from `locked`, `cleared` and `paid`. A payout
//! request claims entries through [`LedgerTable::lock_all`], a single
//! compare-and-set over the whole set.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

use crate::Amount;
use crate::model::{CreatorId, EntryId, RateModel, RequestId, SourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Accruing,
    Locked,
    Cleared,
    Paid,
    ClawedBack,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Accruing => "accruing",
            LedgerStatus::Locked => "locked",
            LedgerStatus::Cleared => "cleared",
            LedgerStatus::Paid => "paid",
            LedgerStatus::ClawedBack => "clawed_back",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger entry {0} not found")]
    EntryNotFound(EntryId),

    #[error("ledger entry {0} is already locked by another payout request")]
    AlreadyLocked(EntryId),

    #[error("ledger entry {entry}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        entry: EntryId,
        from: LedgerStatus,
        to: LedgerStatus,
    },

    #[error("ledger entry {entry} is still clearing until {until}")]
    ClearingWindowOpen {
        entry: EntryId,
        until: DateTime<Utc>,
    },

    #[error("ledger entry {0}: clawback requires a reason")]
    MissingReason(EntryId),

    #[error("negative rate {rate} for {source_ref}")]
    NegativeRate { source_ref: SourceRef, rate: RateModel },

    #[error("{views} views under {rate} for {source_ref} overflows")]
    AmountOverflow {
        source_ref: SourceRef,
        rate: RateModel,
        views: u64,
    },

    #[error("ledger entry {entry}: clawback of {amount} exceeds paid {paid}")]
    ClawbackExceedsPaid {
        entry: EntryId,
        amount: Amount,
        paid: Amount,
    },

    #[error("ledger entry {entry}: paid {paid} would exceed accrued {accrued}")]
    PaidExceedsAccrued {
        entry: EntryId,
        paid: Amount,
        accrued: Amount,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClawbackNote {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub creator: CreatorId,
    pub source: SourceRef,
    pub rate: RateModel,
    pub views_snapshot: u64,
    pub accrued_amount: Amount,
    pub paid_amount: Amount,
    pub status: LedgerStatus,
    /// Payout request currently holding this entry.
    pub claimed_by: Option<RequestId>,
    pub clearing_ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub clawback: Option<ClawbackNote>,
}

impl LedgerEntry {
    /// Open for inclusion in a new payout request.
    pub fn is_claimable(&self) -> bool {
        self.claimed_by.is_none()
            && matches!(self.status, LedgerStatus::Accruing | LedgerStatus::Cleared)
    }

    pub fn withdrawable(&self) -> Amount {
        self.accrued_amount - self.paid_amount
    }

    pub fn is_clear_at(&self, now: DateTime<Utc>) -> bool {
        self.clearing_ends_at <= now
    }
}

/// Result of feeding a views snapshot to [`LedgerTable::accrue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrualChange {
    Created,
    Recomputed,
    /// Snapshot older than (or equal to) the one already applied.
    Stale,
    /// Entry is paid or clawed back; its amount no longer moves.
    Frozen,
}

/// Parameters for a single accrual.
#[derive(Debug, Clone, Copy)]
pub struct Accrual {
    pub creator: CreatorId,
    pub source: SourceRef,
    pub rate: RateModel,
    pub views: u64,
}

#[derive(Debug, Default)]
pub struct LedgerTable {
    entries: HashMap<EntryId, LedgerEntry>,
    by_source: HashMap<(CreatorId, SourceRef), EntryId>,
    next_id: EntryId,
}

impl LedgerTable {
    pub fn get(&self, id: EntryId) -> Option<&LedgerEntry> {
        self.entries.get(&id)
    }

    fn get_mut(&mut self, id: EntryId) -> Result<&mut LedgerEntry, LedgerError> {
        self.entries
            .get_mut(&id)
            .ok_or(LedgerError::EntryNotFound(id))
    }

    pub fn by_source(&self, creator: CreatorId, source: SourceRef) -> Option<&LedgerEntry> {
        self.by_source
            .get(&(creator, source))
            .and_then(|id| self.entries.get(id))
    }

    pub fn for_creator(&self, creator: CreatorId) -> Vec<LedgerEntry> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.creator == creator)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn all(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Entries a new request for `creator` may include right now.
    pub fn withdrawable(&self, creator: CreatorId, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .filter(|e| {
                e.creator == creator
                    && e.is_claimable()
                    && e.is_clear_at(now)
                    && e.withdrawable().is_positive()
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Create or refresh the entry for `(creator, source)`.
    ///
    /// A smaller views snapshot than the last applied one is stale and
    /// ignored, including when it comes with a new rate. Claimed entries
    /// never decrease.
    pub fn accrue(
        &mut self,
        accrual: Accrual,
        boost_cap: Option<Amount>,
        clearing_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(LedgerEntry, AccrualChange), LedgerError> {
        let Accrual {
            creator,
            source,
            rate,
            views,
        } = accrual;
        if rate.is_negative() {
            return Err(LedgerError::NegativeRate {
                source_ref: source,
                rate,
            });
        }
        let estimate = |views: u64| {
            source
                .estimate_amount(rate, views, boost_cap)
                .ok_or(LedgerError::AmountOverflow {
                    source_ref: source,
                    rate,
                    views,
                })
        };

        let Some(&id) = self.by_source.get(&(creator, source)) else {
            let amount = estimate(views)?;
            self.next_id += 1;
            let id = self.next_id;
            let entry = LedgerEntry {
                id,
                creator,
                source,
                rate,
                views_snapshot: views,
                accrued_amount: amount,
                paid_amount: Amount::ZERO,
                status: LedgerStatus::Accruing,
                claimed_by: None,
                clearing_ends_at: now + clearing_window,
                created_at: now,
                updated_at: now,
                locked_at: None,
                cleared_at: None,
                paid_at: None,
                clawback: None,
            };
            self.entries.insert(id, entry.clone());
            self.by_source.insert((creator, source), id);
            return Ok((entry, AccrualChange::Created));
        };

        let entry = self.get_mut(id)?;
        if matches!(entry.status, LedgerStatus::Paid | LedgerStatus::ClawedBack) {
            debug!(entry = id, status = entry.status.as_str(), "accrual on settled entry ignored");
            return Ok((entry.clone(), AccrualChange::Frozen));
        }
        if views <= entry.views_snapshot && rate == entry.rate {
            if views < entry.views_snapshot {
                warn!(
                    entry = id,
                    previous = entry.views_snapshot,
                    views,
                    "stale views snapshot ignored"
                );
            }
            return Ok((entry.clone(), AccrualChange::Stale));
        }

        let views = entry.views_snapshot.max(views);
        let amount = estimate(views)?;
        entry.views_snapshot = views;
        entry.rate = rate;
        entry.accrued_amount = if entry.claimed_by.is_some() {
            entry.accrued_amount.max(amount)
        } else {
            amount
        };
        entry.updated_at = now;
        Ok((entry.clone(), AccrualChange::Recomputed))
    }

    /// Claim every entry in `ids` for `request`, or none of them.
    pub fn lock_all(
        &mut self,
        ids: &[EntryId],
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut seen = HashSet::with_capacity(ids.len());
        for &id in ids {
            let entry = self.entries.get(&id).ok_or(LedgerError::EntryNotFound(id))?;
            if !seen.insert(id) || entry.claimed_by.is_some() || entry.status == LedgerStatus::Locked {
                return Err(LedgerError::AlreadyLocked(id));
            }
            if !entry.is_claimable() {
                return Err(LedgerError::InvalidTransition {
                    entry: id,
                    from: entry.status,
                    to: LedgerStatus::Locked,
                });
            }
        }

        let mut locked = Vec::with_capacity(ids.len());
        for &id in ids {
            let entry = self.get_mut(id)?;
            entry.status = LedgerStatus::Locked;
            entry.claimed_by = Some(request);
            entry.locked_at = Some(now);
            entry.updated_at = now;
            locked.push(entry.clone());
        }
        Ok(locked)
    }

    /// Give entries held by `request` back to the pool. Entries in any other
    /// state or held by someone else are left alone.
    pub fn release(&mut self, ids: &[EntryId], request: RequestId, now: DateTime<Utc>) -> usize {
        let mut released = 0;
        for id in ids {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            if entry.claimed_by != Some(request)
                || !matches!(entry.status, LedgerStatus::Locked | LedgerStatus::Cleared)
            {
                continue;
            }
            entry.claimed_by = None;
            entry.status = if entry.cleared_at.is_some() || entry.is_clear_at(now) {
                LedgerStatus::Cleared
            } else {
                LedgerStatus::Accruing
            };
            entry.updated_at = now;
            released += 1;
        }
        released
    }

    pub fn mark_cleared(&mut self, id: EntryId, now: DateTime<Utc>) -> Result<LedgerEntry, LedgerError> {
        let entry = self.get_mut(id)?;
        if !matches!(entry.status, LedgerStatus::Accruing | LedgerStatus::Locked) {
            return Err(LedgerError::InvalidTransition {
                entry: id,
                from: entry.status,
                to: LedgerStatus::Cleared,
            });
        }
        if !entry.is_clear_at(now) {
            return Err(LedgerError::ClearingWindowOpen {
                entry: id,
                until: entry.clearing_ends_at,
            });
        }
        entry.status = LedgerStatus::Cleared;
        entry.cleared_at = Some(now);
        entry.updated_at = now;
        Ok(entry.clone())
    }

    /// Promote every entry whose clearing deadline has passed.
    pub fn sweep_cleared(&mut self, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        let mut cleared: Vec<LedgerEntry> = self
            .entries
            .values_mut()
            .filter(|e| {
                matches!(e.status, LedgerStatus::Accruing | LedgerStatus::Locked) && e.is_clear_at(now)
            })
            .map(|e| {
                e.status = LedgerStatus::Cleared;
                e.cleared_at = Some(now);
                e.updated_at = now;
                e.clone()
            })
            .collect();
        cleared.sort_by_key(|e| e.id);
        cleared
    }

    /// Check that each `(entry, amount)` could be marked paid for `request`.
    pub fn check_payable(
        &self,
        payments: &[(EntryId, Amount)],
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        for &(id, amount) in payments {
            let entry = self.entries.get(&id).ok_or(LedgerError::EntryNotFound(id))?;
            if entry.claimed_by != Some(request)
                || !matches!(entry.status, LedgerStatus::Locked | LedgerStatus::Cleared)
            {
                return Err(LedgerError::InvalidTransition {
                    entry: id,
                    from: entry.status,
                    to: LedgerStatus::Paid,
                });
            }
            if !entry.is_clear_at(now) {
                return Err(LedgerError::ClearingWindowOpen {
                    entry: id,
                    until: entry.clearing_ends_at,
                });
            }
            let paid = entry.paid_amount + amount;
            if paid > entry.accrued_amount {
                return Err(LedgerError::PaidExceedsAccrued {
                    entry: id,
                    paid,
                    accrued: entry.accrued_amount,
                });
            }
        }
        Ok(())
    }

    /// Mark every entry paid. Validates the whole set before touching any.
    pub fn mark_paid_all(
        &mut self,
        payments: &[(EntryId, Amount)],
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.check_payable(payments, request, now)?;
        for &(id, amount) in payments {
            let entry = self.get_mut(id)?;
            if entry.status == LedgerStatus::Locked {
                entry.cleared_at = Some(now);
            }
            entry.paid_amount += amount;
            entry.status = LedgerStatus::Paid;
            entry.paid_at = Some(now);
            entry.updated_at = now;
        }
        Ok(())
    }

    /// Reverse an entry. The entry stays in the ledger for audit.
    pub fn clawback(
        &mut self,
        id: EntryId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::MissingReason(id));
        }
        let entry = self.get_mut(id)?;
        if !matches!(
            entry.status,
            LedgerStatus::Locked | LedgerStatus::Cleared | LedgerStatus::Paid
        ) {
            return Err(LedgerError::InvalidTransition {
                entry: id,
                from: entry.status,
                to: LedgerStatus::ClawedBack,
            });
        }
        entry.status = LedgerStatus::ClawedBack;
        entry.clawback = Some(ClawbackNote {
            reason: reason.to_string(),
            at: now,
        });
        entry.updated_at = now;
        Ok(entry.clone())
    }

    /// Push clearing deadlines out to at least `until`, returning the previous
    /// deadline of every entry so the hold can be lifted later.
    pub fn extend_hold(
        &mut self,
        ids: &[EntryId],
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<(EntryId, DateTime<Utc>)> {
        let mut previous = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                previous.push((*id, entry.clearing_ends_at));
                if entry.clearing_ends_at < until {
                    entry.clearing_ends_at = until;
                    entry.updated_at = now;
                }
            }
        }
        previous
    }

    pub fn restore_hold(&mut self, previous: &[(EntryId, DateTime<Utc>)], now: DateTime<Utc>) {
        for (id, deadline) in previous {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.clearing_ends_at = *deadline;
                entry.updated_at = now;
            }
        }
    }
}

/// The ledger repository.
#[derive(Debug, Default)]
pub struct Ledger {
    table: Mutex<LedgerTable>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> MutexGuard<'_, LedgerTable> {
        self.table.lock()
    }

    /// Claim `ids` for `request` as a single compare-and-set.
    pub fn lock(
        &self,
        ids: &[EntryId],
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.table.lock().lock_all(ids, request, now)
    }

    pub fn mark_cleared(&self, id: EntryId, now: DateTime<Utc>) -> Result<LedgerEntry, LedgerError> {
        self.table.lock().mark_cleared(id, now)
    }

    pub fn clawback(
        &self,
        id: EntryId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.table.lock().clawback(id, reason, now)
    }

    pub fn get(&self, id: EntryId) -> Option<LedgerEntry> {
        self.table.lock().get(id).cloned()
    }

    pub fn by_source(&self, creator: CreatorId, source: SourceRef) -> Option<LedgerEntry> {
        self.table.lock().by_source(creator, source).cloned()
    }

    pub fn entries_for(&self, creator: CreatorId) -> Vec<LedgerEntry> {
        self.table.lock().for_creator(creator)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.table.lock().all()
    }

    pub fn withdrawable(&self, creator: CreatorId, now: DateTime<Utc>) -> Vec<LedgerEntry> {
        self.table.lock().withdrawable(creator, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    fn accrual(source: u64, views: u64) -> Accrual {
        Accrual {
            creator: 1,
            source: SourceRef::CampaignVideo(source),
            rate: Amount::from_float(0.01).into(),
            views,
        }
    }

    fn table_with(entries: &[(u64, u64)]) -> LedgerTable {
        let mut table = LedgerTable::default();
        for &(source, views) in entries {
            table
                .accrue(accrual(source, views), None, Duration::hours(1), t0())
                .unwrap();
        }
        table
    }

    #[test]
    fn accrue_creates_then_recomputes() {
        let mut table = LedgerTable::default();
        let (entry, change) = table
            .accrue(accrual(1, 500), None, Duration::hours(1), t0())
            .unwrap();
        assert_eq!(change, AccrualChange::Created);
        assert_eq!(entry.accrued_amount, Amount::from_units(5));
        assert_eq!(entry.clearing_ends_at, t0() + Duration::hours(1));

        let (entry, change) = table
            .accrue(accrual(1, 700), None, Duration::hours(1), t0())
            .unwrap();
        assert_eq!(change, AccrualChange::Recomputed);
        assert_eq!(entry.accrued_amount, Amount::from_units(7));
        assert_eq!(entry.id, 1);
    }

    #[test]
    fn smaller_snapshot_is_stale() {
        let mut table = table_with(&[(1, 700)]);
        let (entry, change) = table
            .accrue(accrual(1, 300), None, Duration::hours(1), t0())
            .unwrap();
        assert_eq!(change, AccrualChange::Stale);
        assert_eq!(entry.accrued_amount, Amount::from_units(7));
        assert_eq!(entry.views_snapshot, 700);
    }

    #[test]
    fn negative_rate_rejected() {
        let mut table = LedgerTable::default();
        let mut bad = accrual(1, 10);
        bad.rate = Amount::from_scaled(-1).into();
        assert!(matches!(
            table.accrue(bad, None, Duration::zero(), t0()),
            Err(LedgerError::NegativeRate { .. })
        ));
    }

    #[test]
    fn rate_change_keeps_larger_snapshot() {
        let mut table = table_with(&[(1, 1_000)]);
        let mut stale = accrual(1, 10);
        stale.rate = Amount::from_float(0.02).into();
        let (entry, change) = table.accrue(stale, None, Duration::hours(1), t0()).unwrap();
        assert_eq!(change, AccrualChange::Recomputed);
        assert_eq!(entry.views_snapshot, 1_000);
        assert_eq!(entry.rate, RateModel::from(Amount::from_float(0.02)));
        assert_eq!(entry.accrued_amount, Amount::from_units(20));
    }

    #[test]
    fn overflowing_accrual_rejected() {
        let mut table = LedgerTable::default();
        assert!(matches!(
            table.accrue(accrual(1, u64::MAX), None, Duration::zero(), t0()),
            Err(LedgerError::AmountOverflow { views: u64::MAX, .. })
        ));
        assert!(table.all().is_empty());

        let mut table = table_with(&[(1, 100)]);
        assert!(matches!(
            table.accrue(accrual(1, u64::MAX), None, Duration::zero(), t0()),
            Err(LedgerError::AmountOverflow { .. })
        ));
        let entry = table.get(1).unwrap();
        assert_eq!(entry.views_snapshot, 100);
        assert_eq!(entry.accrued_amount, Amount::from_units(1));
    }

    #[test]
    fn milestone_entry_fills_in_once() {
        let mut table = LedgerTable::default();
        let milestone = |views| Accrual {
            creator: 1,
            source: SourceRef::ViewBonus(3),
            rate: RateModel::Milestone {
                threshold: 10_000,
                bonus: Amount::from_units(25),
            },
            views,
        };
        let (entry, _) = table.accrue(milestone(4_000), None, Duration::hours(1), t0()).unwrap();
        assert_eq!(entry.accrued_amount, Amount::ZERO);

        let (entry, _) = table.accrue(milestone(12_000), None, Duration::hours(1), t0()).unwrap();
        assert_eq!(entry.accrued_amount, Amount::from_units(25));
        let (entry, _) = table.accrue(milestone(90_000), None, Duration::hours(1), t0()).unwrap();
        assert_eq!(entry.accrued_amount, Amount::from_units(25));
        assert_eq!(table.withdrawable(1, t0() + Duration::hours(1)).len(), 1);
    }

    #[test]
    fn claimed_entry_never_decreases() {
        let mut table = table_with(&[(1, 1_000)]);
        table.lock_all(&[1], 9, t0()).unwrap();

        let mut cheaper = accrual(1, 1_200);
        cheaper.rate = Amount::from_float(0.005).into();
        let (entry, _) = table.accrue(cheaper, None, Duration::hours(1), t0()).unwrap();
        assert_eq!(entry.accrued_amount, Amount::from_units(10));
    }

    #[test]
    fn lock_is_all_or_nothing() {
        let mut table = table_with(&[(1, 100), (2, 100), (3, 100)]);
        table.lock_all(&[2], 7, t0()).unwrap();

        assert_eq!(
            table.lock_all(&[1, 2, 3], 8, t0()),
            Err(LedgerError::AlreadyLocked(2))
        );
        // Nothing from the failed call was claimed
        assert!(table.get(1).unwrap().is_claimable());
        assert!(table.get(3).unwrap().is_claimable());
        assert_eq!(table.get(2).unwrap().claimed_by, Some(7));
    }

    #[test]
    fn lock_rejects_duplicate_ids() {
        let mut table = table_with(&[(1, 100)]);
        assert_eq!(
            table.lock_all(&[1, 1], 7, t0()),
            Err(LedgerError::AlreadyLocked(1))
        );
        assert!(table.get(1).unwrap().is_claimable());
    }

    #[test]
    fn cleared_but_claimed_entry_cannot_be_locked_again() {
        let mut table = table_with(&[(1, 100)]);
        table.lock_all(&[1], 7, t0()).unwrap();
        let later = t0() + Duration::hours(2);
        assert_eq!(table.sweep_cleared(later).len(), 1);
        assert_eq!(table.get(1).unwrap().status, LedgerStatus::Cleared);

        assert_eq!(
            table.lock_all(&[1], 8, later),
            Err(LedgerError::AlreadyLocked(1))
        );
    }

    #[test]
    fn mark_cleared_respects_window() {
        let mut table = table_with(&[(1, 100)]);
        assert!(matches!(
            table.mark_cleared(1, t0()),
            Err(LedgerError::ClearingWindowOpen { .. })
        ));
        let entry = table.mark_cleared(1, t0() + Duration::hours(1)).unwrap();
        assert_eq!(entry.status, LedgerStatus::Cleared);
    }

    #[test]
    fn sweep_is_idempotent() {
        let mut table = table_with(&[(1, 100), (2, 100)]);
        let later = t0() + Duration::hours(1);
        assert_eq!(table.sweep_cleared(later).len(), 2);
        assert!(table.sweep_cleared(later).is_empty());
    }

    #[test]
    fn paid_is_bounded_by_accrued() {
        let mut table = table_with(&[(1, 100)]);
        table.lock_all(&[1], 7, t0()).unwrap();
        let later = t0() + Duration::hours(1);

        let err = table
            .mark_paid_all(&[(1, Amount::from_units(2))], 7, later)
            .unwrap_err();
        assert!(matches!(err, LedgerError::PaidExceedsAccrued { .. }));
        assert_eq!(table.get(1).unwrap().status, LedgerStatus::Locked);

        table.mark_paid_all(&[(1, Amount::from_units(1))], 7, later).unwrap();
        let entry = table.get(1).unwrap();
        assert_eq!(entry.status, LedgerStatus::Paid);
        assert_eq!(entry.paid_amount, Amount::from_units(1));
    }

    #[test]
    fn paid_entries_are_frozen() {
        let mut table = table_with(&[(1, 100)]);
        table.lock_all(&[1], 7, t0()).unwrap();
        let later = t0() + Duration::hours(1);
        table.mark_paid_all(&[(1, Amount::from_units(1))], 7, later).unwrap();

        let (entry, change) = table
            .accrue(accrual(1, 5_000), None, Duration::hours(1), later)
            .unwrap();
        assert_eq!(change, AccrualChange::Frozen);
        assert_eq!(entry.accrued_amount, Amount::from_units(1));
    }

    #[test]
    fn clawback_needs_reason_and_keeps_entry() {
        let mut table = table_with(&[(1, 100)]);
        assert!(matches!(
            table.clawback(1, "fraud", t0()),
            Err(LedgerError::InvalidTransition { .. })
        ));

        table.lock_all(&[1], 7, t0()).unwrap();
        assert_eq!(table.clawback(1, "  ", t0()), Err(LedgerError::MissingReason(1)));

        let entry = table.clawback(1, "bot views", t0()).unwrap();
        assert_eq!(entry.status, LedgerStatus::ClawedBack);
        assert_eq!(entry.clawback.unwrap().reason, "bot views");
        assert!(table.get(1).is_some());
    }

    #[test]
    fn release_returns_entries_to_pool() {
        let mut table = table_with(&[(1, 100), (2, 100)]);
        table.lock_all(&[1, 2], 7, t0()).unwrap();
        assert_eq!(table.release(&[1, 2], 8, t0()), 0);
        assert_eq!(table.release(&[1, 2], 7, t0()), 2);

        let entry = table.get(1).unwrap();
        assert!(entry.is_claimable());
        assert_eq!(entry.status, LedgerStatus::Accruing);
    }

    #[test]
    fn hold_extends_and_restores() {
        let mut table = table_with(&[(1, 100)]);
        table.lock_all(&[1], 7, t0()).unwrap();
        let until = t0() + Duration::hours(48);
        let previous = table.extend_hold(&[1], until, t0());
        assert_eq!(table.get(1).unwrap().clearing_ends_at, until);

        table.restore_hold(&previous, t0());
        assert_eq!(table.get(1).unwrap().clearing_ends_at, t0() + Duration::hours(1));
    }
}
