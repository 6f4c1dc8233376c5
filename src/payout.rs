//! Payout requests: a creator's cleared ledger entries batched into one
//! reviewable withdrawal, with per-item operator edits and an appeal path.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::Amount;
use crate::external::ExternalRef;
use crate::fraud::FraudCheck;
use crate::ledger::LedgerEntry;
use crate::model::{
    ActorId, ApprovalId, CreatorId, EntryId, FlagId, IdempotencyKey, ItemId, PayoutMethod,
    RequestId, SourceRef,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayoutError {
    #[error("payout request {0} not found")]
    RequestNotFound(RequestId),

    #[error("payout item {0} not found")]
    ItemNotFound(ItemId),

    #[error("creator {0} has nothing to withdraw")]
    NothingToWithdraw(CreatorId),

    #[error("withdrawable total for creator {0} overflows")]
    TotalOverflow(CreatorId),

    #[error("total {total} is below the minimum withdrawal of {minimum}")]
    MinimumNotMet { total: Amount, minimum: Amount },

    #[error("withdrawal of {amount} not permitted for creator {creator}")]
    WithdrawalNotPermitted { creator: CreatorId, amount: Amount },

    #[error("payout request {request} is {status:?}, cannot {action}")]
    InvalidState {
        request: RequestId,
        status: PayoutStatus,
        action: &'static str,
    },

    #[error("payout item {0} is not locked")]
    ItemNotLocked(ItemId),

    #[error("payout item {item}: override {amount} exceeds original {original}")]
    OverrideExceedsOriginal {
        item: ItemId,
        amount: Amount,
        original: Amount,
    },

    #[error("payout item {0}: override must not be negative")]
    NegativeOverride(ItemId),

    #[error("a reason is required")]
    EmptyReason,

    #[error("payout item {0} is not flagged")]
    NotFlagged(ItemId),

    #[error("payout request {request} does not belong to creator {creator}")]
    NotOwner {
        request: RequestId,
        creator: CreatorId,
    },

    #[error("payout request {0} was already appealed")]
    AppealAlreadyFiled(RequestId),

    #[error("payout request {request} appeal window closed at {deadline}")]
    AppealWindowClosed {
        request: RequestId,
        deadline: DateTime<Utc>,
    },

    #[error("payout request {0} was rejected for confirmed fraud")]
    FraudRejected(RequestId),

    #[error("payout request {0} has no payable amount")]
    NothingPayable(RequestId),

    #[error("payout with idempotency key {0} is already in flight")]
    InFlight(IdempotencyKey),

    #[error("idempotency key {0} was already used for another payout request")]
    KeyReused(IdempotencyKey),

    #[error("no external payout with reference {0}")]
    UnknownReference(ExternalRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    Completed,
    Appealed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::UnderReview => "under_review",
            PayoutStatus::Approved => "approved",
            PayoutStatus::Rejected => "rejected",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Appealed => "appealed",
        }
    }

    fn can_become(self, next: PayoutStatus) -> bool {
        use PayoutStatus::*;
        matches!(
            (self, next),
            (Pending, UnderReview)
                | (Pending | UnderReview, Approved)
                | (Pending | UnderReview | Approved, Rejected)
                | (Approved, Completed)
                | (Rejected, Appealed)
                | (Appealed, Approved | Rejected)
        )
    }

    /// Operators may still edit items.
    pub fn is_reviewable(self) -> bool {
        matches!(self, PayoutStatus::Pending | PayoutStatus::UnderReview)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Approved,
    Flagged,
    Overridden,
    Completed,
    /// Excluded from the payout; its entry went back to the pool.
    Released,
    ClawedBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFlag {
    pub reason: String,
    pub by: ActorId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOverride {
    pub amount: Amount,
    pub reason: String,
    pub by: ActorId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemClawback {
    pub flag: Option<FlagId>,
    pub amount: Amount,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutItem {
    pub id: ItemId,
    pub request: RequestId,
    pub entry: EntryId,
    pub source: SourceRef,
    /// Amount snapshotted when the request was created.
    pub amount: Amount,
    pub original_amount: Amount,
    pub views_at_request: u64,
    pub is_locked: bool,
    pub status: ItemStatus,
    pub flag: Option<ItemFlag>,
    #[serde(rename = "override")]
    pub override_: Option<ItemOverride>,
    pub clawback: Option<ItemClawback>,
}

impl PayoutItem {
    /// What this item contributes to the payout right now.
    pub fn payable(&self) -> Amount {
        if self.flag.is_some() {
            return Amount::ZERO;
        }
        self.override_
            .as_ref()
            .map(|o| o.amount)
            .unwrap_or(self.amount)
    }

    fn review_status(&self) -> ItemStatus {
        if self.flag.is_some() {
            ItemStatus::Flagged
        } else if self.override_.is_some() {
            ItemStatus::Overridden
        } else {
            ItemStatus::Pending
        }
    }
}

/// Audit delta left by an operator edit; the request total never moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutAdjustment {
    pub item: ItemId,
    pub from: Amount,
    pub to: Amount,
    pub reason: String,
    pub by: ActorId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealOutcome {
    Reinstated,
    Upheld,
    /// Nobody resolved it before the deadline.
    Lapsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppealResolution {
    pub outcome: AppealOutcome,
    pub by: Option<ActorId>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Appeal {
    pub evidence: String,
    pub filed_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub resolution: Option<AppealResolution>,
}

/// Fraud hold on a request, with what is needed to lift it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hold {
    pub flags: Vec<FlagId>,
    pub previous_deadline: DateTime<Utc>,
    pub entry_deadlines: Vec<(EntryId, DateTime<Utc>)>,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from: PayoutStatus,
    pub to: PayoutStatus,
    pub by: Option<ActorId>,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SettlementStatus {
    Settled,
    PendingExternal { reference: ExternalRef },
}

/// Outcome of paying out a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutSettlement {
    pub request: RequestId,
    pub creator: CreatorId,
    pub amount: Amount,
    pub status: SettlementStatus,
    pub key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutRequest {
    pub id: RequestId,
    pub creator: CreatorId,
    /// Sum of item amounts at creation. Never recomputed.
    pub total_amount: Amount,
    pub items: Vec<PayoutItem>,
    pub views_snapshot: u64,
    pub clearing_ends_at: DateTime<Utc>,
    pub status: PayoutStatus,
    pub method: PayoutMethod,
    pub fraud_check: Option<FraudCheck>,
    pub hold: Option<Hold>,
    pub appeal: Option<Appeal>,
    /// Approval currently gating this request.
    pub approval: Option<ApprovalId>,
    pub adjustments: Vec<PayoutAdjustment>,
    pub external_ref: Option<ExternalRef>,
    pub rail_failures: Vec<String>,
    pub rejection_reason: Option<String>,
    /// Confirmed fraud flag that froze this request.
    pub frozen_by: Option<FlagId>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PayoutRequest {
    pub fn payable_total(&self) -> Amount {
        self.items.iter().map(PayoutItem::payable).sum()
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.items.iter().map(|i| i.entry).collect()
    }

    /// `(entry, amount)` pairs that will be paid, excluding flagged items.
    pub fn payments(&self) -> Vec<(EntryId, Amount)> {
        self.items
            .iter()
            .filter(|i| i.payable().is_positive())
            .map(|i| (i.entry, i.payable()))
            .collect()
    }

    /// Entries of flagged items, given back to the pool at completion.
    pub fn excluded_entries(&self) -> Vec<EntryId> {
        self.items
            .iter()
            .filter(|i| !i.payable().is_positive())
            .map(|i| i.entry)
            .collect()
    }

    pub fn item(&self, id: ItemId) -> Option<&PayoutItem> {
        self.items.iter().find(|i| i.id == id)
    }

    fn item_mut(&mut self, id: ItemId) -> Result<&mut PayoutItem, PayoutError> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(PayoutError::ItemNotFound(id))
    }

    fn ensure(&self, status_ok: bool, action: &'static str) -> Result<(), PayoutError> {
        if status_ok {
            Ok(())
        } else {
            Err(PayoutError::InvalidState {
                request: self.id,
                status: self.status,
                action,
            })
        }
    }

    /// Move to `next`, recording the change. Invalid moves leave the request untouched.
    pub fn transition(
        &mut self,
        next: PayoutStatus,
        by: Option<ActorId>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PayoutError> {
        self.ensure(self.status.can_become(next), next.as_str())?;
        self.history.push(StatusChange {
            from: self.status,
            to: next,
            by,
            note,
            at: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Items lose their review state once the request is approved.
    pub fn approve_items(&mut self) {
        for item in &mut self.items {
            if item.status == ItemStatus::Pending {
                item.status = ItemStatus::Approved;
            }
        }
    }

    /// Mark paid items completed and flagged ones released.
    pub fn complete_items(&mut self, now: DateTime<Utc>) {
        for item in &mut self.items {
            item.status = if item.payable().is_positive() {
                ItemStatus::Completed
            } else {
                ItemStatus::Released
            };
            item.is_locked = false;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Record a clawback on the completed item paying `entry`.
    pub fn claw_back_entry(
        &mut self,
        entry: EntryId,
        flag: Option<FlagId>,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Option<ItemId> {
        let item = self
            .items
            .iter_mut()
            .find(|i| i.entry == entry && i.status == ItemStatus::Completed)?;
        item.status = ItemStatus::ClawedBack;
        item.clawback = Some(ItemClawback { flag, amount, at: now });
        self.updated_at = now;
        Some(item.id)
    }

    /// Record a clawback on every item that had not been clawed back yet.
    /// Returns `(entry, amount)` for each item affected.
    pub fn claw_back_items(
        &mut self,
        flag: Option<FlagId>,
        now: DateTime<Utc>,
    ) -> Vec<(EntryId, Amount)> {
        let mut reversed = Vec::new();
        for item in &mut self.items {
            if matches!(item.status, ItemStatus::Released | ItemStatus::ClawedBack) {
                continue;
            }
            let amount = item.payable();
            if !amount.is_positive() {
                continue;
            }
            item.status = ItemStatus::ClawedBack;
            item.is_locked = false;
            item.clawback = Some(ItemClawback { flag, amount, at: now });
            reversed.push((item.entry, amount));
        }
        self.updated_at = now;
        reversed
    }
}

/// Build a request from entries already locked for it.
pub fn request_from_locked(
    id: RequestId,
    creator: CreatorId,
    entries: &[LedgerEntry],
    method: PayoutMethod,
    next_item: &mut impl FnMut() -> ItemId,
    now: DateTime<Utc>,
) -> PayoutRequest {
    let items: Vec<PayoutItem> = entries
        .iter()
        .map(|entry| PayoutItem {
            id: next_item(),
            request: id,
            entry: entry.id,
            source: entry.source,
            amount: entry.withdrawable(),
            original_amount: entry.withdrawable(),
            views_at_request: entry.views_snapshot,
            is_locked: true,
            status: ItemStatus::Pending,
            flag: None,
            override_: None,
            clawback: None,
        })
        .collect();
    let clearing_ends_at = entries
        .iter()
        .map(|e| e.clearing_ends_at)
        .max()
        .unwrap_or(now);

    PayoutRequest {
        id,
        creator,
        total_amount: items.iter().map(|i| i.amount).sum(),
        views_snapshot: items.iter().map(|i| i.views_at_request).sum(),
        items,
        clearing_ends_at,
        status: PayoutStatus::Pending,
        method,
        fraud_check: None,
        hold: None,
        appeal: None,
        approval: None,
        adjustments: Vec::new(),
        external_ref: None,
        rail_failures: Vec::new(),
        rejection_reason: None,
        frozen_by: None,
        history: Vec::new(),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

#[derive(Debug, Default)]
pub struct PayoutTable {
    requests: HashMap<RequestId, PayoutRequest>,
    item_index: HashMap<ItemId, RequestId>,
    by_reference: HashMap<ExternalRef, RequestId>,
    next_request: RequestId,
    next_item: ItemId,
}

impl PayoutTable {
    pub fn reserve_id(&mut self) -> RequestId {
        self.next_request += 1;
        self.next_request
    }

    pub fn build(
        &mut self,
        id: RequestId,
        creator: CreatorId,
        entries: &[LedgerEntry],
        method: PayoutMethod,
        now: DateTime<Utc>,
    ) -> PayoutRequest {
        let mut next_item = self.next_item;
        let request = request_from_locked(
            id,
            creator,
            entries,
            method,
            &mut || {
                next_item += 1;
                next_item
            },
            now,
        );
        self.next_item = next_item;
        request
    }

    pub fn insert(&mut self, request: PayoutRequest) {
        for item in &request.items {
            self.item_index.insert(item.id, request.id);
        }
        self.requests.insert(request.id, request);
    }

    pub fn get(&self, id: RequestId) -> Result<&PayoutRequest, PayoutError> {
        self.requests.get(&id).ok_or(PayoutError::RequestNotFound(id))
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut PayoutRequest, PayoutError> {
        self.requests
            .get_mut(&id)
            .ok_or(PayoutError::RequestNotFound(id))
    }

    pub fn request_of(&self, item: ItemId) -> Result<RequestId, PayoutError> {
        self.item_index
            .get(&item)
            .copied()
            .ok_or(PayoutError::ItemNotFound(item))
    }

    pub fn by_reference(&self, reference: &ExternalRef) -> Result<RequestId, PayoutError> {
        self.by_reference
            .get(reference)
            .copied()
            .ok_or_else(|| PayoutError::UnknownReference(reference.clone()))
    }

    pub fn record_reference(&mut self, request: RequestId, reference: ExternalRef) -> Result<(), PayoutError> {
        self.get_mut(request)?.external_ref = Some(reference.clone());
        self.by_reference.insert(reference, request);
        Ok(())
    }

    pub fn clear_reference(&mut self, request: RequestId) -> Result<Option<ExternalRef>, PayoutError> {
        let reference = self.get_mut(request)?.external_ref.take();
        if let Some(reference) = &reference {
            self.by_reference.remove(reference);
        }
        Ok(reference)
    }

    fn editable_item(&mut self, item: ItemId) -> Result<&mut PayoutItem, PayoutError> {
        let request = self.request_of(item)?;
        let request = self.get_mut(request)?;
        request.ensure(request.status.is_reviewable(), "edit items")?;
        let target = request.item_mut(item)?;
        if !target.is_locked {
            return Err(PayoutError::ItemNotLocked(item));
        }
        Ok(target)
    }

    pub fn flag_item(
        &mut self,
        item: ItemId,
        by: ActorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutItem, PayoutError> {
        if reason.trim().is_empty() {
            return Err(PayoutError::EmptyReason);
        }
        let target = self.editable_item(item)?;
        let from = target.payable();
        target.flag = Some(ItemFlag {
            reason: reason.to_string(),
            by,
            at: now,
        });
        target.status = target.review_status();
        let updated = target.clone();
        self.adjust(&updated, from, reason, by, now)?;
        Ok(updated)
    }

    pub fn unflag_item(
        &mut self,
        item: ItemId,
        by: ActorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutItem, PayoutError> {
        if reason.trim().is_empty() {
            return Err(PayoutError::EmptyReason);
        }
        let target = self.editable_item(item)?;
        if target.flag.is_none() {
            return Err(PayoutError::NotFlagged(item));
        }
        let from = target.payable();
        target.flag = None;
        target.status = target.review_status();
        let updated = target.clone();
        self.adjust(&updated, from, reason, by, now)?;
        Ok(updated)
    }

    /// Replace the payable amount of an item. Overrides never exceed the
    /// amount snapshotted at request time.
    pub fn override_item(
        &mut self,
        item: ItemId,
        by: ActorId,
        amount: Amount,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutItem, PayoutError> {
        if reason.trim().is_empty() {
            return Err(PayoutError::EmptyReason);
        }
        if amount.is_negative() {
            return Err(PayoutError::NegativeOverride(item));
        }
        let target = self.editable_item(item)?;
        if amount > target.original_amount {
            return Err(PayoutError::OverrideExceedsOriginal {
                item,
                amount,
                original: target.original_amount,
            });
        }
        let from = target.payable();
        target.override_ = Some(ItemOverride {
            amount,
            reason: reason.to_string(),
            by,
            at: now,
        });
        target.status = target.review_status();
        let updated = target.clone();
        self.adjust(&updated, from, reason, by, now)?;
        Ok(updated)
    }

    fn adjust(
        &mut self,
        item: &PayoutItem,
        from: Amount,
        reason: &str,
        by: ActorId,
        now: DateTime<Utc>,
    ) -> Result<(), PayoutError> {
        let request = self.get_mut(item.request)?;
        request.adjustments.push(PayoutAdjustment {
            item: item.id,
            from,
            to: item.payable(),
            reason: reason.to_string(),
            by,
            at: now,
        });
        request.updated_at = now;
        Ok(())
    }

    pub fn file_appeal(
        &mut self,
        id: RequestId,
        creator: CreatorId,
        evidence: &str,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, PayoutError> {
        if evidence.trim().is_empty() {
            return Err(PayoutError::EmptyReason);
        }
        let request = self.get_mut(id)?;
        if request.creator != creator {
            return Err(PayoutError::NotOwner { request: id, creator });
        }
        if request.appeal.is_some() {
            return Err(PayoutError::AppealAlreadyFiled(id));
        }
        if request.frozen_by.is_some() {
            return Err(PayoutError::FraudRejected(id));
        }
        request.transition(PayoutStatus::Appealed, Some(creator), Some(evidence.to_string()), now)?;
        request.appeal = Some(Appeal {
            evidence: evidence.to_string(),
            filed_at: now,
            deadline,
            resolution: None,
        });
        Ok(request.clone())
    }

    /// Close an open appeal. Reinstating is only allowed before the deadline.
    pub fn resolve_appeal(
        &mut self,
        id: RequestId,
        outcome: AppealOutcome,
        by: Option<ActorId>,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, PayoutError> {
        let request = self.get_mut(id)?;
        request.ensure(request.status == PayoutStatus::Appealed, "resolve appeal")?;
        let deadline = request
            .appeal
            .as_ref()
            .map(|a| a.deadline)
            .unwrap_or(now);
        if outcome == AppealOutcome::Reinstated && now > deadline {
            return Err(PayoutError::AppealWindowClosed { request: id, deadline });
        }
        let next = match outcome {
            AppealOutcome::Reinstated => PayoutStatus::Approved,
            AppealOutcome::Upheld | AppealOutcome::Lapsed => PayoutStatus::Rejected,
        };
        request.transition(next, by, Some(format!("appeal {outcome:?}").to_lowercase()), now)?;
        if let Some(appeal) = request.appeal.as_mut() {
            appeal.resolution = Some(AppealResolution { outcome, by, at: now });
        }
        Ok(request.clone())
    }

    /// Appeals whose deadline passed without a resolution.
    pub fn lapsed_appeals(&self, now: DateTime<Utc>) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .requests
            .values()
            .filter(|r| {
                r.status == PayoutStatus::Appealed
                    && r.appeal.as_ref().is_some_and(|a| a.deadline <= now)
            })
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn for_creator(&self, creator: CreatorId) -> Vec<PayoutRequest> {
        let mut requests: Vec<_> = self
            .requests
            .values()
            .filter(|r| r.creator == creator)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.id);
        requests
    }
}

/// The payout request repository.
#[derive(Debug, Default)]
pub struct PayoutBook {
    table: Mutex<PayoutTable>,
}

impl PayoutBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> MutexGuard<'_, PayoutTable> {
        self.table.lock()
    }

    pub fn get(&self, id: RequestId) -> Option<PayoutRequest> {
        self.table.lock().get(id).ok().cloned()
    }

    pub fn for_creator(&self, creator: CreatorId) -> Vec<PayoutRequest> {
        self.table.lock().for_creator(creator)
    }

    pub fn history(&self, id: RequestId) -> Vec<StatusChange> {
        self.get(id).map(|r| r.history).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Accrual, LedgerTable};
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    fn units(n: i64) -> Amount {
        Amount::from_units(n)
    }

    /// A pending request with two items worth $4 and $6.
    fn table_with_request() -> (PayoutTable, RequestId) {
        let mut ledger = LedgerTable::default();
        for (source, views) in [(1, 400), (2, 600)] {
            ledger
                .accrue(
                    Accrual {
                        creator: 1,
                        source: SourceRef::CampaignVideo(source),
                        rate: Amount::from_float(0.01).into(),
                        views,
                    },
                    None,
                    Duration::zero(),
                    t0(),
                )
                .unwrap();
        }
        let mut table = PayoutTable::default();
        let id = table.reserve_id();
        let locked = ledger.lock_all(&[1, 2], id, t0()).unwrap();
        let request = table.build(id, 1, &locked, PayoutMethod::Wallet, t0());
        table.insert(request);
        (table, id)
    }

    #[test]
    fn request_snapshots_items_and_total() {
        let (table, id) = table_with_request();
        let request = table.get(id).unwrap();
        assert_eq!(request.total_amount, units(10));
        assert_eq!(request.items.len(), 2);
        assert_eq!(request.views_snapshot, 1_000);
        assert!(request.items.iter().all(|i| i.is_locked));
        assert_eq!(table.request_of(request.items[1].id).unwrap(), id);
    }

    #[test]
    fn override_is_clamped_to_original_and_total_is_kept() {
        let (mut table, id) = table_with_request();
        let item = table.get(id).unwrap().items[1].id;

        assert!(matches!(
            table.override_item(item, 9, units(7), "bonus", t0()),
            Err(PayoutError::OverrideExceedsOriginal { .. })
        ));
        table.override_item(item, 9, units(2), "partial bot views", t0()).unwrap();

        let request = table.get(id).unwrap();
        assert_eq!(request.total_amount, units(10));
        assert_eq!(request.payable_total(), units(6));
        assert_eq!(request.adjustments.len(), 1);
        assert_eq!(request.adjustments[0].from, units(6));
        assert_eq!(request.adjustments[0].to, units(2));
        assert_eq!(request.item(item).unwrap().original_amount, units(6));
        assert_eq!(request.item(item).unwrap().status, ItemStatus::Overridden);
    }

    #[test]
    fn flag_and_unflag_move_payable() {
        let (mut table, id) = table_with_request();
        let item = table.get(id).unwrap().items[0].id;

        assert_eq!(table.flag_item(item, 9, "", t0()), Err(PayoutError::EmptyReason));
        table.flag_item(item, 9, "duplicate upload", t0()).unwrap();
        let request = table.get(id).unwrap();
        assert_eq!(request.payable_total(), units(6));
        assert_eq!(request.excluded_entries(), vec![1]);

        table.unflag_item(item, 9, "false positive", t0()).unwrap();
        assert_eq!(table.get(id).unwrap().payable_total(), units(10));
        assert_eq!(
            table.unflag_item(item, 9, "again", t0()),
            Err(PayoutError::NotFlagged(item))
        );
    }

    #[test]
    fn edits_blocked_after_approval() {
        let (mut table, id) = table_with_request();
        let item = table.get(id).unwrap().items[0].id;
        table
            .get_mut(id)
            .unwrap()
            .transition(PayoutStatus::Approved, Some(9), None, t0())
            .unwrap();

        assert!(matches!(
            table.flag_item(item, 9, "late", t0()),
            Err(PayoutError::InvalidState { .. })
        ));
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let (mut table, id) = table_with_request();
        let request = table.get_mut(id).unwrap();
        assert!(request.transition(PayoutStatus::Completed, None, None, t0()).is_err());
        assert!(request.transition(PayoutStatus::Appealed, None, None, t0()).is_err());
        assert_eq!(request.status, PayoutStatus::Pending);
        assert!(request.history.is_empty());
    }

    #[test]
    fn appeal_only_from_rejected_and_only_once() {
        let (mut table, id) = table_with_request();
        let deadline = t0() + Duration::hours(72);
        assert!(matches!(
            table.file_appeal(id, 1, "proof", deadline, t0()),
            Err(PayoutError::InvalidState { .. })
        ));

        table
            .get_mut(id)
            .unwrap()
            .transition(PayoutStatus::Rejected, Some(9), None, t0())
            .unwrap();
        assert_eq!(
            table.file_appeal(id, 2, "proof", deadline, t0()),
            Err(PayoutError::NotOwner { request: id, creator: 2 })
        );
        table.file_appeal(id, 1, "analytics export", deadline, t0()).unwrap();

        let resolved = table
            .resolve_appeal(id, AppealOutcome::Upheld, Some(9), t0())
            .unwrap();
        assert_eq!(resolved.status, PayoutStatus::Rejected);
        assert_eq!(
            table.file_appeal(id, 1, "more", deadline, t0()),
            Err(PayoutError::AppealAlreadyFiled(id))
        );
    }

    #[test]
    fn appeals_lapse_after_deadline() {
        let (mut table, id) = table_with_request();
        let deadline = t0() + Duration::hours(72);
        table
            .get_mut(id)
            .unwrap()
            .transition(PayoutStatus::Rejected, None, None, t0())
            .unwrap();
        table.file_appeal(id, 1, "proof", deadline, t0()).unwrap();

        assert!(table.lapsed_appeals(t0()).is_empty());
        assert_eq!(table.lapsed_appeals(deadline), vec![id]);
        assert!(matches!(
            table.resolve_appeal(id, AppealOutcome::Reinstated, Some(9), deadline + Duration::seconds(1)),
            Err(PayoutError::AppealWindowClosed { .. })
        ));
    }

    #[test]
    fn completion_releases_flagged_items() {
        let (mut table, id) = table_with_request();
        let flagged = table.get(id).unwrap().items[0].id;
        table.flag_item(flagged, 9, "bots", t0()).unwrap();

        let request = table.get_mut(id).unwrap();
        assert_eq!(request.payments(), vec![(2, units(6))]);
        request.complete_items(t0());
        assert_eq!(request.items[0].status, ItemStatus::Released);
        assert_eq!(request.items[1].status, ItemStatus::Completed);

        let reversed = request.claw_back_items(Some(3), t0());
        assert_eq!(reversed, vec![(2, units(6))]);
        assert!(request.claw_back_items(Some(3), t0()).is_empty());
    }
}
