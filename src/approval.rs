//! N-of-M operator approval of payouts and ad-hoc transfers.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::Amount;
use crate::config::RejectPolicy;
use crate::model::{AccountId, ActorId, ApprovalId, Decision, IdempotencyKey, RequestId};
use crate::payout::PayoutSettlement;
use crate::wallet::TransferReceipt;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(ApprovalId),

    #[error("approval {0} has expired")]
    Expired(ApprovalId),

    #[error("approval {id} is already {status:?}")]
    AlreadyDecided { id: ApprovalId, status: ApprovalStatus },

    #[error("approval {id} is {status:?}, not approved")]
    NotApproved { id: ApprovalId, status: ApprovalStatus },

    #[error("actor {voter} may not vote on approval {id}")]
    NotEligible { id: ApprovalId, voter: ActorId },

    #[error("payout request {0} already has a live approval")]
    AlreadyOpen(RequestId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Executed => "executed",
            ApprovalStatus::Expired => "expired",
        }
    }
}

/// An ad-hoc wallet movement waiting for consent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOrder {
    pub from: AccountId,
    pub to: AccountId,
    pub gross: Amount,
    pub fee: Amount,
    pub key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalSubject {
    Payout { request: RequestId },
    Transfer(TransferOrder),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalVote {
    pub voter: ActorId,
    pub decision: Decision,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferResult {
    Payout(PayoutSettlement),
    Transfer(TransferReceipt),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub subject: ApprovalSubject,
    pub amount: Amount,
    pub currency: String,
    pub required: u8,
    /// One vote per voter; a second vote replaces the first.
    pub votes: BTreeMap<ActorId, ApprovalVote>,
    pub status: ApprovalStatus,
    pub requested_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub executed_by: Option<ActorId>,
    pub executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<TransferResult>,
}

impl ApprovalRequest {
    pub fn approvals(&self) -> usize {
        self.count(Decision::Approve)
    }

    pub fn rejections(&self) -> usize {
        self.count(Decision::Reject)
    }

    fn count(&self, decision: Decision) -> usize {
        self.votes.values().filter(|v| v.decision == decision).count()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn payout_request(&self) -> Option<RequestId> {
        match self.subject {
            ApprovalSubject::Payout { request } => Some(request),
            ApprovalSubject::Transfer(_) => None,
        }
    }

    /// Status implied by the current votes. Depends only on the vote set.
    fn tally(&self, policy: RejectPolicy) -> ApprovalStatus {
        let rejected = match policy {
            RejectPolicy::Veto => self.rejections() >= 1,
            RejectPolicy::Threshold(n) => self.rejections() >= usize::from(n),
        };
        if rejected {
            ApprovalStatus::Rejected
        } else if self.approvals() >= usize::from(self.required) {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        }
    }
}

/// Parameters for a new approval.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub subject: ApprovalSubject,
    pub amount: Amount,
    pub currency: String,
    pub required: u8,
    pub requested_by: ActorId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ApprovalTable {
    approvals: HashMap<ApprovalId, ApprovalRequest>,
    next_id: ApprovalId,
}

impl ApprovalTable {
    pub fn get(&self, id: ApprovalId) -> Result<&ApprovalRequest, ApprovalError> {
        self.approvals.get(&id).ok_or(ApprovalError::NotFound(id))
    }

    fn get_mut(&mut self, id: ApprovalId) -> Result<&mut ApprovalRequest, ApprovalError> {
        self.approvals.get_mut(&id).ok_or(ApprovalError::NotFound(id))
    }

    pub fn open(&mut self, new: NewApproval, now: DateTime<Utc>) -> ApprovalRequest {
        self.next_id += 1;
        let approval = ApprovalRequest {
            id: self.next_id,
            subject: new.subject,
            amount: new.amount,
            currency: new.currency,
            required: new.required.max(1),
            votes: BTreeMap::new(),
            status: ApprovalStatus::Pending,
            requested_by: new.requested_by,
            created_at: now,
            expires_at: new.expires_at,
            decided_at: None,
            executed_by: None,
            executed_at: None,
            last_error: None,
            result: None,
        };
        self.approvals.insert(approval.id, approval.clone());
        approval
    }

    /// Upsert `voter`'s vote and recompute the status.
    ///
    /// Returns the approval and the status it moved to, if it moved.
    pub fn vote(
        &mut self,
        id: ApprovalId,
        vote: ApprovalVote,
        policy: RejectPolicy,
        now: DateTime<Utc>,
    ) -> Result<(ApprovalRequest, Option<ApprovalStatus>), ApprovalError> {
        let approval = self.get_mut(id)?;
        match approval.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Expired => return Err(ApprovalError::Expired(id)),
            status => return Err(ApprovalError::AlreadyDecided { id, status }),
        }
        // Past the deadline but not swept yet; the sweep moves it
        if approval.is_expired_at(now) {
            return Err(ApprovalError::Expired(id));
        }
        if vote.voter == approval.requested_by {
            return Err(ApprovalError::NotEligible {
                id,
                voter: vote.voter,
            });
        }

        approval.votes.insert(vote.voter, vote);
        let next = approval.tally(policy);
        if next == approval.status {
            return Ok((approval.clone(), None));
        }
        approval.status = next;
        approval.decided_at = Some(now);
        Ok((approval.clone(), Some(next)))
    }

    /// The approval, if it may be executed now.
    pub fn executable(&self, id: ApprovalId) -> Result<&ApprovalRequest, ApprovalError> {
        let approval = self.get(id)?;
        if approval.status != ApprovalStatus::Approved {
            return Err(ApprovalError::NotApproved {
                id,
                status: approval.status,
            });
        }
        Ok(approval)
    }

    pub fn mark_executed(
        &mut self,
        id: ApprovalId,
        executor: Option<ActorId>,
        result: TransferResult,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let approval = self.get_mut(id)?;
        if approval.status != ApprovalStatus::Approved {
            return Err(ApprovalError::NotApproved {
                id,
                status: approval.status,
            });
        }
        approval.status = ApprovalStatus::Executed;
        if executor.is_some() {
            approval.executed_by = executor;
        }
        approval.executed_at = Some(now);
        approval.last_error = None;
        approval.result = Some(result);
        Ok(approval.clone())
    }

    /// Keep the approval `approved` and remember why execution failed.
    pub fn record_failure(
        &mut self,
        id: ApprovalId,
        executor: Option<ActorId>,
        error: &str,
    ) -> Result<(), ApprovalError> {
        let approval = self.get_mut(id)?;
        if executor.is_some() {
            approval.executed_by = executor;
        }
        approval.last_error = Some(error.to_string());
        Ok(())
    }

    /// Remember an in-flight result while the approval waits for settlement.
    pub fn record_pending(
        &mut self,
        id: ApprovalId,
        executor: ActorId,
        result: TransferResult,
    ) -> Result<(), ApprovalError> {
        let approval = self.get_mut(id)?;
        approval.executed_by = Some(executor);
        approval.last_error = None;
        approval.result = Some(result);
        Ok(())
    }

    /// Expire every pending approval past its deadline.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let mut expired: Vec<ApprovalRequest> = self
            .approvals
            .values_mut()
            .filter(|a| a.status == ApprovalStatus::Pending && a.is_expired_at(now))
            .map(|a| {
                a.status = ApprovalStatus::Expired;
                a.decided_at = Some(now);
                a.clone()
            })
            .collect();
        expired.sort_by_key(|a| a.id);
        expired
    }

    /// Pending, unexpired approvals `operator` has not voted on yet.
    pub fn pending_for(&self, operator: ActorId, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .approvals
            .values()
            .filter(|a| {
                a.status == ApprovalStatus::Pending
                    && !a.is_expired_at(now)
                    && a.requested_by != operator
                    && !a.votes.contains_key(&operator)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.id);
        pending
    }
}

/// The approval repository.
#[derive(Debug, Default)]
pub struct ApprovalBook {
    table: Mutex<ApprovalTable>,
}

impl ApprovalBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> MutexGuard<'_, ApprovalTable> {
        self.table.lock()
    }

    pub fn get(&self, id: ApprovalId) -> Option<ApprovalRequest> {
        self.table.lock().get(id).ok().cloned()
    }

    pub fn pending_for(&self, operator: ActorId, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        self.table.lock().pending_for(operator, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    fn open(table: &mut ApprovalTable, required: u8) -> ApprovalId {
        table
            .open(
                NewApproval {
                    subject: ApprovalSubject::Payout { request: 1 },
                    amount: Amount::from_units(500),
                    currency: "USD".into(),
                    required,
                    requested_by: 1,
                    expires_at: t0() + Duration::hours(24),
                },
                t0(),
            )
            .id
    }

    fn vote(voter: ActorId, decision: Decision) -> ApprovalVote {
        ApprovalVote {
            voter,
            decision,
            comment: None,
            at: t0(),
        }
    }

    #[test]
    fn reaches_approved_at_threshold() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 2);

        let (_, moved) = table.vote(id, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();
        assert_eq!(moved, None);
        let (approval, moved) = table.vote(id, vote(11, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();
        assert_eq!(moved, Some(ApprovalStatus::Approved));
        assert_eq!(approval.approvals(), 2);
    }

    #[test]
    fn revote_overwrites_instead_of_counting_twice() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 2);

        table.vote(id, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();
        let (approval, moved) = table.vote(id, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();
        assert_eq!(moved, None);
        assert_eq!(approval.votes.len(), 1);
        assert_eq!(approval.status, ApprovalStatus::Pending);
    }

    #[test]
    fn veto_rejects_on_first_reject() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 2);
        table.vote(id, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();
        let (_, moved) = table.vote(id, vote(11, Decision::Reject), RejectPolicy::Veto, t0()).unwrap();
        assert_eq!(moved, Some(ApprovalStatus::Rejected));
    }

    #[test]
    fn threshold_policy_needs_enough_rejects() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 3);
        let policy = RejectPolicy::Threshold(2);
        let (_, moved) = table.vote(id, vote(10, Decision::Reject), policy, t0()).unwrap();
        assert_eq!(moved, None);
        let (_, moved) = table.vote(id, vote(11, Decision::Reject), policy, t0()).unwrap();
        assert_eq!(moved, Some(ApprovalStatus::Rejected));
    }

    #[test]
    fn tally_does_not_depend_on_vote_order() {
        let votes = [
            vote(10, Decision::Approve),
            vote(11, Decision::Reject),
            vote(11, Decision::Approve),
        ];
        let policy = RejectPolicy::Threshold(2);

        let mut forward = ApprovalTable::default();
        let a = open(&mut forward, 3);
        for v in votes.iter().cloned() {
            forward.vote(a, v, policy, t0()).unwrap();
        }

        let mut backward = ApprovalTable::default();
        let b = open(&mut backward, 3);
        for v in [votes[0].clone(), votes[2].clone()] {
            backward.vote(b, v, policy, t0()).unwrap();
        }

        let forward = forward.get(a).unwrap();
        let backward = backward.get(b).unwrap();
        assert_eq!(forward.approvals(), backward.approvals());
        assert_eq!(forward.status, backward.status);
    }

    #[test]
    fn decided_approvals_ignore_further_votes() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 1);
        table.vote(id, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();

        let err = table
            .vote(id, vote(11, Decision::Reject), RejectPolicy::Veto, t0())
            .unwrap_err();
        assert_eq!(
            err,
            ApprovalError::AlreadyDecided {
                id,
                status: ApprovalStatus::Approved
            }
        );
        let approval = table.get(id).unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.rejections(), 0);
    }

    #[test]
    fn requester_cannot_vote() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 1);
        assert_eq!(
            table.vote(id, vote(1, Decision::Approve), RejectPolicy::Veto, t0()),
            Err(ApprovalError::NotEligible { id, voter: 1 })
        );
    }

    #[test]
    fn expiry_sweep_and_late_votes() {
        let mut table = ApprovalTable::default();
        let id = open(&mut table, 2);
        table.vote(id, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();

        let later = t0() + Duration::hours(25);
        assert_eq!(
            table.vote(id, vote(11, Decision::Approve), RejectPolicy::Veto, later),
            Err(ApprovalError::Expired(id))
        );
        let swept = table.sweep_expired(later);
        assert_eq!(swept.len(), 1);
        assert!(table.sweep_expired(later).is_empty());

        assert_eq!(
            table.vote(id, vote(11, Decision::Approve), RejectPolicy::Veto, later),
            Err(ApprovalError::Expired(id))
        );
        assert!(matches!(
            table.executable(id),
            Err(ApprovalError::NotApproved { status: ApprovalStatus::Expired, .. })
        ));
    }

    #[test]
    fn pending_for_skips_voted_and_own() {
        let mut table = ApprovalTable::default();
        let first = open(&mut table, 2);
        let second = open(&mut table, 2);
        table.vote(first, vote(10, Decision::Approve), RejectPolicy::Veto, t0()).unwrap();

        let pending: Vec<_> = table.pending_for(10, t0()).iter().map(|a| a.id).collect();
        assert_eq!(pending, vec![second]);
        assert!(table.pending_for(1, t0()).is_empty());
    }
}
