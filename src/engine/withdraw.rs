//! Withdrawal lifecycle: batching, review, approval, settlement and appeal.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::state::{Claim, UnitOfWork};
use super::{Engine, EngineError};
use crate::Amount;
use crate::approval::{
    ApprovalError, ApprovalRequest, ApprovalStatus, ApprovalSubject, ApprovalVote, NewApproval,
    TransferOrder, TransferResult,
};
use crate::external::{DomainEvent, ExternalRef, PayoutInstruction, RailOutcome};
use crate::fraud::FraudError;
use crate::model::{
    AccountId, ActorId, ApprovalId, CreatorId, Decision, EntryId, IdempotencyKey, ItemId,
    PayoutMethod, PlatformAccount, RequestId,
};
use crate::payout::{
    AppealOutcome, PayoutError, PayoutItem, PayoutRequest, PayoutSettlement, PayoutStatus,
    SettlementStatus,
};
use crate::wallet::AuditEvent;

const LIABILITY: AccountId = AccountId::Platform(PlatformAccount::PayoutLiability);
const RAIL_RESERVE: AccountId = AccountId::Platform(PlatformAccount::RailReserve);

/// Public API
impl Engine {
    /// Batch every clearable entry of `creator` into a new payout request.
    ///
    /// - Select unclaimed entries whose clearing deadline has passed
    /// - Check the minimum and the withdrawal gate
    /// - Claim all entries in one compare-and-set and snapshot them into items
    pub fn create_request(
        &self,
        creator: CreatorId,
        method: PayoutMethod,
    ) -> Result<PayoutRequest, EngineError> {
        let result = self.create_request_inner(creator, method);
        Self::log_result(
            "create_request",
            format_args!("creator={creator}"),
            &result,
        );
        result
    }

    /// File a payout request and open its approval.
    pub fn request_withdrawal(
        &self,
        creator: CreatorId,
        method: PayoutMethod,
    ) -> Result<PayoutRequest, EngineError> {
        let request = self.create_request(creator, method)?;
        self.open_approval(request.id)?;
        self.payouts
            .get(request.id)
            .ok_or(EngineError::Payout(PayoutError::RequestNotFound(request.id)))
    }

    /// Open the approval gating a pending payout request and put the request
    /// under review.
    pub fn open_approval(&self, request: RequestId) -> Result<ApprovalRequest, EngineError> {
        let result = self.open_approval_inner(request, PayoutStatus::Pending, "open approval");
        Self::log_result("open_approval", format_args!("request={request}"), &result);
        result
    }

    /// Open a fresh approval for a request under review whose previous
    /// approval expired.
    pub fn reopen_review(
        &self,
        request: RequestId,
        operator: ActorId,
    ) -> Result<ApprovalRequest, EngineError> {
        let result = self.ensure_operator(operator).and_then(|()| {
            self.open_approval_inner(request, PayoutStatus::UnderReview, "reopen review")
        });
        Self::log_result("reopen_review", format_args!("request={request}"), &result);
        result
    }

    /// Put an ad-hoc transfer behind operator approval.
    pub fn open_transfer_approval(
        &self,
        order: TransferOrder,
        requested_by: ActorId,
    ) -> Result<ApprovalRequest, EngineError> {
        let now = self.now();
        let required = self.config.required_approvals(order.gross);
        let amount = order.gross;
        let approval = self.approvals.write().open(
            NewApproval {
                subject: ApprovalSubject::Transfer(order),
                amount,
                currency: self.config.currency.clone(),
                required,
                requested_by,
                expires_at: now + self.config.approval_expiry(),
            },
            now,
        );
        info!(approval = approval.id, %amount, required, "transfer approval opened");
        Ok(approval)
    }

    /// Upsert `voter`'s vote. When the vote decides the approval, the payout
    /// request follows it in the same unit of work.
    pub fn vote(
        &self,
        approval: ApprovalId,
        voter: ActorId,
        decision: Decision,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        let result = self.vote_inner(approval, voter, decision, comment);
        Self::log_result(
            "vote",
            format_args!("approval={approval} voter={voter} decision={decision:?}"),
            &result,
        );
        result
    }

    /// Carry out an approved approval's subject.
    ///
    /// On failure the approval stays `approved` with the error recorded, so
    /// it can be retried.
    pub fn execute(
        &self,
        approval: ApprovalId,
        executor: ActorId,
    ) -> Result<TransferResult, EngineError> {
        let result = self.execute_inner(approval, executor);
        Self::log_result(
            "execute",
            format_args!("approval={approval} executor={executor}"),
            &result,
        );
        result
    }

    /// Pay out an approved request under `key`.
    ///
    /// Wallet payouts settle at once: the liability is debited, the creator
    /// credited, entries marked paid and items completed. External payouts
    /// only reserve the money and record the rail's reference; see
    /// [`Engine::confirm_external`]. A key seen before returns its original
    /// settlement without moving money again.
    pub fn complete_payout(
        &self,
        request: RequestId,
        key: IdempotencyKey,
    ) -> Result<PayoutSettlement, EngineError> {
        let result = self.settle(request, key, None);
        Self::log_result("complete_payout", format_args!("request={request}"), &result);
        result
    }

    /// Final word from the rail about an external payout.
    pub fn confirm_external(
        &self,
        reference: &ExternalRef,
        outcome: RailOutcome,
    ) -> Result<PayoutRequest, EngineError> {
        let result = self.confirm_external_inner(reference, outcome);
        Self::log_result(
            "confirm_external",
            format_args!("reference={reference}"),
            &result,
        );
        result
    }

    pub fn flag_item(
        &self,
        item: ItemId,
        operator: ActorId,
        reason: &str,
    ) -> Result<PayoutItem, EngineError> {
        let result = self.ensure_operator(operator).and_then(|()| {
            Ok(self
                .payouts
                .write()
                .flag_item(item, operator, reason, self.now())?)
        });
        Self::log_result("flag_item", format_args!("item={item}"), &result);
        result
    }

    pub fn unflag_item(
        &self,
        item: ItemId,
        operator: ActorId,
        reason: &str,
    ) -> Result<PayoutItem, EngineError> {
        let result = self.ensure_operator(operator).and_then(|()| {
            Ok(self
                .payouts
                .write()
                .unflag_item(item, operator, reason, self.now())?)
        });
        Self::log_result("unflag_item", format_args!("item={item}"), &result);
        result
    }

    pub fn override_item(
        &self,
        item: ItemId,
        operator: ActorId,
        amount: Amount,
        reason: &str,
    ) -> Result<PayoutItem, EngineError> {
        let result = self.ensure_operator(operator).and_then(|()| {
            Ok(self
                .payouts
                .write()
                .override_item(item, operator, amount, reason, self.now())?)
        });
        Self::log_result(
            "override_item",
            format_args!("item={item} amount={amount}"),
            &result,
        );
        result
    }

    /// Contest a rejected request.
    pub fn appeal(
        &self,
        request: RequestId,
        creator: CreatorId,
        evidence: &str,
    ) -> Result<PayoutRequest, EngineError> {
        let now = self.now();
        let result = self
            .payouts
            .write()
            .file_appeal(
                request,
                creator,
                evidence,
                now + self.config.appeal_window(),
                now,
            )
            .map_err(EngineError::from);
        Self::log_result("appeal", format_args!("request={request}"), &result);
        result
    }

    /// Operator decision on an appeal. Reinstating re-claims the request's
    /// entries and may lose to another request with `AlreadyLocked`.
    pub fn resolve_appeal(
        &self,
        request: RequestId,
        operator: ActorId,
        reinstate: bool,
    ) -> Result<PayoutRequest, EngineError> {
        let result = self.resolve_appeal_inner(request, operator, reinstate);
        Self::log_result(
            "resolve_appeal",
            format_args!("request={request} reinstate={reinstate}"),
            &result,
        );
        result
    }
}

/// Private API
impl Engine {
    fn create_request_inner(
        &self,
        creator: CreatorId,
        method: PayoutMethod,
    ) -> Result<PayoutRequest, EngineError> {
        let now = self.now();
        let candidates = self.ledger.withdrawable(creator, now);
        if candidates.is_empty() {
            return Err(PayoutError::NothingToWithdraw(creator).into());
        }
        let total = Amount::checked_sum(candidates.iter().map(|e| e.withdrawable()))
            .ok_or(PayoutError::TotalOverflow(creator))?;
        if total < self.config.minimum_withdrawal {
            return Err(PayoutError::MinimumNotMet {
                total,
                minimum: self.config.minimum_withdrawal,
            }
            .into());
        }
        if !self.gate.is_withdrawal_permitted(creator, total) {
            return Err(PayoutError::WithdrawalNotPermitted {
                creator,
                amount: total,
            }
            .into());
        }

        let ids: Vec<_> = candidates.iter().map(|e| e.id).collect();
        let mut uow = self.uow();
        let id = uow.payouts.reserve_id();
        let locked = uow.ledger.lock_all(&ids, id, now)?;
        let request = uow.payouts.build(id, creator, &locked, method, now);
        uow.payouts.insert(request.clone());
        info!(
            creator,
            request = id,
            total = %request.total_amount,
            items = request.items.len(),
            "payout request created"
        );
        Ok(request)
    }

    fn open_approval_inner(
        &self,
        request: RequestId,
        expected: PayoutStatus,
        action: &'static str,
    ) -> Result<ApprovalRequest, EngineError> {
        let now = self.now();
        let mut uow = self.uow();
        let target = uow.payouts.get(request)?;
        if target.status != expected {
            return Err(PayoutError::InvalidState {
                request,
                status: target.status,
                action,
            }
            .into());
        }
        if let Some(current) = target.approval
            && let Ok(existing) = uow.approvals.get(current)
            && matches!(existing.status, ApprovalStatus::Pending | ApprovalStatus::Approved)
            && !existing.is_expired_at(now)
        {
            return Err(ApprovalError::AlreadyOpen(request).into());
        }
        let amount = target.payable_total();
        let creator = target.creator;
        let required = self.config.required_approvals(amount);
        let approval = uow.approvals.open(
            NewApproval {
                subject: ApprovalSubject::Payout { request },
                amount,
                currency: self.config.currency.clone(),
                required,
                requested_by: creator,
                expires_at: now + self.config.approval_expiry(),
            },
            now,
        );

        let target = uow.payouts.get_mut(request)?;
        target.approval = Some(approval.id);
        if target.status == PayoutStatus::Pending {
            target.transition(
                PayoutStatus::UnderReview,
                None,
                Some(format!("approval {}", approval.id)),
                now,
            )?;
        }
        info!(request, approval = approval.id, %amount, required, "approval opened");
        Ok(approval)
    }

    fn vote_inner(
        &self,
        id: ApprovalId,
        voter: ActorId,
        decision: Decision,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, EngineError> {
        self.ensure_operator(voter)?;
        let now = self.now();
        let mut uow = self.uow();

        // The payout must still be reviewable before a vote can decide it
        let current = uow.approvals.get(id)?;
        if current.status == ApprovalStatus::Pending
            && let Some(request) = current.payout_request()
        {
            let target = uow.payouts.get(request)?;
            if !target.status.is_reviewable() {
                return Err(PayoutError::InvalidState {
                    request,
                    status: target.status,
                    action: "vote",
                }
                .into());
            }
        }

        let vote = ApprovalVote {
            voter,
            decision,
            comment: comment.map(str::to_string),
            at: now,
        };
        let (approval, moved) =
            uow.approvals
                .vote(id, vote, self.config.reject_policy, now)?;

        if let (Some(status), Some(request)) = (moved, approval.payout_request()) {
            let target = uow.payouts.get_mut(request)?;
            let creator = target.creator;
            match status {
                ApprovalStatus::Approved => {
                    target.transition(PayoutStatus::Approved, Some(voter), None, now)?;
                    target.approve_items();
                    uow.emit(DomainEvent::PayoutApproved { request, creator });
                }
                ApprovalStatus::Rejected => {
                    target.transition(
                        PayoutStatus::Rejected,
                        Some(voter),
                        comment.map(str::to_string),
                        now,
                    )?;
                    target.rejection_reason =
                        Some(comment.unwrap_or("rejected by approvers").to_string());
                    let entries = target.entry_ids();
                    let released = uow.ledger.release(&entries, request, now);
                    info!(request, released, "payout rejected, entries released");
                    uow.emit(DomainEvent::PayoutRejected { request, creator });
                }
                _ => {}
            }
        }

        let events = uow.finish();
        self.publish(events);
        Ok(approval)
    }

    fn execute_inner(
        &self,
        id: ApprovalId,
        executor: ActorId,
    ) -> Result<TransferResult, EngineError> {
        self.ensure_operator(executor)?;
        let subject = self.approvals.write().executable(id)?.subject.clone();

        match subject {
            ApprovalSubject::Payout { request } => {
                let key = IdempotencyKey::for_approval(id);
                match self.settle(request, key, Some((id, executor))) {
                    Ok(settlement) => Ok(TransferResult::Payout(settlement)),
                    Err(e) => {
                        self.approvals
                            .write()
                            .record_failure(id, Some(executor), &e.to_string())?;
                        Err(e)
                    }
                }
            }
            ApprovalSubject::Transfer(order) => {
                let now = self.now();
                let transfer = self.wallets.transfer(
                    order.from,
                    order.to,
                    order.gross,
                    order.fee,
                    order.key.clone(),
                    now,
                );
                let mut approvals = self.approvals.write();
                match transfer {
                    Ok(receipt) => {
                        let result = TransferResult::Transfer(receipt);
                        match approvals.mark_executed(id, Some(executor), result.clone(), now) {
                            Ok(_) => Ok(result),
                            // A concurrent execute got there first with the same key
                            Err(ApprovalError::NotApproved {
                                status: ApprovalStatus::Executed,
                                ..
                            }) => Ok(result),
                            Err(e) => Err(e.into()),
                        }
                    }
                    Err(e) => {
                        approvals.record_failure(id, Some(executor), &e.to_string())?;
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Settle `request` under `key`. `via` is the approval being executed.
    fn settle(
        &self,
        request: RequestId,
        key: IdempotencyKey,
        via: Option<(ApprovalId, ActorId)>,
    ) -> Result<PayoutSettlement, EngineError> {
        match self.settlements.claim(&key, request)? {
            Claim::Replay(settlement) => {
                info!(request, key = %key, "duplicate settlement, returning original");
                return Ok(settlement);
            }
            Claim::Proceed => {}
        }

        let result = self.settle_claimed(request, &key, via);
        match &result {
            Ok(settlement) => {
                let settled = settlement.status == SettlementStatus::Settled;
                self.settlements.finish(&key, settlement, settled);
            }
            Err(_) => self.settlements.abandon(&key),
        }
        result
    }

    fn settle_claimed(
        &self,
        request: RequestId,
        key: &IdempotencyKey,
        via: Option<(ApprovalId, ActorId)>,
    ) -> Result<PayoutSettlement, EngineError> {
        let now = self.now();
        let mut uow = self.uow();

        let target = uow.payouts.get(request)?;
        if target.status != PayoutStatus::Approved {
            return Err(PayoutError::InvalidState {
                request,
                status: target.status,
                action: "complete payout",
            }
            .into());
        }
        if let Some(reference) = &target.external_ref {
            // Already reserved and sent; waiting for the rail
            return Ok(PayoutSettlement {
                request,
                creator: target.creator,
                amount: target.payable_total(),
                status: SettlementStatus::PendingExternal {
                    reference: reference.clone(),
                },
                key: key.clone(),
            });
        }
        let open_flags = uow.fraud.open_flags_for(request);
        if !open_flags.is_empty() {
            return Err(FraudError::OnHold {
                request,
                flags: open_flags,
            }
            .into());
        }
        let payments = target.payments();
        if payments.is_empty() {
            Self::close_unpayable(&mut uow, request, via.map(|(_, executor)| executor), now)?;
            let events = uow.finish();
            self.publish(events);
            return Err(PayoutError::NothingPayable(request).into());
        }
        uow.ledger.check_payable(&payments, request, now)?;

        let creator = target.creator;
        let amount: Amount = payments.iter().map(|(_, amount)| *amount).sum();
        let method = target.method.clone();

        match method {
            PayoutMethod::Wallet => {
                let account = AccountId::Creator(creator);
                let mut tx = self
                    .wallets
                    .begin(&[LIABILITY, account], now)
                    .with_key(key.clone());
                tx.debit(LIABILITY, amount, AuditEvent::PayoutSettled { request })?;
                tx.credit(account, amount, AuditEvent::PayoutSettled { request })?;
                tx.commit()?;

                Self::finalize_payout(
                    &mut uow,
                    request,
                    &payments,
                    via.map(|(_, executor)| executor),
                    now,
                )?;
                let settlement = PayoutSettlement {
                    request,
                    creator,
                    amount,
                    status: SettlementStatus::Settled,
                    key: key.clone(),
                };
                if let Some((approval, executor)) = via {
                    uow.approvals.mark_executed(
                        approval,
                        Some(executor),
                        TransferResult::Payout(settlement.clone()),
                        now,
                    )?;
                }
                info!(request, creator, %amount, "payout completed");
                let events = uow.finish();
                self.publish(events);
                Ok(settlement)
            }
            PayoutMethod::External { rail, destination } => {
                let mut tx = self
                    .wallets
                    .begin(&[LIABILITY, RAIL_RESERVE], now)
                    .with_key(key.clone());
                tx.debit(LIABILITY, amount, AuditEvent::PayoutReserved { request })?;
                tx.credit(RAIL_RESERVE, amount, AuditEvent::PayoutReserved { request })?;
                tx.commit()?;
                drop(uow);

                let instruction = PayoutInstruction {
                    request,
                    creator,
                    amount,
                    currency: self.config.currency.clone(),
                    rail,
                    destination,
                };
                let submitted = self.rail.submit(&instruction);

                let mut uow = self.uow();
                match submitted {
                    Ok(reference) => {
                        uow.payouts.record_reference(request, reference.clone())?;
                        let settlement = PayoutSettlement {
                            request,
                            creator,
                            amount,
                            status: SettlementStatus::PendingExternal { reference },
                            key: key.clone(),
                        };
                        if let Some((approval, executor)) = via {
                            uow.approvals.record_pending(
                                approval,
                                executor,
                                TransferResult::Payout(settlement.clone()),
                            )?;
                        }
                        info!(request, creator, %amount, "payout sent to rail");
                        Ok(settlement)
                    }
                    Err(source) => {
                        self.release_reservation(&mut uow, request, amount, &source.to_string(), now)?;
                        Err(EngineError::Rail { request, source })
                    }
                }
            }
        }
    }

    /// Mark entries paid and items completed, release excluded entries.
    fn finalize_payout(
        uow: &mut UnitOfWork<'_>,
        request: RequestId,
        payments: &[(EntryId, Amount)],
        by: Option<ActorId>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        uow.ledger.mark_paid_all(payments, request, now)?;
        let target = uow.payouts.get_mut(request)?;
        let excluded = target.excluded_entries();
        let creator = target.creator;
        let amount: Amount = payments.iter().map(|(_, amount)| *amount).sum();
        target.transition(PayoutStatus::Completed, by, None, now)?;
        target.complete_items(now);
        target.hold = None;
        uow.ledger.release(&excluded, request, now);
        uow.fraud.record_completed_payout(creator, now);
        uow.emit(DomainEvent::PayoutCompleted {
            request,
            creator,
            amount,
        });
        Ok(())
    }

    /// Reject an approved request whose every item was excluded and give
    /// its entries back to the pool.
    fn close_unpayable(
        uow: &mut UnitOfWork<'_>,
        request: RequestId,
        by: Option<ActorId>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let target = uow.payouts.get_mut(request)?;
        let creator = target.creator;
        target.transition(
            PayoutStatus::Rejected,
            by,
            Some("nothing payable".to_string()),
            now,
        )?;
        target.rejection_reason = Some("nothing payable".to_string());
        let entries = target.entry_ids();
        let released = uow.ledger.release(&entries, request, now);
        warn!(request, released, "nothing payable, request rejected and entries released");
        uow.emit(DomainEvent::PayoutRejected { request, creator });
        Ok(())
    }

    /// Return reserved money to the liability and note the failure.
    fn release_reservation(
        &self,
        uow: &mut UnitOfWork<'_>,
        request: RequestId,
        amount: Amount,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut tx = self.wallets.begin(&[LIABILITY, RAIL_RESERVE], now);
        let event = AuditEvent::ReservationReleased {
            request,
            reason: reason.to_string(),
        };
        tx.debit(RAIL_RESERVE, amount, event.clone())?;
        tx.credit(LIABILITY, amount, event)?;
        tx.commit()?;

        uow.payouts.clear_reference(request)?;
        let target = uow.payouts.get_mut(request)?;
        target.rail_failures.push(reason.to_string());
        target.updated_at = now;
        if let Some(approval) = target.approval {
            uow.approvals.record_failure(approval, None, reason)?;
        }
        warn!(request, %amount, reason, "rail failure, reservation released");
        Ok(())
    }

    fn confirm_external_inner(
        &self,
        reference: &ExternalRef,
        outcome: RailOutcome,
    ) -> Result<PayoutRequest, EngineError> {
        let now = self.now();
        let mut uow = self.uow();
        let request = uow.payouts.by_reference(reference)?;
        let target = uow.payouts.get(request)?;
        if target.status != PayoutStatus::Approved {
            return Err(PayoutError::InvalidState {
                request,
                status: target.status,
                action: "confirm external payout",
            }
            .into());
        }
        let payments = target.payments();
        let amount: Amount = payments.iter().map(|(_, amount)| *amount).sum();
        let creator = target.creator;
        let approval = target.approval;
        let key = self.settlements.active_key(request);

        match outcome {
            RailOutcome::Settled => {
                uow.ledger.check_payable(&payments, request, now)?;
                let mut tx = self.wallets.begin(&[RAIL_RESERVE], now);
                if let Some(key) = &key {
                    tx = tx.with_key(key.clone());
                }
                tx.debit(RAIL_RESERVE, amount, AuditEvent::PayoutSettled { request })?;
                tx.commit()?;

                let executor = approval
                    .and_then(|a| uow.approvals.get(a).ok())
                    .and_then(|a| a.executed_by);
                Self::finalize_payout(&mut uow, request, &payments, executor, now)?;
                let settlement = PayoutSettlement {
                    request,
                    creator,
                    amount,
                    status: SettlementStatus::Settled,
                    key: key.clone().unwrap_or_else(IdempotencyKey::generate),
                };
                if let Some(approval) = approval
                    && uow.approvals.executable(approval).is_ok()
                {
                    uow.approvals.mark_executed(
                        approval,
                        executor,
                        TransferResult::Payout(settlement.clone()),
                        now,
                    )?;
                }
                if let Some(key) = &key {
                    self.settlements.finish(key, &settlement, true);
                }
                info!(request, %reference, "external payout settled");
            }
            RailOutcome::Failed(reason) => {
                self.release_reservation(&mut uow, request, amount, &reason, now)?;
                if let Some(key) = &key {
                    self.settlements.abandon(key);
                }
            }
        }

        let updated = uow.payouts.get(request)?.clone();
        let events = uow.finish();
        self.publish(events);
        Ok(updated)
    }

    fn resolve_appeal_inner(
        &self,
        request: RequestId,
        operator: ActorId,
        reinstate: bool,
    ) -> Result<PayoutRequest, EngineError> {
        self.ensure_operator(operator)?;
        let now = self.now();
        let mut uow = self.uow();
        let target = uow.payouts.get(request)?;
        if target.status != PayoutStatus::Appealed {
            return Err(PayoutError::InvalidState {
                request,
                status: target.status,
                action: "resolve appeal",
            }
            .into());
        }
        let creator = target.creator;

        let outcome = if reinstate {
            if let Some(deadline) = target.appeal.as_ref().map(|a| a.deadline)
                && now > deadline
            {
                return Err(PayoutError::AppealWindowClosed { request, deadline }.into());
            }
            let entries = target.entry_ids();
            uow.ledger.lock_all(&entries, request, now)?;
            AppealOutcome::Reinstated
        } else {
            AppealOutcome::Upheld
        };

        let resolved = uow
            .payouts
            .resolve_appeal(request, outcome, Some(operator), now)?;
        if outcome == AppealOutcome::Reinstated {
            uow.payouts.get_mut(request)?.approve_items();
            uow.emit(DomainEvent::PayoutApproved { request, creator });
        }
        let resolved = uow.payouts.get(request).cloned().unwrap_or(resolved);
        let events = uow.finish();
        self.publish(events);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ErrorKind;
    use super::super::tests::{Harness, approve, cleared_creator, config, harness, units};
    use super::*;
    use crate::external::{PaymentRail, RailError};
    use crate::ledger::LedgerStatus;
    use crate::model::{Rail, SourceRef};
    use crate::payout::ItemStatus;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn withdrawal_below_minimum_is_refused() {
        let h = harness();
        cleared_creator(&h, 500);
        let err = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap_err();
        assert_eq!(
            err,
            EngineError::Payout(PayoutError::MinimumNotMet {
                total: units(5),
                minimum: units(10),
            })
        );
        // Nothing was claimed
        assert!(h.engine.ledger().entries_for(1)[0].is_claimable());
    }

    #[test]
    fn entries_still_clearing_are_not_withdrawable() {
        let h = harness();
        h.engine
            .accrue(1, SourceRef::CampaignVideo(1), Amount::from_float(0.01), 5_000)
            .unwrap();
        assert_eq!(
            h.engine.create_request(1, PayoutMethod::Wallet).unwrap_err(),
            EngineError::Payout(PayoutError::NothingToWithdraw(1))
        );
    }

    #[test]
    fn gate_denial_is_a_policy_violation() {
        struct Deny;
        impl crate::external::WithdrawalGate for Deny {
            fn is_withdrawal_permitted(&self, _: CreatorId, _: Amount) -> bool {
                false
            }
        }
        let clock = Arc::new(crate::clock::ManualClock::default());
        let engine = Engine::builder(config())
            .clock(clock.clone())
            .gate(Arc::new(Deny))
            .build();
        engine
            .accrue(1, SourceRef::CampaignVideo(1), Amount::from_float(0.01), 5_000)
            .unwrap();
        clock.advance(engine.config().clearing_window());
        let err = engine.create_request(1, PayoutMethod::Wallet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    }

    #[test]
    fn approved_request_executes_once() {
        let h = harness();
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap();
        assert_eq!(request.status, PayoutStatus::UnderReview);

        let approval = approve(&h, &request);
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(
            h.engine.payout_request(request.id).unwrap().status,
            PayoutStatus::Approved
        );

        let result = h.engine.execute(approval.id, 100).unwrap();
        assert!(matches!(result, TransferResult::Payout(_)));
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(1)), units(15));
        assert_eq!(
            h.engine.approval(approval.id).unwrap().status,
            ApprovalStatus::Executed
        );

        // Executing again is refused and moves nothing
        assert!(h.engine.execute(approval.id, 100).is_err());
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(1)), units(15));
        assert_eq!(
            h.sink.names(),
            vec!["payout.approved", "payout.completed"]
        );
    }

    #[test]
    fn complete_payout_is_idempotent_per_key() {
        let h = harness();
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap();
        approve(&h, &request);

        let key = IdempotencyKey::new("payout-1");
        let first = h.engine.complete_payout(request.id, key.clone()).unwrap();
        let second = h.engine.complete_payout(request.id, key).unwrap();
        assert_eq!(first, second);
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(1)), units(15));

        // A different key hits the completed state instead
        assert!(matches!(
            h.engine
                .complete_payout(request.id, IdempotencyKey::new("other"))
                .unwrap_err(),
            EngineError::Payout(PayoutError::InvalidState { .. })
        ));
    }

    #[test]
    fn rejection_releases_entries_and_appeal_reinstates() {
        let h = harness();
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap();
        let approval = request.approval.unwrap();
        h.engine
            .vote(approval, 100, Decision::Reject, Some("views look off"))
            .unwrap();

        let rejected = h.engine.payout_request(request.id).unwrap();
        assert_eq!(rejected.status, PayoutStatus::Rejected);
        assert!(h.engine.ledger().entries_for(1)[0].is_claimable());

        h.engine.appeal(request.id, 1, "analytics screenshot").unwrap();
        let reinstated = h.engine.resolve_appeal(request.id, 101, true).unwrap();
        assert_eq!(reinstated.status, PayoutStatus::Approved);
        assert_eq!(h.engine.ledger().entries_for(1)[0].claimed_by, Some(request.id));

        h.engine
            .complete_payout(request.id, IdempotencyKey::new("after-appeal"))
            .unwrap();
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(1)), units(15));
    }

    #[test]
    fn flagged_item_is_excluded_and_released() {
        let h = harness();
        cleared_creator(&h, 1_500);
        h.engine
            .accrue(1, SourceRef::BoostSubmission(2), Amount::from_float(0.01), 500)
            .unwrap();
        h.clock.advance(h.engine.config().clearing_window());

        let request = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap();
        assert_eq!(request.total_amount, units(20));
        let boost_item = request.items[1].id;
        h.engine.flag_item(boost_item, 100, "bought views").unwrap();
        approve(&h, &request);
        h.engine
            .complete_payout(request.id, IdempotencyKey::new("k"))
            .unwrap();

        let done = h.engine.payout_request(request.id).unwrap();
        assert_eq!(done.total_amount, units(20));
        assert_eq!(done.items[1].status, ItemStatus::Released);
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(1)), units(15));

        let boost = h.engine.entry_by_source(1, SourceRef::BoostSubmission(2)).unwrap();
        assert_eq!(boost.status, LedgerStatus::Cleared);
        assert!(boost.is_claimable());
    }

    #[test]
    fn fully_flagged_request_is_rejected_on_execute() {
        let h = harness();
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap();
        h.engine.flag_item(request.items[0].id, 100, "bought views").unwrap();
        let approval = approve(&h, &request);

        assert_eq!(
            h.engine.execute(approval.id, 100).unwrap_err(),
            EngineError::Payout(PayoutError::NothingPayable(request.id))
        );
        let closed = h.engine.payout_request(request.id).unwrap();
        assert_eq!(closed.status, PayoutStatus::Rejected);
        assert_eq!(closed.rejection_reason.as_deref(), Some("nothing payable"));
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(1)), Amount::ZERO);

        let entry = &h.engine.ledger().entries_for(1)[0];
        assert_eq!(entry.status, LedgerStatus::Cleared);
        assert!(entry.is_claimable());
        assert!(h.sink.names().contains(&"payout.rejected"));
    }

    #[test]
    fn overflowing_request_total_is_refused() {
        let h = harness();
        let huge = Amount::from_scaled(i64::MAX / 2 + 1);
        for video in 1..=2 {
            h.engine
                .accrue(1, SourceRef::CampaignVideo(video), huge, 1)
                .unwrap();
        }
        h.clock.advance(h.engine.config().clearing_window());

        let err = h.engine.create_request(1, PayoutMethod::Wallet).unwrap_err();
        assert_eq!(err, EngineError::Payout(PayoutError::TotalOverflow(1)));
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
        assert!(h.engine.ledger().entries_for(1).iter().all(|e| e.is_claimable()));
    }

    #[test]
    fn liability_must_cover_payout() {
        let h = harness();
        h.engine
            .accrue(1, SourceRef::CampaignVideo(1), Amount::from_float(0.01), 1_500)
            .unwrap();
        h.clock.advance(h.engine.config().clearing_window());
        let request = h.engine.request_withdrawal(1, PayoutMethod::Wallet).unwrap();
        let approval = approve(&h, &request);

        let err = h.engine.execute(approval.id, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let approval = h.engine.approval(approval.id).unwrap();
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert!(approval.last_error.is_some());
        assert_eq!(
            h.engine.ledger().entries_for(1)[0].status,
            LedgerStatus::Locked
        );
    }

    #[derive(Default)]
    struct ScriptedRail {
        fail: Mutex<Option<String>>,
        sent: Mutex<Vec<PayoutInstruction>>,
    }

    impl PaymentRail for ScriptedRail {
        fn submit(&self, instruction: &PayoutInstruction) -> Result<ExternalRef, RailError> {
            if let Some(reason) = self.fail.lock().take() {
                return Err(RailError::Rejected(reason));
            }
            let mut sent = self.sent.lock();
            sent.push(instruction.clone());
            Ok(ExternalRef(format!("wire-{}", sent.len())))
        }
    }

    fn external_harness(rail: Arc<ScriptedRail>) -> Harness {
        let h = harness();
        let engine = Engine::builder(config())
            .clock(h.clock.clone())
            .events(h.sink.clone())
            .rail(rail)
            .build();
        Harness {
            engine,
            clock: h.clock,
            sink: h.sink,
        }
    }

    fn external() -> PayoutMethod {
        PayoutMethod::External {
            rail: Rail::Bank,
            destination: "DE89 3704".into(),
        }
    }

    #[test]
    fn external_payout_settles_on_confirmation() {
        let rail = Arc::new(ScriptedRail::default());
        let h = external_harness(rail.clone());
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, external()).unwrap();
        let approval = approve(&h, &request);

        let TransferResult::Payout(settlement) = h.engine.execute(approval.id, 100).unwrap() else {
            panic!("expected payout settlement");
        };
        let SettlementStatus::PendingExternal { reference } = settlement.status else {
            panic!("expected pending settlement");
        };
        assert_eq!(rail.sent.lock().len(), 1);
        assert_eq!(h.engine.wallet_balance(RAIL_RESERVE), units(15));
        assert_eq!(
            h.engine.approval(approval.id).unwrap().status,
            ApprovalStatus::Approved
        );

        // Retrying while the rail works on it does not resubmit
        h.engine.execute(approval.id, 100).unwrap();
        assert_eq!(rail.sent.lock().len(), 1);

        let done = h.engine.confirm_external(&reference, RailOutcome::Settled).unwrap();
        assert_eq!(done.status, PayoutStatus::Completed);
        assert_eq!(h.engine.wallet_balance(RAIL_RESERVE), Amount::ZERO);
        assert_eq!(
            h.engine.ledger().entries_for(1)[0].status,
            LedgerStatus::Paid
        );
        assert_eq!(
            h.engine.approval(approval.id).unwrap().status,
            ApprovalStatus::Executed
        );
    }

    #[test]
    fn rail_rejection_unreserves_and_stays_retryable() {
        let rail = Arc::new(ScriptedRail::default());
        *rail.fail.lock() = Some("account closed".into());
        let h = external_harness(rail.clone());
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, external()).unwrap();
        let approval = approve(&h, &request);

        let err = h.engine.execute(approval.id, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalRailFailure);
        assert_eq!(h.engine.wallet_balance(RAIL_RESERVE), Amount::ZERO);
        assert_eq!(h.engine.wallet_balance(LIABILITY), units(10_000));
        let after = h.engine.payout_request(request.id).unwrap();
        assert_eq!(after.status, PayoutStatus::Approved);
        assert_eq!(after.rail_failures, vec!["rail rejected instruction: account closed"]);

        // Second attempt goes through
        h.engine.execute(approval.id, 100).unwrap();
        assert_eq!(rail.sent.lock().len(), 1);
    }

    #[test]
    fn async_rail_failure_returns_request_to_approved() {
        let rail = Arc::new(ScriptedRail::default());
        let h = external_harness(rail.clone());
        cleared_creator(&h, 1_500);
        let request = h.engine.request_withdrawal(1, external()).unwrap();
        let approval = approve(&h, &request);
        h.engine.execute(approval.id, 100).unwrap();

        let reference = ExternalRef("wire-1".into());
        let after = h
            .engine
            .confirm_external(&reference, RailOutcome::Failed("returned by bank".into()))
            .unwrap();
        assert_eq!(after.status, PayoutStatus::Approved);
        assert!(after.external_ref.is_none());
        assert_eq!(h.engine.wallet_balance(RAIL_RESERVE), Amount::ZERO);

        h.engine.execute(approval.id, 100).unwrap();
        assert_eq!(rail.sent.lock().len(), 2);
    }

    #[test]
    fn transfer_approval_moves_money_once_approved() {
        let h = harness();
        h.engine.credit(AccountId::Brand(7), units(50), "top up").unwrap();
        let approval = h
            .engine
            .open_transfer_approval(
                TransferOrder {
                    from: AccountId::Brand(7),
                    to: AccountId::Creator(3),
                    gross: units(50),
                    fee: units(1),
                    key: IdempotencyKey::new("brand-bonus"),
                },
                3,
            )
            .unwrap();
        assert!(matches!(
            h.engine.execute(approval.id, 100),
            Err(EngineError::Approval(ApprovalError::NotApproved { .. }))
        ));

        h.engine.vote(approval.id, 100, Decision::Approve, None).unwrap();
        let TransferResult::Transfer(receipt) = h.engine.execute(approval.id, 101).unwrap() else {
            panic!("expected transfer receipt");
        };
        assert_eq!(receipt.net, units(49));
        assert_eq!(h.engine.wallet_balance(AccountId::Creator(3)), units(49));
    }
}
