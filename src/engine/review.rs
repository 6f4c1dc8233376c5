//! Fraud review: screening, holds, flag resolution and clawbacks.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::state::UnitOfWork;
use super::{Engine, EngineError};
use crate::Amount;
use crate::external::DomainEvent;
use crate::fraud::{
    FraudCheck, FraudContext, FraudError, FraudFlag, FraudSignals, PayoutTier, hold_deadline,
};
use crate::ledger::{LedgerError, LedgerStatus};
use crate::model::{
    AccountId, ActorId, CreatorId, EntryId, FlagId, PlatformAccount, RequestId, Verdict,
};
use crate::payout::{AppealOutcome, Hold, ItemStatus, PayoutError, PayoutStatus};
use crate::wallet::ClawbackDebit;

const LIABILITY: AccountId = AccountId::Platform(PlatformAccount::PayoutLiability);

/// Public API
impl Engine {
    /// Screen a payout request before approval.
    ///
    /// - Evaluate the signals against the configured sensitivity
    /// - Tier the request by payable amount and check the creator's profile
    /// - Record the check on the request; hold it if any flag was raised
    pub fn check_payout(
        &self,
        request: RequestId,
        signals: FraudSignals,
    ) -> Result<FraudCheck, EngineError> {
        let result = self.check_payout_inner(request, signals);
        Self::log_result("check_payout", format_args!("request={request}"), &result);
        result
    }

    /// Compare `context` against the configured thresholds. Flags tied to a
    /// request put it on hold.
    pub fn evaluate(
        &self,
        creator: CreatorId,
        context: FraudContext,
    ) -> Result<Vec<FraudFlag>, EngineError> {
        let now = self.now();
        let thresholds = self.config.fraud_sensitivity.thresholds();
        let mut uow = self.uow();
        if let Some(request) = context.request
            && uow.payouts.get(request)?.creator != creator
        {
            return Err(PayoutError::NotOwner { request, creator }.into());
        }
        let flags = uow.fraud.evaluate(creator, &context, thresholds, now);
        if let Some(request) = context.request
            && !flags.is_empty()
        {
            self.hold_if_pending(&mut uow, request, now)?;
        }
        for flag in &flags {
            warn!(creator, flag = flag.id, kind = ?flag.kind, reason = %flag.reason, "fraud flag raised");
        }
        Ok(flags)
    }

    /// Operator-raised flag, optionally tied to a payout request.
    pub fn raise_flag(
        &self,
        creator: CreatorId,
        request: Option<RequestId>,
        operator: ActorId,
        reason: &str,
    ) -> Result<FraudFlag, EngineError> {
        let result = self.raise_flag_inner(creator, request, operator, reason);
        Self::log_result("raise_flag", format_args!("creator={creator}"), &result);
        result
    }

    /// Extend the request's clearing deadline while fraud flags are open.
    /// Execution is refused until every flag is resolved.
    pub fn apply_hold(&self, request: RequestId) -> Result<Hold, EngineError> {
        let now = self.now();
        let result = self.place_hold(&mut self.uow(), request, now);
        Self::log_result("apply_hold", format_args!("request={request}"), &result);
        result
    }

    /// Close a fraud flag.
    ///
    /// - `Dismissed` lifts the hold once no other flag is open
    /// - `Confirmed` on a completed request claws the paid money back
    /// - `Confirmed` on a request not yet paid freezes it as rejected
    ///
    /// Confirmed fraud lowers the creator's trust score by a penalty that grows
    /// with the amount and with prior confirmed frauds.
    pub fn resolve_fraud_flag(
        &self,
        flag: FlagId,
        verdict: Verdict,
        operator: ActorId,
    ) -> Result<FraudFlag, EngineError> {
        let result = self.resolve_fraud_flag_inner(flag, verdict, operator);
        Self::log_result(
            "resolve_fraud_flag",
            format_args!("flag={flag} verdict={verdict:?}"),
            &result,
        );
        result
    }

    /// Reverse `amount` of a paid entry: the creator wallet is debited down
    /// to the negative allowance, the rest is booked as debt, and what was
    /// taken goes back to the payout liability.
    pub fn reverse_clawback(
        &self,
        entry: EntryId,
        amount: Amount,
        flag: Option<FlagId>,
        reason: &str,
    ) -> Result<ClawbackDebit, EngineError> {
        let result = self.reverse_clawback_inner(entry, amount, flag, reason);
        Self::log_result(
            "reverse_clawback",
            format_args!("entry={entry} amount={amount}"),
            &result,
        );
        result
    }
}

/// Private API
impl Engine {
    fn check_payout_inner(
        &self,
        request: RequestId,
        signals: FraudSignals,
    ) -> Result<FraudCheck, EngineError> {
        let now = self.now();
        let mut uow = self.uow();
        let target = uow.payouts.get(request)?;
        if !target.status.is_reviewable() {
            return Err(PayoutError::InvalidState {
                request,
                status: target.status,
                action: "fraud check",
            }
            .into());
        }
        let creator = target.creator;
        let amount = target.payable_total();

        let context = FraudContext {
            signals,
            amount,
            request: Some(request),
        };
        let thresholds = self.config.fraud_sensitivity.thresholds();
        let flags = uow.fraud.evaluate(creator, &context, thresholds, now);
        let tier = PayoutTier::for_amount(amount);
        let qualified = uow.fraud.profile(creator, now).meets(tier.requirements(), now);
        let check = FraudCheck {
            approved: flags.is_empty() && qualified,
            tier,
            flags: flags.iter().map(|f| f.id).collect(),
            checked_at: now,
        };
        uow.payouts.get_mut(request)?.fraud_check = Some(check.clone());
        if !flags.is_empty() {
            self.place_hold(&mut uow, request, now)?;
        }
        info!(request, creator, tier = ?tier, approved = check.approved, flags = flags.len(), "payout screened");
        Ok(check)
    }

    fn raise_flag_inner(
        &self,
        creator: CreatorId,
        request: Option<RequestId>,
        operator: ActorId,
        reason: &str,
    ) -> Result<FraudFlag, EngineError> {
        self.ensure_operator(operator)?;
        if reason.trim().is_empty() {
            return Err(PayoutError::EmptyReason.into());
        }
        let now = self.now();
        let mut uow = self.uow();
        if let Some(request) = request {
            let target = uow.payouts.get(request)?;
            if target.creator != creator {
                return Err(PayoutError::NotOwner { request, creator }.into());
            }
        }
        let flag = uow.fraud.raise(creator, request, reason, now);
        if let Some(request) = request {
            self.hold_if_pending(&mut uow, request, now)?;
        }
        warn!(creator, flag = flag.id, operator, reason, "fraud flag raised by operator");
        Ok(flag)
    }

    /// Hold `request` if it has not been paid or decided yet.
    fn hold_if_pending(
        &self,
        uow: &mut UnitOfWork<'_>,
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let status = uow.payouts.get(request)?.status;
        let holdable = matches!(
            status,
            PayoutStatus::Pending | PayoutStatus::UnderReview | PayoutStatus::Approved
        );
        if holdable && !self.settling(uow, request)? {
            self.place_hold(uow, request, now)?;
        }
        Ok(())
    }

    /// True while money for `request` is reserved on an external rail or a
    /// settlement for it is running.
    fn settling(&self, uow: &UnitOfWork<'_>, request: RequestId) -> Result<bool, EngineError> {
        let target = uow.payouts.get(request)?;
        Ok(target.external_ref.is_some() || self.settlements.active_key(request).is_some())
    }

    fn place_hold(
        &self,
        uow: &mut UnitOfWork<'_>,
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Hold, EngineError> {
        let flags = uow.fraud.open_flags_for(request);
        if flags.is_empty() {
            return Err(FraudError::NoOpenFlags(request).into());
        }
        let target = uow.payouts.get(request)?;
        if !matches!(
            target.status,
            PayoutStatus::Pending | PayoutStatus::UnderReview | PayoutStatus::Approved
        ) {
            return Err(PayoutError::InvalidState {
                request,
                status: target.status,
                action: "hold",
            }
            .into());
        }
        if self.settling(uow, request)? {
            return Err(FraudError::SettlementInFlight(request).into());
        }

        let until = hold_deadline(target.clearing_ends_at, now, self.config.fraud_hold());
        let entries = target.entry_ids();
        let previous = uow.ledger.extend_hold(&entries, until, now);

        let target = uow.payouts.get_mut(request)?;
        let hold = match target.hold.take() {
            // Keep the deadlines from before the first hold
            Some(mut existing) => {
                existing.flags = flags;
                existing
            }
            None => Hold {
                flags,
                previous_deadline: target.clearing_ends_at,
                entry_deadlines: previous,
                placed_at: now,
            },
        };
        target.clearing_ends_at = until;
        target.updated_at = now;
        target.hold = Some(hold.clone());
        info!(request, %until, flags = ?hold.flags, "payout held");
        Ok(hold)
    }

    /// Lift the hold on `request` once no flag is open on it.
    fn release_hold(
        uow: &mut UnitOfWork<'_>,
        request: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let open = uow.fraud.open_flags_for(request);
        let target = uow.payouts.get_mut(request)?;
        let Some(hold) = target.hold.as_mut() else {
            return Ok(());
        };
        if !open.is_empty() {
            hold.flags = open;
            return Ok(());
        }
        let Some(hold) = target.hold.take() else {
            return Ok(());
        };
        target.clearing_ends_at = hold.previous_deadline;
        target.updated_at = now;
        uow.ledger.restore_hold(&hold.entry_deadlines, now);
        info!(request, "hold lifted");
        Ok(())
    }

    fn resolve_fraud_flag_inner(
        &self,
        id: FlagId,
        verdict: Verdict,
        operator: ActorId,
    ) -> Result<FraudFlag, EngineError> {
        self.ensure_operator(operator)?;
        let now = self.now();
        let mut uow = self.uow();
        let flag = uow.fraud.open_flag(id)?.clone();

        if verdict == Verdict::Dismissed {
            let resolved = uow
                .fraud
                .resolve(id, verdict, operator, 0, Amount::ZERO, now)?;
            if let Some(request) = flag.request {
                Self::release_hold(&mut uow, request, now)?;
            }
            info!(flag = id, operator, "fraud flag dismissed");
            return Ok(resolved);
        }

        let (amount, clawed_back) = match flag.request {
            Some(request) => self.confirm_on_request(&mut uow, &flag, request, operator, now)?,
            None => (Amount::ZERO, Amount::ZERO),
        };
        let penalty = uow
            .fraud
            .apply_penalty(flag.creator, amount, &self.config.trust_penalty, now);
        let resolved = uow
            .fraud
            .resolve(id, verdict, operator, penalty, clawed_back, now)?;
        warn!(flag = id, creator = flag.creator, %amount, penalty, "fraud confirmed");
        uow.emit(DomainEvent::FraudConfirmed {
            flag: id,
            creator: flag.creator,
            amount,
            penalty,
        });
        let events = uow.finish();
        self.publish(events);
        Ok(resolved)
    }

    /// Apply a confirmed flag to its request. Returns the fraud amount and
    /// the amount reversed from the creator.
    fn confirm_on_request(
        &self,
        uow: &mut UnitOfWork<'_>,
        flag: &FraudFlag,
        request: RequestId,
        operator: ActorId,
        now: DateTime<Utc>,
    ) -> Result<(Amount, Amount), EngineError> {
        let target = uow.payouts.get(request)?;
        let creator = target.creator;
        let note = format!("fraud flag {}: {}", flag.id, flag.reason);

        let status = target.status;
        match status {
            PayoutStatus::Completed => {
                let reversals: Vec<(EntryId, Amount)> = target
                    .items
                    .iter()
                    .filter(|i| i.status == ItemStatus::Completed)
                    .map(|i| (i.entry, i.payable()))
                    .collect();
                for &(entry, _) in &reversals {
                    let row = uow.ledger.get(entry).ok_or(LedgerError::EntryNotFound(entry))?;
                    if row.status != LedgerStatus::Paid {
                        return Err(LedgerError::InvalidTransition {
                            entry,
                            from: row.status,
                            to: LedgerStatus::ClawedBack,
                        }
                        .into());
                    }
                }
                let account = AccountId::Creator(creator);
                let mut total = Amount::ZERO;
                if !reversals.is_empty() {
                    let mut tx = self.wallets.begin(&[LIABILITY, account], now);
                    for &(entry, amount) in &reversals {
                        tx.reverse_clawback(account, amount, entry, Some(flag.id))?;
                        total += amount;
                    }
                    tx.commit()?;
                }
                for &(entry, _) in &reversals {
                    uow.ledger.clawback(entry, &note, now)?;
                }
                uow.payouts
                    .get_mut(request)?
                    .claw_back_items(Some(flag.id), now);
                Ok((total, total))
            }
            PayoutStatus::Pending | PayoutStatus::UnderReview | PayoutStatus::Approved => {
                if self.settling(uow, request)? {
                    return Err(FraudError::SettlementInFlight(request).into());
                }
                let amount = target.payable_total();
                let payable: Vec<EntryId> = target.payments().iter().map(|(e, _)| *e).collect();
                let excluded = target.excluded_entries();
                for entry in &payable {
                    uow.ledger.clawback(*entry, &note, now)?;
                }
                uow.ledger.release(&excluded, request, now);

                let target = uow.payouts.get_mut(request)?;
                target.transition(PayoutStatus::Rejected, Some(operator), Some(note.clone()), now)?;
                target.claw_back_items(Some(flag.id), now);
                target.frozen_by = Some(flag.id);
                target.rejection_reason = Some(note);
                target.hold = None;
                uow.emit(DomainEvent::PayoutRejected { request, creator });
                info!(request, flag = flag.id, "payout frozen by confirmed fraud");
                Ok((amount, Amount::ZERO))
            }
            PayoutStatus::Rejected | PayoutStatus::Appealed => {
                let amount = target.payable_total();
                if status == PayoutStatus::Appealed {
                    uow.payouts.resolve_appeal(
                        request,
                        AppealOutcome::Upheld,
                        Some(operator),
                        now,
                    )?;
                }
                uow.payouts.get_mut(request)?.frozen_by = Some(flag.id);
                Ok((amount, Amount::ZERO))
            }
        }
    }

    fn reverse_clawback_inner(
        &self,
        entry: EntryId,
        amount: Amount,
        flag: Option<FlagId>,
        reason: &str,
    ) -> Result<ClawbackDebit, EngineError> {
        let now = self.now();
        let mut uow = self.uow();
        let row = uow.ledger.get(entry).ok_or(LedgerError::EntryNotFound(entry))?;
        if reason.trim().is_empty() {
            return Err(LedgerError::MissingReason(entry).into());
        }
        if row.status != LedgerStatus::Paid {
            return Err(LedgerError::InvalidTransition {
                entry,
                from: row.status,
                to: LedgerStatus::ClawedBack,
            }
            .into());
        }
        if amount > row.paid_amount {
            return Err(LedgerError::ClawbackExceedsPaid {
                entry,
                amount,
                paid: row.paid_amount,
            }
            .into());
        }
        let creator = row.creator;
        let request = row.claimed_by;

        let account = AccountId::Creator(creator);
        let mut tx = self.wallets.begin(&[LIABILITY, account], now);
        let debit = tx.reverse_clawback(account, amount, entry, flag)?;
        tx.commit()?;

        uow.ledger.clawback(entry, reason, now)?;
        if let Some(request) = request
            && let Ok(target) = uow.payouts.get_mut(request)
        {
            target.claw_back_entry(entry, flag, amount, now);
        }
        info!(entry, creator, debited = %debit.debited, debt = %debit.debt, "clawback reversed");
        Ok(debit)
    }
}
