//! Ledger and payout engine.
//!
//! The engine owns the aggregate repositories (ledger, payout requests,
//! approvals, fraud flags, wallets) and runs every command as one unit of
//! work over them. It is `Send + Sync`; share it behind an `Arc`.
//! Also supports an async stream of commands and a periodic sweeper.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

use crate::Amount;
use crate::approval::{ApprovalBook, ApprovalRequest, TransferResult};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::external::{
    AllowAll, DomainEvent, EventSink, LogSink, NoRail, PaymentRail, SourceCatalog, WithdrawalGate,
};
use crate::fraud::{CreatorRisk, FraudEngine, FraudFlag};
use crate::ledger::{Accrual, AccrualChange, Ledger, LedgerEntry};
use crate::model::{
    AccountId, ActorId, ApprovalId, BrandId, Command, CreatorId, EntryId, IdempotencyKey,
    PlatformAccount, RateModel, RequestId, SourceRef,
};
use crate::payout::{PayoutBook, PayoutItem, PayoutRequest};
use crate::wallet::{AuditRecord, TransferReceipt, WalletStore};

mod state;
use state::{SettlementKeys, UnitOfWork};

mod error;
pub use error::{EngineError, ErrorKind};

mod review;
mod sweep;
mod withdraw;

pub use sweep::SweepReport;

/// Result of applying a [`Command`].
#[derive(Debug, Clone)]
pub enum Outcome {
    Accrued(LedgerEntry),
    WithdrawalRequested(PayoutRequest),
    Voted(ApprovalRequest),
    Executed(TransferResult),
    ItemUpdated(PayoutItem),
    FlagResolved(FraudFlag),
    Appealed(PayoutRequest),
}

/// The ledger and payout engine.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ledger: Ledger,
    payouts: PayoutBook,
    approvals: ApprovalBook,
    fraud: FraudEngine,
    wallets: WalletStore,
    settlements: SettlementKeys,
    gate: Arc<dyn WithdrawalGate>,
    rail: Arc<dyn PaymentRail>,
    events: Arc<dyn EventSink>,
    catalog: Option<Arc<dyn SourceCatalog>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Wires collaborators into an [`Engine`]. Anything not set gets the
/// permissive or inert default.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<dyn WithdrawalGate>,
    rail: Arc<dyn PaymentRail>,
    events: Arc<dyn EventSink>,
    catalog: Option<Arc<dyn SourceCatalog>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(mut self, gate: Arc<dyn WithdrawalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn rail(mut self, rail: Arc<dyn PaymentRail>) -> Self {
        self.rail = rail;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn SourceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            wallets: WalletStore::new(self.config.currency.clone(), self.config.negative_allowance),
            config: self.config,
            clock: self.clock,
            ledger: Ledger::new(),
            payouts: PayoutBook::new(),
            approvals: ApprovalBook::new(),
            fraud: FraudEngine::new(),
            settlements: SettlementKeys::default(),
            gate: self.gate,
            rail: self.rail,
            events: self.events,
            catalog: self.catalog,
        }
    }
}

/// Public API
impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: Arc::new(SystemClock),
            gate: Arc::new(AllowAll),
            rail: Arc::new(NoRail),
            events: Arc::new(LogSink),
            catalog: None,
        }
    }

    /// Run the engine over a command stream. Failed commands are logged and
    /// skipped.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a failing command must not stop the engine
            let _ = self.apply(command);
        }
    }

    /// Apply one command from the command surface.
    pub fn apply(&self, command: Command) -> Result<Outcome, EngineError> {
        match command {
            Command::Accrue {
                creator,
                source,
                rate,
                views,
            } => self.accrue(creator, source, rate, views).map(Outcome::Accrued),
            Command::RequestWithdrawal { creator, method } => self
                .request_withdrawal(creator, method)
                .map(Outcome::WithdrawalRequested),
            Command::Vote {
                approval,
                voter,
                decision,
                comment,
            } => self
                .vote(approval, voter, decision, comment.as_deref())
                .map(Outcome::Voted),
            Command::Execute { approval, executor } => {
                self.execute(approval, executor).map(Outcome::Executed)
            }
            Command::FlagItem {
                item,
                operator,
                reason,
            } => self.flag_item(item, operator, &reason).map(Outcome::ItemUpdated),
            Command::OverrideItem {
                item,
                operator,
                amount,
                reason,
            } => self
                .override_item(item, operator, amount, &reason)
                .map(Outcome::ItemUpdated),
            Command::ResolveFraudFlag {
                flag,
                verdict,
                operator,
            } => self
                .resolve_fraud_flag(flag, verdict, operator)
                .map(Outcome::FlagResolved),
            Command::Appeal {
                request,
                creator,
                evidence,
            } => self.appeal(request, creator, &evidence).map(Outcome::Appealed),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn payouts(&self) -> &PayoutBook {
        &self.payouts
    }

    pub fn approvals(&self) -> &ApprovalBook {
        &self.approvals
    }

    pub fn fraud(&self) -> &FraudEngine {
        &self.fraud
    }

    pub fn wallets(&self) -> &WalletStore {
        &self.wallets
    }

    /// Record a views snapshot for `(creator, source)`.
    pub fn accrue(
        &self,
        creator: CreatorId,
        source: SourceRef,
        rate: impl Into<RateModel>,
        views: u64,
    ) -> Result<LedgerEntry, EngineError> {
        let rate = rate.into();
        let now = self.now();
        let result = self
            .ledger
            .write()
            .accrue(
                Accrual {
                    creator,
                    source,
                    rate,
                    views,
                },
                self.config.boost_submission_cap,
                self.config.clearing_window(),
                now,
            )
            .map(|(entry, change)| {
                if change == AccrualChange::Created {
                    info!(creator, %source, "ledger entry opened");
                }
                entry
            })
            .map_err(EngineError::from);
        Self::log_result("accrue", format_args!("creator={creator} source={source}"), &result);
        result
    }

    /// Re-accrue `source` from the view catalog. `None` when there is no
    /// catalog, no entry for the source, or no view count for it.
    pub fn refresh_accrual(
        &self,
        creator: CreatorId,
        source: SourceRef,
    ) -> Result<Option<LedgerEntry>, EngineError> {
        let Some(catalog) = &self.catalog else {
            return Ok(None);
        };
        let Some(entry) = self.ledger.by_source(creator, source) else {
            return Ok(None);
        };
        let Some(views) = catalog.current_views(&source) else {
            return Ok(None);
        };
        self.accrue(creator, source, entry.rate, views).map(Some)
    }

    /// Promote one entry whose clearing window has passed.
    pub fn mark_cleared(&self, entry: EntryId) -> Result<LedgerEntry, EngineError> {
        let result = self
            .ledger
            .mark_cleared(entry, self.now())
            .map_err(EngineError::from);
        Self::log_result("mark_cleared", format_args!("entry={entry}"), &result);
        if let Ok(entry) = &result {
            self.publish(vec![DomainEvent::LedgerCleared {
                entry: entry.id,
                creator: entry.creator,
            }]);
        }
        result
    }

    pub fn register_creator(&self, creator: CreatorId, joined_at: DateTime<Utc>) -> CreatorRisk {
        self.fraud.write().register(creator, joined_at)
    }

    pub fn credit(
        &self,
        account: AccountId,
        amount: Amount,
        reason: &str,
    ) -> Result<AuditRecord, EngineError> {
        let result = self
            .wallets
            .credit(account, amount, reason, self.now())
            .map_err(EngineError::from);
        Self::log_result("credit", format_args!("account={account} amount={amount}"), &result);
        result
    }

    pub fn debit(
        &self,
        account: AccountId,
        amount: Amount,
        reason: &str,
    ) -> Result<AuditRecord, EngineError> {
        let result = self
            .wallets
            .debit(account, amount, reason, self.now())
            .map_err(EngineError::from);
        Self::log_result("debit", format_args!("account={account} amount={amount}"), &result);
        result
    }

    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        gross: Amount,
        fee: Amount,
        key: IdempotencyKey,
    ) -> Result<TransferReceipt, EngineError> {
        let result = self
            .wallets
            .transfer(from, to, gross, fee, key, self.now())
            .map_err(EngineError::from);
        Self::log_result("transfer", format_args!("from={from} to={to} gross={gross}"), &result);
        result
    }

    /// Creator-to-creator transfer with the configured percentage fee.
    pub fn p2p_transfer(
        &self,
        from: CreatorId,
        to: CreatorId,
        gross: Amount,
        key: IdempotencyKey,
    ) -> Result<TransferReceipt, EngineError> {
        let fee = gross.bps(self.config.p2p_fee_bps);
        self.transfer(AccountId::Creator(from), AccountId::Creator(to), gross, fee, key)
    }

    /// Move brand money into the payout liability every payout draws from.
    pub fn fund_payouts(
        &self,
        brand: BrandId,
        amount: Amount,
        key: IdempotencyKey,
    ) -> Result<TransferReceipt, EngineError> {
        self.transfer(
            AccountId::Brand(brand),
            AccountId::Platform(PlatformAccount::PayoutLiability),
            amount,
            Amount::ZERO,
            key,
        )
    }

    pub fn wallet_balance(&self, account: AccountId) -> Amount {
        self.wallets.balance(account)
    }

    pub fn entry_by_source(&self, creator: CreatorId, source: SourceRef) -> Option<LedgerEntry> {
        self.ledger.by_source(creator, source)
    }

    pub fn payout_request(&self, id: RequestId) -> Option<PayoutRequest> {
        self.payouts.get(id)
    }

    pub fn payout_history(&self, creator: CreatorId) -> Vec<PayoutRequest> {
        self.payouts.for_creator(creator)
    }

    pub fn approval(&self, id: ApprovalId) -> Option<ApprovalRequest> {
        self.approvals.get(id)
    }

    /// Live approvals `operator` can still vote on.
    pub fn pending_approvals(&self, operator: ActorId) -> Vec<ApprovalRequest> {
        self.approvals.pending_for(operator, self.now())
    }

    pub fn trust_score(&self, creator: CreatorId) -> u32 {
        self.fraud.trust_score(creator)
    }
}

/// Private API
impl Engine {
    fn uow(&self) -> UnitOfWork<'_> {
        // Field order is the global lock order
        UnitOfWork::new(
            self.ledger.write(),
            self.payouts.write(),
            self.approvals.write(),
            self.fraud.write(),
        )
    }

    fn publish(&self, events: Vec<DomainEvent>) {
        for event in &events {
            self.events.publish(event);
        }
    }

    fn ensure_operator(&self, actor: ActorId) -> Result<(), EngineError> {
        if self.config.is_operator(actor) {
            Ok(())
        } else {
            Err(EngineError::NotOperator(actor))
        }
    }

    /// Small helper to log command results
    fn log_result<T>(command: &str, subject: fmt::Arguments<'_>, result: &Result<T, EngineError>) {
        match result {
            Ok(_) => {
                info!(%subject, "{command} applied");
            }
            Err(e) if e.is_invariant() => {
                error!(%subject, reason = %e, "{command} aborted: invariant violated");
            }
            Err(e) => {
                info!(%subject, kind = ?e.kind(), reason = %e, "{command} skipped");
            }
        }
    }
}
