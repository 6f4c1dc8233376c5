//! Wallet balances and the only primitives that move them.
//!
//! Every mutation runs inside a [`WalletTx`]: the rows it touches are locked
//! in ascending [`AccountId`] order, each change is journaled with its
//! before/after balance, and a transaction that is dropped without
//! [`WalletTx::commit`] restores every row it touched.

use chrono::{DateTime, Utc};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::Amount;
use crate::model::{AccountId, EntryId, FlagId, IdempotencyKey, PlatformAccount, RequestId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("insufficient balance in {account}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        balance: Amount,
        requested: Amount,
    },

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("fee {fee} exceeds gross amount {gross}")]
    FeeExceedsGross { gross: Amount, fee: Amount },

    #[error("cannot transfer from {0} to itself")]
    SameAccount(AccountId),

    #[error("{0} was not locked by this transaction")]
    NotEnlisted(AccountId),

    #[error("a transfer with idempotency key {0} is already in flight")]
    InFlight(IdempotencyKey),

    #[error("idempotency key {0} was already used for a different transfer")]
    KeyReused(IdempotencyKey),

    #[error("{account} balance {balance} is below its allowed floor")]
    NegativeBalance { account: AccountId, balance: Amount },

    #[error("adding {amount} to {account} overflows")]
    Overflow { account: AccountId, amount: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub account: AccountId,
    pub balance: Amount,
    pub total_received: Amount,
    pub total_spent: Amount,
    pub total_clawed_back: Amount,
    /// Clawed-back money the creator could not cover.
    pub debt: Amount,
    pub currency: String,
}

impl Wallet {
    fn new(account: AccountId, currency: &str) -> Self {
        Self {
            account,
            balance: Amount::ZERO,
            total_received: Amount::ZERO,
            total_spent: Amount::ZERO,
            total_clawed_back: Amount::ZERO,
            debt: Amount::ZERO,
            currency: currency.to_string(),
        }
    }
}

/// What caused a balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Credit { reason: String },
    Debit { reason: String },
    TransferOut {
        to: AccountId,
        gross: Amount,
        fee: Amount,
    },
    TransferIn { from: AccountId, net: Amount },
    Fee { payer: AccountId },
    PayoutSettled { request: RequestId },
    PayoutReserved { request: RequestId },
    ReservationReleased { request: RequestId, reason: String },
    Clawback {
        entry: EntryId,
        flag: Option<FlagId>,
        debt: Amount,
    },
    LiabilityRestored { entry: EntryId, flag: Option<FlagId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub account: AccountId,
    pub before: Amount,
    pub after: Amount,
    pub event: AuditEvent,
    pub key: Option<IdempotencyKey>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub key: IdempotencyKey,
    pub from: AccountId,
    pub to: AccountId,
    pub gross: Amount,
    pub fee: Amount,
    pub net: Amount,
    pub at: DateTime<Utc>,
}

/// Split of a clawback between money taken and debt booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClawbackDebit {
    pub debited: Amount,
    pub debt: Amount,
}

#[derive(Debug, Clone)]
enum KeySlot {
    InFlight,
    Done(TransferReceipt),
}

type Row = Arc<Mutex<Wallet>>;
type RowGuard = ArcMutexGuard<RawMutex, Wallet>;

#[derive(Debug)]
pub struct WalletStore {
    rows: RwLock<HashMap<AccountId, Row>>,
    journal: Mutex<Vec<AuditRecord>>,
    transfers: Mutex<HashMap<IdempotencyKey, KeySlot>>,
    currency: String,
    negative_allowance: Amount,
}

impl WalletStore {
    pub fn new(currency: impl Into<String>, negative_allowance: Amount) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            transfers: Mutex::new(HashMap::new()),
            currency: currency.into(),
            negative_allowance,
        }
    }

    fn row(&self, account: AccountId) -> Row {
        if let Some(row) = self.rows.read().get(&account) {
            return Arc::clone(row);
        }
        let mut rows = self.rows.write();
        Arc::clone(
            rows.entry(account)
                .or_insert_with(|| Arc::new(Mutex::new(Wallet::new(account, &self.currency)))),
        )
    }

    /// Lock `accounts` (in ascending order) for one unit of work.
    pub fn begin(&self, accounts: &[AccountId], now: DateTime<Utc>) -> WalletTx<'_> {
        let mut ordered = accounts.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut rows = BTreeMap::new();
        let mut originals = BTreeMap::new();
        for account in ordered {
            let guard = self.row(account).lock_arc();
            originals.insert(account, (*guard).clone());
            rows.insert(account, guard);
        }

        WalletTx {
            store: self,
            rows,
            originals,
            records: Vec::new(),
            key: None,
            now,
            committed: false,
        }
    }

    pub fn credit(
        &self,
        account: AccountId,
        amount: Amount,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AuditRecord, WalletError> {
        let mut tx = self.begin(&[account], now);
        tx.credit(
            account,
            amount,
            AuditEvent::Credit {
                reason: reason.to_string(),
            },
        )?;
        let mut records = tx.commit()?;
        records.pop().ok_or(WalletError::InvalidAmount(amount))
    }

    pub fn debit(
        &self,
        account: AccountId,
        amount: Amount,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AuditRecord, WalletError> {
        let mut tx = self.begin(&[account], now);
        tx.debit(
            account,
            amount,
            AuditEvent::Debit {
                reason: reason.to_string(),
            },
        )?;
        let mut records = tx.commit()?;
        records.pop().ok_or(WalletError::InvalidAmount(amount))
    }

    /// Move `gross` out of `from`; `to` receives `gross - fee` and the fee
    /// account receives `fee`. A key seen before returns its original receipt.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        gross: Amount,
        fee: Amount,
        key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<TransferReceipt, WalletError> {
        if from == to {
            return Err(WalletError::SameAccount(from));
        }
        if !gross.is_positive() || fee.is_negative() {
            return Err(WalletError::InvalidAmount(gross.min(fee)));
        }
        if fee > gross {
            return Err(WalletError::FeeExceedsGross { gross, fee });
        }

        {
            let mut transfers = self.transfers.lock();
            match transfers.get(&key) {
                Some(KeySlot::Done(receipt)) => {
                    if receipt.from != from
                        || receipt.to != to
                        || receipt.gross != gross
                        || receipt.fee != fee
                    {
                        return Err(WalletError::KeyReused(key));
                    }
                    info!(key = %key, "duplicate transfer, returning original receipt");
                    return Ok(receipt.clone());
                }
                Some(KeySlot::InFlight) => return Err(WalletError::InFlight(key)),
                None => {
                    transfers.insert(key.clone(), KeySlot::InFlight);
                }
            }
        }

        let result = self.apply_transfer(from, to, gross, fee, &key, now);
        let mut transfers = self.transfers.lock();
        match &result {
            Ok(receipt) => {
                transfers.insert(key, KeySlot::Done(receipt.clone()));
            }
            Err(_) => {
                transfers.remove(&key);
            }
        }
        result
    }

    fn apply_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        gross: Amount,
        fee: Amount,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<TransferReceipt, WalletError> {
        let fees = AccountId::Platform(PlatformAccount::Fees);
        let net = gross - fee;

        let mut tx = self.begin(&[from, to, fees], now).with_key(key.clone());
        tx.debit(from, gross, AuditEvent::TransferOut { to, gross, fee })?;
        if net.is_positive() {
            tx.credit(to, net, AuditEvent::TransferIn { from, net })?;
        }
        if fee.is_positive() {
            tx.credit(fees, fee, AuditEvent::Fee { payer: from })?;
        }
        tx.commit()?;

        info!(%from, %to, %gross, %fee, key = %key, "transfer applied");
        Ok(TransferReceipt {
            key: key.clone(),
            from,
            to,
            gross,
            fee,
            net,
            at: now,
        })
    }

    pub fn wallet(&self, account: AccountId) -> Option<Wallet> {
        let row = self.rows.read().get(&account).map(Arc::clone)?;
        let wallet = row.lock().clone();
        Some(wallet)
    }

    pub fn balance(&self, account: AccountId) -> Amount {
        self.wallet(account).map(|w| w.balance).unwrap_or_default()
    }

    pub fn journal(&self) -> Vec<AuditRecord> {
        self.journal.lock().clone()
    }

    pub fn journal_for(&self, account: AccountId) -> Vec<AuditRecord> {
        self.journal
            .lock()
            .iter()
            .filter(|r| r.account == account)
            .cloned()
            .collect()
    }
}

/// A set of locked wallet rows mutated as one unit.
pub struct WalletTx<'a> {
    store: &'a WalletStore,
    rows: BTreeMap<AccountId, RowGuard>,
    originals: BTreeMap<AccountId, Wallet>,
    records: Vec<AuditRecord>,
    key: Option<IdempotencyKey>,
    now: DateTime<Utc>,
    committed: bool,
}

impl WalletTx<'_> {
    pub fn with_key(mut self, key: IdempotencyKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn balance(&self, account: AccountId) -> Option<Amount> {
        self.rows.get(&account).map(|row| row.balance)
    }

    fn row_mut(&mut self, account: AccountId) -> Result<&mut Wallet, WalletError> {
        self.rows
            .get_mut(&account)
            .map(|row| &mut **row)
            .ok_or(WalletError::NotEnlisted(account))
    }

    fn record(&mut self, account: AccountId, before: Amount, after: Amount, event: AuditEvent) {
        self.records.push(AuditRecord {
            seq: 0,
            account,
            before,
            after,
            event,
            key: self.key.clone(),
            at: self.now,
        });
    }

    pub fn credit(
        &mut self,
        account: AccountId,
        amount: Amount,
        event: AuditEvent,
    ) -> Result<(), WalletError> {
        if !amount.is_positive() {
            return Err(WalletError::InvalidAmount(amount));
        }
        let wallet = self.row_mut(account)?;
        let before = wallet.balance;
        wallet.balance = before
            .checked_add(amount)
            .ok_or(WalletError::Overflow { account, amount })?;
        wallet.total_received = wallet.total_received.saturating_add(amount);
        let after = wallet.balance;
        self.record(account, before, after, event);
        Ok(())
    }

    /// Debit that never takes a balance below zero.
    pub fn debit(
        &mut self,
        account: AccountId,
        amount: Amount,
        event: AuditEvent,
    ) -> Result<(), WalletError> {
        if !amount.is_positive() {
            return Err(WalletError::InvalidAmount(amount));
        }
        let wallet = self.row_mut(account)?;
        let before = wallet.balance;
        if before < amount {
            return Err(WalletError::InsufficientBalance {
                account,
                balance: before,
                requested: amount,
            });
        }
        wallet.balance -= amount;
        wallet.total_spent = wallet.total_spent.saturating_add(amount);
        let after = wallet.balance;
        self.record(account, before, after, event);
        Ok(())
    }

    /// Take clawed-back money from a creator wallet, letting the balance go
    /// negative down to the configured allowance and booking the rest as debt.
    /// Whatever was actually taken goes back to the payout liability.
    pub fn reverse_clawback(
        &mut self,
        account: AccountId,
        amount: Amount,
        entry: EntryId,
        flag: Option<FlagId>,
    ) -> Result<ClawbackDebit, WalletError> {
        if !amount.is_positive() {
            return Err(WalletError::InvalidAmount(amount));
        }
        let allowance = self.store.negative_allowance;
        let wallet = self.row_mut(account)?;
        let before = wallet.balance;
        let headroom = before.saturating_add(allowance).max_zero();
        let debited = amount.min(headroom);
        let debt = amount - debited;

        wallet.balance -= debited;
        wallet.debt = wallet.debt.saturating_add(debt);
        wallet.total_clawed_back = wallet.total_clawed_back.saturating_add(amount);
        let after = wallet.balance;
        if after.is_negative() || debt.is_positive() {
            warn!(%account, balance = %after, %debt, entry, "clawback left creator wallet short");
        }
        self.record(account, before, after, AuditEvent::Clawback { entry, flag, debt });

        if debited.is_positive() {
            let liability = AccountId::Platform(PlatformAccount::PayoutLiability);
            let wallet = self.row_mut(liability)?;
            let before = wallet.balance;
            wallet.balance = before.checked_add(debited).ok_or(WalletError::Overflow {
                account: liability,
                amount: debited,
            })?;
            let after = wallet.balance;
            self.record(liability, before, after, AuditEvent::LiabilityRestored { entry, flag });
        }

        Ok(ClawbackDebit { debited, debt })
    }

    /// Check balance invariants and publish the journal records.
    pub fn commit(mut self) -> Result<Vec<AuditRecord>, WalletError> {
        let floor = -self.store.negative_allowance;
        for (account, row) in &self.rows {
            let allowed = if account.is_creator() { floor } else { Amount::ZERO };
            if row.balance < allowed {
                error!(%account, balance = %row.balance, "wallet invariant violated, rolling back");
                return Err(WalletError::NegativeBalance {
                    account: *account,
                    balance: row.balance,
                });
            }
        }

        let store = self.store;
        let mut journal = store.journal.lock();
        let mut records = std::mem::take(&mut self.records);
        for record in &mut records {
            record.seq = journal.len() as u64 + 1;
            journal.push(record.clone());
        }
        self.committed = true;
        Ok(records)
    }
}

impl Drop for WalletTx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (account, original) in std::mem::take(&mut self.originals) {
            if let Some(row) = self.rows.get_mut(&account) {
                **row = original;
            }
        }
    }
}
