//! Error types surfaced by the engine.

use thiserror::Error;

use crate::approval::ApprovalError;
use crate::external::RailError;
use crate::fraud::FraudError;
use crate::ledger::LedgerError;
use crate::model::{ActorId, RequestId};
use crate::payout::PayoutError;
use crate::wallet::WalletError;

/// Top-level error returned by every [`Engine`](super::Engine) command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("payout: {0}")]
    Payout(#[from] PayoutError),

    #[error("approval: {0}")]
    Approval(#[from] ApprovalError),

    #[error("fraud: {0}")]
    Fraud(#[from] FraudError),

    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    #[error("payout request {request}: rail failure: {source}")]
    Rail {
        request: RequestId,
        #[source]
        source: RailError,
    },

    #[error("actor {0} is not an operator")]
    NotOperator(ActorId),
}

/// How a caller should react to an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lost a race; retry with fresh state.
    Conflict,
    /// The input or current state does not allow the action.
    PolicyViolation,
    /// A deadline passed or has not passed yet.
    Expired,
    /// The payment rail refused the payout; funds were un-reserved.
    ExternalRailFailure,
    NotFound,
    /// Broken money invariant. The triggering unit of work was aborted.
    Invariant,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use ErrorKind::*;
        match self {
            EngineError::Ledger(e) => match e {
                LedgerError::EntryNotFound(_) => NotFound,
                LedgerError::AlreadyLocked(_) => Conflict,
                LedgerError::ClearingWindowOpen { .. } => Expired,
                LedgerError::PaidExceedsAccrued { .. } => Invariant,
                LedgerError::InvalidTransition { .. }
                | LedgerError::MissingReason(_)
                | LedgerError::NegativeRate { .. }
                | LedgerError::AmountOverflow { .. }
                | LedgerError::ClawbackExceedsPaid { .. } => PolicyViolation,
            },
            EngineError::Payout(e) => match e {
                PayoutError::RequestNotFound(_)
                | PayoutError::ItemNotFound(_)
                | PayoutError::UnknownReference(_) => NotFound,
                PayoutError::InFlight(_) => Conflict,
                PayoutError::AppealWindowClosed { .. } => Expired,
                _ => PolicyViolation,
            },
            EngineError::Approval(e) => match e {
                ApprovalError::NotFound(_) => NotFound,
                ApprovalError::Expired(_) => Expired,
                _ => PolicyViolation,
            },
            EngineError::Fraud(e) => match e {
                FraudError::FlagNotFound(_) => NotFound,
                FraudError::SettlementInFlight(_) => Conflict,
                _ => PolicyViolation,
            },
            EngineError::Wallet(e) => match e {
                WalletError::InsufficientBalance { .. } | WalletError::InFlight(_) => Conflict,
                WalletError::NegativeBalance { .. } | WalletError::NotEnlisted(_) => Invariant,
                WalletError::InvalidAmount(_)
                | WalletError::FeeExceedsGross { .. }
                | WalletError::SameAccount(_)
                | WalletError::KeyReused(_)
                | WalletError::Overflow { .. } => PolicyViolation,
            },
            EngineError::Rail { .. } => ExternalRailFailure,
            EngineError::NotOperator(_) => PolicyViolation,
        }
    }

    pub fn is_invariant(&self) -> bool {
        self.kind() == ErrorKind::Invariant
    }
}
