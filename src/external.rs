//! Narrow contracts with the services around the engine: the tax/KYC gate,
//! external payment rails, notification delivery and view ingestion.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::model::{ApprovalId, CreatorId, EntryId, FlagId, Rail, RequestId, SourceRef};

/// Tax-form/KYC predicate consulted before a withdrawal is filed.
pub trait WithdrawalGate: Send + Sync {
    fn is_withdrawal_permitted(&self, creator: CreatorId, amount: Amount) -> bool;
}

/// Gate that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl WithdrawalGate for AllowAll {
    fn is_withdrawal_permitted(&self, _creator: CreatorId, _amount: Amount) -> bool {
        true
    }
}

/// Reference handed back by a rail for an accepted instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExternalRef(pub String);

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutInstruction {
    pub request: RequestId,
    pub creator: CreatorId,
    pub amount: Amount,
    pub currency: String,
    pub rail: Rail,
    pub destination: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RailError {
    #[error("rail rejected instruction: {0}")]
    Rejected(String),

    #[error("rail unavailable: {0}")]
    Unavailable(String),
}

/// Final word from a rail on a previously accepted instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RailOutcome {
    Settled,
    Failed(String),
}

/// Bank or crypto payout rail.
pub trait PaymentRail: Send + Sync {
    fn submit(&self, instruction: &PayoutInstruction) -> Result<ExternalRef, RailError>;
}

/// Rail used when none is configured; refuses every instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRail;

impl PaymentRail for NoRail {
    fn submit(&self, instruction: &PayoutInstruction) -> Result<ExternalRef, RailError> {
        Err(RailError::Unavailable(format!(
            "no {:?} rail configured for request {}",
            instruction.rail, instruction.request
        )))
    }
}

/// Source of current view counts, used to refresh accruals on demand.
pub trait SourceCatalog: Send + Sync {
    fn current_views(&self, source: &SourceRef) -> Option<u64>;
}

/// Notifications emitted after a unit of work commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum DomainEvent {
    #[serde(rename = "ledger.cleared")]
    LedgerCleared { entry: EntryId, creator: CreatorId },
    #[serde(rename = "payout.approved")]
    PayoutApproved { request: RequestId, creator: CreatorId },
    #[serde(rename = "payout.rejected")]
    PayoutRejected { request: RequestId, creator: CreatorId },
    #[serde(rename = "payout.completed")]
    PayoutCompleted {
        request: RequestId,
        creator: CreatorId,
        amount: Amount,
    },
    #[serde(rename = "fraud.confirmed")]
    FraudConfirmed {
        flag: FlagId,
        creator: CreatorId,
        amount: Amount,
        penalty: u32,
    },
    #[serde(rename = "approval.expired")]
    ApprovalExpired { approval: ApprovalId },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::LedgerCleared { .. } => "ledger.cleared",
            DomainEvent::PayoutApproved { .. } => "payout.approved",
            DomainEvent::PayoutRejected { .. } => "payout.rejected",
            DomainEvent::PayoutCompleted { .. } => "payout.completed",
            DomainEvent::FraudConfirmed { .. } => "fraud.confirmed",
            DomainEvent::ApprovalExpired { .. } => "approval.expired",
        }
    }
}

/// Fire-and-forget delivery. Implementations must not fail the caller.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DomainEvent);
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &DomainEvent) {
        info!(event = event.name(), ?event, "domain event");
    }
}

/// Sink that keeps every event, for tests and replays.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(DomainEvent::name).collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &DomainEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_dotted_names() {
        let event = DomainEvent::PayoutApproved {
            request: 3,
            creator: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "payout.approved");
        assert_eq!(json["request"], 3);
        assert_eq!(event.name(), "payout.approved");
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.publish(&DomainEvent::ApprovalExpired { approval: 1 });
        sink.publish(&DomainEvent::LedgerCleared { entry: 2, creator: 1 });
        assert_eq!(sink.names(), vec!["approval.expired", "ledger.cleared"]);
    }

    #[test]
    fn no_rail_refuses() {
        let instruction = PayoutInstruction {
            request: 1,
            creator: 1,
            amount: Amount::from_units(5),
            currency: "USD".into(),
            rail: Rail::Bank,
            destination: "acct".into(),
        };
        assert!(matches!(
            NoRail.submit(&instruction),
            Err(RailError::Unavailable(_))
        ));
    }
}
