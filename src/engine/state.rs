use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;

use crate::approval::ApprovalTable;
use crate::external::DomainEvent;
use crate::fraud::FraudTable;
use crate::ledger::LedgerTable;
use crate::model::{IdempotencyKey, RequestId};
use crate::payout::{PayoutError, PayoutSettlement, PayoutTable};

/// Every aggregate table, locked in the global order
/// ledger -> payouts -> approvals -> fraud.
///
/// Wallet rows, when needed, are locked after these. Events queued here are
/// only handed out once the guards are gone.
pub(crate) struct UnitOfWork<'a> {
    pub ledger: MutexGuard<'a, LedgerTable>,
    pub payouts: MutexGuard<'a, PayoutTable>,
    pub approvals: MutexGuard<'a, ApprovalTable>,
    pub fraud: MutexGuard<'a, FraudTable>,
    events: Vec<DomainEvent>,
}

impl<'a> UnitOfWork<'a> {
    pub fn new(
        ledger: MutexGuard<'a, LedgerTable>,
        payouts: MutexGuard<'a, PayoutTable>,
        approvals: MutexGuard<'a, ApprovalTable>,
        fraud: MutexGuard<'a, FraudTable>,
    ) -> Self {
        Self {
            ledger,
            payouts,
            approvals,
            fraud,
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// Release every guard and return the queued events.
    pub fn finish(self) -> Vec<DomainEvent> {
        self.events
    }
}

#[derive(Debug, Clone)]
enum Slot {
    InFlight(RequestId),
    Done(PayoutSettlement),
}

/// Idempotency keys of payout settlements.
///
/// A key maps to one request forever; a request has at most one key in
/// flight at a time.
#[derive(Debug, Default)]
pub(crate) struct SettlementKeys {
    inner: Mutex<Keys>,
}

#[derive(Debug, Default)]
struct Keys {
    slots: HashMap<IdempotencyKey, Slot>,
    active: HashMap<RequestId, IdempotencyKey>,
}

/// What to do with a settlement attempt.
#[derive(Debug)]
pub(crate) enum Claim {
    Proceed,
    Replay(PayoutSettlement),
}

impl SettlementKeys {
    pub fn claim(&self, key: &IdempotencyKey, request: RequestId) -> Result<Claim, PayoutError> {
        let mut keys = self.inner.lock();
        match keys.slots.get(key) {
            Some(Slot::Done(settlement)) if settlement.request == request => {
                return Ok(Claim::Replay(settlement.clone()));
            }
            Some(Slot::Done(_)) => return Err(PayoutError::KeyReused(key.clone())),
            Some(Slot::InFlight(owner)) if *owner != request => {
                return Err(PayoutError::KeyReused(key.clone()));
            }
            Some(Slot::InFlight(_)) => return Err(PayoutError::InFlight(key.clone())),
            None => {}
        }
        if let Some(active) = keys.active.get(&request) {
            return Err(PayoutError::InFlight(active.clone()));
        }
        keys.slots.insert(key.clone(), Slot::InFlight(request));
        keys.active.insert(request, key.clone());
        Ok(Claim::Proceed)
    }

    /// Record the result for `key`. Pending external settlements keep the
    /// request active until the rail reports back.
    pub fn finish(&self, key: &IdempotencyKey, settlement: &PayoutSettlement, settled: bool) {
        let mut keys = self.inner.lock();
        if settled {
            keys.active.remove(&settlement.request);
        }
        keys.slots.insert(key.clone(), Slot::Done(settlement.clone()));
    }

    /// Forget `key` so the request can be retried.
    pub fn abandon(&self, key: &IdempotencyKey) {
        let mut keys = self.inner.lock();
        if let Some(Slot::InFlight(request) | Slot::Done(PayoutSettlement { request, .. })) =
            keys.slots.remove(key)
        {
            keys.active.remove(&request);
        }
    }

    pub fn active_key(&self, request: RequestId) -> Option<IdempotencyKey> {
        self.inner.lock().active.get(&request).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::payout::SettlementStatus;

    fn settlement(request: RequestId, key: &IdempotencyKey) -> PayoutSettlement {
        PayoutSettlement {
            request,
            creator: 1,
            amount: Amount::from_units(10),
            status: SettlementStatus::Settled,
            key: key.clone(),
        }
    }

    #[test]
    fn second_claim_replays_finished_settlement() {
        let keys = SettlementKeys::default();
        let key = IdempotencyKey::new("k");
        assert!(matches!(keys.claim(&key, 1), Ok(Claim::Proceed)));
        assert_eq!(keys.claim(&key, 1).unwrap_err(), PayoutError::InFlight(key.clone()));

        keys.finish(&key, &settlement(1, &key), true);
        assert!(matches!(keys.claim(&key, 1), Ok(Claim::Replay(_))));
        assert_eq!(keys.claim(&key, 2).unwrap_err(), PayoutError::KeyReused(key));
    }

    #[test]
    fn one_key_in_flight_per_request() {
        let keys = SettlementKeys::default();
        let first = IdempotencyKey::new("a");
        let second = IdempotencyKey::new("b");
        keys.claim(&first, 1).unwrap();
        assert_eq!(
            keys.claim(&second, 1).unwrap_err(),
            PayoutError::InFlight(first.clone())
        );

        keys.abandon(&first);
        assert!(keys.active_key(1).is_none());
        assert!(matches!(keys.claim(&second, 1), Ok(Claim::Proceed)));
    }
}
