//! Fraud signals, flags and creator trust.
//!
//! Signal producers are opaque: the engine only compares the numbers they
//! report against a threshold set derived from the configured sensitivity.
//! Each raised flag records the detected value next to the threshold it broke.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::Amount;
use crate::config::TrustPenaltyConfig;
use crate::model::{ActorId, CreatorId, FlagId, RequestId, Verdict};

pub const INITIAL_TRUST_SCORE: u32 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FraudError {
    #[error("fraud flag {0} not found")]
    FlagNotFound(FlagId),

    #[error("fraud flag {flag} is already {status:?}")]
    AlreadyResolved { flag: FlagId, status: FlagStatus },

    #[error("payout request {request} is held by open fraud flags {flags:?}")]
    OnHold {
        request: RequestId,
        flags: Vec<FlagId>,
    },

    #[error("payout request {0} has no open fraud flags")]
    NoOpenFlags(RequestId),

    #[error("payout request {0} is settling on an external rail")]
    SettlementInFlight(RequestId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Lenient,
    #[default]
    Normal,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Bot score (0-100) at or above which a flag is raised.
    pub bot_score: f64,
    /// Accounts sharing a device at or above which a flag is raised.
    pub duplicate_devices: u32,
    /// View growth multiplier at or above which a flag is raised.
    pub velocity: f64,
    /// Engagement rate below which a flag is raised.
    pub engagement_floor: f64,
    pub new_creator_days: i64,
    pub new_creator_amount: Amount,
}

impl Sensitivity {
    pub fn thresholds(self) -> Thresholds {
        let (bot_score, duplicate_devices, velocity, engagement_floor) = match self {
            Sensitivity::Lenient => (70.0, 3, 15.0, 0.0005),
            Sensitivity::Normal => (60.0, 2, 10.0, 0.001),
            Sensitivity::Strict => (50.0, 1, 5.0, 0.0015),
        };
        Thresholds {
            bot_score,
            duplicate_devices,
            velocity,
            engagement_floor,
            new_creator_days: 30,
            new_creator_amount: Amount::from_units(100),
        }
    }
}

/// Observations handed over by the signal producers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FraudSignals {
    pub bot_score: Option<f64>,
    pub duplicate_devices: u32,
    pub velocity_multiplier: Option<f64>,
    pub engagement_rate: Option<f64>,
}

/// What is being evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FraudContext {
    pub signals: FraudSignals,
    /// Money at stake.
    pub amount: Amount,
    pub request: Option<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    BotScore,
    DuplicateDevice,
    Velocity,
    Engagement,
    NewCreator,
    PreviousFraud,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    Open,
    Confirmed,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagResolution {
    pub verdict: Verdict,
    pub by: ActorId,
    pub at: DateTime<Utc>,
    pub penalty: u32,
    /// Money reversed because of this flag.
    pub clawed_back: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudFlag {
    pub id: FlagId,
    pub creator: CreatorId,
    pub request: Option<RequestId>,
    pub kind: FlagKind,
    pub reason: String,
    pub detected: f64,
    pub threshold: f64,
    pub status: FlagStatus,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<FlagResolution>,
}

/// Per-creator reputation consumed by tier checks and downstream gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatorRisk {
    pub creator: CreatorId,
    pub trust_score: u32,
    pub joined_at: DateTime<Utc>,
    pub fraud_count: u32,
    pub fraud_amount: Amount,
    pub last_fraud_at: Option<DateTime<Utc>>,
    pub completed_payouts: u32,
}

impl CreatorRisk {
    fn new(creator: CreatorId, joined_at: DateTime<Utc>) -> Self {
        Self {
            creator,
            trust_score: INITIAL_TRUST_SCORE,
            joined_at,
            fraud_count: 0,
            fraud_amount: Amount::ZERO,
            last_fraud_at: None,
            completed_payouts: 0,
        }
    }

    pub fn account_age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.joined_at).num_days().max(0)
    }

    pub fn meets(&self, requirements: TierRequirements, now: DateTime<Utc>) -> bool {
        self.trust_score >= requirements.min_trust_score
            && self.account_age_days(now) >= requirements.min_account_age_days
            && self.completed_payouts >= requirements.min_completed_payouts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutTier {
    Micro,
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierRequirements {
    pub min_trust_score: u32,
    pub min_account_age_days: i64,
    pub min_completed_payouts: u32,
}

impl PayoutTier {
    pub fn for_amount(amount: Amount) -> Self {
        if amount <= Amount::from_units(50) {
            PayoutTier::Micro
        } else if amount <= Amount::from_units(200) {
            PayoutTier::Small
        } else if amount <= Amount::from_units(1_000) {
            PayoutTier::Medium
        } else {
            PayoutTier::Large
        }
    }

    pub fn requirements(self) -> TierRequirements {
        let (min_trust_score, min_account_age_days, min_completed_payouts) = match self {
            PayoutTier::Micro => (60, 0, 0),
            PayoutTier::Small => (70, 14, 0),
            PayoutTier::Medium => (80, 30, 3),
            PayoutTier::Large => (90, 60, 5),
        };
        TierRequirements {
            min_trust_score,
            min_account_age_days,
            min_completed_payouts,
        }
    }
}

/// Outcome of screening a payout request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudCheck {
    /// No flags and the creator meets the tier requirements.
    pub approved: bool,
    pub tier: PayoutTier,
    pub flags: Vec<FlagId>,
    pub checked_at: DateTime<Utc>,
}

/// Trust points removed for a confirmed fraud of `amount`, given how many
/// frauds were confirmed before. Monotonic in both, capped.
pub fn trust_penalty(config: &TrustPenaltyConfig, amount: Amount, prior_frauds: u32) -> u32 {
    let by_amount = u32::try_from(amount.whole_multiples_of(config.per_amount)).unwrap_or(u32::MAX);
    config
        .base
        .saturating_add(by_amount)
        .saturating_add(config.repeat_offense.saturating_mul(prior_frauds))
        .min(config.cap)
}

#[derive(Debug, Default)]
pub struct FraudTable {
    flags: HashMap<FlagId, FraudFlag>,
    profiles: HashMap<CreatorId, CreatorRisk>,
    next_id: FlagId,
}

impl FraudTable {
    pub fn get(&self, id: FlagId) -> Option<&FraudFlag> {
        self.flags.get(&id)
    }

    /// Profile for `creator`, created on first sight.
    pub fn profile(&mut self, creator: CreatorId, now: DateTime<Utc>) -> &mut CreatorRisk {
        self.profiles
            .entry(creator)
            .or_insert_with(|| CreatorRisk::new(creator, now))
    }

    pub fn peek_profile(&self, creator: CreatorId) -> Option<&CreatorRisk> {
        self.profiles.get(&creator)
    }

    pub fn register(&mut self, creator: CreatorId, joined_at: DateTime<Utc>) -> CreatorRisk {
        let profile = self.profile(creator, joined_at);
        profile.joined_at = joined_at;
        profile.clone()
    }

    fn insert(&mut self, mut flag: FraudFlag) -> FraudFlag {
        self.next_id += 1;
        flag.id = self.next_id;
        self.flags.insert(flag.id, flag.clone());
        flag
    }

    /// Compare signals against `thresholds` and store a flag per breach.
    pub fn evaluate(
        &mut self,
        creator: CreatorId,
        context: &FraudContext,
        thresholds: Thresholds,
        now: DateTime<Utc>,
    ) -> Vec<FraudFlag> {
        let profile = self.profile(creator, now).clone();
        let signals = &context.signals;
        let mut breaches: Vec<(FlagKind, String, f64, f64)> = Vec::new();

        if profile.fraud_count > 0 {
            breaches.push((
                FlagKind::PreviousFraud,
                format!("creator has {} previous confirmed fraud(s)", profile.fraud_count),
                f64::from(profile.fraud_count),
                0.0,
            ));
        }

        let age = profile.account_age_days(now);
        if age < thresholds.new_creator_days && context.amount > thresholds.new_creator_amount {
            breaches.push((
                FlagKind::NewCreator,
                format!("account is {age} days old with payout of {}", context.amount),
                age as f64,
                thresholds.new_creator_days as f64,
            ));
        }

        if let Some(score) = signals.bot_score
            && score >= thresholds.bot_score
        {
            breaches.push((
                FlagKind::BotScore,
                format!("bot score {score:.1}/100"),
                score,
                thresholds.bot_score,
            ));
        }

        if signals.duplicate_devices >= thresholds.duplicate_devices {
            breaches.push((
                FlagKind::DuplicateDevice,
                format!("{} accounts share a device", signals.duplicate_devices),
                f64::from(signals.duplicate_devices),
                f64::from(thresholds.duplicate_devices),
            ));
        }

        if let Some(multiplier) = signals.velocity_multiplier
            && multiplier >= thresholds.velocity
        {
            breaches.push((
                FlagKind::Velocity,
                format!("views grew {multiplier:.1}x"),
                multiplier,
                thresholds.velocity,
            ));
        }

        if let Some(rate) = signals.engagement_rate
            && rate < thresholds.engagement_floor
        {
            breaches.push((
                FlagKind::Engagement,
                format!("engagement rate {:.3}%", rate * 100.0),
                rate,
                thresholds.engagement_floor,
            ));
        }

        breaches
            .into_iter()
            .map(|(kind, reason, detected, threshold)| {
                self.insert(FraudFlag {
                    id: 0,
                    creator,
                    request: context.request,
                    kind,
                    reason,
                    detected,
                    threshold,
                    status: FlagStatus::Open,
                    created_at: now,
                    resolution: None,
                })
            })
            .collect()
    }

    /// Operator-raised flag.
    pub fn raise(
        &mut self,
        creator: CreatorId,
        request: Option<RequestId>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> FraudFlag {
        self.profile(creator, now);
        self.insert(FraudFlag {
            id: 0,
            creator,
            request,
            kind: FlagKind::Manual,
            reason: reason.to_string(),
            detected: 0.0,
            threshold: 0.0,
            status: FlagStatus::Open,
            created_at: now,
            resolution: None,
        })
    }

    pub fn open_flag(&self, id: FlagId) -> Result<&FraudFlag, FraudError> {
        let flag = self.flags.get(&id).ok_or(FraudError::FlagNotFound(id))?;
        if flag.status != FlagStatus::Open {
            return Err(FraudError::AlreadyResolved {
                flag: id,
                status: flag.status,
            });
        }
        Ok(flag)
    }

    pub fn open_flags_for(&self, request: RequestId) -> Vec<FlagId> {
        let mut ids: Vec<_> = self
            .flags
            .values()
            .filter(|f| f.request == Some(request) && f.status == FlagStatus::Open)
            .map(|f| f.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn flags_for_creator(&self, creator: CreatorId) -> Vec<FraudFlag> {
        let mut flags: Vec<_> = self
            .flags
            .values()
            .filter(|f| f.creator == creator)
            .cloned()
            .collect();
        flags.sort_by_key(|f| f.id);
        flags
    }

    /// Close an open flag. The caller has already applied any balance effect.
    pub fn resolve(
        &mut self,
        id: FlagId,
        verdict: Verdict,
        operator: ActorId,
        penalty: u32,
        clawed_back: Amount,
        now: DateTime<Utc>,
    ) -> Result<FraudFlag, FraudError> {
        self.open_flag(id)?;
        let flag = self.flags.get_mut(&id).ok_or(FraudError::FlagNotFound(id))?;
        flag.status = match verdict {
            Verdict::Confirmed => FlagStatus::Confirmed,
            Verdict::Dismissed => FlagStatus::Dismissed,
        };
        flag.resolution = Some(FlagResolution {
            verdict,
            by: operator,
            at: now,
            penalty,
            clawed_back,
        });
        Ok(flag.clone())
    }

    /// Record a confirmed fraud against `creator` and lower their trust score.
    pub fn apply_penalty(
        &mut self,
        creator: CreatorId,
        amount: Amount,
        config: &TrustPenaltyConfig,
        now: DateTime<Utc>,
    ) -> u32 {
        let profile = self.profile(creator, now);
        let penalty = trust_penalty(config, amount, profile.fraud_count);
        profile.trust_score = profile.trust_score.saturating_sub(penalty);
        profile.fraud_count += 1;
        profile.fraud_amount += amount;
        profile.last_fraud_at = Some(now);
        penalty
    }

    pub fn record_completed_payout(&mut self, creator: CreatorId, now: DateTime<Utc>) {
        self.profile(creator, now).completed_payouts += 1;
    }
}

#[derive(Debug, Default)]
pub struct FraudEngine {
    table: Mutex<FraudTable>,
}

impl FraudEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self) -> MutexGuard<'_, FraudTable> {
        self.table.lock()
    }

    pub fn flag(&self, id: FlagId) -> Option<FraudFlag> {
        self.table.lock().get(id).cloned()
    }

    pub fn flags_for(&self, creator: CreatorId) -> Vec<FraudFlag> {
        self.table.lock().flags_for_creator(creator)
    }

    pub fn profile(&self, creator: CreatorId) -> Option<CreatorRisk> {
        self.table.lock().peek_profile(creator).cloned()
    }

    pub fn trust_score(&self, creator: CreatorId) -> u32 {
        self.profile(creator)
            .map(|p| p.trust_score)
            .unwrap_or(INITIAL_TRUST_SCORE)
    }
}

/// Hold extension measured from the later of the current deadline and now.
pub fn hold_deadline(current: DateTime<Utc>, now: DateTime<Utc>, hold: Duration) -> DateTime<Utc> {
    current.max(now) + hold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::default()
    }

    fn context(signals: FraudSignals, amount: i64) -> FraudContext {
        FraudContext {
            signals,
            amount: Amount::from_units(amount),
            request: Some(1),
        }
    }

    fn seasoned_table(creator: CreatorId) -> FraudTable {
        let mut table = FraudTable::default();
        table.register(creator, t0() - Duration::days(365));
        table
    }

    #[test]
    fn clean_signals_raise_nothing() {
        let mut table = seasoned_table(1);
        let flags = table.evaluate(
            1,
            &context(FraudSignals::default(), 500),
            Sensitivity::Normal.thresholds(),
            t0(),
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn each_breach_carries_detected_and_threshold() {
        let mut table = seasoned_table(1);
        let signals = FraudSignals {
            bot_score: Some(72.5),
            duplicate_devices: 2,
            velocity_multiplier: Some(12.0),
            engagement_rate: Some(0.0002),
        };
        let flags = table.evaluate(1, &context(signals, 20), Sensitivity::Normal.thresholds(), t0());

        let kinds: Vec<_> = flags.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FlagKind::BotScore,
                FlagKind::DuplicateDevice,
                FlagKind::Velocity,
                FlagKind::Engagement
            ]
        );
        let bot = &flags[0];
        assert_eq!(bot.detected, 72.5);
        assert_eq!(bot.threshold, 60.0);
        assert!(flags.iter().all(|f| f.status == FlagStatus::Open));
        assert_eq!(table.open_flags_for(1).len(), 4);
    }

    #[test]
    fn sensitivity_moves_thresholds() {
        let signals = FraudSignals {
            bot_score: Some(55.0),
            ..Default::default()
        };
        let mut table = seasoned_table(1);
        assert!(
            table
                .evaluate(1, &context(signals.clone(), 20), Sensitivity::Normal.thresholds(), t0())
                .is_empty()
        );
        assert_eq!(
            table
                .evaluate(1, &context(signals, 20), Sensitivity::Strict.thresholds(), t0())
                .len(),
            1
        );
    }

    #[test]
    fn new_creator_with_large_payout_is_flagged() {
        let mut table = FraudTable::default();
        table.register(1, t0() - Duration::days(3));
        let flags = table.evaluate(
            1,
            &context(FraudSignals::default(), 150),
            Sensitivity::Normal.thresholds(),
            t0(),
        );
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, FlagKind::NewCreator);
        assert_eq!(flags[0].detected, 3.0);
    }

    #[test]
    fn penalty_grows_with_amount_and_history_and_is_capped() {
        let config = TrustPenaltyConfig::default();
        let small = trust_penalty(&config, Amount::from_units(10), 0);
        let fifty = trust_penalty(&config, Amount::from_units(50), 0);
        let repeat = trust_penalty(&config, Amount::from_units(50), 1);
        let huge = trust_penalty(&config, Amount::from_units(1_000_000), 0);

        assert_eq!(small, 6);
        assert_eq!(fifty, 10);
        assert_eq!(repeat, 15);
        assert!(small < fifty && fifty < repeat);
        assert_eq!(huge, config.cap);
    }

    #[test]
    fn resolve_closes_flag_once() {
        let mut table = seasoned_table(1);
        let flag = table.raise(1, Some(4), "reported", t0());
        let resolved = table
            .resolve(flag.id, Verdict::Dismissed, 9, 0, Amount::ZERO, t0())
            .unwrap();
        assert_eq!(resolved.status, FlagStatus::Dismissed);
        assert!(table.open_flags_for(4).is_empty());

        assert!(matches!(
            table.resolve(flag.id, Verdict::Confirmed, 9, 0, Amount::ZERO, t0()),
            Err(FraudError::AlreadyResolved { .. })
        ));
    }

    #[test]
    fn penalty_lowers_trust_and_counts_fraud() {
        let mut table = seasoned_table(1);
        let config = TrustPenaltyConfig::default();
        let first = table.apply_penalty(1, Amount::from_units(50), &config, t0());
        let second = table.apply_penalty(1, Amount::from_units(50), &config, t0());

        assert!(second > first);
        let profile = table.peek_profile(1).unwrap();
        assert_eq!(profile.trust_score, INITIAL_TRUST_SCORE - first - second);
        assert_eq!(profile.fraud_count, 2);
        assert_eq!(profile.fraud_amount, Amount::from_units(100));
    }

    #[test]
    fn tiers_follow_amount() {
        assert_eq!(PayoutTier::for_amount(Amount::from_units(50)), PayoutTier::Micro);
        assert_eq!(PayoutTier::for_amount(Amount::from_units(51)), PayoutTier::Small);
        assert_eq!(PayoutTier::for_amount(Amount::from_units(999)), PayoutTier::Medium);
        assert_eq!(PayoutTier::for_amount(Amount::from_units(5_000)), PayoutTier::Large);

        let mut table = FraudTable::default();
        let fresh = table.profile(1, t0()).clone();
        assert!(fresh.meets(PayoutTier::Micro.requirements(), t0()));
        assert!(!fresh.meets(PayoutTier::Small.requirements(), t0()));
    }
}
