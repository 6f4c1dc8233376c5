//! Core domain types shared by every component of the payout engine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Amount;

/// Creator (payee) identifier.
pub type CreatorId = u64;

/// Brand (funding account holder) identifier.
pub type BrandId = u64;

/// Opaque actor identifier handed over by the auth layer (operators, creators).
pub type ActorId = u64;

pub type EntryId = u64;
pub type RequestId = u64;
pub type ItemId = u64;
pub type ApprovalId = u64;
pub type FlagId = u64;

/// The content a ledger entry earns money from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    /// A video submitted to a CPM campaign.
    CampaignVideo(u64),
    /// A boost (bounty) submission, capped by the configured ceiling.
    BoostSubmission(u64),
    /// A view bonus attached to a boost submission.
    ViewBonus(u64),
}

impl SourceRef {
    pub fn parse(kind: &str, id: u64) -> Option<Self> {
        match kind {
            "campaign_video" => Some(SourceRef::CampaignVideo(id)),
            "boost_submission" => Some(SourceRef::BoostSubmission(id)),
            "view_bonus" => Some(SourceRef::ViewBonus(id)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceRef::CampaignVideo(_) => "campaign_video",
            SourceRef::BoostSubmission(_) => "boost_submission",
            SourceRef::ViewBonus(_) => "view_bonus",
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            SourceRef::CampaignVideo(id)
            | SourceRef::BoostSubmission(id)
            | SourceRef::ViewBonus(id) => *id,
        }
    }

    /// Amount owed for `views` under `rate`, or `None` if it does not fit in
    /// an [`Amount`].
    ///
    /// `boost_cap` only applies to boost submissions.
    pub fn estimate_amount(
        &self,
        rate: RateModel,
        views: u64,
        boost_cap: Option<Amount>,
    ) -> Option<Amount> {
        let raw = rate.amount(views)?;
        Some(match (self, boost_cap) {
            (SourceRef::BoostSubmission(_), Some(cap)) => raw.min(cap),
            _ => raw,
        })
    }
}

/// How a views snapshot turns into money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum RateModel {
    /// Fixed amount per view.
    PerView { rate: Amount },
    /// Rate per thousand views plus a flat fee for the video.
    Cpm { rpm: Amount, flat_per_video: Amount },
    /// One-time bonus once views reach `threshold`.
    Milestone { threshold: u64, bonus: Amount },
    /// Rate per thousand views above `min_views`. Nothing below it.
    CpmBonus { rpm: Amount, min_views: u64 },
    /// Fixed amount whatever the views (boost retainer).
    Flat { amount: Amount },
}

impl RateModel {
    pub fn kind(&self) -> &'static str {
        match self {
            RateModel::PerView { .. } => "per_view",
            RateModel::Cpm { .. } => "cpm",
            RateModel::Milestone { .. } => "milestone",
            RateModel::CpmBonus { .. } => "cpm_bonus",
            RateModel::Flat { .. } => "flat",
        }
    }

    pub fn is_negative(&self) -> bool {
        match *self {
            RateModel::PerView { rate } => rate.is_negative(),
            RateModel::Cpm {
                rpm,
                flat_per_video,
            } => rpm.is_negative() || flat_per_video.is_negative(),
            RateModel::Milestone { bonus, .. } => bonus.is_negative(),
            RateModel::CpmBonus { rpm, .. } => rpm.is_negative(),
            RateModel::Flat { amount } => amount.is_negative(),
        }
    }

    /// Money earned at `views`. `None` on overflow.
    pub fn amount(&self, views: u64) -> Option<Amount> {
        match *self {
            RateModel::PerView { rate } => rate.checked_times(views),
            RateModel::Cpm {
                rpm,
                flat_per_video,
            } => rpm.checked_per_thousand(views)?.checked_add(flat_per_video),
            RateModel::Milestone { threshold, bonus } => {
                Some(if views >= threshold { bonus } else { Amount::ZERO })
            }
            RateModel::CpmBonus { rpm, min_views } => {
                rpm.checked_per_thousand(views.saturating_sub(min_views))
            }
            RateModel::Flat { amount } => Some(amount),
        }
    }
}

impl From<Amount> for RateModel {
    fn from(rate: Amount) -> Self {
        RateModel::PerView { rate }
    }
}

impl fmt::Display for RateModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateModel::PerView { rate } => write!(f, "{rate}/view"),
            RateModel::Cpm {
                rpm,
                flat_per_video,
            } => write!(f, "{rpm}/1k views + {flat_per_video}"),
            RateModel::Milestone { threshold, bonus } => write!(f, "{bonus} at {threshold} views"),
            RateModel::CpmBonus { rpm, min_views } => {
                write!(f, "{rpm}/1k views over {min_views}")
            }
            RateModel::Flat { amount } => write!(f, "{amount} flat"),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Platform-owned balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformAccount {
    /// Money owed to creators, funded by brands; every payout draws from it.
    PayoutLiability,
    /// Fee revenue.
    Fees,
    /// Funds reserved for in-flight external rail payouts.
    RailReserve,
}

/// A wallet owner. The derived ordering is the global wallet lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountId {
    Platform(PlatformAccount),
    Brand(BrandId),
    Creator(CreatorId),
}

impl AccountId {
    pub fn is_creator(&self) -> bool {
        matches!(self, AccountId::Creator(_))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountId::Platform(PlatformAccount::PayoutLiability) => {
                write!(f, "platform:payout_liability")
            }
            AccountId::Platform(PlatformAccount::Fees) => write!(f, "platform:fees"),
            AccountId::Platform(PlatformAccount::RailReserve) => write!(f, "platform:rail_reserve"),
            AccountId::Brand(id) => write!(f, "brand:{id}"),
            AccountId::Creator(id) => write!(f, "creator:{id}"),
        }
    }
}

/// Key deduplicating retried money movements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Key used when an approval executes its subject, so re-execution never
    /// moves money twice.
    pub fn for_approval(approval: ApprovalId) -> Self {
        Self(format!("approval-{approval}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    Bank,
    Crypto,
}

/// Where a completed payout goes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethod {
    /// Credit the creator's platform wallet.
    #[default]
    Wallet,
    /// Send through an external rail; settles asynchronously.
    External { rail: Rail, destination: String },
}

/// An operator's vote on an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// Operator verdict on a fraud flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Confirmed,
    Dismissed,
}

/// Commands accepted by [`Engine::apply`](crate::Engine::apply).
#[derive(Debug, Clone)]
pub enum Command {
    /// New views snapshot for a revenue source.
    Accrue {
        creator: CreatorId,
        source: SourceRef,
        rate: RateModel,
        views: u64,
    },
    /// Batch clearable entries into a payout request and open its approval.
    RequestWithdrawal {
        creator: CreatorId,
        method: PayoutMethod,
    },
    Vote {
        approval: ApprovalId,
        voter: ActorId,
        decision: Decision,
        comment: Option<String>,
    },
    Execute {
        approval: ApprovalId,
        executor: ActorId,
    },
    FlagItem {
        item: ItemId,
        operator: ActorId,
        reason: String,
    },
    OverrideItem {
        item: ItemId,
        operator: ActorId,
        amount: Amount,
        reason: String,
    },
    ResolveFraudFlag {
        flag: FlagId,
        verdict: Verdict,
        operator: ActorId,
    },
    Appeal {
        request: RequestId,
        creator: CreatorId,
        evidence: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Accrue { .. } => "accrue",
            Command::RequestWithdrawal { .. } => "request_withdrawal",
            Command::Vote { .. } => "vote",
            Command::Execute { .. } => "execute",
            Command::FlagItem { .. } => "flag_item",
            Command::OverrideItem { .. } => "override_item",
            Command::ResolveFraudFlag { .. } => "resolve_fraud_flag",
            Command::Appeal { .. } => "appeal",
        }
    }
}
