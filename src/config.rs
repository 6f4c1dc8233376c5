//! Engine configuration.
//!
//! Every threshold is data, loadable from TOML; missing keys fall back to the
//! defaults below.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::Amount;
use crate::fraud::Sensitivity;
use crate::model::ActorId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// One row of the approval threshold table.
///
/// Amounts up to and including `up_to` need `required` distinct approvals; the
/// last band must be open-ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalBand {
    #[serde(default)]
    pub up_to: Option<Amount>,
    pub required: u8,
}

/// What a reject vote does to a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// A single reject decides the request.
    #[default]
    Veto,
    /// The request is rejected once this many operators reject it.
    Threshold(u8),
}

/// Parameters of the trust-score penalty applied on confirmed fraud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPenaltyConfig {
    /// Points deducted for any confirmed fraud.
    pub base: u32,
    /// One extra point per this much fraudulent money.
    pub per_amount: Amount,
    /// Extra points per previously confirmed fraud.
    pub repeat_offense: u32,
    /// Upper bound of a single penalty.
    pub cap: u32,
}

impl Default for TrustPenaltyConfig {
    fn default() -> Self {
        Self {
            base: 5,
            per_amount: Amount::from_units(10),
            repeat_offense: 5,
            cap: 50,
        }
    }
}

/// Longest window any `*_hours` setting may ask for (ten years).
pub const MAX_WINDOW_HOURS: i64 = 10 * 365 * 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hold period between accrual and withdrawability.
    #[serde(default = "default_clearing_window_hours")]
    pub clearing_window_hours: i64,

    /// Smallest payout request a creator may file.
    #[serde(default = "default_minimum_withdrawal")]
    pub minimum_withdrawal: Amount,

    #[serde(default = "default_approval_bands")]
    pub approval_bands: Vec<ApprovalBand>,

    #[serde(default = "default_approval_expiry_hours")]
    pub approval_expiry_hours: i64,

    #[serde(default)]
    pub reject_policy: RejectPolicy,

    /// Time an operator has to resolve an appeal before it lapses.
    #[serde(default = "default_appeal_window_hours")]
    pub appeal_window_hours: i64,

    /// Extension applied to a payout's clearing deadline on a fraud hold.
    #[serde(default = "default_fraud_hold_hours")]
    pub fraud_hold_hours: i64,

    #[serde(default)]
    pub fraud_sensitivity: Sensitivity,

    /// How far below zero a clawback may push a creator wallet before the
    /// remainder is booked as standing debt.
    #[serde(default = "default_negative_allowance")]
    pub negative_allowance: Amount,

    #[serde(default)]
    pub trust_penalty: TrustPenaltyConfig,

    #[serde(default)]
    pub p2p_fee_bps: u32,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// Ceiling on what a single boost submission can accrue.
    #[serde(default)]
    pub boost_submission_cap: Option<Amount>,

    /// Operators allowed to vote. Empty means any actor except the payee.
    #[serde(default)]
    pub operators: Vec<ActorId>,
}

fn default_clearing_window_hours() -> i64 {
    7 * 24
}

fn default_minimum_withdrawal() -> Amount {
    Amount::from_units(10)
}

fn default_approval_bands() -> Vec<ApprovalBand> {
    vec![
        ApprovalBand {
            up_to: Some(Amount::from_units(200)),
            required: 1,
        },
        ApprovalBand {
            up_to: Some(Amount::from_units(1_000)),
            required: 2,
        },
        ApprovalBand {
            up_to: None,
            required: 3,
        },
    ]
}

fn default_approval_expiry_hours() -> i64 {
    24
}

fn default_appeal_window_hours() -> i64 {
    72
}

fn default_fraud_hold_hours() -> i64 {
    48
}

fn default_negative_allowance() -> Amount {
    Amount::from_units(100)
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clearing_window_hours: default_clearing_window_hours(),
            minimum_withdrawal: default_minimum_withdrawal(),
            approval_bands: default_approval_bands(),
            approval_expiry_hours: default_approval_expiry_hours(),
            reject_policy: RejectPolicy::default(),
            appeal_window_hours: default_appeal_window_hours(),
            fraud_hold_hours: default_fraud_hold_hours(),
            fraud_sensitivity: Sensitivity::default(),
            negative_allowance: default_negative_allowance(),
            trust_penalty: TrustPenaltyConfig::default(),
            p2p_fee_bps: 0,
            currency: default_currency(),
            boost_submission_cap: None,
            operators: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.clearing_window_hours < 0 {
            return invalid("clearing_window_hours must not be negative".into());
        }
        if self.approval_expiry_hours <= 0 {
            return invalid("approval_expiry_hours must be positive".into());
        }
        if self.appeal_window_hours <= 0 || self.fraud_hold_hours <= 0 {
            return invalid("appeal and fraud hold windows must be positive".into());
        }
        let windows = [
            ("clearing_window_hours", self.clearing_window_hours),
            ("approval_expiry_hours", self.approval_expiry_hours),
            ("appeal_window_hours", self.appeal_window_hours),
            ("fraud_hold_hours", self.fraud_hold_hours),
        ];
        if let Some((name, hours)) = windows.iter().find(|(_, h)| *h > MAX_WINDOW_HOURS) {
            return invalid(format!("{name} {hours} exceeds {MAX_WINDOW_HOURS}"));
        }
        if self.minimum_withdrawal.is_negative() || self.negative_allowance.is_negative() {
            return invalid("amounts must not be negative".into());
        }
        if self.p2p_fee_bps > 10_000 {
            return invalid(format!("p2p_fee_bps {} exceeds 100%", self.p2p_fee_bps));
        }
        if let RejectPolicy::Threshold(0) = self.reject_policy {
            return invalid("reject threshold must be at least 1".into());
        }

        let Some((last, bounded)) = self.approval_bands.split_last() else {
            return invalid("approval_bands must not be empty".into());
        };
        if last.up_to.is_some() {
            return invalid("last approval band must be open-ended".into());
        }
        let mut previous: Option<Amount> = None;
        for band in bounded {
            let Some(up_to) = band.up_to else {
                return invalid("only the last approval band may be open-ended".into());
            };
            if previous.is_some_and(|p| up_to <= p) {
                return invalid("approval bands must be strictly ascending".into());
            }
            previous = Some(up_to);
        }
        if self.approval_bands.iter().any(|b| b.required == 0) {
            return invalid("every approval band needs at least one approver".into());
        }
        if !self.operators.is_empty()
            && let Some(band) = self
                .approval_bands
                .iter()
                .find(|b| usize::from(b.required) > self.operators.len())
        {
            return invalid(format!(
                "approval band needs {} approvers but only {} operators are configured",
                band.required,
                self.operators.len()
            ));
        }

        Ok(())
    }

    /// Approvals needed to release `amount`.
    pub fn required_approvals(&self, amount: Amount) -> u8 {
        self.approval_bands
            .iter()
            .find(|band| band.up_to.is_none_or(|cap| amount <= cap))
            .map(|band| band.required)
            .unwrap_or(1)
    }

    pub fn clearing_window(&self) -> Duration {
        Duration::hours(self.clearing_window_hours)
    }

    pub fn approval_expiry(&self) -> Duration {
        Duration::hours(self.approval_expiry_hours)
    }

    pub fn appeal_window(&self) -> Duration {
        Duration::hours(self.appeal_window_hours)
    }

    pub fn fraud_hold(&self) -> Duration {
        Duration::hours(self.fraud_hold_hours)
    }

    pub fn is_operator(&self, actor: ActorId) -> bool {
        self.operators.is_empty() || self.operators.contains(&actor)
    }
}
