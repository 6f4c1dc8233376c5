pub mod amount;
pub mod approval;
pub mod clock;
pub mod config;
pub mod csv;
pub mod engine;
pub mod external;
pub mod fraud;
pub mod ledger;
pub mod model;
pub mod payout;
pub mod wallet;

pub use amount::Amount;
pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineError, ErrorKind, Outcome, SweepReport};
pub use model::{AccountId, Command, CreatorId, PayoutMethod, RateModel, SourceRef};
