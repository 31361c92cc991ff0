pub mod account;
pub mod aggregator;
pub mod period;
pub mod receipt;

pub use account::{Pool, PoolDraw, UserTokenAccount};
pub use aggregator::{AccountAggregator, AdjustOutcome, CreditOutcome, DebitOutcome, ResetOutcome};
pub use period::{PeriodKey, ReferenceZone};
pub use receipt::{Platform, PurchaseReceipt};
