use crate::config::TierQuota;
use crate::error::{Error, Result};
use crate::ledger::{EntryId, LedgerSource};
use crate::state::period::PeriodKey;
use serde::{Deserialize, Serialize};

/// Which pool a credit lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    FreeActions,
    WelcomeBonus,
    MonthlyTokens,
}

impl Pool {
    /// Designated pool for a credit source.
    pub fn for_source(source: LedgerSource) -> Pool {
        match source {
            LedgerSource::FreeAction => Pool::FreeActions,
            LedgerSource::WelcomeBonus => Pool::WelcomeBonus,
            _ => Pool::MonthlyTokens,
        }
    }
}

/// Tokens taken from each pool by one debit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDraw {
    pub free_actions: u64,
    pub welcome_bonus: u64,
    pub monthly_tokens: u64,
}

impl PoolDraw {
    pub fn total(&self) -> u64 {
        self.free_actions + self.welcome_bonus + self.monthly_tokens
    }
}

/// Account aggregate: a user's spendable tokens split across three pools.
///
/// Invariants:
/// - No pool is ever negative (enforced by `u64` and checked subtraction)
/// - Debits consume free actions, then welcome bonus, then monthly tokens
/// - `total_available` equals the signed sum of the user's ledger entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTokenAccount {
    pub user_id: String,
    pub tier: String,
    pub free_actions: u64,
    pub welcome_bonus: u64,
    pub monthly_tokens: u64,
    /// Period of the last applied monthly reset
    pub last_reset: Option<PeriodKey>,
    /// Most recent ledger entry applied to this account
    pub last_entry_id: Option<EntryId>,
}

impl UserTokenAccount {
    /// Create an empty account; pools are funded through ledger credits.
    pub fn new(user_id: &str, tier: &str) -> Self {
        UserTokenAccount {
            user_id: user_id.to_string(),
            tier: tier.to_string(),
            free_actions: 0,
            welcome_bonus: 0,
            monthly_tokens: 0,
            last_reset: None,
            last_entry_id: None,
        }
    }

    /// Sum of all pools
    pub fn total_available(&self) -> u64 {
        self.free_actions
            .saturating_add(self.welcome_bonus)
            .saturating_add(self.monthly_tokens)
    }

    pub fn has_sufficient_tokens(&self, amount: u64) -> bool {
        self.total_available() >= amount
    }

    /// Deduct `amount` strictly in order free actions -> welcome bonus -> monthly.
    ///
    /// Leaves the account untouched on `InsufficientFunds`.
    pub fn debit(&mut self, amount: u64) -> Result<PoolDraw> {
        let available = self.total_available();
        if available < amount {
            return Err(Error::InsufficientFunds {
                available,
                required: amount,
            });
        }

        let mut remaining = amount;
        let free_actions = remaining.min(self.free_actions);
        remaining -= free_actions;
        let welcome_bonus = remaining.min(self.welcome_bonus);
        remaining -= welcome_bonus;
        let monthly_tokens = remaining;

        self.free_actions -= free_actions;
        self.welcome_bonus -= welcome_bonus;
        self.monthly_tokens -= monthly_tokens;

        Ok(PoolDraw {
            free_actions,
            welcome_bonus,
            monthly_tokens,
        })
    }

    /// Add to a pool. Returns the new total.
    pub fn credit(&mut self, pool: Pool, amount: u64) -> u64 {
        let slot = match pool {
            Pool::FreeActions => &mut self.free_actions,
            Pool::WelcomeBonus => &mut self.welcome_bonus,
            Pool::MonthlyTokens => &mut self.monthly_tokens,
        };
        *slot = slot.saturating_add(amount);
        self.total_available()
    }

    /// Whether a reset for `period` has already been applied.
    pub fn is_reset_applied(&self, period: &PeriodKey) -> bool {
        self.last_reset.as_ref().is_some_and(|last| last >= period)
    }

    /// Replace the monthly and free-action pools with the tier allotment.
    ///
    /// Returns the signed change of the total balance. The welcome bonus is
    /// not touched.
    pub fn apply_reset(&mut self, quota: TierQuota, period: PeriodKey) -> i64 {
        let before = (self.free_actions + self.monthly_tokens) as i64;
        self.free_actions = quota.monthly_free_actions;
        self.monthly_tokens = quota.monthly_tokens;
        self.last_reset = Some(period);
        (quota.monthly_free_actions + quota.monthly_tokens) as i64 - before
    }
}
