//! Account aggregator: every balance mutation goes through here.
//!
//! Each operation runs as one optimistic transaction that updates the
//! account document and appends its ledger entry together, then retries
//! from a fresh read on conflict.

use crate::config::{Config, TierQuota};
use crate::error::{Error, Result};
use crate::ledger::{self, EntryId, LedgerAction, LedgerEntry, LedgerSource};
use crate::state::account::{Pool, PoolDraw, UserTokenAccount};
use crate::state::period::{PeriodKey, ReferenceZone};
use crate::storage::{transact, Store, Transaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

const WELCOME_REQUEST_ID: &str = "welcome_bonus";

/// Result of a debit. `replay` is set when the request id was already charged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitOutcome {
    pub entry_id: EntryId,
    pub charged: u64,
    pub draw: PoolDraw,
    pub new_balance: u64,
    pub replay: bool,
}

/// Result of a credit. `replay` is set when the request id was already credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditOutcome {
    pub entry_id: EntryId,
    pub credited: u64,
    pub new_balance: u64,
    pub replay: bool,
}

/// Result of an operator adjustment. On a replay `delta` is the recorded one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustOutcome {
    pub entry_id: EntryId,
    pub delta: i64,
    pub new_balance: u64,
    pub replay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Applied {
        period: PeriodKey,
        delta: i64,
        new_balance: u64,
    },
    /// A reset for this period was applied earlier; nothing changed.
    AlreadyApplied { period: PeriodKey },
}

pub struct AccountAggregator<S: Store> {
    store: Arc<S>,
    config: Arc<Config>,
    zone: ReferenceZone,
}

impl<S: Store> AccountAggregator<S> {
    pub fn new(store: Arc<S>, config: Arc<Config>) -> Result<Self> {
        config.validate()?;
        let zone = ReferenceZone::from_offset_minutes(config.reset_utc_offset_minutes)?;
        Ok(AccountAggregator {
            store,
            config,
            zone,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn zone(&self) -> ReferenceZone {
        self.zone
    }

    /// Current account, if the user has one.
    pub fn account(&self, user_id: &str) -> Result<Option<UserTokenAccount>> {
        Ok(self.store.load_document(user_id)?.account)
    }

    /// Spend `amount` tokens, drawing free actions, then welcome bonus, then monthly.
    ///
    /// Applies a due monthly reset first. Fails with `InsufficientFunds`
    /// without writing anything when the pools cannot cover `amount`.
    pub fn debit(
        &self,
        user_id: &str,
        amount: u64,
        source: LedgerSource,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome> {
        let delta = signed_amount(amount)?;
        let entry_id = EntryId::derive(user_id, request_id, LedgerAction::Debit);

        let outcome = transact(
            self.store.as_ref(),
            user_id,
            self.config.max_commit_attempts,
            |tx| {
                if let Some(prior) = tx.find_entry(&entry_id)? {
                    return replayed_debit(tx, prior);
                }

                let mut account = self.open_account(tx, now)?;
                self.reset_if_due(tx, &mut account, now)?;

                let draw = account.debit(amount)?;
                let entry =
                    LedgerEntry::new(user_id, LedgerAction::Debit, source, -delta, request_id, now)
                        .with_metadata("free_actions", draw.free_actions)
                        .with_metadata("welcome_bonus", draw.welcome_bonus)
                        .with_metadata("monthly_tokens", draw.monthly_tokens);
                account.last_entry_id = Some(ledger::append(tx, entry)?);
                let new_balance = account.total_available();
                tx.put_account(account);

                Ok(DebitOutcome {
                    entry_id: entry_id.clone(),
                    charged: amount,
                    draw,
                    new_balance,
                    replay: false,
                })
            },
        )?;

        if outcome.replay {
            debug!(user_id, request_id, "debit already applied");
        } else {
            info!(
                user_id,
                request_id,
                amount,
                source = %source,
                new_balance = outcome.new_balance,
                "debited tokens"
            );
        }
        Ok(outcome)
    }

    /// Add `amount` tokens to the pool designated by `source`.
    pub fn credit(
        &self,
        user_id: &str,
        amount: u64,
        source: LedgerSource,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome> {
        let outcome = transact(
            self.store.as_ref(),
            user_id,
            self.config.max_commit_attempts,
            |tx| self.credit_in(tx, amount, source, request_id, now),
        )?;
        if !outcome.replay {
            info!(
                user_id,
                request_id,
                amount,
                source = %source,
                new_balance = outcome.new_balance,
                "credited tokens"
            );
        }
        Ok(outcome)
    }

    /// Credit inside a caller-owned transaction, so other documents (such as
    /// a purchase receipt) can commit atomically with it.
    pub fn credit_in<T: Store + ?Sized>(
        &self,
        tx: &mut Transaction<'_, T>,
        amount: u64,
        source: LedgerSource,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome> {
        let delta = signed_amount(amount)?;
        let user_id = tx.user_id().to_string();
        let entry_id = EntryId::derive(&user_id, request_id, LedgerAction::Credit);
        if let Some(prior) = tx.find_entry(&entry_id)? {
            return Ok(CreditOutcome {
                entry_id,
                credited: prior.token_delta.unsigned_abs(),
                new_balance: tx.account().map(|a| a.total_available()).unwrap_or(0),
                replay: true,
            });
        }

        let mut account = self.open_account(tx, now)?;
        // the period's allotment must land before the credit or it would overwrite it
        self.reset_if_due(tx, &mut account, now)?;
        let new_balance = account.credit(Pool::for_source(source), amount);
        let entry =
            LedgerEntry::new(&user_id, LedgerAction::Credit, source, delta, request_id, now);
        account.last_entry_id = Some(ledger::append(tx, entry)?);
        tx.put_account(account);

        Ok(CreditOutcome {
            entry_id,
            credited: amount,
            new_balance,
            replay: false,
        })
    }

    /// Return the tokens charged for `original_request_id` to the pools they
    /// were drawn from. At most one refund per debited request.
    pub fn refund(
        &self,
        user_id: &str,
        original_request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome> {
        let debit_id = EntryId::derive(user_id, original_request_id, LedgerAction::Debit);
        let refund_id = EntryId::derive(user_id, original_request_id, LedgerAction::Credit);

        let outcome = transact(
            self.store.as_ref(),
            user_id,
            self.config.max_commit_attempts,
            |tx| {
                if let Some(prior) = tx.find_entry(&refund_id)? {
                    return Ok(CreditOutcome {
                        entry_id: refund_id.clone(),
                        credited: prior.token_delta.unsigned_abs(),
                        new_balance: tx.account().map(|a| a.total_available()).unwrap_or(0),
                        replay: true,
                    });
                }
                let debit = tx.find_entry(&debit_id)?.ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no debit recorded for request {}",
                        original_request_id
                    ))
                })?;
                let mut account = tx.account().cloned().ok_or_else(|| {
                    Error::Internal(format!("debit recorded for {} without an account", user_id))
                })?;
                self.reset_if_due(tx, &mut account, now)?;

                let draw = draw_from_metadata(&debit);
                let amount = debit.token_delta.unsigned_abs();
                account.credit(Pool::FreeActions, draw.free_actions);
                account.credit(Pool::WelcomeBonus, draw.welcome_bonus);
                // anything not attributed to a pool goes back to monthly
                account.credit(
                    Pool::MonthlyTokens,
                    amount - draw.free_actions - draw.welcome_bonus,
                );
                let entry = LedgerEntry::new(
                    user_id,
                    LedgerAction::Credit,
                    LedgerSource::Refund,
                    amount as i64,
                    original_request_id,
                    now,
                );
                account.last_entry_id = Some(ledger::append(tx, entry)?);
                let new_balance = account.total_available();
                tx.put_account(account);

                Ok(CreditOutcome {
                    entry_id: refund_id.clone(),
                    credited: amount,
                    new_balance,
                    replay: false,
                })
            },
        )?;
        if !outcome.replay {
            info!(user_id, original_request_id, amount = outcome.credited, "refunded tokens");
        }
        Ok(outcome)
    }

    /// Operator correction. Positive deltas go to monthly tokens; negative
    /// deltas are drawn in consumption order.
    ///
    /// Adjustment ids live in their own namespace, so they never collide with
    /// spends or refunds. Reusing an id returns the recorded adjustment.
    pub fn adjust(
        &self,
        user_id: &str,
        delta: i64,
        request_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<AdjustOutcome> {
        if delta == 0 {
            return Err(Error::InvalidArgument(
                "adjustment must be non-zero".to_string(),
            ));
        }
        let action = if delta > 0 {
            LedgerAction::Credit
        } else {
            LedgerAction::Debit
        };
        let adjustment_id = adjustment_request_id(request_id);
        let recorded = [LedgerAction::Credit, LedgerAction::Debit]
            .map(|a| EntryId::derive(user_id, &adjustment_id, a));

        let outcome = transact(
            self.store.as_ref(),
            user_id,
            self.config.max_commit_attempts,
            |tx| {
                for id in &recorded {
                    if let Some(prior) = tx.find_entry(id)? {
                        return Ok(AdjustOutcome {
                            entry_id: prior.entry_id,
                            delta: prior.token_delta,
                            new_balance: tx.account().map(|a| a.total_available()).unwrap_or(0),
                            replay: true,
                        });
                    }
                }
                let mut account = self.open_account(tx, now)?;
                self.reset_if_due(tx, &mut account, now)?;
                if delta > 0 {
                    account.credit(Pool::MonthlyTokens, delta.unsigned_abs());
                } else {
                    account.debit(delta.unsigned_abs())?;
                }
                let entry = LedgerEntry::new(
                    user_id,
                    action,
                    LedgerSource::Adjustment,
                    delta,
                    &adjustment_id,
                    now,
                )
                .with_metadata("note", note);
                let entry_id = ledger::append(tx, entry)?;
                account.last_entry_id = Some(entry_id.clone());
                let new_balance = account.total_available();
                tx.put_account(account);
                Ok(AdjustOutcome {
                    entry_id,
                    delta,
                    new_balance,
                    replay: false,
                })
            },
        )?;
        if outcome.replay {
            debug!(user_id, request_id, delta = outcome.delta, "adjustment already applied");
        } else {
            info!(user_id, request_id, delta, note, "applied balance adjustment");
        }
        Ok(outcome)
    }

    /// Grant the monthly allotment for the period containing `now`.
    ///
    /// Idempotent per period: a second call in the same month changes nothing.
    pub fn reset_monthly(
        &self,
        user_id: &str,
        quota: TierQuota,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome> {
        let period = self.zone.period_of(now);
        let outcome = transact(
            self.store.as_ref(),
            user_id,
            self.config.max_commit_attempts,
            |tx| {
                let mut account = self.open_account(tx, now)?;
                if account.is_reset_applied(&period) {
                    // keep a fresh account created by this call
                    tx.put_account(account);
                    return Ok(ResetOutcome::AlreadyApplied { period });
                }
                let delta = self.apply_reset(tx, &mut account, quota, period, now)?;
                let new_balance = account.total_available();
                tx.put_account(account);
                Ok(ResetOutcome::Applied {
                    period,
                    delta,
                    new_balance,
                })
            },
        )?;
        if let ResetOutcome::Applied { delta, .. } = &outcome {
            info!(user_id, period = %period, delta, "applied monthly reset");
        }
        Ok(outcome)
    }

    /// Reset using the quota of the account's own tier.
    pub fn reset_monthly_for_tier(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome> {
        let tier = self
            .account(user_id)?
            .map(|a| a.tier)
            .unwrap_or_else(|| self.config.default_tier.clone());
        let quota = self.quota_for(&tier)?;
        self.reset_monthly(user_id, quota, now)
    }

    fn quota_for(&self, tier: &str) -> Result<TierQuota> {
        self.config
            .tier_quota(tier)
            .ok_or_else(|| Error::Internal(format!("no quota configured for tier {}", tier)))
    }

    /// Account as seen by `tx`, creating it on first use.
    ///
    /// A new account receives the welcome bonus and the current period's
    /// allotment through ledger entries in the same transaction.
    fn open_account<T: Store + ?Sized>(
        &self,
        tx: &mut Transaction<'_, T>,
        now: DateTime<Utc>,
    ) -> Result<UserTokenAccount> {
        if let Some(account) = tx.account() {
            return Ok(account.clone());
        }
        let user_id = tx.user_id().to_string();
        let mut account = UserTokenAccount::new(&user_id, &self.config.default_tier);
        if self.config.welcome_bonus > 0 {
            account.credit(Pool::WelcomeBonus, self.config.welcome_bonus);
            let entry = LedgerEntry::new(
                &user_id,
                LedgerAction::Credit,
                LedgerSource::WelcomeBonus,
                signed_amount(self.config.welcome_bonus)?,
                WELCOME_REQUEST_ID,
                now,
            );
            account.last_entry_id = Some(ledger::append(tx, entry)?);
        }
        let quota = self.quota_for(&account.tier)?;
        self.apply_reset(tx, &mut account, quota, self.zone.period_of(now), now)?;
        debug!(user_id = %user_id, tier = %account.tier, "opened token account");
        tx.put_account(account.clone());
        Ok(account)
    }

    fn reset_if_due<T: Store + ?Sized>(
        &self,
        tx: &mut Transaction<'_, T>,
        account: &mut UserTokenAccount,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let period = self.zone.period_of(now);
        if account.is_reset_applied(&period) {
            return Ok(());
        }
        let quota = self.quota_for(&account.tier)?;
        let delta = self.apply_reset(tx, account, quota, period, now)?;
        debug!(user_id = %account.user_id, period = %period, delta, "applied due monthly reset");
        Ok(())
    }

    fn apply_reset<T: Store + ?Sized>(
        &self,
        tx: &mut Transaction<'_, T>,
        account: &mut UserTokenAccount,
        quota: TierQuota,
        period: PeriodKey,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let delta = account.apply_reset(quota, period);
        // a reset that nets to zero only moves last_reset
        if delta != 0 {
            let entry = LedgerEntry::new(
                &account.user_id,
                LedgerAction::Reset,
                LedgerSource::MonthlyReset,
                delta,
                &format!("monthly_reset:{}", period),
                now,
            )
            .with_metadata("monthly_tokens", quota.monthly_tokens)
            .with_metadata("free_actions", quota.monthly_free_actions);
            account.last_entry_id = Some(ledger::append(tx, entry)?);
        }
        Ok(delta)
    }
}

fn adjustment_request_id(request_id: &str) -> String {
    format!("adjustment:{}", request_id)
}

fn signed_amount(amount: u64) -> Result<i64> {
    if amount == 0 {
        return Err(Error::InvalidArgument(
            "token amount must be greater than zero".to_string(),
        ));
    }
    i64::try_from(amount)
        .map_err(|_| Error::InvalidArgument(format!("token amount {} is too large", amount)))
}

fn replayed_debit<T: Store + ?Sized>(
    tx: &Transaction<'_, T>,
    prior: LedgerEntry,
) -> Result<DebitOutcome> {
    Ok(DebitOutcome {
        draw: draw_from_metadata(&prior),
        charged: prior.token_delta.unsigned_abs(),
        entry_id: prior.entry_id,
        new_balance: tx.account().map(|a| a.total_available()).unwrap_or(0),
        replay: true,
    })
}

/// Pool breakdown recorded on a debit entry.
fn draw_from_metadata(entry: &LedgerEntry) -> PoolDraw {
    let get = |key: &str| {
        entry
            .metadata
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    let amount = entry.token_delta.unsigned_abs();
    let free_actions = get("free_actions").min(amount);
    let welcome_bonus = get("welcome_bonus").min(amount - free_actions);
    PoolDraw {
        free_actions,
        welcome_bonus,
        monthly_tokens: amount - free_actions - welcome_bonus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn may() -> DateTime<Utc> {
        at("2024-05-10T12:00:00Z")
    }

    fn setup() -> (AccountAggregator<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(Config::new());
        let aggregator = AccountAggregator::new(store.clone(), config).unwrap();
        (aggregator, store)
    }

    /// Ledger sum must equal the account total.
    fn assert_consistent(store: &MemoryStore, user: &str) {
        let entries = store.load_entries(user, None).unwrap();
        let total = store
            .load_document(user)
            .unwrap()
            .account
            .map(|a| a.total_available())
            .unwrap_or(0);
        assert_eq!(ledger::balance_of(&entries), total as i64);
    }

    #[test]
    fn test_first_debit_opens_account_with_bonus_and_reset() {
        let (agg, store) = setup();
        let outcome = agg
            .debit("alice", 3, LedgerSource::Generate, "r1", may())
            .unwrap();
        // welcome 20 + free 5 + monthly 50 - 3
        assert_eq!(outcome.new_balance, 72);
        assert_eq!(outcome.draw.free_actions, 3);
        assert!(!outcome.replay);

        let account = agg.account("alice").unwrap().unwrap();
        assert_eq!(account.free_actions, 2);
        assert_eq!(account.welcome_bonus, 20);
        assert_eq!(account.monthly_tokens, 50);
        assert_eq!(account.last_reset, Some(PeriodKey::new(2024, 5)));
        assert_eq!(account.last_entry_id, Some(outcome.entry_id));
        // welcome, reset, debit
        assert_eq!(store.entry_count("alice"), 3);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_debit_order_scenario() {
        let mut config = Config::new();
        config.welcome_bonus = 3;
        config.tiers.insert(
            "free".to_string(),
            TierQuota {
                monthly_tokens: 10,
                monthly_free_actions: 2,
            },
        );
        let store = Arc::new(MemoryStore::new());
        let agg = AccountAggregator::new(store.clone(), Arc::new(config)).unwrap();

        // opening the account grants the bonus and this month's allotment
        agg.reset_monthly_for_tier("alice", may()).unwrap();
        let before = agg.account("alice").unwrap().unwrap();
        assert_eq!(
            (before.free_actions, before.welcome_bonus, before.monthly_tokens),
            (2, 3, 10)
        );

        let outcome = agg
            .debit("alice", 4, LedgerSource::Generate, "spend", may())
            .unwrap();
        let after = agg.account("alice").unwrap().unwrap();
        assert_eq!(
            (after.free_actions, after.welcome_bonus, after.monthly_tokens),
            (0, 1, 10)
        );
        assert_eq!(
            outcome.draw,
            PoolDraw {
                free_actions: 2,
                welcome_bonus: 2,
                monthly_tokens: 0
            }
        );
        let entry = store
            .find_entry("alice", &outcome.entry_id)
            .unwrap()
            .unwrap();
        assert_eq!(entry.token_delta, -4);
        assert_eq!(entry.action, LedgerAction::Debit);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_insufficient_funds_writes_nothing() {
        let (agg, store) = setup();
        agg.debit("alice", 1, LedgerSource::Generate, "r1", may())
            .unwrap();
        let count = store.entry_count("alice");
        let err = agg
            .debit("alice", 10_000, LedgerSource::Generate, "r2", may())
            .unwrap_err();
        assert_eq!(
            err,
            Error::InsufficientFunds {
                available: 74,
                required: 10_000
            }
        );
        assert_eq!(store.entry_count("alice"), count);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_debit_same_request_id_is_charged_once() {
        let (agg, store) = setup();
        let first = agg
            .debit("alice", 4, LedgerSource::Generate, "r1", may())
            .unwrap();
        let second = agg
            .debit("alice", 4, LedgerSource::Generate, "r1", may())
            .unwrap();
        assert!(second.replay);
        assert_eq!(second.charged, 4);
        assert_eq!(second.draw, first.draw);
        assert_eq!(second.new_balance, first.new_balance);
        assert_eq!(store.entry_count("alice"), 3);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let (agg, _) = setup();
        assert!(matches!(
            agg.debit("alice", 0, LedgerSource::Generate, "r1", may()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            agg.credit("alice", 0, LedgerSource::Purchase, "r1", may()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_credit_targets_pool_by_source() {
        let (agg, store) = setup();
        let outcome = agg
            .credit("alice", 500, LedgerSource::Purchase, "txn-1", may())
            .unwrap();
        // welcome 20 + free 5 + monthly 50 + 500
        assert_eq!(outcome.new_balance, 575);
        agg.credit("alice", 2, LedgerSource::FreeAction, "promo", may())
            .unwrap();
        let account = agg.account("alice").unwrap().unwrap();
        assert_eq!(account.monthly_tokens, 550);
        assert_eq!(account.free_actions, 7);
        assert_eq!(account.welcome_bonus, 20);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_reset_is_idempotent_within_period() {
        let (agg, store) = setup();
        let quota = TierQuota {
            monthly_tokens: 50,
            monthly_free_actions: 5,
        };
        agg.credit("alice", 5, LedgerSource::Purchase, "p1", may())
            .unwrap();
        let doc_before = store.load_document("alice").unwrap();

        let second = agg
            .reset_monthly("alice", quota, at("2024-05-31T23:00:00Z"))
            .unwrap();
        assert_eq!(
            second,
            ResetOutcome::AlreadyApplied {
                period: PeriodKey::new(2024, 5)
            }
        );
        assert_eq!(store.load_document("alice").unwrap(), doc_before);

        let june = agg
            .reset_monthly("alice", quota, at("2024-06-01T00:00:00Z"))
            .unwrap();
        // the monthly pool is set back to the quota, dropping the purchase
        assert!(matches!(june, ResetOutcome::Applied { delta: -5, .. }));
        let again = agg
            .reset_monthly("alice", quota, at("2024-06-15T00:00:00Z"))
            .unwrap();
        assert!(matches!(again, ResetOutcome::AlreadyApplied { .. }));
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_zero_delta_reset_only_moves_period() {
        let (agg, store) = setup();
        agg.credit("alice", 1, LedgerSource::WelcomeBonus, "extra", may())
            .unwrap();
        let count = store.entry_count("alice");
        let june = agg
            .reset_monthly_for_tier("alice", at("2024-06-01T00:00:00Z"))
            .unwrap();
        assert!(matches!(june, ResetOutcome::Applied { delta: 0, .. }));
        assert_eq!(store.entry_count("alice"), count);
        let account = agg.account("alice").unwrap().unwrap();
        assert_eq!(account.last_reset, Some(PeriodKey::new(2024, 6)));
    }

    #[test]
    fn test_debit_in_new_month_refreshes_pools() {
        let (agg, store) = setup();
        agg.debit("alice", 30, LedgerSource::Generate, "may", may())
            .unwrap();
        let outcome = agg
            .debit(
                "alice",
                1,
                LedgerSource::Generate,
                "june",
                at("2024-06-02T08:00:00Z"),
            )
            .unwrap();
        let account = agg.account("alice").unwrap().unwrap();
        assert_eq!(account.last_reset, Some(PeriodKey::new(2024, 6)));
        assert_eq!(account.free_actions, 4);
        assert_eq!(account.monthly_tokens, 50);
        assert_eq!(outcome.new_balance, account.total_available());
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_refund_returns_tokens_to_drawn_pools() {
        let (agg, store) = setup();
        agg.debit("alice", 8, LedgerSource::Generate, "gen-1", may())
            .unwrap();
        let refund = agg.refund("alice", "gen-1", may()).unwrap();
        assert_eq!(refund.credited, 8);
        let account = agg.account("alice").unwrap().unwrap();
        assert_eq!(account.free_actions, 5);
        assert_eq!(account.welcome_bonus, 20);
        assert_eq!(account.monthly_tokens, 50);

        let again = agg.refund("alice", "gen-1", may()).unwrap();
        assert!(again.replay);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_refund_unknown_request() {
        let (agg, _) = setup();
        assert!(matches!(
            agg.refund("alice", "never-charged", may()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_negative_adjustment_respects_balance() {
        let (agg, store) = setup();
        agg.credit("alice", 5, LedgerSource::Purchase, "p", may())
            .unwrap();
        assert!(matches!(
            agg.adjust("alice", -1000, "fix", "too much", may()),
            Err(Error::InsufficientFunds { .. })
        ));
        assert_eq!(agg.adjust("alice", -5, "fix", "drift", may()).unwrap().delta, -5);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_purchase_before_due_reset_survives_next_debit() {
        let (agg, store) = setup();
        agg.debit("alice", 1, LedgerSource::Generate, "may", may())
            .unwrap();

        // June purchase lands before anything has applied June's reset
        let bought = agg
            .credit(
                "alice",
                500,
                LedgerSource::Purchase,
                "purchase:t-1",
                at("2024-06-05T10:00:00Z"),
            )
            .unwrap();
        assert_eq!(bought.new_balance, 575);

        let spent = agg
            .debit(
                "alice",
                1,
                LedgerSource::Generate,
                "june",
                at("2024-06-05T10:01:00Z"),
            )
            .unwrap();
        assert_eq!(spent.new_balance, 574);
        let account = agg.account("alice").unwrap().unwrap();
        assert_eq!(account.monthly_tokens, 550);
        assert_eq!(account.last_reset, Some(PeriodKey::new(2024, 6)));
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_adjustment_before_due_reset_is_kept() {
        let (agg, store) = setup();
        agg.debit("alice", 1, LedgerSource::Generate, "may", may())
            .unwrap();
        let june = at("2024-06-03T09:00:00Z");
        agg.adjust("alice", 40, "grant", "goodwill", june).unwrap();
        let spent = agg
            .debit("alice", 1, LedgerSource::Generate, "june", june)
            .unwrap();
        // June allotment 75 + 40 - 1
        assert_eq!(spent.new_balance, 114);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_refund_in_next_month_keeps_refunded_tokens() {
        let (agg, store) = setup();
        agg.debit("alice", 60, LedgerSource::Generate, "gen", may())
            .unwrap();
        let june = at("2024-06-02T00:00:00Z");
        let refund = agg.refund("alice", "gen", june).unwrap();
        // June reset restores free 5 and monthly 50 first, then all 60 come back
        assert_eq!(refund.new_balance, 55 + 60);
        let spent = agg
            .debit("alice", 1, LedgerSource::Generate, "after", june)
            .unwrap();
        assert_eq!(spent.new_balance, 114);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_adjustment_ids_are_separate_from_spends() {
        let (agg, store) = setup();
        agg.debit("alice", 3, LedgerSource::Generate, "r1", may())
            .unwrap();
        agg.refund("alice", "r1", may()).unwrap();

        let applied = agg.adjust("alice", 100, "r1", "support grant", may()).unwrap();
        assert!(!applied.replay);
        assert_eq!(applied.delta, 100);
        assert_eq!(applied.new_balance, 175);

        // reusing the id reports the recorded adjustment, whatever the new delta
        let again = agg.adjust("alice", -7, "r1", "retry", may()).unwrap();
        assert!(again.replay);
        assert_eq!(again.delta, 100);
        assert_eq!(again.new_balance, 175);

        // a spend with the id of a negative adjustment is still charged
        agg.adjust("alice", -5, "x", "clawback", may()).unwrap();
        let spend = agg
            .debit("alice", 2, LedgerSource::Generate, "x", may())
            .unwrap();
        assert!(!spend.replay);
        assert_eq!(spend.new_balance, 168);
        assert_consistent(&store, "alice");
    }

    #[test]
    fn test_draw_from_metadata_tolerates_missing_keys() {
        let entry = LedgerEntry::new(
            "alice",
            LedgerAction::Debit,
            LedgerSource::Generate,
            -6,
            "r",
            may(),
        )
        .with_metadata("free_actions", 2);
        let draw = draw_from_metadata(&entry);
        assert_eq!(draw.free_actions, 2);
        assert_eq!(draw.welcome_bonus, 0);
        assert_eq!(draw.monthly_tokens, 4);
    }
}
