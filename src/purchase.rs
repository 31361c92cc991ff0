//! Purchase verification and crediting.
//!
//! Per `(user, product)` a purchase moves `none -> pending -> verified`, or
//! `none -> rejected` when the platform refuses the receipt. Replays are
//! answered from the stored receipt and the original ledger credit, so a
//! transaction id is credited at most once no matter how often it arrives.

use crate::error::{Error, Result};
use crate::guard::TtlCache;
use crate::ledger::{EntryId, LedgerAction, LedgerSource};
use crate::state::AccountAggregator;
use crate::storage::{transact, Store};
use crate::telemetry::{events, TelemetrySink};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub use crate::state::{Platform, PurchaseReceipt};

/// How long a rejected verification is remembered for `state` queries.
const REJECTION_TTL_HOURS: i64 = 24;

/// Answer from the platform's receipt validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub reason: Option<String>,
}

impl VerificationOutcome {
    pub fn accepted() -> Self {
        VerificationOutcome {
            verified: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        VerificationOutcome {
            verified: false,
            reason: Some(reason.into()),
        }
    }
}

/// Platform receipt validation (App Store / Play Store).
///
/// An `Err` means the platform could not be reached; a refused receipt is an
/// `Ok` outcome with `verified == false`.
pub trait ReceiptVerifier: Send + Sync {
    fn verify(
        &self,
        platform: Platform,
        product_id: &str,
        receipt: &str,
    ) -> Result<VerificationOutcome>;
}

/// Accepts any non-empty receipt. For local use and tests only.
#[derive(Debug, Clone, Default)]
pub struct SandboxReceiptVerifier;

impl ReceiptVerifier for SandboxReceiptVerifier {
    fn verify(
        &self,
        _platform: Platform,
        _product_id: &str,
        receipt: &str,
    ) -> Result<VerificationOutcome> {
        if receipt.trim().is_empty() {
            Ok(VerificationOutcome::rejected("empty receipt"))
        } else {
            Ok(VerificationOutcome::accepted())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    None,
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseOutcome {
    pub verified: bool,
    pub tokens_credited: u64,
    pub replay: bool,
}

impl PurchaseOutcome {
    fn rejected() -> Self {
        PurchaseOutcome {
            verified: false,
            tokens_credited: 0,
            replay: false,
        }
    }
}

type PurchaseKey = (String, String);

/// Marks a purchase pending for as long as it lives.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<PurchaseKey>>,
    key: PurchaseKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

pub struct PurchaseVerifier<S: Store> {
    aggregator: Arc<AccountAggregator<S>>,
    verifier: Arc<dyn ReceiptVerifier>,
    telemetry: Arc<dyn TelemetrySink>,
    pending: Mutex<HashSet<PurchaseKey>>,
    rejected: TtlCache<PurchaseKey, String>,
}

/// Ledger request id of the credit for a platform transaction.
fn purchase_request_id(transaction_id: &str) -> String {
    format!("purchase:{}", transaction_id)
}

impl<S: Store> PurchaseVerifier<S> {
    pub fn new(
        aggregator: Arc<AccountAggregator<S>>,
        verifier: Arc<dyn ReceiptVerifier>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        PurchaseVerifier {
            aggregator,
            verifier,
            telemetry,
            pending: Mutex::new(HashSet::new()),
            rejected: TtlCache::new(Duration::hours(REJECTION_TTL_HOURS)),
        }
    }

    /// Verify a purchase with the platform and credit its tokens once.
    pub fn verify_and_credit(
        &self,
        user_id: &str,
        product_id: &str,
        transaction_id: &str,
        receipt: &str,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome> {
        let tokens = self.product_tokens(product_id)?;
        if transaction_id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "transaction id must not be empty".to_string(),
            ));
        }

        if let Some(outcome) = self.replayed(user_id, product_id, transaction_id)? {
            info!(user_id, product_id, transaction_id, "purchase replay answered from receipt");
            self.telemetry.record(
                events::PURCHASE_REPLAY,
                &[
                    ("user_id", user_id.to_string()),
                    ("product_id", product_id.to_string()),
                    ("transaction_id", transaction_id.to_string()),
                ],
            );
            return Ok(outcome);
        }

        let _pending = self.mark_pending(user_id, product_id)?;

        let verdict = self.verifier.verify(platform, product_id, receipt)?;
        if !verdict.verified {
            let reason = verdict.reason.unwrap_or_else(|| "rejected".to_string());
            warn!(
                user_id,
                product_id,
                transaction_id,
                reason = %reason,
                "purchase rejected by platform"
            );
            self.telemetry.record(
                events::PURCHASE_REJECTED,
                &[
                    ("user_id", user_id.to_string()),
                    ("product_id", product_id.to_string()),
                    ("transaction_id", transaction_id.to_string()),
                    ("platform", platform.to_string()),
                    ("reason", reason.clone()),
                ],
            );
            self.rejected
                .insert((user_id.to_string(), product_id.to_string()), reason, now);
            return Ok(PurchaseOutcome::rejected());
        }

        let request_id = purchase_request_id(transaction_id);
        let store = self.aggregator.store().as_ref();
        let attempts = self.aggregator.config().max_commit_attempts;
        let outcome = transact(store, user_id, attempts, |tx| {
            // a concurrent delivery of the same transaction may have won
            if let Some(existing) = tx.receipt(product_id) {
                if existing.covers(transaction_id) {
                    return Ok(PurchaseOutcome {
                        verified: true,
                        tokens_credited: existing.tokens_credited,
                        replay: true,
                    });
                }
            }
            let credit = self
                .aggregator
                .credit_in(tx, tokens, LedgerSource::Purchase, &request_id, now)?;
            if credit.replay {
                // the transaction id was already credited under another product
                return Ok(PurchaseOutcome {
                    verified: true,
                    tokens_credited: credit.credited,
                    replay: true,
                });
            }
            let receipt = match tx.receipt(product_id) {
                Some(previous) => previous.superseded_by(transaction_id, platform, tokens, now),
                None => PurchaseReceipt {
                    user_id: user_id.to_string(),
                    product_id: product_id.to_string(),
                    transaction_id: transaction_id.to_string(),
                    platform,
                    tokens_credited: tokens,
                    timestamp: now,
                    previous_transaction_ids: Vec::new(),
                },
            };
            tx.put_receipt(receipt);
            Ok(PurchaseOutcome {
                verified: true,
                tokens_credited: tokens,
                replay: false,
            })
        })?;

        self.rejected
            .remove(&(user_id.to_string(), product_id.to_string()));
        if !outcome.replay {
            info!(user_id, product_id, transaction_id, tokens, "purchase credited");
            self.telemetry.record(
                events::PURCHASE_VERIFIED,
                &[
                    ("user_id", user_id.to_string()),
                    ("product_id", product_id.to_string()),
                    ("transaction_id", transaction_id.to_string()),
                    ("platform", platform.to_string()),
                    ("tokens", tokens.to_string()),
                ],
            );
        }
        Ok(outcome)
    }

    /// Current state of the `(user, product)` purchase.
    pub fn state(
        &self,
        user_id: &str,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PurchaseState> {
        let key = (user_id.to_string(), product_id.to_string());
        if self.pending.lock().contains(&key) {
            return Ok(PurchaseState::Pending);
        }
        let document = self.aggregator.store().load_document(user_id)?;
        if document.receipts.contains_key(product_id) {
            return Ok(PurchaseState::Verified);
        }
        if self.rejected.get(&key, now).is_some() {
            return Ok(PurchaseState::Rejected);
        }
        Ok(PurchaseState::None)
    }

    /// Stored receipt for `(user, product)`.
    pub fn receipt(&self, user_id: &str, product_id: &str) -> Result<Option<PurchaseReceipt>> {
        Ok(self
            .aggregator
            .store()
            .load_document(user_id)?
            .receipts
            .remove(product_id))
    }

    /// Evict expired rejection records.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        self.rejected.sweep(now, |_| true)
    }

    fn product_tokens(&self, product_id: &str) -> Result<u64> {
        self.aggregator
            .config()
            .products
            .get(product_id)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown product: {}", product_id)))
    }

    /// Original result when `transaction_id` was already credited for this product.
    fn replayed(
        &self,
        user_id: &str,
        product_id: &str,
        transaction_id: &str,
    ) -> Result<Option<PurchaseOutcome>> {
        let store = self.aggregator.store();
        let document = store.load_document(user_id)?;
        let Some(receipt) = document.receipts.get(product_id) else {
            return Ok(None);
        };
        if !receipt.covers(transaction_id) {
            return Ok(None);
        }
        let entry_id = EntryId::derive(
            user_id,
            &purchase_request_id(transaction_id),
            LedgerAction::Credit,
        );
        let tokens_credited = match store.find_entry(user_id, &entry_id)? {
            Some(entry) => entry.token_delta.unsigned_abs(),
            None => receipt.tokens_credited,
        };
        Ok(Some(PurchaseOutcome {
            verified: true,
            tokens_credited,
            replay: true,
        }))
    }

    fn mark_pending(&self, user_id: &str, product_id: &str) -> Result<PendingGuard<'_>> {
        let key = (user_id.to_string(), product_id.to_string());
        if !self.pending.lock().insert(key.clone()) {
            return Err(Error::Internal(format!(
                "verification of {} for {} already in progress",
                product_id, user_id
            )));
        }
        Ok(PendingGuard {
            pending: &self.pending,
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger;
    use crate::storage::MemoryStore;
    use crate::telemetry::MemoryTelemetry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_715_342_400, 0).unwrap()
    }

    /// Counts calls and refuses receipts equal to "bad".
    #[derive(Default)]
    struct CountingVerifier {
        calls: AtomicU32,
    }

    impl ReceiptVerifier for CountingVerifier {
        fn verify(&self, _: Platform, _: &str, receipt: &str) -> Result<VerificationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if receipt == "bad" {
                Ok(VerificationOutcome::rejected("signature mismatch"))
            } else {
                Ok(VerificationOutcome::accepted())
            }
        }
    }

    struct Unreachable;

    impl ReceiptVerifier for Unreachable {
        fn verify(&self, _: Platform, _: &str, _: &str) -> Result<VerificationOutcome> {
            Err(Error::Internal("store API timed out".to_string()))
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        aggregator: Arc<AccountAggregator<MemoryStore>>,
        verifier: Arc<CountingVerifier>,
        telemetry: Arc<MemoryTelemetry>,
        purchases: PurchaseVerifier<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let aggregator =
            Arc::new(AccountAggregator::new(store.clone(), Arc::new(Config::new())).unwrap());
        let verifier = Arc::new(CountingVerifier::default());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let purchases =
            PurchaseVerifier::new(aggregator.clone(), verifier.clone(), telemetry.clone());
        Fixture {
            store,
            aggregator,
            verifier,
            telemetry,
            purchases,
        }
    }

    fn balance(store: &MemoryStore, user: &str) -> u64 {
        store
            .load_document(user)
            .unwrap()
            .account
            .map(|a| a.total_available())
            .unwrap_or(0)
    }

    #[test]
    fn test_purchase_early_in_month_is_not_lost_to_reset() {
        let f = fixture();
        f.aggregator
            .debit("alice", 1, LedgerSource::Generate, "may", now())
            .unwrap();
        assert_eq!(balance(&f.store, "alice"), 74);

        let june = DateTime::parse_from_rfc3339("2024-06-05T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        f.purchases
            .verify_and_credit("alice", "tokens_500", "t-june", "rcpt", Platform::Ios, june)
            .unwrap();
        assert_eq!(balance(&f.store, "alice"), 575);

        let spent = f
            .aggregator
            .debit(
                "alice",
                1,
                LedgerSource::Generate,
                "june",
                june + Duration::minutes(1),
            )
            .unwrap();
        assert_eq!(spent.new_balance, 574);
        let account = f.store.load_document("alice").unwrap().account.unwrap();
        assert_eq!(account.monthly_tokens, 550);
    }

    #[test]
    fn test_same_transaction_credits_once() {
        let f = fixture();
        let first = f
            .purchases
            .verify_and_credit("alice", "tokens_500", "t-1", "rcpt", Platform::Ios, now())
            .unwrap();
        assert_eq!(
            first,
            PurchaseOutcome {
                verified: true,
                tokens_credited: 500,
                replay: false
            }
        );
        let after_first = balance(&f.store, "alice");

        let second = f
            .purchases
            .verify_and_credit("alice", "tokens_500", "t-1", "rcpt", Platform::Ios, now())
            .unwrap();
        assert!(second.replay);
        assert_eq!(second.tokens_credited, 500);
        assert_eq!(balance(&f.store, "alice"), after_first);
        // replay is answered before the platform is asked again
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 1);

        let purchases = f
            .store
            .load_entries("alice", None)
            .unwrap()
            .into_iter()
            .filter(|e| e.source == LedgerSource::Purchase)
            .count();
        assert_eq!(purchases, 1);
        assert_eq!(f.telemetry.named(events::PURCHASE_VERIFIED).len(), 1);
        assert_eq!(f.telemetry.named(events::PURCHASE_REPLAY).len(), 1);
    }

    #[test]
    fn test_repurchase_supersedes_receipt() {
        let f = fixture();
        f.purchases
            .verify_and_credit("alice", "tokens_100", "t-1", "r", Platform::Android, now())
            .unwrap();
        let second = f
            .purchases
            .verify_and_credit("alice", "tokens_100", "t-2", "r", Platform::Android, now())
            .unwrap();
        assert!(!second.replay);
        let receipt = f.purchases.receipt("alice", "tokens_100").unwrap().unwrap();
        assert_eq!(receipt.transaction_id, "t-2");
        assert_eq!(receipt.previous_transaction_ids, vec!["t-1".to_string()]);

        // the superseded transaction is still recognised as a replay
        let old = f
            .purchases
            .verify_and_credit("alice", "tokens_100", "t-1", "r", Platform::Android, now())
            .unwrap();
        assert!(old.replay);
        assert_eq!(old.tokens_credited, 100);
        // welcome 20 + allotment 55 + two purchases
        assert_eq!(balance(&f.store, "alice"), 275);
        let entries = f.store.load_entries("alice", None).unwrap();
        assert_eq!(ledger::balance_of(&entries), 275);
    }

    #[test]
    fn test_rejection_records_telemetry_without_mutation() {
        let f = fixture();
        let outcome = f
            .purchases
            .verify_and_credit("alice", "tokens_500", "t-9", "bad", Platform::Ios, now())
            .unwrap();
        assert!(!outcome.verified);
        assert_eq!(outcome.tokens_credited, 0);
        assert_eq!(f.store.load_document("alice").unwrap().version, 0);
        assert_eq!(f.store.entry_count("alice"), 0);

        let rejected = f.telemetry.named(events::PURCHASE_REJECTED);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].attribute("reason"), Some("signature mismatch"));
        assert_eq!(
            f.purchases.state("alice", "tokens_500", now()).unwrap(),
            PurchaseState::Rejected
        );
    }

    #[test]
    fn test_state_transitions() {
        let f = fixture();
        assert_eq!(
            f.purchases.state("alice", "tokens_500", now()).unwrap(),
            PurchaseState::None
        );
        f.purchases
            .verify_and_credit("alice", "tokens_500", "t-1", "bad", Platform::Ios, now())
            .unwrap();
        f.purchases
            .verify_and_credit("alice", "tokens_500", "t-2", "good", Platform::Ios, now())
            .unwrap();
        assert_eq!(
            f.purchases.state("alice", "tokens_500", now()).unwrap(),
            PurchaseState::Verified
        );
    }

    #[test]
    fn test_rejection_is_forgotten_after_ttl() {
        let f = fixture();
        f.purchases
            .verify_and_credit("alice", "tokens_500", "t-1", "bad", Platform::Ios, now())
            .unwrap();
        let later = now() + Duration::hours(REJECTION_TTL_HOURS + 1);
        assert_eq!(f.purchases.cleanup(later), 1);
        assert_eq!(
            f.purchases.state("alice", "tokens_500", later).unwrap(),
            PurchaseState::None
        );
    }

    #[test]
    fn test_unknown_product_and_empty_transaction() {
        let f = fixture();
        assert!(matches!(
            f.purchases
                .verify_and_credit("alice", "tokens_9999", "t-1", "r", Platform::Ios, now()),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            f.purchases
                .verify_and_credit("alice", "tokens_500", " ", "r", Platform::Ios, now()),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unreachable_platform_is_internal_and_clears_pending() {
        let store = Arc::new(MemoryStore::new());
        let aggregator =
            Arc::new(AccountAggregator::new(store.clone(), Arc::new(Config::new())).unwrap());
        let purchases = PurchaseVerifier::new(
            aggregator,
            Arc::new(Unreachable),
            Arc::new(MemoryTelemetry::new()),
        );
        let err = purchases
            .verify_and_credit("alice", "tokens_500", "t-1", "r", Platform::Ios, now())
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            purchases.state("alice", "tokens_500", now()).unwrap(),
            PurchaseState::None
        );
        assert_eq!(store.entry_count("alice"), 0);
    }

    #[test]
    fn test_sandbox_verifier() {
        let v = SandboxReceiptVerifier;
        assert!(v.verify(Platform::Ios, "p", "abc").unwrap().verified);
        assert!(!v.verify(Platform::Ios, "p", "  ").unwrap().verified);
    }
}
