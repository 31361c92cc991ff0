//! Request-facing entry points.
//!
//! Every spend runs guard checks first and mutates second: authentication,
//! validation, rate limits and dedup all complete before the single debit
//! transaction, so a rejected request leaves no state behind.

use crate::config::Config;
use crate::cost::{ActionType, CostCalculator, PolicyCostCalculator};
use crate::error::{Error, Result};
use crate::guard::{content_hash, DedupGuard, RateLimiter};
use crate::ledger::{self, EntryId, LedgerAction, LedgerEntry};
use crate::purchase::{Platform, PurchaseOutcome, PurchaseState, PurchaseVerifier, ReceiptVerifier};
use crate::reconcile::{CleanupReport, ReconciliationReport, ReconciliationResult, Reconciler};
use crate::state::{AccountAggregator, AdjustOutcome, CreditOutcome, ResetOutcome, UserTokenAccount};
use crate::storage::{validate_user_id, Store};
use crate::telemetry::{events, TelemetrySink, TracingTelemetry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_LEDGER_PAGE: usize = 50;
const MAX_LEDGER_PAGE: usize = 500;
const MAX_REQUEST_ID_LEN: usize = 128;

/// Authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// Operators may read any ledger and apply adjustments
    pub admin: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Caller {
            user_id: user_id.into(),
            admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Caller {
            user_id: user_id.into(),
            admin: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub action_type: String,
    pub request_id: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub tokens_cost: u64,
    pub remaining_tokens: u64,
    /// The request id was already charged; nothing was debited this time
    pub replay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPurchaseRequest {
    pub product_id: String,
    pub transaction_id: String,
    pub receipt: String,
    pub platform: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub users: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub failed: Vec<String>,
}

/// External collaborators the service consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub costs: Arc<dyn CostCalculator>,
    pub receipts: Arc<dyn ReceiptVerifier>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Collaborators {
    /// Configured cost policy and tracing telemetry around `receipts`.
    pub fn new(config: &Config, receipts: Arc<dyn ReceiptVerifier>) -> Self {
        Collaborators {
            costs: Arc::new(PolicyCostCalculator::new(config.cost.clone())),
            receipts,
            telemetry: Arc::new(TracingTelemetry),
        }
    }
}

pub struct TokenService<S: Store> {
    config: Arc<Config>,
    aggregator: Arc<AccountAggregator<S>>,
    rate_limiter: RateLimiter,
    dedup: DedupGuard,
    purchases: PurchaseVerifier<S>,
    reconciler: Reconciler<S>,
    costs: Arc<dyn CostCalculator>,
    telemetry: Arc<dyn TelemetrySink>,
}

fn authenticate(caller: Option<&Caller>) -> Result<&Caller> {
    match caller {
        Some(c) if !c.user_id.trim().is_empty() => {
            validate_user_id(&c.user_id)?;
            Ok(c)
        }
        _ => Err(Error::Unauthenticated),
    }
}

fn authorize_read<'a>(caller: &Caller, user_id: &'a str) -> Result<&'a str> {
    if caller.user_id == user_id || caller.admin {
        Ok(user_id)
    } else {
        Err(Error::PermissionDenied(format!(
            "{} may not read the ledger of {}",
            caller.user_id, user_id
        )))
    }
}

fn validate_request_id(request_id: &str) -> Result<()> {
    let valid = !request_id.is_empty()
        && request_id.len() <= MAX_REQUEST_ID_LEN
        && request_id.chars().all(|c| c.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "request id must be 1-{} printable ASCII characters",
            MAX_REQUEST_ID_LEN
        )))
    }
}

impl<S: Store> TokenService<S> {
    pub fn new(store: Arc<S>, config: Config, collaborators: Collaborators) -> Result<Self> {
        let config = Arc::new(config);
        let aggregator = Arc::new(AccountAggregator::new(store.clone(), config.clone())?);
        let zone = aggregator.zone();
        let Collaborators {
            costs,
            receipts,
            telemetry,
        } = collaborators;

        Ok(TokenService {
            rate_limiter: RateLimiter::new(config.rate_limit.clone(), zone),
            dedup: DedupGuard::new(&config.dedup),
            purchases: PurchaseVerifier::new(aggregator.clone(), receipts, telemetry.clone()),
            reconciler: Reconciler::new(store, telemetry.clone(), config.reconcile.clone()),
            aggregator,
            config,
            costs,
            telemetry,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn aggregator(&self) -> &AccountAggregator<S> {
        &self.aggregator
    }

    /// Charge the caller for one action.
    pub fn consume_tokens(
        &self,
        caller: Option<&Caller>,
        request: &ConsumeRequest,
        now: DateTime<Utc>,
    ) -> Result<ConsumeResponse> {
        let caller = authenticate(caller)?;
        let user_id = caller.user_id.as_str();
        let action: ActionType = request.action_type.parse()?;
        validate_request_id(&request.request_id)?;
        let details = match &request.details {
            Value::Null => Value::Object(Default::default()),
            Value::Object(_) => request.details.clone(),
            _ => {
                return Err(Error::InvalidArgument(
                    "details must be an object".to_string(),
                ))
            }
        };
        let resource = action.resource_id(&details)?;

        // a retried request id is answered from the ledger before any guard
        if let Some(prior) = self.find_debit(user_id, &request.request_id)? {
            return Ok(ConsumeResponse {
                tokens_cost: prior.token_delta.unsigned_abs(),
                remaining_tokens: self.balance(user_id)?,
                replay: true,
            });
        }

        let decision = self
            .rate_limiter
            .check(user_id, action.is_ingest(), resource.as_deref(), now);
        if let Some(reason) = decision.reason {
            self.telemetry.record(
                events::RATE_LIMITED,
                &[
                    ("user_id", user_id.to_string()),
                    ("action", action.to_string()),
                    ("reason", reason.to_string()),
                    ("resource", resource.clone().unwrap_or_default()),
                ],
            );
        }
        decision.into_result()?;

        let hash = content_hash(action.as_str(), &details);
        if !self.dedup.check_and_record(user_id, &hash, now) {
            self.telemetry.record(
                events::DUPLICATE_SUPPRESSED,
                &[
                    ("user_id", user_id.to_string()),
                    ("action", action.to_string()),
                ],
            );
            return Err(Error::DuplicateRequest);
        }

        let charged = self.costs.cost(action, &details).and_then(|cost| {
            self.aggregator
                .debit(user_id, cost, action.ledger_source(), &request.request_id, now)
        });
        let outcome = match charged {
            Ok(outcome) => outcome,
            Err(e) => {
                // nothing was charged, so the same content may be submitted again
                self.dedup.forget(user_id, &hash, now);
                if let Error::InsufficientFunds { available, required } = &e {
                    info!(user_id, action = %action, available, required, "spend refused");
                }
                return Err(e);
            }
        };

        Ok(ConsumeResponse {
            tokens_cost: outcome.charged,
            remaining_tokens: outcome.new_balance,
            replay: outcome.replay,
        })
    }

    /// Verify a store purchase for the caller and credit it once.
    pub fn verify_purchase(
        &self,
        caller: Option<&Caller>,
        request: &VerifyPurchaseRequest,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome> {
        let caller = authenticate(caller)?;
        let platform: Platform = request.platform.parse()?;
        self.purchases.verify_and_credit(
            &caller.user_id,
            &request.product_id,
            &request.transaction_id,
            &request.receipt,
            platform,
            now,
        )
    }

    pub fn purchase_state(
        &self,
        caller: Option<&Caller>,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PurchaseState> {
        let caller = authenticate(caller)?;
        self.purchases.state(&caller.user_id, product_id, now)
    }

    /// Most recent ledger entries of `user_id`, newest first.
    pub fn get_ledger_entries(
        &self,
        caller: Option<&Caller>,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerEntry>> {
        let caller = authenticate(caller)?;
        let user_id = authorize_read(caller, user_id)?;
        let limit = limit.unwrap_or(DEFAULT_LEDGER_PAGE);
        if limit == 0 || limit > MAX_LEDGER_PAGE {
            return Err(Error::InvalidArgument(format!(
                "limit must be between 1 and {}",
                MAX_LEDGER_PAGE
            )));
        }
        ledger::entries(self.aggregator.store().as_ref(), user_id, Some(limit))
    }

    pub fn get_account(
        &self,
        caller: Option<&Caller>,
        user_id: &str,
    ) -> Result<Option<UserTokenAccount>> {
        let caller = authenticate(caller)?;
        let user_id = authorize_read(caller, user_id)?;
        self.aggregator.account(user_id)
    }

    /// Give back the tokens of a spend whose action failed downstream.
    pub fn refund_failed_action(
        &self,
        user_id: &str,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditOutcome> {
        validate_user_id(user_id)?;
        validate_request_id(request_id)?;
        self.aggregator.refund(user_id, request_id, now)
    }

    /// Operator balance correction, e.g. after reviewing a drift result.
    pub fn adjust_balance(
        &self,
        caller: Option<&Caller>,
        user_id: &str,
        delta: i64,
        request_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<AdjustOutcome> {
        let caller = authenticate(caller)?;
        if !caller.admin {
            return Err(Error::PermissionDenied(
                "balance adjustments require an operator".to_string(),
            ));
        }
        validate_user_id(user_id)?;
        validate_request_id(request_id)?;
        if note.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "adjustments need a note for the audit trail".to_string(),
            ));
        }
        warn!(operator = %caller.user_id, user_id, delta, note, "operator adjustment");
        self.aggregator.adjust(user_id, delta, request_id, note, now)
    }

    /// Apply the monthly reset to every account, batch by batch.
    pub fn run_monthly_resets(&self, now: DateTime<Utc>) -> Result<ResetReport> {
        let store = self.aggregator.store();
        let batch_size = self.config.reconcile.batch_size.max(1);
        let mut report = ResetReport::default();
        let mut cursor: Option<String> = None;
        loop {
            let users = store.list_users(cursor.as_deref(), batch_size)?;
            for user_id in &users {
                report.users += 1;
                match self.aggregator.reset_monthly_for_tier(user_id, now) {
                    Ok(ResetOutcome::Applied { .. }) => report.applied += 1,
                    Ok(ResetOutcome::AlreadyApplied { .. }) => report.already_applied += 1,
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "monthly reset failed");
                        report.failed.push(user_id.clone());
                    }
                }
            }
            if users.len() < batch_size {
                break;
            }
            cursor = users.last().cloned();
        }
        info!(
            users = report.users,
            applied = report.applied,
            failed = report.failed.len(),
            "monthly resets finished"
        );
        Ok(report)
    }

    pub fn run_reconciliation(&self, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        self.reconciler.run(now)
    }

    pub fn reconciliation_results(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ReconciliationResult>> {
        self.reconciler.results(user_id)
    }

    /// Bound process memory and the audit log.
    pub fn run_cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let report = CleanupReport {
            rate_limit_windows: self.rate_limiter.cleanup(now),
            dedup_records: self.dedup.cleanup(now),
            rejected_purchases: self.purchases.cleanup(now),
            reconciliation_results: self.reconciler.prune_results(now)?,
        };
        info!(?report, "cleanup finished");
        Ok(report)
    }

    fn find_debit(&self, user_id: &str, request_id: &str) -> Result<Option<LedgerEntry>> {
        let id = EntryId::derive(user_id, request_id, LedgerAction::Debit);
        self.aggregator.store().find_entry(user_id, &id)
    }

    fn balance(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .aggregator
            .account(user_id)?
            .map(|a| a.total_available())
            .unwrap_or(0))
    }
}
