//! Drift detection between the ledger and the account aggregates.
//!
//! The reconciler only reports. A drifted account is persisted as a
//! `ReconciliationResult` and raised through telemetry; correcting it is an
//! operator decision taken through `AccountAggregator::adjust`.

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::ledger::{self, LedgerEntry};
use crate::storage::Store;
use crate::telemetry::{events, TelemetrySink};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot reads retried before a user is skipped for this run.
const SNAPSHOT_ATTEMPTS: usize = 3;

/// One detected drift. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub user_id: String,
    pub run_at: DateTime<Utc>,
    /// Signed sum of the user's ledger entries
    pub expected_balance: i64,
    /// Total of the account pools
    pub actual_balance: i64,
    /// `actual_balance - expected_balance`
    pub difference: i64,
    /// Most recent entries at the time of the run, newest first
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub users_checked: usize,
    pub drifted: Vec<ReconciliationResult>,
    /// Users that could not be read consistently; retried next run
    pub skipped: Vec<String>,
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub rate_limit_windows: usize,
    pub dedup_records: usize,
    pub rejected_purchases: usize,
    pub reconciliation_results: usize,
}

pub struct Reconciler<S: Store> {
    store: Arc<S>,
    telemetry: Arc<dyn TelemetrySink>,
    config: ReconcileConfig,
}

impl<S: Store> Reconciler<S> {
    pub fn new(store: Arc<S>, telemetry: Arc<dyn TelemetrySink>, config: ReconcileConfig) -> Self {
        Reconciler {
            store,
            telemetry,
            config,
        }
    }

    /// Check every user, one batch at a time.
    pub fn run(&self, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        let mut cursor: Option<String> = None;
        loop {
            let next = self.run_batch(cursor.as_deref(), now, &mut report)?;
            match next {
                Some(last) => cursor = Some(last),
                None => break,
            }
        }
        info!(
            users_checked = report.users_checked,
            drifted = report.drifted.len(),
            skipped = report.skipped.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    /// Check the batch of users after `after`. Returns the cursor for the
    /// next batch, or `None` when this was the last one.
    pub fn run_batch(
        &self,
        after: Option<&str>,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) -> Result<Option<String>> {
        let batch_size = self.config.batch_size.max(1);
        let users = self.store.list_users(after, batch_size)?;
        debug!(after = ?after, users = users.len(), "reconciling batch");

        for user_id in &users {
            report.users_checked += 1;
            match self.check_user(user_id, now) {
                Ok(Some(result)) => report.drifted.push(result),
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "reconciliation skipped user");
                    report.skipped.push(user_id.clone());
                }
            }
        }

        if users.len() < batch_size {
            Ok(None)
        } else {
            Ok(users.last().cloned())
        }
    }

    /// Compare one user's ledger sum with the account total, recording drift.
    pub fn check_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationResult>> {
        let (actual, entries) = self.consistent_snapshot(user_id)?;
        let expected = ledger::balance_of(&entries);
        let difference = actual - expected;
        if difference == 0 {
            return Ok(None);
        }

        let result = ReconciliationResult {
            user_id: user_id.to_string(),
            run_at: now,
            expected_balance: expected,
            actual_balance: actual,
            difference,
            entries: entries
                .into_iter()
                .take(self.config.implicated_entries)
                .collect(),
        };
        self.store.save_reconciliation(&result)?;
        warn!(user_id, expected, actual, difference, "ledger drift detected");
        self.telemetry.record(
            events::RECONCILIATION_DRIFT,
            &[
                ("user_id", user_id.to_string()),
                ("expected_balance", expected.to_string()),
                ("actual_balance", actual.to_string()),
                ("difference", difference.to_string()),
            ],
        );
        Ok(Some(result))
    }

    /// Account total and ledger entries from the same document version.
    fn consistent_snapshot(&self, user_id: &str) -> Result<(i64, Vec<LedgerEntry>)> {
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let before = self.store.load_document(user_id)?;
            let entries = self.store.load_entries(user_id, None)?;
            let after = self.store.load_document(user_id)?;
            if before.version == after.version {
                let actual = before
                    .account
                    .map(|a| a.total_available() as i64)
                    .unwrap_or(0);
                return Ok((actual, entries));
            }
        }
        Err(Error::Internal(format!(
            "account {} kept changing during reconciliation",
            user_id
        )))
    }

    /// Persisted results, optionally for one user.
    pub fn results(&self, user_id: Option<&str>) -> Result<Vec<ReconciliationResult>> {
        self.store.load_reconciliations(user_id)
    }

    /// Drop results older than the audit retention window.
    pub fn prune_results(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::days(self.config.retention_days);
        let removed = self.store.prune_reconciliations(cutoff)?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "pruned reconciliation results");
        }
        Ok(removed)
    }
}
