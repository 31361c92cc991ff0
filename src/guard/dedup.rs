//! Suppression of accidental double submits.
//!
//! Advisory only: request-id idempotency in the ledger is what prevents a
//! double charge. This guard catches a user pressing the button twice with
//! two different request ids.

use crate::config::DedupConfig;
use crate::guard::cache::TtlCache;
use crate::sha256_digest;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::debug;

/// Request fields that never take part in the content hash.
const VOLATILE_FIELDS: [&str; 3] = ["timestamp", "requestId", "request_id"];

/// Hash of the semantically relevant parts of a request.
///
/// Object keys are hashed in sorted order, so field order does not matter.
pub fn content_hash(action: &str, details: &Value) -> String {
    let relevant = match details {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    };
    let mut data = action.as_bytes().to_vec();
    data.push(0);
    data.extend_from_slice(relevant.to_string().as_bytes());
    hex::encode(sha256_digest(&data))
}

/// Rolling `(content_hash, seen_at)` list for one user in arrival order.
/// Arrival order need not match timestamp order.
#[derive(Debug, Default)]
struct DedupRecord {
    seen: VecDeque<(String, DateTime<Utc>)>,
}

impl DedupRecord {
    /// Drop hashes whose window has passed.
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        self.seen.retain(|(_, t)| now - *t < window);
    }
}

pub struct DedupGuard {
    window: Duration,
    max_records: usize,
    records: TtlCache<String, DedupRecord>,
}

impl DedupGuard {
    pub fn new(config: &DedupConfig) -> Self {
        DedupGuard {
            window: Duration::seconds(config.window_secs as i64),
            max_records: config.max_records_per_user.max(1),
            records: TtlCache::new(Duration::seconds(config.idle_ttl_secs as i64)),
        }
    }

    /// Returns `true` the first time `hash` is seen inside the window and
    /// records it; `false` for a duplicate.
    ///
    /// A hash seen at `t` is a duplicate while `now - t < window`.
    pub fn check_and_record(&self, user_id: &str, hash: &str, now: DateTime<Utc>) -> bool {
        let window = self.window;
        let max = self.max_records;
        let first_seen = self.records.with_entry(user_id.to_string(), now, |record| {
            record.prune(now, window);
            if record.seen.iter().any(|(h, _)| h == hash) {
                return false;
            }
            record.seen.push_back((hash.to_string(), now));
            while record.seen.len() > max {
                record.seen.pop_front();
            }
            true
        });
        if !first_seen {
            debug!(user_id, hash, "duplicate request suppressed");
        }
        first_seen
    }

    /// Forget a recorded hash so the request can be resubmitted, e.g. after
    /// the charge it guarded failed.
    pub fn forget(&self, user_id: &str, hash: &str, now: DateTime<Utc>) {
        self.records.update(&user_id.to_string(), now, |record| {
            record.seen.retain(|(h, _)| h != hash);
        });
    }

    /// Prune expired hashes and evict idle or empty records.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let window = self.window;
        self.records.sweep(now, |record| {
            record.prune(now, window);
            !record.seen.is_empty()
        })
    }

    pub fn tracked_users(&self) -> usize {
        self.records.len()
    }
}
