//! Per-user and per-resource request limits.
//!
//! Windows are retained timestamp lists filtered against `now - window` on
//! every check, so counts always reflect a live filter. A request is only
//! recorded once every policy allows it; denied requests leave no trace
//! beyond the resource abuse counter that flagged them.

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use crate::guard::cache::TtlCache;
use crate::state::ReferenceZone;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

/// Which policy rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    MinuteLimit,
    HourLimit,
    IngestHourLimit,
    IngestCooldown,
    SessionCap,
    ResourceFlagged,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::MinuteLimit => "minute_limit",
            RateLimitReason::HourLimit => "hour_limit",
            RateLimitReason::IngestHourLimit => "ingest_hour_limit",
            RateLimitReason::IngestCooldown => "ingest_cooldown",
            RateLimitReason::SessionCap => "session_cap",
            RateLimitReason::ResourceFlagged => "resource_flagged",
        }
    }
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<RateLimitReason>,
    /// Seconds until the same request could pass, when known
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    pub fn allow() -> Self {
        RateDecision {
            allowed: true,
            reason: None,
            retry_after_secs: None,
        }
    }

    pub fn deny(reason: RateLimitReason, retry_after: Option<Duration>) -> Self {
        RateDecision {
            allowed: false,
            reason: Some(reason),
            retry_after_secs: retry_after.map(whole_seconds),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.reason {
            Some(reason) if !self.allowed => Err(Error::RateLimited {
                reason,
                retry_after_secs: self.retry_after_secs,
            }),
            _ => Ok(()),
        }
    }
}

/// Round up to whole seconds, never below one.
fn whole_seconds(d: Duration) -> u64 {
    let millis = d.num_milliseconds().max(1) as u64;
    millis.div_ceil(1000)
}

/// Recent activity of one user.
#[derive(Debug, Default)]
struct RateLimitWindow {
    requests: VecDeque<DateTime<Utc>>,
    ingests: VecDeque<DateTime<Utc>>,
    session_start: Option<DateTime<Utc>>,
    session_requests: u64,
}

impl RateLimitWindow {
    fn prune(&mut self, now: DateTime<Utc>, session: Duration) {
        let horizon = now - Duration::hours(1);
        prune_before(&mut self.requests, horizon);
        prune_before(&mut self.ingests, horizon);
        if self
            .session_start
            .is_some_and(|start| now - start >= session)
        {
            self.session_start = None;
            self.session_requests = 0;
        }
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.ingests.is_empty() && self.session_start.is_none()
    }
}

/// Requests for one resource across all users.
#[derive(Debug, Default)]
struct ResourceWindow {
    hits: VecDeque<DateTime<Utc>>,
    flagged_until: Option<DateTime<Utc>>,
}

impl ResourceWindow {
    fn flag_active(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.flagged_until.filter(|until| *until > now)
    }
}

/// Drop timestamps at or before `horizon`; a timestamp counts only while `t > now - window`.
///
/// Timestamps may arrive out of order, so every position is checked.
fn prune_before(times: &mut VecDeque<DateTime<Utc>>, horizon: DateTime<Utc>) {
    times.retain(|t| *t > horizon);
}

/// Live count after `horizon` and the oldest live timestamp.
fn count_after(
    times: &VecDeque<DateTime<Utc>>,
    horizon: DateTime<Utc>,
) -> (usize, Option<DateTime<Utc>>) {
    times
        .iter()
        .filter(|t| **t > horizon)
        .fold((0, None), |(count, oldest), t| {
            let oldest = match oldest {
                Some(o) if o <= *t => o,
                _ => *t,
            };
            (count + 1, Some(oldest))
        })
}

pub struct RateLimiter {
    config: RateLimitConfig,
    zone: ReferenceZone,
    users: TtlCache<String, RateLimitWindow>,
    resources: TtlCache<String, ResourceWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, zone: ReferenceZone) -> Self {
        let idle = Duration::seconds(config.idle_ttl_secs as i64);
        RateLimiter {
            config,
            zone,
            users: TtlCache::new(idle),
            // a flag must outlive the idle TTL until the daily reset
            resources: TtlCache::new(idle.max(Duration::days(1))),
        }
    }

    /// Check every policy for one request and record it if allowed.
    pub fn check(
        &self,
        user_id: &str,
        is_ingest: bool,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> RateDecision {
        if let Some(resource) = resource {
            if let Some(until) = self.flagged_until(resource, now) {
                debug!(user_id, resource, "request for flagged resource");
                return RateDecision::deny(RateLimitReason::ResourceFlagged, Some(until - now));
            }
        }

        let session = Duration::seconds(self.config.session_duration_secs as i64);
        let decision = self.users.with_entry(user_id.to_string(), now, |window| {
            window.prune(now, session);
            if let Some(denied) = self.check_user(window, is_ingest, now) {
                return denied;
            }
            if let Some(resource) = resource {
                if let Some(denied) = self.record_resource_hit(resource, now) {
                    return denied;
                }
            }
            window.requests.push_back(now);
            if is_ingest {
                window.ingests.push_back(now);
            }
            if window.session_start.is_none() {
                window.session_start = Some(now);
            }
            window.session_requests += 1;
            RateDecision::allow()
        });

        if let Some(reason) = decision.reason {
            debug!(
                user_id,
                reason = %reason,
                retry_after_secs = ?decision.retry_after_secs,
                "rate limited"
            );
        }
        decision
    }

    fn check_user(
        &self,
        window: &RateLimitWindow,
        is_ingest: bool,
        now: DateTime<Utc>,
    ) -> Option<RateDecision> {
        let cfg = &self.config;

        let minute = Duration::minutes(1);
        let (in_minute, oldest) = count_after(&window.requests, now - minute);
        if in_minute >= cfg.requests_per_minute {
            let retry = oldest.map(|t| t + minute - now);
            return Some(RateDecision::deny(RateLimitReason::MinuteLimit, retry));
        }

        let hour = Duration::hours(1);
        let (in_hour, oldest) = count_after(&window.requests, now - hour);
        if in_hour >= cfg.requests_per_hour {
            let retry = oldest.map(|t| t + hour - now);
            return Some(RateDecision::deny(RateLimitReason::HourLimit, retry));
        }

        if let Some(start) = window.session_start {
            if window.session_requests >= cfg.session_request_cap {
                let end = start + Duration::seconds(cfg.session_duration_secs as i64);
                return Some(RateDecision::deny(RateLimitReason::SessionCap, Some(end - now)));
            }
        }

        if is_ingest {
            let cooldown = Duration::seconds(cfg.ingest_cooldown_secs as i64);
            // any ingest closer than the cooldown blocks, whichever side of `now` it is on
            let blocking = window
                .ingests
                .iter()
                .filter(|t| (now - **t).abs() < cooldown)
                .max();
            if let Some(last) = blocking {
                return Some(RateDecision::deny(
                    RateLimitReason::IngestCooldown,
                    Some(*last + cooldown - now),
                ));
            }
            let (ingests_in_hour, oldest) = count_after(&window.ingests, now - hour);
            if ingests_in_hour >= cfg.ingest_per_hour {
                let retry = oldest.map(|t| t + hour - now);
                return Some(RateDecision::deny(RateLimitReason::IngestHourLimit, retry));
            }
        }
        None
    }

    /// Count a hit for `resource`; flags it until the next daily reset once
    /// the hourly threshold is exceeded.
    fn record_resource_hit(&self, resource: &str, now: DateTime<Utc>) -> Option<RateDecision> {
        let threshold = self.config.resource_hourly_threshold;
        let next_midnight = self.zone.next_midnight(now);
        self.resources.with_entry(resource.to_string(), now, |window| {
            if let Some(until) = window.flag_active(now) {
                return Some(RateDecision::deny(
                    RateLimitReason::ResourceFlagged,
                    Some(until - now),
                ));
            }
            window.flagged_until = None;
            prune_before(&mut window.hits, now - Duration::hours(1));
            window.hits.push_back(now);
            if window.hits.len() > threshold {
                window.flagged_until = Some(next_midnight);
                warn!(
                    resource,
                    hits = window.hits.len(),
                    until = %next_midnight,
                    "resource flagged for abuse"
                );
                return Some(RateDecision::deny(
                    RateLimitReason::ResourceFlagged,
                    Some(next_midnight - now),
                ));
            }
            None
        })
    }

    /// Whether `resource` is currently flagged.
    pub fn is_flagged(&self, resource: &str, now: DateTime<Utc>) -> bool {
        self.flagged_until(resource, now).is_some()
    }

    fn flagged_until(&self, resource: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.resources
            .update(&resource.to_string(), now, |window| window.flag_active(now))
            .flatten()
    }

    /// Prune stale timestamps and evict idle or empty windows.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let session = Duration::seconds(self.config.session_duration_secs as i64);
        let users = self.users.sweep(now, |window| {
            window.prune(now, session);
            !window.is_empty()
        });
        let resources = self.resources.sweep(now, |window| {
            prune_before(&mut window.hits, now - Duration::hours(1));
            if window.flag_active(now).is_none() {
                window.flagged_until = None;
            }
            !window.hits.is_empty() || window.flagged_until.is_some()
        });
        users + resources
    }

    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }
}
