//! Token pricing for spend actions.
//!
//! Pricing is product policy, so the service only sees the `CostCalculator`
//! trait. `PolicyCostCalculator` is the configurable default.

use crate::config::CostConfig;
use crate::error::{Error, Result};
use crate::ledger::LedgerSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Smallest charge for any billable action. Ratio-based prices round up and
/// never fall below this.
pub const MINIMUM_CHARGE: u64 = 1;

/// Upper bound on the item count or duration accepted in a request.
pub const MAX_QUANTITY: u64 = 10_000;

/// Spend actions a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Generate,
    Regenerate,
    Reorganize,
    VideoImport,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Generate => "generate",
            ActionType::Regenerate => "regenerate",
            ActionType::Reorganize => "reorganize",
            ActionType::VideoImport => "video_import",
        }
    }

    /// Ingest-class actions pull external content and get the stricter limits.
    pub fn is_ingest(&self) -> bool {
        matches!(self, ActionType::VideoImport)
    }

    /// Ledger source recorded for the debit.
    pub fn ledger_source(&self) -> LedgerSource {
        match self {
            ActionType::Generate | ActionType::VideoImport => LedgerSource::Generate,
            ActionType::Regenerate => LedgerSource::Regenerate,
            ActionType::Reorganize => LedgerSource::Reorganize,
        }
    }

    /// Resource the request targets, for per-resource abuse tracking.
    pub fn resource_id(&self, details: &Value) -> Result<Option<String>> {
        if !self.is_ingest() {
            return Ok(None);
        }
        let id = string_field(details, &["videoId", "video_id"]).ok_or_else(|| {
            Error::InvalidArgument("video import requires a video id".to_string())
        })?;
        let valid = !id.is_empty()
            && id.len() <= 64
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::InvalidArgument(format!("malformed video id: {:?}", id)));
        }
        Ok(Some(format!("video:{}", id)))
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generate" => Ok(ActionType::Generate),
            "regenerate" => Ok(ActionType::Regenerate),
            "reorganize" => Ok(ActionType::Reorganize),
            "video_import" | "videoImport" => Ok(ActionType::VideoImport),
            other => Err(Error::InvalidArgument(format!(
                "Unrecognized action type: {}",
                other
            ))),
        }
    }
}

/// Deterministic price of an action.
pub trait CostCalculator: Send + Sync {
    fn cost(&self, action: ActionType, details: &Value) -> Result<u64>;
}

#[derive(Debug, Clone, Default)]
pub struct PolicyCostCalculator {
    config: CostConfig,
}

impl PolicyCostCalculator {
    pub fn new(config: CostConfig) -> Self {
        PolicyCostCalculator { config }
    }
}

impl CostCalculator for PolicyCostCalculator {
    fn cost(&self, action: ActionType, details: &Value) -> Result<u64> {
        let cfg = &self.config;
        let raw = match action {
            ActionType::Generate => {
                let items = quantity(details, &["itemCount", "item_count"])?;
                ceil_div(items, cfg.items_per_token)?
            }
            ActionType::Regenerate => {
                let items = quantity(details, &["itemCount", "item_count"])?;
                let weighted = items.checked_mul(cfg.regenerate_set_cost).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "regenerate cost overflows for {} items",
                        items
                    ))
                })?;
                ceil_div(weighted, cfg.regenerate_set_size)?
            }
            ActionType::Reorganize => cfg.reorganize_cost,
            ActionType::VideoImport => {
                let minutes = quantity(details, &["durationMinutes", "duration_minutes"])?;
                ceil_div(minutes, cfg.video_minutes_per_token)?
            }
        };
        Ok(raw.max(MINIMUM_CHARGE))
    }
}

fn ceil_div(n: u64, divisor: u64) -> Result<u64> {
    if divisor == 0 {
        return Err(Error::InvalidArgument(
            "cost divisor must be greater than zero".to_string(),
        ));
    }
    Ok(n.div_ceil(divisor))
}

fn field<'a>(details: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| details.get(*name))
}

fn string_field<'a>(details: &'a Value, names: &[&str]) -> Option<&'a str> {
    field(details, names).and_then(Value::as_str)
}

/// Positive integer parameter, bounded to keep prices sane.
fn quantity(details: &Value, names: &[&str]) -> Result<u64> {
    let value = field(details, names)
        .ok_or_else(|| Error::InvalidArgument(format!("missing {}", names[0])))?;
    match value.as_u64() {
        Some(n) if (1..=MAX_QUANTITY).contains(&n) => Ok(n),
        _ => Err(Error::InvalidArgument(format!(
            "{} must be an integer between 1 and {}",
            names[0], MAX_QUANTITY
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calc() -> PolicyCostCalculator {
        PolicyCostCalculator::new(CostConfig::default())
    }

    #[test]
    fn test_generate_rounds_up() {
        let c = calc();
        assert_eq!(c.cost(ActionType::Generate, &json!({"itemCount": 5})).unwrap(), 1);
        assert_eq!(c.cost(ActionType::Generate, &json!({"itemCount": 6})).unwrap(), 2);
        assert_eq!(c.cost(ActionType::Generate, &json!({"item_count": 20})).unwrap(), 4);
    }

    #[test]
    fn test_small_regenerate_is_never_free() {
        let c = calc();
        // 1 item of a 20-item set at 2 tokens per set would floor to zero
        assert_eq!(
            c.cost(ActionType::Regenerate, &json!({"itemCount": 1})).unwrap(),
            MINIMUM_CHARGE
        );
        assert_eq!(c.cost(ActionType::Regenerate, &json!({"itemCount": 20})).unwrap(), 2);
        assert_eq!(c.cost(ActionType::Regenerate, &json!({"itemCount": 21})).unwrap(), 3);
    }

    #[test]
    fn test_flat_and_duration_prices() {
        let c = calc();
        assert_eq!(c.cost(ActionType::Reorganize, &json!({})).unwrap(), 1);
        assert_eq!(
            c.cost(ActionType::VideoImport, &json!({"durationMinutes": 25, "videoId": "abc"}))
                .unwrap(),
            3
        );
    }

    #[test]
    fn test_zero_cost_policy_still_charges_minimum() {
        let c = PolicyCostCalculator::new(CostConfig {
            reorganize_cost: 0,
            ..CostConfig::default()
        });
        assert_eq!(c.cost(ActionType::Reorganize, &json!({})).unwrap(), MINIMUM_CHARGE);
    }

    #[test]
    fn test_bad_quantities_rejected() {
        let c = calc();
        for details in [
            json!({}),
            json!({"itemCount": 0}),
            json!({"itemCount": -3}),
            json!({"itemCount": "ten"}),
            json!({"itemCount": 1_000_000}),
        ] {
            assert!(matches!(
                c.cost(ActionType::Generate, &details),
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_action_type_parsing() {
        assert_eq!("videoImport".parse::<ActionType>().unwrap(), ActionType::VideoImport);
        assert!(ActionType::VideoImport.is_ingest());
        assert!(!ActionType::Generate.is_ingest());
        assert!(matches!(
            "delete_everything".parse::<ActionType>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_video_resource_id() {
        let a = ActionType::VideoImport;
        assert_eq!(
            a.resource_id(&json!({"videoId": "dQw4w9WgXcQ"})).unwrap(),
            Some("video:dQw4w9WgXcQ".to_string())
        );
        assert!(a.resource_id(&json!({"videoId": "../etc/passwd"})).is_err());
        assert!(a.resource_id(&json!({})).is_err());
        assert_eq!(ActionType::Generate.resource_id(&json!({})).unwrap(), None);
    }

    #[test]
    fn test_oversized_set_cost_is_rejected_not_wrapped() {
        let c = PolicyCostCalculator::new(CostConfig {
            regenerate_set_cost: u64::MAX / 2,
            ..CostConfig::default()
        });
        assert!(matches!(
            c.cost(ActionType::Regenerate, &json!({"itemCount": 3})),
            Err(Error::InvalidArgument(_))
        ));
        // a single item still fits
        assert_eq!(
            c.cost(ActionType::Regenerate, &json!({"itemCount": 1})).unwrap(),
            (u64::MAX / 2).div_ceil(20)
        );
    }

    #[test]
    fn test_zero_divisor_is_an_error() {
        let c = PolicyCostCalculator::new(CostConfig {
            items_per_token: 0,
            ..CostConfig::default()
        });
        assert!(matches!(
            c.cost(ActionType::Generate, &json!({"itemCount": 3})),
            Err(Error::InvalidArgument(_))
        ));
    }
}
