use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store platform that issued a purchase receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ios => f.write_str("ios"),
            Platform::Android => f.write_str("android"),
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ios" | "app_store" => Ok(Platform::Ios),
            "android" | "play_store" => Ok(Platform::Android),
            other => Err(Error::InvalidArgument(format!("Unknown platform: {}", other))),
        }
    }
}

/// Record of a verified, credited purchase. One per `(user_id, product_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    pub user_id: String,
    pub product_id: String,
    pub transaction_id: String,
    pub platform: Platform,
    pub tokens_credited: u64,
    pub timestamp: DateTime<Utc>,
    /// Transactions previously credited under the same key, oldest first
    #[serde(default)]
    pub previous_transaction_ids: Vec<String>,
}

impl PurchaseReceipt {
    /// Whether `transaction_id` was already credited under this key.
    pub fn covers(&self, transaction_id: &str) -> bool {
        self.transaction_id == transaction_id
            || self
                .previous_transaction_ids
                .iter()
                .any(|t| t == transaction_id)
    }

    /// Receipt for a new transaction on the same key, keeping the history.
    pub fn superseded_by(
        &self,
        transaction_id: &str,
        platform: Platform,
        tokens_credited: u64,
        timestamp: DateTime<Utc>,
    ) -> PurchaseReceipt {
        let mut previous = self.previous_transaction_ids.clone();
        previous.push(self.transaction_id.clone());
        PurchaseReceipt {
            user_id: self.user_id.clone(),
            product_id: self.product_id.clone(),
            transaction_id: transaction_id.to_string(),
            platform,
            tokens_credited,
            timestamp,
            previous_transaction_ids: previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt() -> PurchaseReceipt {
        PurchaseReceipt {
            user_id: "alice".to_string(),
            product_id: "tokens_500".to_string(),
            transaction_id: "t1".to_string(),
            platform: Platform::Ios,
            tokens_credited: 500,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            previous_transaction_ids: Vec::new(),
        }
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!("play_store".parse::<Platform>().unwrap(), Platform::Android);
        assert!(matches!(
            "windows".parse::<Platform>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_superseded_receipt_keeps_history() {
        let first = receipt();
        let ts = DateTime::from_timestamp(1_700_000_500, 0).unwrap();
        let second = first.superseded_by("t2", Platform::Ios, 500, ts);
        assert_eq!(second.transaction_id, "t2");
        assert!(second.covers("t1"));
        assert!(second.covers("t2"));
        assert!(!second.covers("t3"));
    }
}
