use crate::error::{Error, Result};
use crate::sha256_digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of balance movement an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Credit,
    Debit,
    Reset,
    Transfer,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::Credit => "credit",
            LedgerAction::Debit => "debit",
            LedgerAction::Reset => "reset",
            LedgerAction::Transfer => "transfer",
        }
    }
}

impl fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "credit" => Ok(LedgerAction::Credit),
            "debit" => Ok(LedgerAction::Debit),
            "reset" => Ok(LedgerAction::Reset),
            "transfer" => Ok(LedgerAction::Transfer),
            other => Err(Error::InvalidEntry(format!(
                "Unrecognized ledger action: {}",
                other
            ))),
        }
    }
}

/// What caused the balance movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSource {
    Purchase,
    Generate,
    Regenerate,
    Reorganize,
    FreeAction,
    WelcomeBonus,
    MonthlyReset,
    Refund,
    Adjustment,
}

impl LedgerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSource::Purchase => "purchase",
            LedgerSource::Generate => "generate",
            LedgerSource::Regenerate => "regenerate",
            LedgerSource::Reorganize => "reorganize",
            LedgerSource::FreeAction => "free_action",
            LedgerSource::WelcomeBonus => "welcome_bonus",
            LedgerSource::MonthlyReset => "monthly_reset",
            LedgerSource::Refund => "refund",
            LedgerSource::Adjustment => "adjustment",
        }
    }

    /// Actions an entry with this source may carry.
    fn permits(&self, action: LedgerAction) -> bool {
        use LedgerAction::*;
        match self {
            LedgerSource::Purchase | LedgerSource::WelcomeBonus | LedgerSource::Refund => {
                action == Credit
            }
            LedgerSource::Generate | LedgerSource::Regenerate | LedgerSource::Reorganize => {
                action == Debit
            }
            LedgerSource::MonthlyReset => action == Reset,
            LedgerSource::FreeAction | LedgerSource::Adjustment => action != Reset,
        }
    }
}

impl fmt::Display for LedgerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "purchase" => Ok(LedgerSource::Purchase),
            "generate" => Ok(LedgerSource::Generate),
            "regenerate" => Ok(LedgerSource::Regenerate),
            "reorganize" => Ok(LedgerSource::Reorganize),
            "free_action" => Ok(LedgerSource::FreeAction),
            "welcome_bonus" => Ok(LedgerSource::WelcomeBonus),
            "monthly_reset" => Ok(LedgerSource::MonthlyReset),
            "refund" => Ok(LedgerSource::Refund),
            "adjustment" => Ok(LedgerSource::Adjustment),
            other => Err(Error::InvalidEntry(format!(
                "Unrecognized ledger source: {}",
                other
            ))),
        }
    }
}

/// Entry identity, derived from `(user_id, request_id, action)`.
///
/// Deriving the id makes a retried request land on the same id, which is how
/// the store detects that the event was already applied.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(String);

impl EntryId {
    pub fn derive(user_id: &str, request_id: &str, action: LedgerAction) -> Self {
        let mut data = Vec::with_capacity(user_id.len() + request_id.len() + 10);
        data.extend_from_slice(user_id.as_bytes());
        data.push(0);
        data.extend_from_slice(request_id.as_bytes());
        data.push(0);
        data.extend_from_slice(action.as_str().as_bytes());
        EntryId(hex::encode(sha256_digest(&data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable record of one balance-affecting event.
///
/// Invariants:
/// - `token_delta` is never zero; credits are positive, debits negative
/// - the signed sum of a user's entries equals that user's available balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub user_id: String,
    pub action: LedgerAction,
    pub token_delta: i64,
    /// Client-supplied idempotency key
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: LedgerSource,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LedgerEntry {
    pub fn new(
        user_id: &str,
        action: LedgerAction,
        source: LedgerSource,
        token_delta: i64,
        request_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        LedgerEntry {
            entry_id: EntryId::derive(user_id, request_id, action),
            user_id: user_id.to_string(),
            action,
            token_delta,
            request_id: request_id.to_string(),
            timestamp,
            source,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Check the entry is well formed before it may be appended.
    pub fn validate(&self) -> Result<()> {
        if self.token_delta == 0 {
            return Err(Error::InvalidEntry(
                "token_delta must be non-zero".to_string(),
            ));
        }
        if self.user_id.is_empty() {
            return Err(Error::InvalidEntry("user_id is empty".to_string()));
        }
        if self.request_id.is_empty() {
            return Err(Error::InvalidEntry("request_id is empty".to_string()));
        }
        match self.action {
            LedgerAction::Credit if self.token_delta < 0 => {
                return Err(Error::InvalidEntry(format!(
                    "credit entry carries negative delta {}",
                    self.token_delta
                )));
            }
            LedgerAction::Debit if self.token_delta > 0 => {
                return Err(Error::InvalidEntry(format!(
                    "debit entry carries positive delta {}",
                    self.token_delta
                )));
            }
            _ => {}
        }
        if !self.source.permits(self.action) {
            return Err(Error::InvalidEntry(format!(
                "source {} cannot be recorded as {}",
                self.source, self.action
            )));
        }
        if self.entry_id != EntryId::derive(&self.user_id, &self.request_id, self.action) {
            return Err(Error::InvalidEntry(format!(
                "entry_id {} does not match its request",
                self.entry_id
            )));
        }
        Ok(())
    }
}
