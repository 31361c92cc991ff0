//! Append-only ledger log.
//!
//! Entries only enter the log through `append` inside a store transaction, so
//! an entry is visible exactly when the account mutation it records is. There
//! is no update or delete path.

use crate::error::{Error, Result};
use crate::ledger::{EntryId, LedgerEntry};
use crate::storage::{Store, Transaction};

/// Append an entry to the user's log as part of `tx`.
///
/// Fails with `InvalidEntry` for zero deltas, inconsistent action/source
/// pairs, or an entry belonging to another user.
pub fn append<S: Store + ?Sized>(
    tx: &mut Transaction<'_, S>,
    entry: LedgerEntry,
) -> Result<EntryId> {
    entry.validate()?;
    if entry.user_id != tx.user_id() {
        return Err(Error::InvalidEntry(format!(
            "entry for {} appended in transaction for {}",
            entry.user_id,
            tx.user_id()
        )));
    }
    let id = entry.entry_id.clone();
    tx.push_entry(entry);
    Ok(id)
}

/// Most recent entries for a user, newest first.
pub fn entries<S: Store + ?Sized>(
    store: &S,
    user_id: &str,
    limit: Option<usize>,
) -> Result<Vec<LedgerEntry>> {
    store.load_entries(user_id, limit)
}

/// Signed sum of entry deltas: the balance the log says the user holds.
pub fn balance_of(entries: &[LedgerEntry]) -> i64 {
    entries.iter().map(|e| e.token_delta).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerAction, LedgerSource};
    use crate::state::UserTokenAccount;
    use crate::storage::MemoryStore;
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_append_returns_entry_id() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store, "alice").unwrap();
        tx.put_account(UserTokenAccount::new("alice", "free"));
        let entry = LedgerEntry::new(
            "alice",
            LedgerAction::Credit,
            LedgerSource::Refund,
            3,
            "r1",
            now(),
        );
        let expected = entry.entry_id.clone();
        assert_eq!(append(&mut tx, entry).unwrap(), expected);
        tx.commit().unwrap();
        assert_eq!(entries(&store, "alice", None).unwrap().len(), 1);
    }

    #[test]
    fn test_append_rejects_zero_delta() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store, "alice").unwrap();
        let entry = LedgerEntry::new(
            "alice",
            LedgerAction::Debit,
            LedgerSource::Generate,
            0,
            "r1",
            now(),
        );
        assert!(matches!(append(&mut tx, entry), Err(Error::InvalidEntry(_))));
    }

    #[test]
    fn test_append_rejects_other_user() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store, "alice").unwrap();
        let entry = LedgerEntry::new(
            "bob",
            LedgerAction::Credit,
            LedgerSource::Purchase,
            5,
            "r1",
            now(),
        );
        assert!(matches!(append(&mut tx, entry), Err(Error::InvalidEntry(_))));
    }

    #[test]
    fn test_balance_of_signed_sum() {
        let e = |delta: i64, action, source, req: &str| {
            LedgerEntry::new("alice", action, source, delta, req, now())
        };
        let log = vec![
            e(20, LedgerAction::Credit, LedgerSource::WelcomeBonus, "w"),
            e(55, LedgerAction::Reset, LedgerSource::MonthlyReset, "m"),
            e(-4, LedgerAction::Debit, LedgerSource::Generate, "g"),
        ];
        assert_eq!(balance_of(&log), 71);
        assert_eq!(balance_of(&[]), 0);
    }
}
