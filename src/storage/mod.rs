pub mod kv;
pub mod memory;

pub use kv::FileStore;
pub use memory::MemoryStore;

use crate::error::{Error, Result};
use crate::ledger::{EntryId, LedgerEntry};
use crate::reconcile::ReconciliationResult;
use crate::state::{PurchaseReceipt, UserTokenAccount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Everything one user owns, versioned as a unit.
///
/// The version is bumped by every commit, so a commit that read version `n`
/// only succeeds while nobody else committed for that user in between.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDocument {
    pub version: u64,
    pub account: Option<UserTokenAccount>,
    /// Receipts keyed by product id
    pub receipts: BTreeMap<String, PurchaseReceipt>,
}

/// Writes produced by one transaction, applied atomically by `Store::commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub user_id: String,
    /// Document version observed when the transaction began
    pub expected_version: u64,
    pub account: UserTokenAccount,
    pub entries: Vec<LedgerEntry>,
    pub receipt: Option<PurchaseReceipt>,
}

/// Transactional document store.
///
/// Implementations must preserve:
/// - Append-only semantics for ledger entries (no update or delete)
/// - All-or-nothing commits: account, entries and receipt become visible together
/// - Optimistic concurrency: `commit` fails with `Error::Conflict` when the
///   user's document version moved since `expected_version`
pub trait Store: Send + Sync {
    /// Load a user's document; a missing user yields the default (version 0).
    fn load_document(&self, user_id: &str) -> Result<UserDocument>;

    /// Look up a committed entry by id.
    fn find_entry(&self, user_id: &str, entry_id: &EntryId) -> Result<Option<LedgerEntry>>;

    /// Committed entries, newest first. `None` returns the whole log.
    fn load_entries(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<LedgerEntry>>;

    /// Atomically apply a write batch.
    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// User ids in ascending order, strictly after `after`.
    fn list_users(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>>;

    fn save_reconciliation(&self, result: &ReconciliationResult) -> Result<()>;

    /// Persisted reconciliation results, optionally for one user.
    fn load_reconciliations(&self, user_id: Option<&str>) -> Result<Vec<ReconciliationResult>>;

    /// Drop reconciliation results recorded before `before`. Returns how many were removed.
    fn prune_reconciliations(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Longest user id, in bytes, a store must accept. Keeps hex-encoded file
/// names under common 255-byte filesystem limits.
pub const MAX_USER_ID_BYTES: usize = 120;

/// Reject user ids that are empty or longer than `MAX_USER_ID_BYTES`.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_BYTES {
        return Err(Error::InvalidArgument(format!(
            "user id must be 1-{} bytes",
            MAX_USER_ID_BYTES
        )));
    }
    Ok(())
}

/// Checks shared by every `commit` implementation before anything is written.
pub(crate) fn check_batch(current: &UserDocument, batch: &WriteBatch) -> Result<()> {
    if current.version != batch.expected_version {
        return Err(Error::Conflict);
    }
    if batch.account.user_id != batch.user_id {
        return Err(Error::InvalidArgument(format!(
            "account {} written through transaction for {}",
            batch.account.user_id, batch.user_id
        )));
    }
    for entry in &batch.entries {
        entry.validate()?;
        if entry.user_id != batch.user_id {
            return Err(Error::InvalidEntry(format!(
                "entry for {} written through transaction for {}",
                entry.user_id, batch.user_id
            )));
        }
    }
    Ok(())
}

/// One optimistic read-modify-write over a single user's document.
///
/// Reads go straight to the store; writes are buffered until `commit`.
pub struct Transaction<'a, S: Store + ?Sized> {
    store: &'a S,
    user_id: String,
    document: UserDocument,
    account: Option<UserTokenAccount>,
    entries: Vec<LedgerEntry>,
    receipt: Option<PurchaseReceipt>,
}

impl<'a, S: Store + ?Sized> Transaction<'a, S> {
    pub fn begin(store: &'a S, user_id: &str) -> Result<Self> {
        let document = store.load_document(user_id)?;
        Ok(Transaction {
            store,
            user_id: user_id.to_string(),
            account: document.account.clone(),
            document,
            entries: Vec::new(),
            receipt: None,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Account as modified so far in this transaction.
    pub fn account(&self) -> Option<&UserTokenAccount> {
        self.account.as_ref()
    }

    pub fn put_account(&mut self, account: UserTokenAccount) {
        self.account = Some(account);
    }

    /// Receipt visible to this transaction (buffered write wins).
    pub fn receipt(&self, product_id: &str) -> Option<&PurchaseReceipt> {
        match &self.receipt {
            Some(r) if r.product_id == product_id => Some(r),
            _ => self.document.receipts.get(product_id),
        }
    }

    pub fn put_receipt(&mut self, receipt: PurchaseReceipt) {
        self.receipt = Some(receipt);
    }

    /// Entry visible to this transaction, buffered or committed.
    pub fn find_entry(&self, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        if let Some(e) = self.entries.iter().find(|e| &e.entry_id == entry_id) {
            return Ok(Some(e.clone()));
        }
        self.store.find_entry(&self.user_id, entry_id)
    }

    /// Buffer an already validated entry. Use `ledger::append`.
    pub(crate) fn push_entry(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    fn has_writes(&self) -> bool {
        self.account != self.document.account
            || !self.entries.is_empty()
            || self.receipt.is_some()
    }

    /// Commit buffered writes. A transaction without writes commits trivially.
    pub fn commit(self) -> Result<()> {
        if !self.has_writes() {
            return Ok(());
        }
        let account = self.account.clone().ok_or_else(|| {
            Error::Internal(format!(
                "transaction for {} wrote entries without an account",
                self.user_id
            ))
        })?;
        self.store.commit(WriteBatch {
            user_id: self.user_id,
            expected_version: self.document.version,
            account,
            entries: self.entries,
            receipt: self.receipt,
        })
    }
}

/// Run `body` inside a transaction for `user_id`, retrying on write conflicts.
///
/// The body is re-run from a fresh read on each attempt, so it must derive all
/// writes from what it reads. An error from the body aborts without writing.
/// Conflicts past `max_attempts` surface as `Error::Internal`.
pub fn transact<S, T, F>(store: &S, user_id: &str, max_attempts: u32, mut body: F) -> Result<T>
where
    S: Store + ?Sized,
    F: FnMut(&mut Transaction<'_, S>) -> Result<T>,
{
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        let mut tx = Transaction::begin(store, user_id)?;
        let value = body(&mut tx)?;
        match tx.commit() {
            Ok(()) => return Ok(value),
            Err(Error::Conflict) => {
                debug!(user_id, attempt, "write conflict, retrying transaction");
            }
            Err(e) => return Err(e),
        }
    }
    warn!(user_id, attempts, "transaction abandoned after repeated conflicts");
    Err(Error::Internal(format!(
        "transaction for {} conflicted {} times",
        user_id, attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{self, LedgerAction, LedgerSource};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn credit_entry(user: &str, request: &str, amount: i64) -> LedgerEntry {
        LedgerEntry::new(
            user,
            LedgerAction::Credit,
            LedgerSource::Purchase,
            amount,
            request,
            now(),
        )
    }

    #[test]
    fn test_transaction_without_writes_commits_trivially() {
        let store = MemoryStore::new();
        let tx = Transaction::begin(&store, "alice").unwrap();
        assert!(tx.account().is_none());
        tx.commit().unwrap();
        assert_eq!(store.load_document("alice").unwrap().version, 0);
    }

    #[test]
    fn test_commit_bumps_version() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store, "alice").unwrap();
        let mut account = UserTokenAccount::new("alice", "free");
        account.monthly_tokens = 10;
        tx.put_account(account);
        ledger::append(&mut tx, credit_entry("alice", "r1", 10)).unwrap();
        tx.commit().unwrap();

        let doc = store.load_document("alice").unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.account.unwrap().monthly_tokens, 10);
    }

    #[test]
    fn test_stale_transaction_conflicts() {
        let store = MemoryStore::new();
        let mut first = Transaction::begin(&store, "alice").unwrap();
        let mut second = Transaction::begin(&store, "alice").unwrap();

        first.put_account(UserTokenAccount::new("alice", "free"));
        second.put_account(UserTokenAccount::new("alice", "premium"));

        first.commit().unwrap();
        assert_eq!(second.commit(), Err(Error::Conflict));
    }

    #[test]
    fn test_transact_retries_then_succeeds() {
        let store = MemoryStore::new();
        let calls = AtomicU32::new(0);
        let result = transact(&store, "alice", 3, |tx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // a competing writer commits between our read and our commit
                let mut rival = Transaction::begin(&store, "alice")?;
                rival.put_account(UserTokenAccount::new("alice", "rival"));
                rival.commit()?;
            }
            let mut account = tx
                .account()
                .cloned()
                .unwrap_or_else(|| UserTokenAccount::new("alice", "free"));
            account.monthly_tokens += 1;
            tx.put_account(account);
            Ok(n)
        })
        .unwrap();

        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let doc = store.load_document("alice").unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.account.unwrap().tier, "rival");
    }

    #[test]
    fn test_transact_gives_up_as_internal() {
        let store = MemoryStore::new();
        let result: Result<()> = transact(&store, "alice", 2, |tx| {
            let mut rival = Transaction::begin(&store, "alice")?;
            let version = rival.account().map(|a| a.monthly_tokens).unwrap_or(0);
            let mut account = UserTokenAccount::new("alice", "free");
            account.monthly_tokens = version + 1;
            rival.put_account(account.clone());
            rival.commit()?;
            tx.put_account(UserTokenAccount::new("alice", "mine"));
            Ok(())
        });
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn test_body_error_aborts_without_writes() {
        let store = MemoryStore::new();
        let result: Result<()> = transact(&store, "alice", 3, |tx| {
            tx.put_account(UserTokenAccount::new("alice", "free"));
            Err(Error::InsufficientFunds {
                available: 0,
                required: 1,
            })
        });
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        assert_eq!(store.load_document("alice").unwrap(), UserDocument::default());
    }

    #[test]
    fn test_commit_rejects_foreign_entry() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store, "alice").unwrap();
        tx.put_account(UserTokenAccount::new("alice", "free"));
        tx.push_entry(credit_entry("bob", "r1", 5));
        assert!(matches!(tx.commit(), Err(Error::InvalidEntry(_))));
    }
}
