use crate::error::{Error, Result};
use crate::ledger::{EntryId, LedgerEntry};
use crate::reconcile::ReconciliationResult;
use crate::storage::{check_batch, Store, UserDocument, WriteBatch};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct UserRecord {
    document: UserDocument,
    entries: Vec<LedgerEntry>,
    index: HashMap<EntryId, usize>,
}

/// In-process store. Each commit holds the lock for the whole batch, so
/// batches are atomic; conflicts are detected on the per-user version.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<BTreeMap<String, UserRecord>>,
    reconciliations: Mutex<Vec<ReconciliationResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of entries in a user's log.
    pub fn entry_count(&self, user_id: &str) -> usize {
        self.users
            .lock()
            .get(user_id)
            .map(|u| u.entries.len())
            .unwrap_or(0)
    }

    /// Overwrite an account without a ledger entry or version bump.
    ///
    /// Only for tests that need to simulate out-of-band corruption.
    #[doc(hidden)]
    pub fn tamper_account(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut crate::state::UserTokenAccount),
    ) {
        if let Some(account) = self
            .users
            .lock()
            .get_mut(user_id)
            .and_then(|u| u.document.account.as_mut())
        {
            f(account);
        }
    }
}

impl Store for MemoryStore {
    fn load_document(&self, user_id: &str) -> Result<UserDocument> {
        Ok(self
            .users
            .lock()
            .get(user_id)
            .map(|u| u.document.clone())
            .unwrap_or_default())
    }

    fn find_entry(&self, user_id: &str, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        let users = self.users.lock();
        Ok(users.get(user_id).and_then(|u| {
            u.index
                .get(entry_id)
                .and_then(|&i| u.entries.get(i))
                .cloned()
        }))
    }

    fn load_entries(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        let users = self.users.lock();
        let Some(user) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        let take = limit.unwrap_or(user.entries.len());
        Ok(user.entries.iter().rev().take(take).cloned().collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut users = self.users.lock();
        let record = users.entry(batch.user_id.clone()).or_default();
        check_batch(&record.document, &batch)?;
        if let Some(dup) = batch
            .entries
            .iter()
            .find(|e| record.index.contains_key(&e.entry_id))
        {
            return Err(Error::InvalidEntry(format!(
                "entry {} already recorded",
                dup.entry_id
            )));
        }

        for entry in batch.entries {
            record.index.insert(entry.entry_id.clone(), record.entries.len());
            record.entries.push(entry);
        }
        if let Some(receipt) = batch.receipt {
            record
                .document
                .receipts
                .insert(receipt.product_id.clone(), receipt);
        }
        record.document.account = Some(batch.account);
        record.document.version += 1;
        Ok(())
    }

    fn list_users(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let users = self.users.lock();
        Ok(users
            .iter()
            .filter(|(_, u)| u.document.account.is_some())
            .map(|(id, _)| id)
            .filter(|id| after.map_or(true, |a| id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    fn save_reconciliation(&self, result: &ReconciliationResult) -> Result<()> {
        self.reconciliations.lock().push(result.clone());
        Ok(())
    }

    fn load_reconciliations(&self, user_id: Option<&str>) -> Result<Vec<ReconciliationResult>> {
        Ok(self
            .reconciliations
            .lock()
            .iter()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .cloned()
            .collect())
    }

    fn prune_reconciliations(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut results = self.reconciliations.lock();
        let len = results.len();
        results.retain(|r| r.run_at >= before);
        Ok(len - results.len())
    }
}
