use crate::config::Config;
use crate::error::{Error, Result};
use crate::ledger::{EntryId, LedgerEntry};
use crate::reconcile::ReconciliationResult;
use crate::storage::{check_batch, validate_user_id, Store, UserDocument, WriteBatch};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Document as persisted: the user document plus the committed length of the
/// user's ledger log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredDocument {
    document: UserDocument,
    /// Bytes of the ledger log covered by committed transactions
    ledger_bytes: u64,
}

/// File-based store using per-user snapshots and append-only ledger logs.
///
/// Files:
/// - `accounts/<hex user id>.bin`: bincode `StoredDocument`, replaced atomically
/// - `ledger/<hex user id>.log`: length-prefixed bincode `LedgerEntry` records
/// - `reconciliation.log`: length-prefixed bincode `ReconciliationResult` records
///
/// The snapshot rename is the commit point. Entries are appended and fsynced
/// first; bytes past `ledger_bytes` belong to an interrupted commit and are
/// ignored on read and truncated by the next commit.
///
/// Commits are serialized inside one process. Several processes sharing a
/// data directory are not coordinated.
pub struct FileStore {
    accounts_dir: PathBuf,
    ledger_dir: PathBuf,
    reconciliation_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a new FileStore with paths from config
    pub fn new(config: &Config) -> Self {
        FileStore::with_paths(
            config.get_accounts_dir(),
            config.get_ledger_dir(),
            config.get_reconciliation_log_path(),
        )
    }

    /// Create FileStore rooted at a directory (for testing)
    pub fn open(dir: &Path) -> Self {
        FileStore::new(&Config::with_data_dir(dir.to_path_buf()))
    }

    pub fn with_paths(
        accounts_dir: PathBuf,
        ledger_dir: PathBuf,
        reconciliation_path: PathBuf,
    ) -> Self {
        FileStore {
            accounts_dir,
            ledger_dir,
            reconciliation_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Ensure the data directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.accounts_dir, &self.ledger_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        }
        Ok(())
    }

    fn document_path(&self, user_id: &str) -> PathBuf {
        self.accounts_dir
            .join(format!("{}.bin", hex::encode(user_id.as_bytes())))
    }

    fn ledger_path(&self, user_id: &str) -> PathBuf {
        self.ledger_dir
            .join(format!("{}.log", hex::encode(user_id.as_bytes())))
    }

    fn load_stored(&self, user_id: &str) -> Result<StoredDocument> {
        validate_user_id(user_id)?;
        let path = self.document_path(user_id);
        if !path.exists() {
            return Ok(StoredDocument::default());
        }
        let mut data = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| Error::Storage(format!("Failed to read account document: {}", e)))?;
        bincode::deserialize(&data)
            .map_err(|e| Error::Storage(format!("Failed to deserialize account document: {}", e)))
    }

    /// Committed entries in append order.
    fn read_ledger(&self, user_id: &str, committed_bytes: u64) -> Result<Vec<LedgerEntry>> {
        read_records(&self.ledger_path(user_id), Some(committed_bytes))
    }
}

/// Serialize one record with its u64 little-endian length prefix.
fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(record)
        .map_err(|e| Error::Storage(format!("Failed to serialize record: {}", e)))?;
    let mut out = Vec::with_capacity(bytes.len() + 8);
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// Read length-prefixed records, stopping at `limit_bytes` when given.
fn read_records<T: DeserializeOwned>(path: &Path, limit_bytes: Option<u64>) -> Result<Vec<T>> {
    let (records, valid_bytes) = scan_records(path, limit_bytes)?;
    if let Some(limit) = limit_bytes {
        if valid_bytes < limit {
            return Err(Error::Storage(format!(
                "log {} ends at byte {} before its committed length {}",
                path.display(),
                valid_bytes,
                limit
            )));
        }
    }
    Ok(records)
}

/// Parse records and return them with the number of bytes they cover.
///
/// A torn record at the end (short length prefix, or a length running past
/// the end of the data) stops the scan; the bytes after the returned length
/// belong to an interrupted write.
fn scan_records<T: DeserializeOwned>(
    path: &Path,
    limit_bytes: Option<u64>,
) -> Result<(Vec<T>, u64)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut data = fs::read(path)
        .map_err(|e| Error::Storage(format!("Failed to read log {}: {}", path.display(), e)))?;
    if let Some(limit) = limit_bytes {
        data.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }

    let mut records = Vec::new();
    let mut offset = 0usize;
    while data.len() - offset >= 8 {
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(&data[offset..offset + 8]);
        let len = u64::from_le_bytes(len_buf);
        let remaining = (data.len() - offset - 8) as u64;
        if len > remaining {
            break;
        }
        let start = offset + 8;
        let end = start + len as usize;
        let record = bincode::deserialize(&data[start..end])
            .map_err(|e| Error::Storage(format!("Failed to deserialize record: {}", e)))?;
        records.push(record);
        offset = end;
    }

    Ok((records, offset as u64))
}

/// Write `bytes` to `path` via temp file, fsync and rename.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path)
        .map_err(|e| Error::Storage(format!("Failed to create temp file: {}", e)))?;
    file.write_all(bytes)
        .map_err(|e| Error::Storage(format!("Failed to write temp file: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::Storage(format!("Failed to fsync temp file: {}", e)))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .map_err(|e| Error::Storage(format!("Failed to rename temp file: {}", e)))?;

    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|d| d.sync_all())
            .map_err(|e| Error::Storage(format!("Failed to fsync parent directory: {}", e)))?;
    }
    Ok(())
}

impl Store for FileStore {
    fn load_document(&self, user_id: &str) -> Result<UserDocument> {
        Ok(self.load_stored(user_id)?.document)
    }

    fn find_entry(&self, user_id: &str, entry_id: &EntryId) -> Result<Option<LedgerEntry>> {
        let stored = self.load_stored(user_id)?;
        Ok(self
            .read_ledger(user_id, stored.ledger_bytes)?
            .into_iter()
            .find(|e| &e.entry_id == entry_id))
    }

    fn load_entries(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<LedgerEntry>> {
        let stored = self.load_stored(user_id)?;
        let entries = self.read_ledger(user_id, stored.ledger_bytes)?;
        let take = limit.unwrap_or(entries.len());
        Ok(entries.into_iter().rev().take(take).collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.ensure_dirs()?;

        let mut stored = self.load_stored(&batch.user_id)?;
        check_batch(&stored.document, &batch)?;

        let existing = self.read_ledger(&batch.user_id, stored.ledger_bytes)?;
        if let Some(dup) = batch
            .entries
            .iter()
            .find(|e| existing.iter().any(|x| x.entry_id == e.entry_id))
        {
            return Err(Error::InvalidEntry(format!(
                "entry {} already recorded",
                dup.entry_id
            )));
        }

        if !batch.entries.is_empty() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(self.ledger_path(&batch.user_id))
                .map_err(|e| Error::Storage(format!("Failed to open ledger log: {}", e)))?;
            // drop bytes left behind by an interrupted commit
            file.set_len(stored.ledger_bytes)
                .map_err(|e| Error::Storage(format!("Failed to truncate ledger log: {}", e)))?;
            let mut bytes = Vec::new();
            for entry in &batch.entries {
                bytes.extend(encode_record(entry)?);
            }
            file.seek(SeekFrom::Start(stored.ledger_bytes))
                .and_then(|_| file.write_all(&bytes))
                .and_then(|_| file.sync_all())
                .map_err(|e| Error::Storage(format!("Failed to append ledger entries: {}", e)))?;
            stored.ledger_bytes += bytes.len() as u64;
        }

        if let Some(receipt) = batch.receipt {
            stored
                .document
                .receipts
                .insert(receipt.product_id.clone(), receipt);
        }
        stored.document.account = Some(batch.account);
        stored.document.version += 1;

        let snapshot = bincode::serialize(&stored)
            .map_err(|e| Error::Storage(format!("Failed to serialize account document: {}", e)))?;
        write_atomically(&self.document_path(&batch.user_id), &snapshot)
    }

    fn list_users(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        if !self.accounts_dir.exists() {
            return Ok(Vec::new());
        }
        let dir = fs::read_dir(&self.accounts_dir)
            .map_err(|e| Error::Storage(format!("Failed to list accounts: {}", e)))?;
        let mut users = Vec::new();
        for item in dir {
            let path = item
                .map_err(|e| Error::Storage(format!("Failed to list accounts: {}", e)))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(user) = hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) else {
                continue;
            };
            if after.map_or(true, |a| user.as_str() > a) {
                users.push(user);
            }
        }
        users.sort();
        users.truncate(limit);
        Ok(users)
    }

    fn save_reconciliation(&self, result: &ReconciliationResult) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.reconciliation_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        }
        let (_, valid_bytes) =
            scan_records::<ReconciliationResult>(&self.reconciliation_path, None)?;
        let bytes = encode_record(result)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.reconciliation_path)
            .map_err(|e| Error::Storage(format!("Failed to open reconciliation log: {}", e)))?;
        // drop a record torn by an interrupted append
        file.set_len(valid_bytes)
            .and_then(|_| file.seek(SeekFrom::Start(valid_bytes)))
            .and_then(|_| file.write_all(&bytes))
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::Storage(format!("Failed to append reconciliation result: {}", e)))
    }

    fn load_reconciliations(&self, user_id: Option<&str>) -> Result<Vec<ReconciliationResult>> {
        let all: Vec<ReconciliationResult> = read_records(&self.reconciliation_path, None)?;
        Ok(all
            .into_iter()
            .filter(|r| user_id.map_or(true, |u| r.user_id == u))
            .collect())
    }

    fn prune_reconciliations(&self, before: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let all: Vec<ReconciliationResult> = read_records(&self.reconciliation_path, None)?;
        let len = all.len();
        let kept: Vec<_> = all.into_iter().filter(|r| r.run_at >= before).collect();
        let removed = len - kept.len();
        if removed > 0 {
            let mut bytes = Vec::new();
            for r in &kept {
                bytes.extend(encode_record(r)?);
            }
            write_atomically(&self.reconciliation_path, &bytes)?;
        }
        Ok(removed)
    }
}
