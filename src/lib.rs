pub mod config;
pub mod cost;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod logger;
pub mod purchase;
pub mod reconcile;
pub mod service;
pub mod state;
pub mod storage;
pub mod telemetry;

use sha2::{Digest, Sha256};

/// Calculate SHA256 digest
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}
