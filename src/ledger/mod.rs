pub mod entry;
pub mod log;

pub use entry::{EntryId, LedgerAction, LedgerEntry, LedgerSource};
pub use log::{append, balance_of, entries};
