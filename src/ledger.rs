// Ledger abstraction shared by every module
// An ordered record store keyed by (kind, nonce) plus a per-identity balance
// sub-ledger. Each module instance owns exactly one ledger; nothing is shared
// across modules.

use crate::call::{ContractError, Identity};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// RECORD KEYS
// ============================================================================

/// Record families the engine persists. Each module writes exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    Listing,
    Product,
    RecyclingEvent,
}

impl RecordKind {
    /// Key prefix, also used as the column value in the durable store.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Listing => "listing",
            RecordKind::Product => "product",
            RecordKind::RecyclingEvent => "event",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified record key, rendered as "listing-1", "product-3", "event-2".
///
/// Nonces start at 1 and never repeat within a kind, so the derived ordering
/// doubles as creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub nonce: u64,
}

impl RecordKey {
    pub fn new(kind: RecordKind, nonce: u64) -> Self {
        RecordKey { kind, nonce }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.as_str(), self.nonce)
    }
}

// ============================================================================
// LEDGER ERRORS
// ============================================================================

/// Failures the storage layer itself can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Debit larger than the current balance
    InsufficientFunds,
    /// Credit would push a balance past the u64 range
    BalanceOverflow,
    /// Durable backend failure (I/O, encoding, constraint)
    Storage(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InsufficientFunds => write!(f, "insufficient balance"),
            LedgerError::BalanceOverflow => write!(f, "balance overflow"),
            LedgerError::Storage(msg) => write!(f, "storage failure: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<LedgerError> for ContractError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientFunds => ContractError::InsufficientFunds,
            LedgerError::BalanceOverflow => {
                ContractError::InvalidAmount("balance overflow".to_string())
            }
            LedgerError::Storage(msg) => ContractError::Storage(msg),
        }
    }
}

// ============================================================================
// LEDGER TRAIT
// ============================================================================

/// Ordered durable store plus balance sub-ledger.
///
/// Implementations must keep `records` and `balances` in key order so the
/// state digest is identical across backends. The unit hooks default to
/// no-ops; transactional backends override them.
pub trait Ledger {
    type Record: Clone + Serialize;

    /// Fetch a record. Absent keys are `Ok(None)`, never an error.
    fn get(&self, key: &RecordKey) -> Result<Option<Self::Record>, LedgerError>;

    /// Insert or overwrite a record at a key.
    fn put(&mut self, key: RecordKey, record: Self::Record) -> Result<(), LedgerError>;

    /// All records in ascending key order.
    fn records(&self) -> Result<Vec<(RecordKey, Self::Record)>, LedgerError>;

    /// Current balance; identities never seen before hold zero.
    fn balance_of(&self, id: &Identity) -> Result<u64, LedgerError>;

    /// Add to a balance. Fails on u64 overflow without writing.
    fn credit(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError>;

    /// Subtract from a balance. Fails on insufficient funds without writing.
    fn debit(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError>;

    /// All balance rows in ascending identity order.
    fn balances(&self) -> Result<Vec<(Identity, u64)>, LedgerError>;

    /// Open an atomic write unit. No-op for in-memory backends.
    fn begin_unit(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Commit the open write unit.
    fn commit_unit(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Discard the open write unit.
    fn rollback_unit(&mut self) -> Result<(), LedgerError> {
        Ok(())
    }

    /// Highest nonce ever assigned for a kind, 0 when no records exist.
    /// Used to resume id assignment after reopening a durable store.
    fn max_nonce(&self, kind: RecordKind) -> Result<u64, LedgerError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(key, _)| key.nonce)
            .max()
            .unwrap_or(0))
    }

    /// Move funds between two identities. Debits first, so an insufficient
    /// balance never touches the credit side. Callers that need atomicity
    /// against storage failures wrap this in a write unit.
    fn transfer(&mut self, from: &Identity, to: &Identity, amount: u64) -> Result<(), LedgerError> {
        self.debit(from, amount)?;
        self.credit(to, amount)?;
        Ok(())
    }

    /// Sum over every balance row. Internal transfers leave this unchanged.
    fn total_balance(&self) -> Result<u64, LedgerError> {
        let mut total: u64 = 0;
        for (_, amount) in self.balances()? {
            total = total
                .checked_add(amount)
                .ok_or(LedgerError::BalanceOverflow)?;
        }
        Ok(total)
    }

    /// SHA-256 over the ordered records followed by the ordered balances.
    ///
    /// Two ledgers holding the same state produce the same hex digest no
    /// matter which backend they run on.
    fn state_digest(&self) -> Result<String, LedgerError> {
        let mut hasher = Sha256::new();

        for (key, record) in self.records()? {
            let body =
                serde_json::to_string(&record).map_err(|e| LedgerError::Storage(e.to_string()))?;
            hasher.update(key.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(body.as_bytes());
            hasher.update([0u8]);
        }

        hasher.update(b"balances");
        hasher.update([0u8]);

        for (id, amount) in self.balances()? {
            hasher.update(id.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(amount.to_be_bytes());
        }

        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Run a group of writes as one unit: commit on success, roll back on error.
///
/// Handlers check every precondition before calling this, so a rollback only
/// ever compensates for a storage failure mid-unit.
pub fn with_unit<L, T>(
    ledger: &mut L,
    work: impl FnOnce(&mut L) -> Result<T, ContractError>,
) -> Result<T, ContractError>
where
    L: Ledger,
{
    ledger.begin_unit()?;
    match work(ledger) {
        Ok(value) => {
            ledger.commit_unit()?;
            Ok(value)
        }
        Err(e) => {
            // keep the handler error even when the rollback itself fails
            let _ = ledger.rollback_unit();
            Err(e)
        }
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

/// BTreeMap-backed ledger for tests and ephemeral hosts.
///
/// Mutating operations validate before writing, so a returned error leaves
/// the maps untouched and the unit hooks can stay no-ops.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger<R> {
    records: BTreeMap<RecordKey, R>,
    balances: BTreeMap<Identity, u64>,
}

impl<R> MemoryLedger<R> {
    pub fn new() -> Self {
        MemoryLedger {
            records: BTreeMap::new(),
            balances: BTreeMap::new(),
        }
    }
}

impl<R: Clone + Serialize> Ledger for MemoryLedger<R> {
    type Record = R;

    fn get(&self, key: &RecordKey) -> Result<Option<R>, LedgerError> {
        Ok(self.records.get(key).cloned())
    }

    fn put(&mut self, key: RecordKey, record: R) -> Result<(), LedgerError> {
        self.records.insert(key, record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<(RecordKey, R)>, LedgerError> {
        Ok(self
            .records
            .iter()
            .map(|(key, record)| (*key, record.clone()))
            .collect())
    }

    fn balance_of(&self, id: &Identity) -> Result<u64, LedgerError> {
        Ok(self.balances.get(id).copied().unwrap_or(0))
    }

    fn credit(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError> {
        let current = self.balance_of(id)?;
        let next = current
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow)?;
        self.balances.insert(id.clone(), next);
        Ok(())
    }

    fn debit(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError> {
        let current = self.balance_of(id)?;
        if amount > current {
            return Err(LedgerError::InsufficientFunds);
        }
        self.balances.insert(id.clone(), current - amount);
        Ok(())
    }

    fn balances(&self) -> Result<Vec<(Identity, u64)>, LedgerError> {
        Ok(self
            .balances
            .iter()
            .map(|(id, amount)| (id.clone(), *amount))
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
