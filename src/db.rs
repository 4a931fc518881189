// SQLite-backed ledger
// Same contract as the in-memory backend, with real write units on top of
// SQLite transactions. One database file per module instance.

use crate::call::Identity;
use crate::ledger::{with_unit, Ledger, LedgerError, RecordKey, RecordKind};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

fn setup_schema(conn: &Connection) -> Result<(), LedgerError> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            kind TEXT NOT NULL,
            nonce INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (kind, nonce)
        )",
        [],
    )?;

    // Balance amounts exceed SQLite's signed integer range at the top of
    // the u64 domain, so they are stored as decimal text.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS balances (
            identity TEXT PRIMARY KEY,
            amount TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind)",
        [],
    )?;

    Ok(())
}

fn kind_from_column(s: &str) -> Result<RecordKind, LedgerError> {
    match s {
        "listing" => Ok(RecordKind::Listing),
        "product" => Ok(RecordKind::Product),
        "event" => Ok(RecordKind::RecyclingEvent),
        other => Err(LedgerError::Storage(format!(
            "unknown record kind in store: {}",
            other
        ))),
    }
}

fn nonce_to_sql(nonce: u64) -> Result<i64, LedgerError> {
    i64::try_from(nonce).map_err(|_| LedgerError::Storage("nonce out of range".to_string()))
}

fn amount_from_column(s: &str) -> Result<u64, LedgerError> {
    s.parse::<u64>()
        .map_err(|_| LedgerError::Storage(format!("malformed balance amount in store: {}", s)))
}

// ============================================================================
// SQLITE LEDGER
// ============================================================================

/// Durable ledger over a single SQLite database.
///
/// Record bodies are stored as JSON text, so the schema never changes when a
/// record type grows a field. Every trait-level failure comes back as a
/// `LedgerError` value; nothing in here panics on a bad row.
pub struct SqliteLedger<R> {
    conn: Connection,
    _record: PhantomData<R>,
}

impl<R> SqliteLedger<R> {
    /// Open (or create) a ledger database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger database {}", path.display()))?;
        setup_schema(&conn).context("Failed to set up ledger schema")?;

        tracing::info!(path = %path.display(), "opened ledger database");

        Ok(SqliteLedger {
            conn,
            _record: PhantomData,
        })
    }

    /// Ephemeral database, used by tests and throwaway hosts.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        setup_schema(&conn).context("Failed to set up ledger schema")?;

        Ok(SqliteLedger {
            conn,
            _record: PhantomData,
        })
    }
}

impl<R: Clone + Serialize + DeserializeOwned> Ledger for SqliteLedger<R> {
    type Record = R;

    fn get(&self, key: &RecordKey) -> Result<Option<R>, LedgerError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE kind = ?1 AND nonce = ?2",
                params![key.kind.as_str(), nonce_to_sql(key.nonce)?],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(json) => {
                let record =
                    serde_json::from_str(&json).map_err(|e| LedgerError::Storage(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put(&mut self, key: RecordKey, record: R) -> Result<(), LedgerError> {
        let body = serde_json::to_string(&record).map_err(|e| LedgerError::Storage(e.to_string()))?;

        self.conn.execute(
            "INSERT INTO records (kind, nonce, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind, nonce) DO UPDATE SET body = excluded.body",
            params![key.kind.as_str(), nonce_to_sql(key.nonce)?, body],
        )?;

        Ok(())
    }

    fn records(&self) -> Result<Vec<(RecordKey, R)>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, nonce, body FROM records ORDER BY kind, nonce")?;

        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(0)?;
                let nonce: i64 = row.get(1)?;
                let body: String = row.get(2)?;
                Ok((kind, nonce, body))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (kind, nonce, body) in rows {
            let key = RecordKey::new(kind_from_column(&kind)?, nonce as u64);
            let record =
                serde_json::from_str(&body).map_err(|e| LedgerError::Storage(e.to_string()))?;
            records.push((key, record));
        }

        // SQLite sorts the kind column as text; the key ordering the digest
        // depends on is the RecordKind one
        records.sort_by_key(|(key, _)| *key);

        Ok(records)
    }

    fn balance_of(&self, id: &Identity) -> Result<u64, LedgerError> {
        let amount: Option<String> = self
            .conn
            .query_row(
                "SELECT amount FROM balances WHERE identity = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match amount {
            Some(text) => amount_from_column(&text),
            None => Ok(0),
        }
    }

    fn credit(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError> {
        let current = self.balance_of(id)?;
        let next = current
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow)?;

        self.conn.execute(
            "INSERT INTO balances (identity, amount) VALUES (?1, ?2)
             ON CONFLICT(identity) DO UPDATE SET amount = excluded.amount",
            params![id.as_str(), next.to_string()],
        )?;

        Ok(())
    }

    fn debit(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError> {
        let current = self.balance_of(id)?;
        if amount > current {
            return Err(LedgerError::InsufficientFunds);
        }

        self.conn.execute(
            "INSERT INTO balances (identity, amount) VALUES (?1, ?2)
             ON CONFLICT(identity) DO UPDATE SET amount = excluded.amount",
            params![id.as_str(), (current - amount).to_string()],
        )?;

        Ok(())
    }

    fn balances(&self) -> Result<Vec<(Identity, u64)>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity, amount FROM balances ORDER BY identity")?;

        let rows = stmt
            .query_map([], |row| {
                let identity: String = row.get(0)?;
                let amount: String = row.get(1)?;
                Ok((identity, amount))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut balances = Vec::with_capacity(rows.len());
        for (identity, amount) in rows {
            balances.push((Identity::new(identity), amount_from_column(&amount)?));
        }

        Ok(balances)
    }

    fn begin_unit(&mut self) -> Result<(), LedgerError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit_unit(&mut self) -> Result<(), LedgerError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_unit(&mut self) -> Result<(), LedgerError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn max_nonce(&self, kind: RecordKind) -> Result<u64, LedgerError> {
        let max: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(nonce), 0) FROM records WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;

        Ok(max as u64)
    }
}

// ============================================================================
// GENESIS ALLOCATIONS
// ============================================================================

/// One genesis balance row from an allocations CSV.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Allocation {
    pub identity: String,
    pub amount: u64,
}

/// Read allocation rows from any CSV source with an `identity,amount` header.
pub fn read_allocations<R: std::io::Read>(reader: R) -> Result<Vec<Allocation>> {
    let mut rdr = csv::Reader::from_reader(reader);

    let mut allocations = Vec::new();
    for result in rdr.deserialize() {
        let allocation: Allocation = result.context("Failed to deserialize allocation row")?;
        allocations.push(allocation);
    }

    Ok(allocations)
}

pub fn load_allocations_csv(csv_path: &Path) -> Result<Vec<Allocation>> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open allocations file {}", csv_path.display()))?;
    read_allocations(file)
}

/// Credit every allocation into a ledger as one unit. Runs once at host
/// startup, before the first call is accepted.
///
/// The whole batch is validated against current balances before the first
/// write, repeated identities included; a manifest that overflows any
/// balance leaves the ledger untouched.
pub fn apply_allocations<L: Ledger>(ledger: &mut L, allocations: &[Allocation]) -> Result<()> {
    let mut totals: BTreeMap<Identity, u64> = BTreeMap::new();
    for allocation in allocations {
        let identity = Identity::new(allocation.identity.clone());
        let current = match totals.get(&identity) {
            Some(total) => *total,
            None => ledger.balance_of(&identity)?,
        };
        let next = current
            .checked_add(allocation.amount)
            .with_context(|| format!("Allocation for {} overflows the balance range", identity))?;
        totals.insert(identity, next);
    }

    with_unit(ledger, |l| {
        for allocation in allocations {
            let identity = Identity::new(allocation.identity.clone());
            l.credit(&identity, allocation.amount)?;
        }
        Ok(())
    })
    .context("Failed to apply genesis allocations")?;

    tracing::info!(count = allocations.len(), "applied genesis allocations");

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
        }
    }

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("ledger-test-{}.db", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let mut ledger: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        let key = RecordKey::new(RecordKind::Listing, 1);

        assert_eq!(ledger.get(&key).unwrap(), None);

        ledger.put(key, note("first")).unwrap();
        assert_eq!(ledger.get(&key).unwrap(), Some(note("first")));

        ledger.put(key, note("second")).unwrap();
        assert_eq!(ledger.get(&key).unwrap(), Some(note("second")));
    }

    #[test]
    fn test_records_come_back_in_key_order() {
        let mut ledger: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        ledger
            .put(RecordKey::new(RecordKind::Listing, 3), note("c"))
            .unwrap();
        ledger
            .put(RecordKey::new(RecordKind::Listing, 1), note("a"))
            .unwrap();
        ledger
            .put(RecordKey::new(RecordKind::Listing, 2), note("b"))
            .unwrap();

        let texts: Vec<String> = ledger
            .records()
            .unwrap()
            .into_iter()
            .map(|(_, r)| r.text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_balances_survive_the_full_u64_range() {
        let mut ledger: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        let user = Identity::new("user1");

        ledger.credit(&user, u64::MAX).unwrap();
        assert_eq!(ledger.balance_of(&user).unwrap(), u64::MAX);

        let err = ledger.credit(&user, 1).unwrap_err();
        assert_eq!(err, LedgerError::BalanceOverflow);
        assert_eq!(ledger.balance_of(&user).unwrap(), u64::MAX);
    }

    #[test]
    fn test_debit_below_zero_fails_cleanly() {
        let mut ledger: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        let user = Identity::new("user1");
        ledger.credit(&user, 100).unwrap();

        let err = ledger.debit(&user, 101).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientFunds);
        assert_eq!(ledger.balance_of(&user).unwrap(), 100);
    }

    #[test]
    fn test_max_nonce_uses_the_store() {
        let mut ledger: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        assert_eq!(ledger.max_nonce(RecordKind::Product).unwrap(), 0);

        ledger
            .put(RecordKey::new(RecordKind::Product, 4), note("x"))
            .unwrap();
        ledger
            .put(RecordKey::new(RecordKind::Product, 2), note("y"))
            .unwrap();

        assert_eq!(ledger.max_nonce(RecordKind::Product).unwrap(), 4);
        assert_eq!(ledger.max_nonce(RecordKind::Listing).unwrap(), 0);
    }

    #[test]
    fn test_write_unit_commit_and_rollback() {
        let mut ledger: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        let key = RecordKey::new(RecordKind::Listing, 1);

        ledger.begin_unit().unwrap();
        ledger.put(key, note("kept")).unwrap();
        ledger.commit_unit().unwrap();
        assert_eq!(ledger.get(&key).unwrap(), Some(note("kept")));

        let key2 = RecordKey::new(RecordKind::Listing, 2);
        ledger.begin_unit().unwrap();
        ledger.put(key2, note("discarded")).unwrap();
        ledger.credit(&Identity::new("user1"), 500).unwrap();
        ledger.rollback_unit().unwrap();

        assert_eq!(ledger.get(&key2).unwrap(), None);
        assert_eq!(ledger.balance_of(&Identity::new("user1")).unwrap(), 0);
    }

    #[test]
    fn test_digest_matches_the_memory_backend() {
        let mut durable: SqliteLedger<Note> = SqliteLedger::in_memory().unwrap();
        let mut memory: MemoryLedger<Note> = MemoryLedger::new();

        durable
            .put(RecordKey::new(RecordKind::Listing, 1), note("x"))
            .unwrap();
        memory
            .put(RecordKey::new(RecordKind::Listing, 1), note("x"))
            .unwrap();

        durable.credit(&Identity::new("alice"), 300).unwrap();
        memory.credit(&Identity::new("alice"), 300).unwrap();
        durable.credit(&Identity::new("bob"), 50).unwrap();
        memory.credit(&Identity::new("bob"), 50).unwrap();

        assert_eq!(
            durable.state_digest().unwrap(),
            memory.state_digest().unwrap()
        );

        println!("✅ Cross-backend digest parity PASSED");
    }

    #[test]
    fn test_state_survives_reopen() {
        let path = temp_db_path();

        {
            let mut ledger: SqliteLedger<Note> = SqliteLedger::open(&path).unwrap();
            ledger
                .put(RecordKey::new(RecordKind::Listing, 1), note("a"))
                .unwrap();
            ledger
                .put(RecordKey::new(RecordKind::Listing, 2), note("b"))
                .unwrap();
            ledger.credit(&Identity::new("user1"), 750).unwrap();
        }

        {
            let ledger: SqliteLedger<Note> = SqliteLedger::open(&path).unwrap();
            assert_eq!(ledger.max_nonce(RecordKind::Listing).unwrap(), 2);
            assert_eq!(
                ledger.get(&RecordKey::new(RecordKind::Listing, 2)).unwrap(),
                Some(note("b"))
            );
            assert_eq!(ledger.balance_of(&Identity::new("user1")).unwrap(), 750);
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_allocations_from_csv() {
        let csv = "identity,amount\nalice,1000\nbob,250\n";
        let allocations = read_allocations(csv.as_bytes()).unwrap();

        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].identity, "alice");
        assert_eq!(allocations[0].amount, 1000);
        assert_eq!(allocations[1].identity, "bob");
        assert_eq!(allocations[1].amount, 250);
    }

    #[test]
    fn test_read_allocations_rejects_negative_amounts() {
        let csv = "identity,amount\nalice,-5\n";
        assert!(read_allocations(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_apply_allocations_credits_every_row() {
        let mut ledger: MemoryLedger<Note> = MemoryLedger::new();
        let allocations = vec![
            Allocation {
                identity: "alice".to_string(),
                amount: 1000,
            },
            Allocation {
                identity: "bob".to_string(),
                amount: 250,
            },
        ];

        apply_allocations(&mut ledger, &allocations).unwrap();

        assert_eq!(ledger.balance_of(&Identity::new("alice")).unwrap(), 1000);
        assert_eq!(ledger.balance_of(&Identity::new("bob")).unwrap(), 250);
        assert_eq!(ledger.total_balance().unwrap(), 1250);
    }

    #[test]
    fn test_apply_allocations_accumulates_repeated_identities() {
        let mut ledger: MemoryLedger<Note> = MemoryLedger::new();
        let allocations = vec![
            Allocation {
                identity: "alice".to_string(),
                amount: 600,
            },
            Allocation {
                identity: "alice".to_string(),
                amount: 400,
            },
        ];

        apply_allocations(&mut ledger, &allocations).unwrap();

        assert_eq!(ledger.balance_of(&Identity::new("alice")).unwrap(), 1000);
    }

    #[test]
    fn test_apply_allocations_rejects_overflowing_batch_without_writing() {
        let mut ledger: MemoryLedger<Note> = MemoryLedger::new();
        let allocations = vec![
            Allocation {
                identity: "alice".to_string(),
                amount: u64::MAX,
            },
            Allocation {
                identity: "alice".to_string(),
                amount: 1,
            },
            Allocation {
                identity: "bob".to_string(),
                amount: 250,
            },
        ];

        assert!(apply_allocations(&mut ledger, &allocations).is_err());

        // the rejected batch left no partial credits behind
        assert_eq!(ledger.balance_of(&Identity::new("alice")).unwrap(), 0);
        assert_eq!(ledger.balance_of(&Identity::new("bob")).unwrap(), 0);
        assert_eq!(ledger.total_balance().unwrap(), 0);
    }

    #[test]
    fn test_apply_allocations_checks_against_existing_balances() {
        let mut ledger: MemoryLedger<Note> = MemoryLedger::new();
        ledger.credit(&Identity::new("alice"), u64::MAX).unwrap();

        let allocations = vec![Allocation {
            identity: "alice".to_string(),
            amount: 1,
        }];

        assert!(apply_allocations(&mut ledger, &allocations).is_err());
        assert_eq!(ledger.balance_of(&Identity::new("alice")).unwrap(), u64::MAX);
    }
}
