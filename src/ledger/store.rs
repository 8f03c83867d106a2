use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};

use super::LedgerEntry;
use crate::record::ForensicRecord;

/// Append-only SQLite backing for the ledger. Rows are only ever inserted.
pub struct LedgerStore {
    conn: Connection,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore").finish_non_exhaustive()
    }
}

impl LedgerStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open ledger {}", path))?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS forensic_records (
                sequence_id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                nonce INTEGER NOT NULL,
                severity TEXT NOT NULL,
                record_json TEXT NOT NULL,
                prev_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_forensic_source ON forensic_records(source, nonce);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        let json = serde_json::to_string(&entry.record)?;
        self.conn.execute(
            "INSERT INTO forensic_records
                (sequence_id, source, nonce, severity, record_json, prev_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.record.sequence_id as i64,
                entry.record.source.as_str(),
                entry.record.nonce as i64,
                entry.record.severity.as_str(),
                json,
                entry.prev_hash,
                entry.entry_hash,
            ],
        )?;
        Ok(())
    }

    /// Load every entry in sequence order, refusing storage with gaps.
    pub fn load_all(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_id, record_json, prev_hash, entry_hash
             FROM forensic_records ORDER BY sequence_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, json, prev_hash, entry_hash) = row?;
            let expected = entries.len() as i64 + 1;
            if seq != expected {
                bail!("ledger storage gap: expected sequence {}, found {}", expected, seq);
            }
            let record: ForensicRecord = serde_json::from_str(&json)
                .with_context(|| format!("decode record {}", seq))?;
            entries.push(LedgerEntry {
                record,
                prev_hash,
                entry_hash,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ZERO_HASH;
    use crate::record::{sample_record, Severity};

    fn entry(seq: u64) -> LedgerEntry {
        let mut record = sample_record("mint", seq, Severity::Info);
        record.sequence_id = seq;
        LedgerEntry {
            record,
            prev_hash: ZERO_HASH.to_string(),
            entry_hash: format!("{:064}", seq),
        }
    }

    #[test]
    fn test_append_and_load() {
        let mut store = LedgerStore::in_memory().unwrap();
        store.append(&entry(1)).unwrap();
        store.append(&entry(2)).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].record.sequence_id, 2);
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let mut store = LedgerStore::in_memory().unwrap();
        store.append(&entry(1)).unwrap();
        assert!(store.append(&entry(1)).is_err());
    }

    #[test]
    fn test_gap_refused_on_load() {
        let mut store = LedgerStore::in_memory().unwrap();
        store.append(&entry(1)).unwrap();
        store.append(&entry(3)).unwrap();
        assert!(store.load_all().is_err());
    }
}
