use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use core_model::DatasetError;
use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use tracing::{debug, warn};

mod groups;
pub mod legacy;
mod messages;
mod mutations;
mod notes;
mod schema;
mod tags;

pub use messages::ImportBatch;

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening sqlite db {}", path.as_ref().display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
        )?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    /// Runs `op` inside an immediate transaction.
    ///
    /// Commits when `op` returns `Ok`. Any error rolls every statement back
    /// and comes out with [`DatasetError::RolledBack`] attached as context.
    /// A panic inside `op` drops the transaction, which also rolls back.
    pub fn with_transaction<T>(
        &mut self,
        operation: &'static str,
        op: impl FnOnce(&Transaction<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| DatasetError::RolledBack { operation })?;
        match op(&tx) {
            Ok(value) => {
                tx.commit()
                    .with_context(|| DatasetError::RolledBack { operation })?;
                debug!(operation, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(operation, error = %rollback_err, "rollback failed");
                }
                warn!(operation, error = %err, "transaction rolled back");
                Err(err.context(DatasetError::RolledBack { operation }))
            }
        }
    }

    /// Checkpoints the write-ahead log and rebuilds the database file.
    pub fn compact(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE); VACUUM;")
            .context("compacting store")
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.conn
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }

    /// Names of all tables in the open database, sorted.
    pub fn schema_tables(&self) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Expected tables that are missing from the open database.
    pub fn missing_tables(&self) -> anyhow::Result<Vec<&'static str>> {
        let present = self.schema_tables()?;
        Ok(schema::TABLES
            .into_iter()
            .filter(|t| !present.iter().any(|p| p == t))
            .collect())
    }

    /// Flushes the write-ahead log into the main file and closes the handle.
    pub fn close(self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .context("checkpointing store")?;
        self.conn
            .close()
            .map_err(|(_, err)| err)
            .context("closing store")
    }
}

pub(crate) fn ts_from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Ids of `table` in display order. `table` is always one of ours.
pub(crate) fn ordered_ids(conn: &Connection, table: &str) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(&format!("SELECT id FROM {table} ORDER BY seq ASC, id ASC"))?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    rows.collect()
}

fn write_sequence(conn: &Connection, table: &str, ids: &[i64]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("UPDATE {table} SET seq = ?1 WHERE id = ?2"))?;
    for (pos, id) in ids.iter().enumerate() {
        stmt.execute(params![pos as i64 + 1, id])?;
    }
    Ok(())
}

/// Renumbers `seq` to 1..=N keeping the current order.
pub(crate) fn rectify_seq(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    let ids = ordered_ids(conn, table)?;
    write_sequence(conn, table, &ids)
}

/// Moves `id` to 1-based position `seq`, clamped to the list, and renumbers.
/// Returns false when `id` is not in the table.
pub(crate) fn move_to_seq(
    conn: &Connection,
    table: &str,
    id: i64,
    seq: i64,
) -> rusqlite::Result<bool> {
    let mut ids = ordered_ids(conn, table)?;
    let Some(pos) = ids.iter().position(|&x| x == id) else {
        return Ok(false);
    };
    ids.remove(pos);
    let target = (seq - 1).clamp(0, ids.len() as i64) as usize;
    ids.insert(target, id);
    write_sequence(conn, table, &ids)?;
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn schema_and_integrity() {
        let store = store();
        assert_eq!(store.integrity_check().unwrap(), "ok");
        assert!(store.missing_tables().unwrap().is_empty());
        assert!(store.schema_tables().unwrap().contains(&"email_note".to_string()));
    }

    #[test]
    fn init_schema_idempotent() {
        let mut store = store();
        seed(&mut store, &[msg("a", None, 10, "hello")]);
        store.init_schema().unwrap();
        assert_eq!(store.count_messages().unwrap(), 1);
    }

    #[test]
    fn failed_transaction_rolls_back_and_reports_kind() {
        let mut store = store();
        let ids = seed(&mut store, &[msg("a", None, 10, "hello")]);
        let err = store
            .with_transaction::<()>("hide_then_fail", |tx| {
                tx.execute("UPDATE email SET hidden = 1 WHERE id = ?1", params![ids[0]])?;
                anyhow::bail!("simulated failure")
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::RolledBack {
                operation: "hide_then_fail"
            })
        ));
        assert!(!store.get_message(ids[0]).unwrap().unwrap().hidden);
    }

    #[test]
    fn seq_moves_are_clamped() {
        let store = store();
        for name in ["a", "b", "c"] {
            store
                .conn
                .execute("INSERT INTO tag (name, seq) VALUES (?1, 0)", params![name])
                .unwrap();
        }
        rectify_seq(&store.conn, "tag").unwrap();
        assert_eq!(ordered_ids(&store.conn, "tag").unwrap(), vec![1, 2, 3]);
        assert!(move_to_seq(&store.conn, "tag", 1, 99).unwrap());
        assert_eq!(ordered_ids(&store.conn, "tag").unwrap(), vec![2, 3, 1]);
        assert!(move_to_seq(&store.conn, "tag", 1, -4).unwrap());
        assert_eq!(ordered_ids(&store.conn, "tag").unwrap(), vec![1, 2, 3]);
        assert!(!move_to_seq(&store.conn, "tag", 42, 1).unwrap());
    }

    #[test]
    fn close_flushes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let mut store = SqliteStore::open(&path).unwrap();
        store.init_schema().unwrap();
        seed(&mut store, &[msg("a", None, 10, "hello")]);
        store.close().unwrap();
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count_messages().unwrap(), 1);
    }
}
