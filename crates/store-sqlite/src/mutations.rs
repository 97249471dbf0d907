use chrono::{DateTime, Utc};
use core_model::{MessageId, MutationEntry};
use rusqlite::{Connection, params};

use crate::{SqliteStore, ts_from_epoch};

pub(crate) fn insert_mutation(
    conn: &Connection,
    description: &str,
    affected: i64,
) -> rusqlite::Result<i64> {
    insert_mutation_at(conn, description, Utc::now(), affected)
}

fn insert_mutation_at(
    conn: &Connection,
    description: &str,
    performed_at: DateTime<Utc>,
    affected: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO mutation (description, performed_at, affected_email_count) VALUES (?1, ?2, ?3)",
        params![description, performed_at.timestamp(), affected],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn link_messages(
    conn: &Connection,
    mutation_id: i64,
    ids: &[MessageId],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO mutation_email (mutation_id, email_id) VALUES (?1, ?2)",
    )?;
    for id in ids {
        stmt.execute(params![mutation_id, id])?;
    }
    Ok(())
}

impl SqliteStore {
    /// Audit log, most recent first.
    pub fn list_mutations(&self) -> anyhow::Result<Vec<MutationEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, description, performed_at, affected_email_count FROM mutation ORDER BY performed_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(MutationEntry {
                id: r.get(0)?,
                description: r.get(1)?,
                performed_at: ts_from_epoch(r.get(2)?),
                affected_count: r.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn mutation_message_ids(&self, mutation_id: i64) -> anyhow::Result<Vec<MessageId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT email_id FROM mutation_email WHERE mutation_id = ?1 ORDER BY email_id",
        )?;
        let rows = stmt.query_map(params![mutation_id], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Copies an audit entry from another dataset, keeping its timestamp.
    pub fn import_mutation(
        &mut self,
        entry: &MutationEntry,
        linked: &[MessageId],
    ) -> anyhow::Result<i64> {
        self.with_transaction("import_mutation", |tx| {
            let id = insert_mutation_at(tx, &entry.description, entry.performed_at, entry.affected_count)?;
            link_messages(tx, id, linked)?;
            Ok(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use crate::ts_from_epoch;
    use core_model::MutationEntry;

    #[test]
    fn imported_mutation_keeps_timestamp() {
        let mut store = store();
        let ids = seed(&mut store, &[msg("a", None, 10, "x")]);
        let entry = MutationEntry {
            id: 0,
            description: "Hide emails with body like '%x%'".to_string(),
            performed_at: ts_from_epoch(1_600_000_000),
            affected_count: 1,
        };
        let id = store.import_mutation(&entry, &ids).unwrap();
        let listed = store.list_mutations().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].performed_at, entry.performed_at);
        assert_eq!(store.mutation_message_ids(id).unwrap(), ids);
    }
}
