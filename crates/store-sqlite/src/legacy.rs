//! Read access to version 1 datasets.
//!
//! Version 1 keyed messages by their string message id, stored tags as plain
//! names per message and had no numeric ids, groups or notes.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use core_model::{MutationEntry, NewMessage};
use rusqlite::{Connection, OpenFlags, Row, types::Type, types::Value};

use crate::ts_from_epoch;

/// Shape of a version 1 store. Dates are epoch seconds or RFC 3339 text.
pub const V1_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS email (
  message_id TEXT PRIMARY KEY,
  subject TEXT,
  in_reply_to TEXT,
  sent_from TEXT,
  date,
  body TEXT,
  hidden INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS email_tag (
  message_id TEXT NOT NULL,
  tag TEXT NOT NULL,
  PRIMARY KEY (message_id, tag)
);
CREATE TABLE IF NOT EXISTS mutation (
  id INTEGER PRIMARY KEY,
  description TEXT NOT NULL,
  performed_at,
  affected_email_count INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMessage {
    pub message: NewMessage,
    pub hidden: bool,
}

pub struct LegacyStore {
    conn: Connection,
}

fn timestamp(r: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    match r.get::<_, Value>(idx)? {
        Value::Integer(secs) => Ok(ts_from_epoch(secs)),
        Value::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        Value::Null => Ok(DateTime::<Utc>::default()),
        Value::Real(secs) => Ok(ts_from_epoch(secs as i64)),
        Value::Blob(_) => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "date".to_string(),
            Type::Blob,
        )),
    }
}

impl LegacyStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("opening v1 store {}", path.as_ref().display()))?;
        Ok(Self { conn })
    }

    fn has_table(&self, name: &str) -> anyhow::Result<bool> {
        self.conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
            .exists([name])
            .map_err(Into::into)
    }

    /// Every message in chronological order.
    pub fn messages(&self) -> anyhow::Result<Vec<LegacyMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, subject, in_reply_to, sent_from, date, body, hidden FROM email",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(LegacyMessage {
                message: NewMessage {
                    message_id: r.get(0)?,
                    subject: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    in_reply_to: r.get(2)?,
                    sent_from: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    date: timestamp(r, 4)?,
                    body: r.get::<_, Option<String>>(5)?.unwrap_or_default(),
                },
                hidden: r.get(6)?,
            })
        })?;
        let mut msgs = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading v1 messages")?;
        // dates may mix integer and text storage, which SQLite orders by type
        msgs.sort_by(|a, b| {
            (a.message.date, &a.message.message_id).cmp(&(b.message.date, &b.message.message_id))
        });
        Ok(msgs)
    }

    /// `(message_id, tag name)` pairs.
    pub fn tag_links(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT message_id, tag FROM email_tag ORDER BY rowid")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("reading v1 tags")
    }

    /// Audit entries, empty when the store predates the mutation log.
    pub fn mutations(&self) -> anyhow::Result<Vec<MutationEntry>> {
        if !self.has_table("mutation")? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT id, description, performed_at, affected_email_count FROM mutation ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(MutationEntry {
                id: r.get(0)?,
                description: r.get(1)?,
                performed_at: timestamp(r, 2)?,
                affected_count: r.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("reading v1 mutations")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &Path, with_mutations: bool) -> std::path::PathBuf {
        let path = dir.join("v1.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(V1_SCHEMA).unwrap();
        if !with_mutations {
            conn.execute_batch("DROP TABLE mutation;").unwrap();
        }
        conn.execute_batch(
            r#"
            INSERT INTO email VALUES ('b@x', 'Re: hi', 'a@x', 'bob', '2020-01-02T00:00:00Z', 'reply', 0);
            INSERT INTO email VALUES ('a@x', 'hi', NULL, 'ann', 1577836800, NULL, 1);
            INSERT INTO email_tag VALUES ('a@x', 'Budget');
            "#,
        )
        .unwrap();
        if with_mutations {
            conn.execute(
                "INSERT INTO mutation VALUES (1, 'Hide emails', 1577900000, 3)",
                [],
            )
            .unwrap();
        }
        path
    }

    #[test]
    fn reads_messages_in_date_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LegacyStore::open(fixture(dir.path(), true)).unwrap();
        let msgs = store.messages().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message.message_id, "a@x");
        assert!(msgs[0].hidden);
        assert_eq!(msgs[0].message.body, "");
        assert_eq!(msgs[1].message.in_reply_to.as_deref(), Some("a@x"));
        assert_eq!(msgs[1].message.date.timestamp(), 1_577_923_200);
        assert_eq!(
            store.tag_links().unwrap(),
            vec![("a@x".to_string(), "Budget".to_string())]
        );
        let mutations = store.mutations().unwrap();
        assert_eq!(mutations[0].affected_count, 3);
    }

    #[test]
    fn missing_mutation_table_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LegacyStore::open(fixture(dir.path(), false)).unwrap();
        assert!(store.mutations().unwrap().is_empty());
    }
}
