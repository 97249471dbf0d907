use anyhow::Context;
use chrono::Utc;
use core_model::{MessageId, Note};
use rusqlite::{OptionalExtension, params};

use crate::{SqliteStore, ts_from_epoch};

impl SqliteStore {
    pub fn add_note(&self, message_id: MessageId, text: &str) -> anyhow::Result<Note> {
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO email_note (email_id, created_at, message) VALUES (?1, ?2, ?3)",
                params![message_id, now.timestamp(), text],
            )
            .with_context(|| format!("adding note to message {message_id}"))?;
        let id = self.conn.last_insert_rowid();
        self.get_note(id)?
            .with_context(|| format!("note {id} vanished after insert"))
    }

    pub fn get_note(&self, id: i64) -> anyhow::Result<Option<Note>> {
        self.conn
            .query_row(
                "SELECT id, email_id, created_at, message FROM email_note WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Note {
                        id: r.get(0)?,
                        message_id: r.get(1)?,
                        created_at: ts_from_epoch(r.get(2)?),
                        text: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn notes_for_message(&self, message_id: MessageId) -> anyhow::Result<Vec<Note>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, email_id, created_at, message FROM email_note WHERE email_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![message_id], |r| {
            Ok(Note {
                id: r.get(0)?,
                message_id: r.get(1)?,
                created_at: ts_from_epoch(r.get(2)?),
                text: r.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn delete_note(&self, id: i64) -> anyhow::Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM email_note WHERE id = ?1", params![id])?
            > 0)
    }
}
