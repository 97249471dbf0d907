use std::collections::{HashSet, VecDeque};

use anyhow::Context;
use core_model::{DatasetError, Message, MessageId, MessagePreview, NewMessage};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter, types::Value};
use tracing::{info, warn};

use crate::{SqliteStore, mutations, ts_from_epoch};

pub(crate) const MESSAGE_COLUMNS: &str =
    "m.id, m.parent_id, m.message_id, m.subject, m.in_reply_to, m.sent_from, m.date, m.body, m.hidden";
pub(crate) const PREVIEW_COLUMNS: &str =
    "m.id, m.parent_id, m.message_id, m.subject, m.sent_from, m.date, m.hidden";

const FIND_BY_MESSAGE_ID: &str = "SELECT id FROM email WHERE message_id = ?1 ORDER BY id LIMIT 1";
const INSERT_MESSAGE: &str = r#"INSERT INTO email
    (parent_id, message_id, subject, in_reply_to, sent_from, date, body, hidden)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)"#;

pub(crate) fn message_from_row(r: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: r.get(0)?,
        parent_id: r.get(1)?,
        message_id: r.get(2)?,
        subject: r.get(3)?,
        in_reply_to: r.get(4)?,
        sent_from: r.get(5)?,
        date: ts_from_epoch(r.get(6)?),
        body: r.get(7)?,
        hidden: r.get(8)?,
    })
}

pub(crate) fn preview_from_row(r: &Row<'_>) -> rusqlite::Result<MessagePreview> {
    Ok(MessagePreview {
        id: r.get(0)?,
        parent_id: r.get(1)?,
        message_id: r.get(2)?,
        subject: r.get(3)?,
        sent_from: r.get(4)?,
        date: ts_from_epoch(r.get(5)?),
        hidden: r.get(6)?,
    })
}

fn find_id(conn: &Connection, message_id: &str) -> rusqlite::Result<Option<MessageId>> {
    conn.prepare_cached(FIND_BY_MESSAGE_ID)?
        .query_row(params![message_id], |r| r.get(0))
        .optional()
}

pub(crate) fn reply_ids(conn: &Connection, id: MessageId) -> rusqlite::Result<Vec<MessageId>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM email WHERE parent_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![id], |r| r.get(0))?;
    rows.collect()
}

/// `id` followed by every transitive reply, breadth first.
pub(crate) fn thread_ids(conn: &Connection, id: MessageId) -> rusqlite::Result<Vec<MessageId>> {
    let mut seen = HashSet::from([id]);
    let mut out = vec![id];
    let mut queue = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        for child in reply_ids(conn, current)? {
            if seen.insert(child) {
                out.push(child);
                queue.push_back(child);
            }
        }
    }
    Ok(out)
}

/// Write handle for one import. Lookups see rows inserted earlier in the
/// same batch. Dropping the batch without [`ImportBatch::commit`] discards it.
pub struct ImportBatch<'a> {
    tx: Transaction<'a>,
    inserted: usize,
}

impl ImportBatch<'_> {
    pub fn find_id(&self, message_id: &str) -> anyhow::Result<Option<MessageId>> {
        find_id(&self.tx, message_id).map_err(Into::into)
    }

    /// Inserts `msg` unless a row with the same message id exists. Returns
    /// the new row id, or `None` for a duplicate.
    pub fn insert(
        &mut self,
        msg: &NewMessage,
        parent_id: Option<MessageId>,
    ) -> anyhow::Result<Option<MessageId>> {
        if find_id(&self.tx, &msg.message_id)?.is_some() {
            return Ok(None);
        }
        self.tx.prepare_cached(INSERT_MESSAGE)?.execute(params![
            parent_id,
            msg.message_id,
            msg.subject,
            msg.in_reply_to,
            msg.sent_from,
            msg.date.timestamp(),
            msg.body,
        ])?;
        self.inserted += 1;
        Ok(Some(self.tx.last_insert_rowid()))
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn commit(self) -> anyhow::Result<usize> {
        self.tx
            .commit()
            .with_context(|| DatasetError::RolledBack { operation: "import" })?;
        Ok(self.inserted)
    }
}

impl SqliteStore {
    pub fn begin_import(&mut self) -> anyhow::Result<ImportBatch<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        Ok(ImportBatch { tx, inserted: 0 })
    }

    pub fn count_messages(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM email", [], |r| r.get(0))
            .map_err(Into::into)
    }

    /// Messages carrying at least one tag.
    pub fn count_tagged_messages(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(DISTINCT email_id) FROM email_tag", [], |r| r.get(0))
            .map_err(Into::into)
    }

    pub fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM email m WHERE m.id = ?1"),
                params![id],
                message_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_preview(&self, id: MessageId) -> anyhow::Result<Option<MessagePreview>> {
        self.conn
            .query_row(
                &format!("SELECT {PREVIEW_COLUMNS} FROM email m WHERE m.id = ?1"),
                params![id],
                preview_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn find_id_by_message_id(&self, message_id: &str) -> anyhow::Result<Option<MessageId>> {
        find_id(&self.conn, message_id).map_err(Into::into)
    }

    /// Body text, or `None` when the row is missing or has no body.
    pub fn get_body(&self, id: MessageId) -> anyhow::Result<Option<String>> {
        let body: Option<Option<String>> = self
            .conn
            .prepare_cached("SELECT body FROM email WHERE id = ?1")?
            .query_row(params![id], |r| r.get(0))
            .optional()?;
        Ok(body.flatten())
    }

    /// Direct replies in chronological order.
    pub fn find_replies(&self, id: MessageId) -> anyhow::Result<Vec<MessagePreview>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {PREVIEW_COLUMNS} FROM email m WHERE m.parent_id = ?1 ORDER BY m.date ASC, m.id ASC"
        ))?;
        let rows = stmt.query_map(params![id], preview_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn count_replies(&self, id: MessageId) -> anyhow::Result<i64> {
        self.conn
            .prepare_cached("SELECT COUNT(*) FROM email WHERE parent_id = ?1")?
            .query_row(params![id], |r| r.get(0))
            .map_err(Into::into)
    }

    /// Number of messages below `id` at any depth.
    pub fn count_replies_recursive(&self, id: MessageId) -> anyhow::Result<i64> {
        Ok(thread_ids(&self.conn, id)?.len() as i64 - 1)
    }

    /// Follows parent links up to the thread root.
    ///
    /// Returns `None` when `id` does not exist, when the chain points at a
    /// missing row, or when a step does not move to a smaller id. Parents are
    /// always inserted before their replies, so a non-decreasing step means
    /// the stored links are corrupt.
    pub fn find_root_id(&self, id: MessageId) -> anyhow::Result<Option<MessageId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT parent_id FROM email WHERE id = ?1")?;
        let mut current = id;
        loop {
            let parent: Option<Option<MessageId>> = stmt
                .query_row(params![current], |r| r.get(0))
                .optional()?;
            match parent {
                None => {
                    if current != id {
                        warn!(id, missing = current, "thread chain points at a missing message");
                    }
                    return Ok(None);
                }
                Some(None) => return Ok(Some(current)),
                Some(Some(parent_id)) if parent_id >= current => {
                    warn!(id, at = current, parent_id, "thread chain does not descend");
                    return Ok(None);
                }
                Some(Some(parent_id)) => current = parent_id,
            }
        }
    }

    pub fn find_root(&self, id: MessageId) -> anyhow::Result<Option<MessagePreview>> {
        match self.find_root_id(id)? {
            Some(root) => self.get_preview(root),
            None => Ok(None),
        }
    }

    /// Every message in the thread rooted at `root`, parents before replies.
    pub fn thread(&self, root: MessageId) -> anyhow::Result<Vec<MessagePreview>> {
        let mut out = Vec::new();
        for id in thread_ids(&self.conn, root)? {
            if let Some(preview) = self.get_preview(id)? {
                out.push(preview);
            }
        }
        Ok(out)
    }

    pub fn set_hidden(&self, id: MessageId, hidden: bool) -> anyhow::Result<bool> {
        let changed = self
            .conn
            .execute("UPDATE email SET hidden = ?1 WHERE id = ?2", params![hidden, id])?;
        Ok(changed > 0)
    }

    /// Hides visible messages whose body matches the SQL `LIKE` pattern and
    /// records the change as a mutation. Returns the number hidden.
    pub fn hide_by_body(&mut self, pattern: &str) -> anyhow::Result<usize> {
        self.hide_where(
            "hide_by_body",
            format!("Hide emails with body like '{pattern}'"),
            "body LIKE ?1",
            pattern,
        )
    }

    /// Hides visible messages whose sender matches the SQL `LIKE` pattern.
    pub fn hide_by_sender(&mut self, pattern: &str) -> anyhow::Result<usize> {
        self.hide_where(
            "hide_by_sender",
            format!("Hide emails sent from addresses like '{pattern}'"),
            "sent_from LIKE ?1",
            pattern,
        )
    }

    fn hide_where(
        &mut self,
        operation: &'static str,
        description: String,
        condition: &str,
        pattern: &str,
    ) -> anyhow::Result<usize> {
        let count = self.with_transaction(operation, |tx| {
            let ids: Vec<MessageId> = {
                let mut stmt =
                    tx.prepare(&format!("SELECT id FROM email WHERE hidden = 0 AND {condition}"))?;
                let rows = stmt.query_map(params![pattern], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mutation_id = mutations::insert_mutation(tx, &description, ids.len() as i64)?;
            mutations::link_messages(tx, mutation_id, &ids)?;
            let mut hide = tx.prepare_cached("UPDATE email SET hidden = 1 WHERE id = ?1")?;
            for id in &ids {
                hide.execute(params![id])?;
            }
            Ok(ids.len())
        })?;
        info!(operation, pattern, count, "messages hidden");
        Ok(count)
    }

    /// Deletes every hidden message. Replies of a deleted message become
    /// roots. Recorded as a mutation with no linked messages.
    pub fn delete_hidden(&mut self) -> anyhow::Result<usize> {
        let count = self.with_transaction("delete_hidden", |tx| {
            let count = tx.execute("DELETE FROM email WHERE hidden = 1", [])?;
            mutations::insert_mutation(tx, "Delete hidden emails", count as i64)?;
            Ok(count)
        })?;
        info!(count, "hidden messages deleted");
        Ok(count)
    }

    /// Previews matching `condition`, newest first, ties by ascending id.
    ///
    /// `condition` refers to the message table as `m` and uses anonymous `?`
    /// placeholders bound from `values` in order.
    pub fn fetch_previews(
        &self,
        condition: Option<&str>,
        values: &[Value],
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<MessagePreview>> {
        let sql = format!(
            "SELECT {PREVIEW_COLUMNS} FROM email m {} ORDER BY m.date DESC, m.id ASC LIMIT ? OFFSET ?",
            where_clause(condition)
        );
        let bound = values
            .iter()
            .cloned()
            .chain([Value::Integer(limit), Value::Integer(offset)]);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), preview_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn count_where(&self, condition: Option<&str>, values: &[Value]) -> anyhow::Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM email m {}", where_clause(condition));
        self.conn
            .query_row(&sql, params_from_iter(values.iter()), |r| r.get(0))
            .map_err(Into::into)
    }
}

fn where_clause(condition: Option<&str>) -> String {
    condition.map(|c| format!("WHERE {c}")).unwrap_or_default()
}
