use std::collections::BTreeMap;

use anyhow::Context;
use core_model::{DatasetError, MessageId, Tag, TagId};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{SqliteStore, messages, move_to_seq, rectify_seq};

const TAG_COLUMNS: &str = "t.id, t.name, t.description, t.seq";

fn tag_from_row(r: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: r.get(0)?,
        name: r.get(1)?,
        description: r.get(2)?,
        seq: r.get(3)?,
    })
}

fn tag_id_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<TagId>> {
    conn.prepare_cached("SELECT id FROM tag WHERE name = ?1")?
        .query_row(params![name], |r| r.get(0))
        .optional()
}

/// Appends a tag at the end of the display order.
fn insert_tag(conn: &Connection, name: &str, description: Option<&str>) -> rusqlite::Result<TagId> {
    conn.execute(
        "INSERT INTO tag (name, description, seq) VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM tag))",
        params![name, description],
    )?;
    let id = conn.last_insert_rowid();
    rectify_seq(conn, "tag")?;
    Ok(id)
}

fn link(conn: &Connection, email_id: MessageId, tag_id: TagId) -> rusqlite::Result<bool> {
    let added = conn
        .prepare_cached("INSERT OR IGNORE INTO email_tag (email_id, tag_id) VALUES (?1, ?2)")?
        .execute(params![email_id, tag_id])?;
    Ok(added > 0)
}

fn unlink(conn: &Connection, email_id: MessageId, tag_id: TagId) -> rusqlite::Result<bool> {
    let removed = conn
        .prepare_cached("DELETE FROM email_tag WHERE email_id = ?1 AND tag_id = ?2")?
        .execute(params![email_id, tag_id])?;
    Ok(removed > 0)
}

/// Tag name ordering used for aggregated tag lists.
fn sort_by_name(tags: &mut [Tag]) {
    tags.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
}

impl SqliteStore {
    pub fn create_tag(&mut self, name: &str, description: Option<&str>) -> anyhow::Result<Tag> {
        let id = self.with_transaction("create_tag", |tx| {
            if tag_id_by_name(tx, name)?.is_some() {
                return Err(DatasetError::DuplicateName {
                    kind: "tag",
                    name: name.to_string(),
                }
                .into());
            }
            Ok(insert_tag(tx, name, description)?)
        })?;
        self.get_tag(id)?
            .with_context(|| format!("tag {id} vanished after insert"))
    }

    pub fn get_tag(&self, id: TagId) -> anyhow::Result<Option<Tag>> {
        self.conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tag t WHERE t.id = ?1"),
                params![id],
                tag_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Exact, case-sensitive lookup.
    pub fn get_tag_by_name(&self, name: &str) -> anyhow::Result<Option<Tag>> {
        self.conn
            .query_row(
                &format!("SELECT {TAG_COLUMNS} FROM tag t WHERE t.name = ?1"),
                params![name],
                tag_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// All tags in display order.
    pub fn list_tags(&self) -> anyhow::Result<Vec<Tag>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TAG_COLUMNS} FROM tag t ORDER BY t.seq, t.id"))?;
        let rows = stmt.query_map([], tag_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn count_tags(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tag", [], |r| r.get(0))
            .map_err(Into::into)
    }

    pub fn rename_tag(&mut self, id: TagId, name: &str) -> anyhow::Result<bool> {
        self.with_transaction("rename_tag", |tx| {
            if let Some(existing) = tag_id_by_name(tx, name)?
                && existing != id
            {
                return Err(DatasetError::DuplicateName {
                    kind: "tag",
                    name: name.to_string(),
                }
                .into());
            }
            Ok(tx.execute("UPDATE tag SET name = ?1 WHERE id = ?2", params![name, id])? > 0)
        })
    }

    pub fn set_tag_description(&self, id: TagId, description: Option<&str>) -> anyhow::Result<bool> {
        Ok(self.conn.execute(
            "UPDATE tag SET description = ?1 WHERE id = ?2",
            params![description, id],
        )? > 0)
    }

    /// Moves a tag to 1-based position `seq`. Out of range positions clamp
    /// to the first or last slot.
    pub fn set_tag_seq(&mut self, id: TagId, seq: i64) -> anyhow::Result<bool> {
        self.with_transaction("set_tag_seq", |tx| Ok(move_to_seq(tx, "tag", id, seq)?))
    }

    /// Deletes the tag and its links, then closes the gap in the order.
    pub fn delete_tag(&mut self, id: TagId) -> anyhow::Result<bool> {
        self.with_transaction("delete_tag", |tx| {
            let removed = tx.execute("DELETE FROM tag WHERE id = ?1", params![id])? > 0;
            rectify_seq(tx, "tag")?;
            Ok(removed)
        })
    }

    pub fn tags_for_message(&self, email_id: MessageId) -> anyhow::Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {TAG_COLUMNS} FROM tag t JOIN email_tag et ON et.tag_id = t.id WHERE et.email_id = ?1 ORDER BY t.seq, t.id"
        ))?;
        let rows = stmt.query_map(params![email_id], tag_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn has_tag(&self, email_id: MessageId, tag_id: TagId) -> anyhow::Result<bool> {
        self.conn
            .prepare_cached("SELECT 1 FROM email_tag WHERE email_id = ?1 AND tag_id = ?2")?
            .exists(params![email_id, tag_id])
            .map_err(Into::into)
    }

    pub fn count_messages_with_tag(&self, tag_id: TagId) -> anyhow::Result<i64> {
        self.conn
            .prepare_cached("SELECT COUNT(*) FROM email_tag WHERE tag_id = ?1")?
            .query_row(params![tag_id], |r| r.get(0))
            .map_err(Into::into)
    }

    /// Returns true when the link is new.
    pub fn add_tag(&self, email_id: MessageId, tag_id: TagId) -> anyhow::Result<bool> {
        link(&self.conn, email_id, tag_id)
            .with_context(|| format!("tagging message {email_id} with tag {tag_id}"))
    }

    pub fn remove_tag(&self, email_id: MessageId, tag_id: TagId) -> anyhow::Result<bool> {
        unlink(&self.conn, email_id, tag_id).map_err(Into::into)
    }

    /// Tags a message by tag name, creating the tag when needed.
    pub fn add_tag_by_name(&mut self, email_id: MessageId, name: &str) -> anyhow::Result<Tag> {
        let tag_id = self.with_transaction("add_tag_by_name", |tx| {
            let tag_id = match tag_id_by_name(tx, name)? {
                Some(id) => id,
                None => insert_tag(tx, name, None)?,
            };
            link(tx, email_id, tag_id)?;
            Ok(tag_id)
        })?;
        self.get_tag(tag_id)?
            .with_context(|| format!("tag {tag_id} vanished after insert"))
    }

    /// Tags the message and every reply below it. Returns how many links
    /// were added.
    pub fn add_tag_recursive(&mut self, email_id: MessageId, tag_id: TagId) -> anyhow::Result<usize> {
        self.with_transaction("add_tag_recursive", |tx| {
            let mut added = 0;
            for id in messages::thread_ids(tx, email_id)? {
                if link(tx, id, tag_id)? {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    pub fn remove_tag_recursive(
        &mut self,
        email_id: MessageId,
        tag_id: TagId,
    ) -> anyhow::Result<usize> {
        self.with_transaction("remove_tag_recursive", |tx| {
            let mut removed = 0;
            for id in messages::thread_ids(tx, email_id)? {
                if unlink(tx, id, tag_id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Distinct tags carried by any ancestor of the message, by name.
    pub fn parent_tags(&self, email_id: MessageId) -> anyhow::Result<Vec<Tag>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT parent_id FROM email WHERE id = ?1")?;
        let mut found = BTreeMap::new();
        let mut current = email_id;
        while let Some(Some(parent)) = stmt
            .query_row(params![current], |r| r.get::<_, Option<MessageId>>(0))
            .optional()?
        {
            if parent >= current {
                break;
            }
            for tag in self.tags_for_message(parent)? {
                found.insert(tag.id, tag);
            }
            current = parent;
        }
        let mut tags: Vec<Tag> = found.into_values().collect();
        sort_by_name(&mut tags);
        Ok(tags)
    }

    /// Distinct tags carried by any reply below the message, by name.
    pub fn child_tags(&self, email_id: MessageId) -> anyhow::Result<Vec<Tag>> {
        let mut found = BTreeMap::new();
        for id in messages::thread_ids(&self.conn, email_id)?.into_iter().skip(1) {
            for tag in self.tags_for_message(id)? {
                found.insert(tag.id, tag);
            }
        }
        let mut tags: Vec<Tag> = found.into_values().collect();
        sort_by_name(&mut tags);
        Ok(tags)
    }
}
