use std::collections::{BTreeMap, HashSet, VecDeque};

use anyhow::{Context, bail};
use core_model::{DatasetError, GroupId, Tag, TagGroup, TagId};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{SqliteStore, move_to_seq, rectify_seq};

const GROUP_COLUMNS: &str = "g.id, g.parent_id, g.name, g.description, g.seq";

fn group_from_row(r: &Row<'_>) -> rusqlite::Result<TagGroup> {
    Ok(TagGroup {
        id: r.get(0)?,
        parent_id: r.get(1)?,
        name: r.get(2)?,
        description: r.get(3)?,
        seq: r.get(4)?,
    })
}

fn group_id_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<GroupId>> {
    conn.prepare_cached("SELECT id FROM tag_group WHERE name = ?1")?
        .query_row(params![name], |r| r.get(0))
        .optional()
}

fn child_group_ids(conn: &Connection, id: GroupId) -> rusqlite::Result<Vec<GroupId>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM tag_group WHERE parent_id = ?1 ORDER BY seq, id")?;
    let rows = stmt.query_map(params![id], |r| r.get(0))?;
    rows.collect()
}

/// `id` and every group nested below it.
fn subtree(conn: &Connection, id: GroupId) -> rusqlite::Result<Vec<GroupId>> {
    let mut seen = HashSet::from([id]);
    let mut out = vec![id];
    let mut queue = VecDeque::from([id]);
    while let Some(current) = queue.pop_front() {
        for child in child_group_ids(conn, current)? {
            if seen.insert(child) {
                out.push(child);
                queue.push_back(child);
            }
        }
    }
    Ok(out)
}

impl SqliteStore {
    pub fn create_group(&mut self, name: &str, description: Option<&str>) -> anyhow::Result<TagGroup> {
        let id = self.with_transaction("create_group", |tx| {
            if group_id_by_name(tx, name)?.is_some() {
                return Err(DatasetError::DuplicateName {
                    kind: "group",
                    name: name.to_string(),
                }
                .into());
            }
            tx.execute(
                "INSERT INTO tag_group (name, description, seq) VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM tag_group))",
                params![name, description],
            )?;
            let id = tx.last_insert_rowid();
            rectify_seq(tx, "tag_group")?;
            Ok(id)
        })?;
        self.get_group(id)?
            .with_context(|| format!("group {id} vanished after insert"))
    }

    pub fn get_group(&self, id: GroupId) -> anyhow::Result<Option<TagGroup>> {
        self.conn
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM tag_group g WHERE g.id = ?1"),
                params![id],
                group_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_group_by_name(&self, name: &str) -> anyhow::Result<Option<TagGroup>> {
        self.conn
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM tag_group g WHERE g.name = ?1"),
                params![name],
                group_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_groups(&self) -> anyhow::Result<Vec<TagGroup>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {GROUP_COLUMNS} FROM tag_group g ORDER BY g.seq, g.id"
        ))?;
        let rows = stmt.query_map([], group_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn group_children(&self, id: GroupId) -> anyhow::Result<Vec<TagGroup>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM tag_group g WHERE g.parent_id = ?1 ORDER BY g.seq, g.id"
        ))?;
        let rows = stmt.query_map(params![id], group_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    pub fn count_groups(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tag_group", [], |r| r.get(0))
            .map_err(Into::into)
    }

    pub fn rename_group(&mut self, id: GroupId, name: &str) -> anyhow::Result<bool> {
        self.with_transaction("rename_group", |tx| {
            if let Some(existing) = group_id_by_name(tx, name)?
                && existing != id
            {
                return Err(DatasetError::DuplicateName {
                    kind: "group",
                    name: name.to_string(),
                }
                .into());
            }
            Ok(tx.execute("UPDATE tag_group SET name = ?1 WHERE id = ?2", params![name, id])? > 0)
        })
    }

    pub fn set_group_description(
        &self,
        id: GroupId,
        description: Option<&str>,
    ) -> anyhow::Result<bool> {
        Ok(self.conn.execute(
            "UPDATE tag_group SET description = ?1 WHERE id = ?2",
            params![description, id],
        )? > 0)
    }

    /// Nests a group under `parent`, or makes it top level with `None`.
    /// Refuses to create a cycle.
    pub fn set_group_parent(&mut self, id: GroupId, parent: Option<GroupId>) -> anyhow::Result<bool> {
        self.with_transaction("set_group_parent", |tx| {
            if let Some(parent) = parent
                && subtree(tx, id)?.contains(&parent)
            {
                bail!("group {parent} is {id} or nested below it");
            }
            Ok(tx.execute(
                "UPDATE tag_group SET parent_id = ?1 WHERE id = ?2",
                params![parent, id],
            )? > 0)
        })
    }

    pub fn set_group_seq(&mut self, id: GroupId, seq: i64) -> anyhow::Result<bool> {
        self.with_transaction("set_group_seq", |tx| Ok(move_to_seq(tx, "tag_group", id, seq)?))
    }

    /// Deletes a group. Nested groups move to the top level; member tags
    /// are kept.
    pub fn delete_group(&mut self, id: GroupId) -> anyhow::Result<bool> {
        self.with_transaction("delete_group", |tx| {
            let removed = tx.execute("DELETE FROM tag_group WHERE id = ?1", params![id])? > 0;
            rectify_seq(tx, "tag_group")?;
            Ok(removed)
        })
    }

    pub fn add_tag_to_group(&self, group_id: GroupId, tag_id: TagId) -> anyhow::Result<bool> {
        Ok(self.conn.execute(
            "INSERT OR IGNORE INTO tag_group_tag (group_id, tag_id) VALUES (?1, ?2)",
            params![group_id, tag_id],
        )? > 0)
    }

    pub fn remove_tag_from_group(&self, group_id: GroupId, tag_id: TagId) -> anyhow::Result<bool> {
        Ok(self.conn.execute(
            "DELETE FROM tag_group_tag WHERE group_id = ?1 AND tag_id = ?2",
            params![group_id, tag_id],
        )? > 0)
    }

    /// Tags placed directly in the group, in tag display order.
    pub fn tags_in_group(&self, group_id: GroupId) -> anyhow::Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.id, t.name, t.description, t.seq FROM tag t JOIN tag_group_tag gt ON gt.tag_id = t.id WHERE gt.group_id = ?1 ORDER BY t.seq, t.id",
        )?;
        let rows = stmt.query_map(params![group_id], |r| {
            Ok(Tag {
                id: r.get(0)?,
                name: r.get(1)?,
                description: r.get(2)?,
                seq: r.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Tags in the group or any group nested below it, without duplicates.
    pub fn tags_in_group_recursive(&self, group_id: GroupId) -> anyhow::Result<Vec<Tag>> {
        let mut found = BTreeMap::new();
        for id in subtree(&self.conn, group_id)? {
            for tag in self.tags_in_group(id)? {
                found.insert((tag.seq, tag.id), tag);
            }
        }
        Ok(found.into_values().collect())
    }

    pub fn groups_for_tag(&self, tag_id: TagId) -> anyhow::Result<Vec<TagGroup>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM tag_group g JOIN tag_group_tag gt ON gt.group_id = g.id WHERE gt.tag_id = ?1 ORDER BY g.seq, g.id"
        ))?;
        let rows = stmt.query_map(params![tag_id], group_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }
}
