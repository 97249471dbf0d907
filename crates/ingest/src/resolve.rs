use std::time::Instant;

use core_model::{MessageId, NewMessage};
use store_sqlite::SqliteStore;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    pub inserted: usize,
    pub duplicates: usize,
    /// Replies whose target was not stored before them.
    pub unresolved_parents: usize,
}

/// Stores `messages` in date order, linking each reply to a message stored
/// before it. Returns the row id given to each message id, in insertion
/// order.
///
/// Only earlier rows are candidates for a parent, so a parent id is always
/// smaller than its reply's id and threads cannot form cycles.
pub fn resolve_threads(
    store: &mut SqliteStore,
    mut messages: Vec<NewMessage>,
) -> anyhow::Result<(ResolveReport, Vec<(String, MessageId)>)> {
    let t = Instant::now();
    messages.sort_by(|a, b| (a.date, &a.message_id).cmp(&(b.date, &b.message_id)));

    let mut report = ResolveReport::default();
    let mut assigned = Vec::with_capacity(messages.len());
    let mut batch = store.begin_import()?;
    for msg in &messages {
        let parent = match &msg.in_reply_to {
            Some(target) => {
                let found = batch.find_id(target)?;
                if found.is_none() {
                    debug!(message_id = %msg.message_id, in_reply_to = %target, "reply target not found");
                    report.unresolved_parents += 1;
                }
                found
            }
            None => None,
        };
        match batch.insert(msg, parent)? {
            Some(id) => {
                report.inserted += 1;
                assigned.push((msg.message_id.clone(), id));
            }
            None => report.duplicates += 1,
        }
    }
    batch.commit()?;

    info!(
        inserted = report.inserted,
        duplicates = report.duplicates,
        unresolved = report.unresolved_parents,
        elapsed = ?t.elapsed(),
        "threads resolved"
    );
    Ok((report, assigned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, reply: Option<&str>, secs: i64) -> NewMessage {
        NewMessage {
            message_id: id.to_string(),
            in_reply_to: reply.map(str::to_string),
            subject: id.to_string(),
            sent_from: "x@example.org".to_string(),
            date: Utc.timestamp_opt(secs, 0).unwrap(),
            body: "body".to_string(),
        }
    }

    fn store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        store
    }

    #[test]
    fn links_replies_regardless_of_input_order() {
        let mut store = store();
        let (report, assigned) = resolve_threads(
            &mut store,
            vec![
                msg("c", Some("b"), 30),
                msg("a", None, 10),
                msg("b", Some("a"), 20),
            ],
        )
        .unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(report.unresolved_parents, 0);
        let ids: Vec<&str> = assigned.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let c = store.find_id_by_message_id("c").unwrap().unwrap();
        let a = store.find_id_by_message_id("a").unwrap().unwrap();
        assert_eq!(store.find_root_id(c).unwrap(), Some(a));
    }

    #[test]
    fn reply_dated_before_parent_becomes_root() {
        let mut store = store();
        let (report, _) =
            resolve_threads(&mut store, vec![msg("late", None, 50), msg("early", Some("late"), 10)])
                .unwrap();
        assert_eq!(report.unresolved_parents, 1);
        let early = store.find_id_by_message_id("early").unwrap().unwrap();
        assert!(store.get_message(early).unwrap().unwrap().is_root());
    }

    #[test]
    fn rerun_counts_duplicates() {
        let mut store = store();
        let input = vec![msg("a", None, 10), msg("b", Some("a"), 20), msg("orphan", Some("zzz"), 5)];
        resolve_threads(&mut store, input.clone()).unwrap();
        let (again, assigned) = resolve_threads(&mut store, input).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 3);
        assert!(assigned.is_empty());
        assert_eq!(store.count_messages().unwrap(), 3);
    }
}
