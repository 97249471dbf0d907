//! Full-text index over visible message subjects and bodies.
//!
//! Each document stores the message id and the id of its thread root, so a
//! hit can be reported as the conversation it belongs to.

use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use anyhow::Context;
use core_model::{DatasetError, MessageId};
use rayon::ThreadPoolBuilder;
use store_sqlite::SqliteStore;
use tantivy::{
    Index, IndexWriter, Searcher, TantivyDocument,
    collector::TopDocs,
    doc,
    query::{Query, QueryParser},
    schema::{Field, STORED, Schema, TEXT, Value},
};
use tracing::{debug, info, warn};

use crate::{
    executor::{count, find},
    filter::Filter,
};

const WRITER_MEMORY_PER_THREAD: usize = 50_000_000;
const MAX_WRITER_THREADS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct IndexFields {
    id: Field,
    subject: Field,
    body: Field,
    root_id: Field,
}

impl IndexFields {
    fn schema() -> (Schema, Self) {
        let mut builder = Schema::builder();
        let id = builder.add_i64_field("id", STORED);
        let subject = builder.add_text_field("subject", TEXT);
        let body = builder.add_text_field("body", TEXT);
        let root_id = builder.add_i64_field("root_id", STORED);
        (
            builder.build(),
            Self {
                id,
                subject,
                body,
                root_id,
            },
        )
    }

    fn from_schema(schema: &Schema) -> anyhow::Result<Self> {
        Ok(Self {
            id: schema.get_field("id")?,
            subject: schema.get_field("subject")?,
            body: schema.get_field("body")?,
            root_id: schema.get_field("root_id")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Concurrent partitions. Defaults to the available parallelism minus
    /// one, at least one.
    pub workers: Option<usize>,
}

impl IndexOptions {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
        })
        .max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexProgress {
    Started { total: i64, partitions: usize },
    PartitionDone { partition: usize, indexed: usize },
    PartitionFailed { partition: usize },
    Committed { indexed: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub partitions: usize,
    pub indexed: usize,
    pub skipped_without_body: usize,
    pub failed_partitions: usize,
}

struct Entry {
    id: MessageId,
    root_id: MessageId,
    subject: String,
    body: String,
}

/// Reads every visible message with a body, split into `workers` partitions.
fn collect_partitions(
    store: &SqliteStore,
    total: i64,
    workers: usize,
) -> anyhow::Result<(Vec<Vec<Entry>>, usize)> {
    let visible = [Filter::Hidden(false)];
    let page_size = (total.max(0) as usize).div_ceil(workers).max(1);
    let mut partitions = Vec::with_capacity(workers);
    let mut skipped = 0;
    let mut page = 1;
    loop {
        let result = find(store, page, page_size, &visible)?;
        if result.previews.is_empty() {
            break;
        }
        let has_next_page = result.has_next_page();
        let mut entries = Vec::with_capacity(result.previews.len());
        for preview in result.previews {
            let Some(body) = store.get_body(preview.id)? else {
                debug!(id = preview.id, "message has no body, not indexed");
                skipped += 1;
                continue;
            };
            let root_id = store.find_root_id(preview.id)?.unwrap_or(preview.id);
            entries.push(Entry {
                id: preview.id,
                root_id,
                subject: preview.subject,
                body,
            });
        }
        partitions.push(entries);
        if !has_next_page {
            break;
        }
        page += 1;
    }
    Ok((partitions, skipped))
}

fn index_partition(writer: &IndexWriter, fields: IndexFields, entries: Vec<Entry>) -> anyhow::Result<usize> {
    let mut indexed = 0;
    for entry in entries {
        writer.add_document(doc!(
            fields.id => entry.id,
            fields.root_id => entry.root_id,
            fields.subject => entry.subject,
            fields.body => entry.body,
        ))?;
        indexed += 1;
    }
    Ok(indexed)
}

/// Deletes `index_dir` and indexes every visible message from scratch.
///
/// All store reads happen before the workers start; the workers only feed
/// the shared writer. A failing partition is reported and skipped.
pub fn rebuild_index(
    store: &SqliteStore,
    index_dir: &Path,
    options: &IndexOptions,
    on_progress: &(dyn Fn(IndexProgress) + Sync),
) -> anyhow::Result<IndexReport> {
    let t = Instant::now();
    if index_dir.exists() {
        fs::remove_dir_all(index_dir)
            .with_context(|| format!("removing old index {}", index_dir.display()))?;
    }
    fs::create_dir_all(index_dir)
        .with_context(|| format!("creating index dir {}", index_dir.display()))?;

    let (schema, fields) = IndexFields::schema();
    let index = Index::create_in_dir(index_dir, schema)
        .with_context(|| format!("creating index in {}", index_dir.display()))?;

    let workers = options.worker_count();
    let total = count(store, &[Filter::Hidden(false)])?;
    let (partitions, skipped) = collect_partitions(store, total, workers)?;
    let partition_count = partitions.len();
    on_progress(IndexProgress::Started {
        total,
        partitions: partition_count,
    });

    let writer_threads = workers.min(MAX_WRITER_THREADS);
    let mut writer: IndexWriter =
        index.writer_with_num_threads(writer_threads, WRITER_MEMORY_PER_THREAD * writer_threads)?;
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("index-worker-{i}"))
        .build()?;

    let indexed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    pool.scope(|scope| {
        for (partition, entries) in partitions.into_iter().enumerate() {
            let writer = &writer;
            let indexed = &indexed;
            let failed = &failed;
            scope.spawn(move |_| match index_partition(writer, fields, entries) {
                Ok(n) => {
                    indexed.fetch_add(n, Ordering::Relaxed);
                    debug!(partition, indexed = n, "partition indexed");
                    on_progress(IndexProgress::PartitionDone {
                        partition,
                        indexed: n,
                    });
                }
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(partition, error = %err, "partition failed");
                    on_progress(IndexProgress::PartitionFailed { partition });
                }
            });
        }
    });

    writer.commit().context("committing index")?;
    writer
        .wait_merging_threads()
        .context("waiting for index merges")?;

    let report = IndexReport {
        partitions: partition_count,
        indexed: indexed.into_inner(),
        skipped_without_body: skipped,
        failed_partitions: failed.into_inner(),
    };
    on_progress(IndexProgress::Committed {
        indexed: report.indexed,
    });
    info!(
        indexed = report.indexed,
        skipped = report.skipped_without_body,
        failed = report.failed_partitions,
        workers,
        elapsed = ?t.elapsed(),
        "index rebuilt"
    );
    Ok(report)
}

/// True when a term may start at `i`: after whitespace, `(`, or a `+`/`-`
/// that itself starts a term.
fn starts_term(chars: &[char], i: usize) -> bool {
    let open = |j: usize| j == 0 || chars[j - 1].is_whitespace() || chars[j - 1] == '(';
    open(i) || (i > 0 && matches!(chars[i - 1], '+' | '-') && open(i - 1))
}

/// Indexed terms of `fields` that start with `stem`, as a parser group.
/// No match leaves the bare stem, which matches nothing.
fn prefix_group(searcher: &Searcher, fields: &[Field], stem: &str) -> anyhow::Result<String> {
    let mut terms = BTreeSet::new();
    for segment in searcher.segment_readers() {
        for &field in fields {
            let inverted = segment.inverted_index(field)?;
            let mut stream = inverted.terms().range().ge(stem.as_bytes()).into_stream()?;
            while stream.advance() {
                let key = stream.key();
                if !key.starts_with(stem.as_bytes()) {
                    break;
                }
                if let Ok(term) = std::str::from_utf8(key) {
                    terms.insert(term.to_string());
                }
            }
        }
    }
    if terms.is_empty() {
        return Ok(stem.to_string());
    }
    Ok(format!("({})", terms.into_iter().collect::<Vec<_>>().join(" ")))
}

/// Rewrites every bare `stem*` term of `query` into the group of indexed
/// terms it covers. Operators around the term and quoted phrases are left
/// untouched.
fn expand_prefixes(searcher: &Searcher, fields: &[Field], query: &str) -> anyhow::Result<String> {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len());
    let mut in_phrase = false;
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            in_phrase = !in_phrase;
        } else if !in_phrase && ch.is_alphanumeric() && starts_term(&chars, i) {
            let end = chars[i..]
                .iter()
                .position(|c| !c.is_alphanumeric())
                .map_or(chars.len(), |n| i + n);
            let word: String = chars[i..end].iter().collect();
            let is_prefix = chars.get(end) == Some(&'*')
                && chars.get(end + 1).is_none_or(|c| c.is_whitespace() || *c == ')');
            if is_prefix {
                out.push_str(&prefix_group(searcher, fields, &word.to_lowercase())?);
                i = end + 1;
            } else {
                out.push_str(&word);
                i = end;
            }
            continue;
        }
        out.push(ch);
        i += 1;
    }
    Ok(out)
}

fn malformed(query: &str, reason: impl ToString) -> anyhow::Error {
    DatasetError::MalformedQuery {
        query: query.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn build_query(
    index: &Index,
    searcher: &Searcher,
    fields: IndexFields,
    query: &str,
) -> anyhow::Result<Box<dyn Query>> {
    if query.trim().is_empty() {
        return Err(malformed(query, "empty query"));
    }
    let text_fields = vec![fields.subject, fields.body];
    let expanded = expand_prefixes(searcher, &text_fields, query)?;
    let parser = QueryParser::for_index(index, text_fields);
    parser.parse_query(&expanded).map_err(|e| malformed(query, e))
}

/// Runs `query` over subject and body and returns the distinct thread roots
/// of the hits in relevance order, at most `max_results` of them.
pub fn search_index(index_dir: &Path, query: &str, max_results: usize) -> anyhow::Result<Vec<MessageId>> {
    let index = Index::open_in_dir(index_dir)
        .with_context(|| format!("opening index {}", index_dir.display()))?;
    let fields = IndexFields::from_schema(&index.schema())?;
    let reader = index.reader().context("opening index reader")?;
    let searcher = reader.searcher();
    let query_obj = build_query(&index, &searcher, fields, query)?;
    let limit = searcher.num_docs() as usize;
    if limit == 0 || max_results == 0 {
        return Ok(Vec::new());
    }

    let hits = searcher.search(query_obj.as_ref(), &TopDocs::with_limit(limit))?;
    let mut seen = HashSet::new();
    let mut roots = Vec::new();
    for (_score, address) in hits {
        let doc: TantivyDocument = searcher.doc(address)?;
        let Some(root) = doc.get_first(fields.root_id).and_then(|v| v.as_i64()) else {
            continue;
        };
        if seen.insert(root) {
            roots.push(root);
            if roots.len() >= max_results {
                break;
            }
        }
    }
    debug!(query, hits = roots.len(), "index searched");
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use core_model::NewMessage;
    use std::sync::Mutex;

    fn msg(id: &str, reply: Option<&str>, secs: i64, subject: &str, body: &str) -> NewMessage {
        NewMessage {
            message_id: id.to_string(),
            in_reply_to: reply.map(str::to_string),
            subject: subject.to_string(),
            sent_from: format!("{id}@example.org"),
            date: Utc.timestamp_opt(secs, 0).unwrap(),
            body: body.to_string(),
        }
    }

    fn seeded() -> (SqliteStore, Vec<MessageId>) {
        let mut store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let msgs = [
            msg("a", None, 100, "Budget", "draft numbers"),
            msg("b", Some("a"), 200, "Re: Budget", "approved budget"),
            msg("c", None, 300, "Meeting", "room booked"),
            msg("d", Some("c"), 400, "Re: Meeting", "bring the budget sheet"),
            msg("e", None, 500, "Spam", "budget lottery"),
        ];
        let mut batch = store.begin_import().unwrap();
        let mut ids = Vec::new();
        for m in &msgs {
            let parent = match &m.in_reply_to {
                Some(r) => batch.find_id(r).unwrap(),
                None => None,
            };
            ids.push(batch.insert(m, parent).unwrap().unwrap());
        }
        batch.commit().unwrap();
        (store, ids)
    }

    #[test]
    fn worker_count_has_floor() {
        assert_eq!(IndexOptions { workers: Some(0) }.worker_count(), 1);
        assert_eq!(IndexOptions { workers: Some(3) }.worker_count(), 3);
        assert!(IndexOptions::default().worker_count() >= 1);
    }

    fn indexed(store: &SqliteStore) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let index_dir = dir.path().join("index");
        rebuild_index(store, &index_dir, &IndexOptions { workers: Some(1) }, &|_| {}).unwrap();
        (dir, index_dir)
    }

    #[test]
    fn prefixes_expand_in_place() {
        let (store, _) = seeded();
        let (_dir, index_dir) = indexed(&store);
        let index = Index::open_in_dir(&index_dir).unwrap();
        let fields = IndexFields::from_schema(&index.schema()).unwrap();
        let searcher = index.reader().unwrap().searcher();
        let text = [fields.subject, fields.body];

        let expand = |q: &str| expand_prefixes(&searcher, &text, q).unwrap();
        assert_eq!(expand("+room Dra*"), "+room (draft)");
        assert_eq!(expand("b* AND -x"), "(booked bring budget) AND -x");
        assert_eq!(expand("zzz*"), "zzz");
        assert_eq!(expand("\"draft num\"*"), "\"draft num\"*");
        assert_eq!(expand("re-boo*"), "re-boo*");
    }

    #[test]
    fn prefixes_keep_boolean_operators() {
        let (store, ids) = seeded();
        let (_dir, index_dir) = indexed(&store);

        assert_eq!(search_index(&index_dir, "+room draf*", 10).unwrap(), vec![ids[2]]);
        assert_eq!(search_index(&index_dir, "bud* AND lottery", 10).unwrap(), vec![ids[4]]);
        assert_eq!(search_index(&index_dir, "draf* AND room", 10).unwrap(), Vec::<MessageId>::new());

        let mut roots = search_index(&index_dir, "-lottery bud*", 10).unwrap();
        roots.sort();
        assert_eq!(roots, vec![ids[0], ids[2]]);
    }

    #[test]
    fn rebuild_then_search_reports_roots() {
        let (mut store, ids) = seeded();
        store.set_hidden(ids[4], true).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let index_dir = dir.path().join("index");

        let events = Mutex::new(Vec::new());
        let report = rebuild_index(
            &store,
            &index_dir,
            &IndexOptions { workers: Some(2) },
            &|p| events.lock().unwrap().push(p),
        )
        .unwrap();
        assert_eq!(report.indexed, 4);
        assert_eq!(report.partitions, 2);
        assert_eq!(report.failed_partitions, 0);
        let events = events.into_inner().unwrap();
        assert!(matches!(events.first(), Some(IndexProgress::Started { total: 4, .. })));
        assert!(matches!(events.last(), Some(IndexProgress::Committed { indexed: 4 })));

        let mut roots = search_index(&index_dir, "budget", 10).unwrap();
        roots.sort();
        assert_eq!(roots, vec![ids[0], ids[2]]);

        assert_eq!(search_index(&index_dir, "budget", 1).unwrap().len(), 1);
        assert_eq!(search_index(&index_dir, "room", 10).unwrap(), vec![ids[2]]);
        assert_eq!(search_index(&index_dir, "lottery", 10).unwrap(), Vec::<MessageId>::new());
        assert_eq!(search_index(&index_dir, "draf*", 10).unwrap(), vec![ids[0]]);
    }

    #[test]
    fn rebuild_replaces_previous_index() {
        let (mut store, ids) = seeded();
        let dir = tempfile::TempDir::new().unwrap();
        let index_dir = dir.path().join("index");
        rebuild_index(&store, &index_dir, &IndexOptions { workers: Some(1) }, &|_| {}).unwrap();
        assert_eq!(search_index(&index_dir, "lottery", 10).unwrap(), vec![ids[4]]);

        store.hide_by_body("%lottery%").unwrap();
        rebuild_index(&store, &index_dir, &IndexOptions { workers: Some(1) }, &|_| {}).unwrap();
        assert!(search_index(&index_dir, "lottery", 10).unwrap().is_empty());
    }

    #[test]
    fn malformed_queries_are_reported() {
        let (store, _) = seeded();
        let dir = tempfile::TempDir::new().unwrap();
        let index_dir = dir.path().join("index");
        rebuild_index(&store, &index_dir, &IndexOptions { workers: Some(1) }, &|_| {}).unwrap();
        for query in ["nosuchfield:budget", "   "] {
            let err = search_index(&index_dir, query, 10).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DatasetError>(),
                Some(DatasetError::MalformedQuery { .. })
            ));
        }
    }

    #[test]
    fn empty_store_builds_empty_index() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let index_dir = dir.path().join("index");
        let report =
            rebuild_index(&store, &index_dir, &IndexOptions { workers: Some(4) }, &|_| {}).unwrap();
        assert_eq!(report.indexed, 0);
        assert!(search_index(&index_dir, "anything", 5).unwrap().is_empty());
    }
}
