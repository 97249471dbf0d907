use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use core_model::{CURRENT_VERSION, DatasetLayout, MessageSource, NewMessage, RawMessage};
use rayon::prelude::*;
use search::{IndexOptions, IndexProgress, rebuild_index};
use store_sqlite::SqliteStore;
use tracing::{debug, info};

use crate::{resolve::resolve_threads, sanitize::sanitize};

#[derive(Debug, Clone)]
pub enum GenerationPhase {
    Discovering { location: PathBuf },
    ReadingFiles { location: PathBuf, file_count: usize },
    FileRead { path: PathBuf, messages: usize },
    Resolving { message_count: usize },
    Indexing(IndexProgress),
    Done(GenerationReport),
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub index: IndexOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub files_read: usize,
    pub messages_read: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub unresolved_parents: usize,
    pub indexed: usize,
}

fn read_location(
    source: &dyn MessageSource,
    location: &Path,
    on_progress: &(dyn Fn(GenerationPhase) + Sync),
) -> anyhow::Result<Vec<Vec<RawMessage>>> {
    on_progress(GenerationPhase::Discovering {
        location: location.to_path_buf(),
    });
    let files = source
        .discover_files(location)
        .with_context(|| format!("discovering files in {}", location.display()))?;
    on_progress(GenerationPhase::ReadingFiles {
        location: location.to_path_buf(),
        file_count: files.len(),
    });
    files
        .par_iter()
        .map(|path| {
            let raw = source
                .read_file(path)
                .with_context(|| format!("reading {}", path.display()))?;
            on_progress(GenerationPhase::FileRead {
                path: path.clone(),
                messages: raw.len(),
            });
            Ok(raw)
        })
        .collect()
}

/// Builds a dataset at `destination` from every file `source` finds under
/// `locations`.
///
/// Safe to rerun on an existing destination: stored messages are kept and
/// only new message ids are added, then the index is rebuilt.
pub fn generate(
    locations: &[PathBuf],
    destination: &Path,
    source: &dyn MessageSource,
    options: &GenerationOptions,
    on_progress: &(dyn Fn(GenerationPhase) + Sync),
) -> anyhow::Result<GenerationReport> {
    let t = Instant::now();
    fs::create_dir_all(destination)
        .with_context(|| format!("creating dataset dir {}", destination.display()))?;
    let layout = DatasetLayout::new(destination);
    let mut store = SqliteStore::open(layout.store_file())?;
    store.init_schema()?;

    let mut report = GenerationReport::default();
    let mut messages: Vec<NewMessage> = Vec::new();
    for location in locations {
        for raw_file in read_location(source, location, on_progress)? {
            report.files_read += 1;
            report.messages_read += raw_file.len();
            for raw in raw_file {
                match sanitize(raw) {
                    Ok(msg) => messages.push(msg),
                    Err(reason) => {
                        debug!(?reason, "record skipped");
                        report.skipped += 1;
                    }
                }
            }
        }
    }

    on_progress(GenerationPhase::Resolving {
        message_count: messages.len(),
    });
    let (resolved, _) = resolve_threads(&mut store, messages)?;
    report.inserted = resolved.inserted;
    report.duplicates = resolved.duplicates;
    report.unresolved_parents = resolved.unresolved_parents;

    let index = rebuild_index(
        &store,
        &layout.index_dir(),
        &options.index,
        &|p| on_progress(GenerationPhase::Indexing(p)),
    )?;
    report.indexed = index.indexed;
    layout.write_version(CURRENT_VERSION)?;
    store.close()?;

    info!(
        source = source.name(),
        files = report.files_read,
        inserted = report.inserted,
        skipped = report.skipped,
        indexed = report.indexed,
        elapsed = ?t.elapsed(),
        "dataset generated"
    );
    on_progress(GenerationPhase::Done(report.clone()));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use search::{find, search_index, Filter};
    use std::{collections::HashMap, sync::Mutex};

    struct MemorySource {
        files: HashMap<PathBuf, Vec<RawMessage>>,
    }

    impl MessageSource for MemorySource {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn discover_files(&self, location: &Path) -> anyhow::Result<Vec<PathBuf>> {
            let mut files: Vec<PathBuf> = self
                .files
                .keys()
                .filter(|p| p.starts_with(location))
                .cloned()
                .collect();
            files.sort();
            Ok(files)
        }

        fn read_file(&self, path: &Path) -> anyhow::Result<Vec<RawMessage>> {
            self.files
                .get(path)
                .cloned()
                .with_context(|| format!("no such file {}", path.display()))
        }
    }

    fn raw(id: &str, reply: Option<&str>, secs: i64, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            message_id: Some(format!("<{id}>")),
            in_reply_to: reply.map(|r| format!("<{r}>")),
            subject: Some(subject.to_string()),
            sent_from: Some(format!("{id}@example.org")),
            date: Utc.timestamp_opt(secs, 0).unwrap(),
            body: Some(body.to_string()),
            charset: Some("UTF-8".to_string()),
        }
    }

    fn source() -> MemorySource {
        let mut files = HashMap::new();
        files.insert(
            PathBuf::from("/in/a.jsonl"),
            vec![
                raw("budget", None, 100, "Budget", "Q3 numbers"),
                raw("budget-re", Some("budget"), 200, "Re: Budget", "> Q3 numbers\nlooks good"),
            ],
        );
        files.insert(
            PathBuf::from("/in/b.jsonl"),
            vec![
                raw("meeting", None, 300, "Meeting", "tuesday at ten"),
                RawMessage {
                    charset: None,
                    ..raw("nocharset", None, 400, "x", "y")
                },
            ],
        );
        MemorySource { files }
    }

    #[test]
    fn generates_store_index_and_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("ds");
        let phases = Mutex::new(Vec::new());
        let report = generate(
            &[PathBuf::from("/in")],
            &dest,
            &source(),
            &GenerationOptions {
                index: IndexOptions { workers: Some(2) },
            },
            &|p| phases.lock().unwrap().push(p),
        )
        .unwrap();

        assert_eq!(report.files_read, 2);
        assert_eq!(report.messages_read, 4);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.indexed, 3);
        assert!(matches!(
            phases.lock().unwrap().last(),
            Some(GenerationPhase::Done(_))
        ));

        let layout = DatasetLayout::new(&dest);
        assert!(layout.is_complete());
        assert_eq!(layout.read_version().unwrap(), CURRENT_VERSION);

        let store = SqliteStore::open(layout.store_file()).unwrap();
        let roots = find(&store, 1, 10, &[Filter::Root(true)]).unwrap();
        assert_eq!(roots.total, 2);
        let reply = store.find_id_by_message_id("budget-re").unwrap().unwrap();
        assert_eq!(store.get_body(reply).unwrap().as_deref(), Some("looks good\n"));

        let budget = store.find_id_by_message_id("budget").unwrap().unwrap();
        assert_eq!(search_index(&layout.index_dir(), "looks", 10).unwrap(), vec![budget]);
    }

    #[test]
    fn rerun_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("ds");
        let src = source();
        let opts = GenerationOptions::default();
        generate(&[PathBuf::from("/in")], &dest, &src, &opts, &|_| {}).unwrap();
        let again = generate(&[PathBuf::from("/in")], &dest, &src, &opts, &|_| {}).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 3);
        assert_eq!(again.indexed, 3);
    }

    #[test]
    fn failing_file_aborts() {
        struct Broken;
        impl MessageSource for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn discover_files(&self, _location: &Path) -> anyhow::Result<Vec<PathBuf>> {
                Ok(vec![PathBuf::from("bad.jsonl")])
            }
            fn read_file(&self, _path: &Path) -> anyhow::Result<Vec<RawMessage>> {
                anyhow::bail!("unreadable")
            }
        }
        let dir = tempfile::TempDir::new().unwrap();
        let err = generate(
            &[PathBuf::from("/in")],
            &dir.path().join("ds"),
            &Broken,
            &GenerationOptions::default(),
            &|_| {},
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unreadable"));
    }
}
