use std::{
    fs,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use core_model::{CURRENT_VERSION, DatasetError, DatasetLayout, MessagePreview};
use search::{Filter, IndexOptions, IndexProgress, IndexReport, SearchPage, find, rebuild_index, search_index};
use store_sqlite::SqliteStore;
use tracing::{info, warn};

use crate::package::{PackReport, extract_archive, unpack_target, write_archive};

/// An open dataset directory: the store connection plus the paths of its
/// index and metadata.
///
/// The connection sits behind a mutex so one handle can be shared between
/// worker threads. After [`Dataset::close`] every accessor fails with
/// [`DatasetError::Closed`].
pub struct Dataset {
    layout: DatasetLayout,
    store: Mutex<Option<SqliteStore>>,
}

fn invalid(path: &Path, reason: impl Into<String>) -> DatasetError {
    DatasetError::InvalidDataset {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

fn open_store(layout: &DatasetLayout) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::open(layout.store_file())?;
    let missing = store.missing_tables()?;
    if !missing.is_empty() {
        return Err(invalid(
            layout.root(),
            format!("store is missing tables: {}", missing.join(", ")),
        )
        .into());
    }
    Ok(store)
}

const REOPEN_ATTEMPTS: u32 = 3;
const REOPEN_BACKOFF: Duration = Duration::from_millis(50);

fn reopen_store(layout: &DatasetLayout) -> anyhow::Result<SqliteStore> {
    let mut attempt = 1;
    loop {
        match open_store(layout) {
            Ok(store) => return Ok(store),
            Err(err) if attempt < REOPEN_ATTEMPTS => {
                warn!(root = %layout.root().display(), attempt, error = %err, "reopen failed, retrying");
                thread::sleep(REOPEN_BACKOFF * attempt);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Combines the pack result with the reopen result. The store, if any,
/// goes back into the handle; a failed reopen leaves it closed and is
/// reported along with any pack error.
fn settle_export(
    archive: &Path,
    packed: anyhow::Result<PackReport>,
    reopened: anyhow::Result<SqliteStore>,
) -> (Option<SqliteStore>, anyhow::Result<PackReport>) {
    match (packed, reopened) {
        (packed, Ok(store)) => {
            if let Err(err) = &packed {
                warn!(archive = %archive.display(), error = %err, "export failed, dataset reopened");
            }
            (Some(store), packed)
        }
        (Ok(_), Err(reopen)) => {
            tracing::error!(archive = %archive.display(), error = %reopen, "archive written but dataset could not be reopened");
            (
                None,
                Err(reopen.context(format!(
                    "archive {} was written but the dataset is now closed",
                    archive.display()
                ))),
            )
        }
        (Err(pack), Err(reopen)) => {
            tracing::error!(
                archive = %archive.display(),
                pack_error = %pack,
                reopen_error = %reopen,
                "export failed and dataset could not be reopened"
            );
            (
                None,
                Err(pack.context(format!(
                    "export failed and the dataset could not be reopened: {reopen:#}"
                ))),
            )
        }
    }
}

impl Dataset {
    /// Opens a dataset directory, or a `.zip` archive of one.
    ///
    /// An archive is unpacked into a fresh sibling directory first (see
    /// [`unpack_target`]) and the handle points at that directory.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let t = Instant::now();
        let root = if path.is_dir() {
            path.to_path_buf()
        } else if path.is_file() && is_zip(path) {
            let dest = unpack_target(path)?;
            if let Err(err) = extract_archive(path, &dest) {
                if let Err(cleanup) = fs::remove_dir_all(&dest) {
                    warn!(dest = %dest.display(), error = %cleanup, "could not remove partial extraction");
                }
                return Err(err);
            }
            dest
        } else {
            return Err(invalid(path, "expected a dataset directory or a .zip archive").into());
        };

        let layout = DatasetLayout::new(root);
        if !layout.is_complete() {
            return Err(invalid(layout.root(), "store file or index directory missing").into());
        }
        let version = layout.read_version()?;
        if version < CURRENT_VERSION {
            return Err(DatasetError::OutdatedVersion {
                path: layout.root().to_path_buf(),
                found: version,
                expected: CURRENT_VERSION,
            }
            .into());
        }
        if version > CURRENT_VERSION {
            return Err(invalid(
                layout.root(),
                format!("version {version} is newer than supported version {CURRENT_VERSION}"),
            )
            .into());
        }
        let store = open_store(&layout)?;
        info!(root = %layout.root().display(), elapsed = ?t.elapsed(), "dataset opened");
        Ok(Self {
            layout,
            store: Mutex::new(Some(store)),
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    fn lock(&self) -> MutexGuard<'_, Option<SqliteStore>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Runs `f` against the open store.
    pub fn with_store<T>(
        &self,
        f: impl FnOnce(&mut SqliteStore) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut guard = self.lock();
        let store = guard.as_mut().ok_or(DatasetError::Closed)?;
        f(store)
    }

    /// Compacts and releases the store. With `repack_to`, the dataset is
    /// also written to that archive.
    pub fn close(&self, repack_to: Option<&Path>) -> anyhow::Result<Option<PackReport>> {
        let store = self.lock().take().ok_or(DatasetError::Closed)?;
        store.compact()?;
        store.close()?;
        info!(root = %self.layout.root().display(), "dataset closed");
        repack_to
            .map(|dest| write_archive(&self.layout, dest))
            .transpose()
    }

    /// Writes the dataset to `archive` and keeps the handle open.
    ///
    /// The store is closed while packing and reopened afterwards, also when
    /// packing fails. If it cannot be reopened the handle stays closed and
    /// the error says so.
    pub fn export(&self, archive: &Path) -> anyhow::Result<PackReport> {
        let mut guard = self.lock();
        let store = guard.take().ok_or(DatasetError::Closed)?;
        if let Err(err) = store.compact() {
            *guard = Some(store);
            return Err(err);
        }
        let packed = store
            .close()
            .and_then(|()| write_archive(&self.layout, archive));
        let (store, result) = settle_export(archive, packed, reopen_store(&self.layout));
        *guard = store;
        result
    }

    /// Rebuilds the full-text index from the store.
    pub fn regenerate_index(
        &self,
        options: &IndexOptions,
        on_progress: &(dyn Fn(IndexProgress) + Sync),
    ) -> anyhow::Result<IndexReport> {
        let index_dir = self.layout.index_dir();
        self.with_store(|store| rebuild_index(store, &index_dir, options, on_progress))
    }

    pub fn find(&self, page: usize, size: usize, filters: &[Filter]) -> anyhow::Result<SearchPage> {
        self.with_store(|store| find(store, page, size, filters))
    }

    /// Thread roots matching `query`, best match first.
    pub fn search(&self, query: &str, max_results: usize) -> anyhow::Result<Vec<MessagePreview>> {
        let ids = search_index(&self.layout.index_dir(), query, max_results)?;
        self.with_store(|store| {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                match store.get_preview(id)? {
                    Some(preview) => out.push(preview),
                    None => warn!(id, "indexed root missing from store"),
                }
            }
            Ok(out)
        })
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("root", &self.layout.root())
            .field("open", &self.is_open())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        store
    }

    fn report() -> PackReport {
        PackReport { entries: 2, bytes: 10 }
    }

    #[test]
    fn settle_keeps_store_and_pack_error() {
        let archive = Path::new("out.zip");
        let (kept, result) = settle_export(archive, Ok(report()), Ok(store()));
        assert!(kept.is_some());
        assert_eq!(result.unwrap().entries, 2);

        let (kept, result) = settle_export(archive, Err(anyhow::anyhow!("disk full")), Ok(store()));
        assert!(kept.is_some());
        assert!(result.unwrap_err().to_string().contains("disk full"));
    }

    #[test]
    fn settle_reports_failed_reopen() {
        let archive = Path::new("out.zip");
        let (kept, result) = settle_export(archive, Ok(report()), Err(anyhow::anyhow!("locked")));
        assert!(kept.is_none());
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("out.zip was written"));
        assert!(msg.contains("locked"));

        let (kept, result) = settle_export(
            archive,
            Err(anyhow::anyhow!("disk full")),
            Err(anyhow::anyhow!("locked")),
        );
        assert!(kept.is_none());
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("disk full"));
        assert!(msg.contains("locked"));
    }

    #[test]
    fn reopen_gives_up_on_missing_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DatasetLayout::new(dir.path());
        SqliteStore::open(layout.store_file()).unwrap().close().unwrap();
        let Err(err) = reopen_store(&layout) else {
            panic!("store without tables reopened");
        };
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::InvalidDataset { .. })
        ));
    }
}
