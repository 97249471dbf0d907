//! One-way upgrade of version 1 datasets.

use std::{collections::HashMap, fs, path::Path, time::Instant};

use anyhow::Context;
use core_model::{CURRENT_VERSION, DatasetError, DatasetLayout};
use ingest::resolve_threads;
use search::{IndexOptions, rebuild_index};
use store_sqlite::{SqliteStore, legacy::LegacyStore};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub messages: usize,
    pub hidden: usize,
    pub tag_links: usize,
    pub dropped_tag_links: usize,
    pub mutations: usize,
    pub indexed: usize,
}

/// Rewrites the version 1 dataset at `source` into a new dataset at
/// `destination`.
///
/// Messages are replayed through the thread resolver in date order, so a
/// reply is only linked when its target is older. Tags are recreated by
/// name, hidden flags and audit descriptions are carried over, then the
/// index is rebuilt and the metadata written. `source` is only read.
pub fn upgrade_v1(
    source: &Path,
    destination: &Path,
    options: &IndexOptions,
) -> anyhow::Result<UpgradeReport> {
    let t = Instant::now();
    let src = DatasetLayout::new(source);
    if !src.store_file().is_file() {
        return Err(DatasetError::InvalidDataset {
            path: source.to_path_buf(),
            reason: "no store file".to_string(),
        }
        .into());
    }
    let version = src.read_version()?;
    if version != 1 {
        return Err(DatasetError::InvalidDataset {
            path: source.to_path_buf(),
            reason: format!("expected version 1, found {version}"),
        }
        .into());
    }
    let dest = DatasetLayout::new(destination);
    if dest.store_file().exists() {
        return Err(DatasetError::InvalidDataset {
            path: destination.to_path_buf(),
            reason: "destination already holds a dataset".to_string(),
        }
        .into());
    }
    fs::create_dir_all(destination)
        .with_context(|| format!("creating {}", destination.display()))?;

    let legacy = LegacyStore::open(src.store_file())?;
    let mut store = SqliteStore::open(dest.store_file())?;
    store.init_schema()?;

    let mut report = UpgradeReport::default();
    let rows = legacy.messages()?;
    let hidden: Vec<String> = rows
        .iter()
        .filter(|m| m.hidden)
        .map(|m| m.message.message_id.clone())
        .collect();
    let (resolved, assigned) =
        resolve_threads(&mut store, rows.into_iter().map(|m| m.message).collect())?;
    report.messages = resolved.inserted;
    let ids: HashMap<String, i64> = assigned.into_iter().collect();

    for message_id in &hidden {
        if let Some(&id) = ids.get(message_id) {
            store.set_hidden(id, true)?;
            report.hidden += 1;
        }
    }

    for (message_id, tag) in legacy.tag_links()? {
        match ids.get(&message_id) {
            Some(&id) => {
                store.add_tag_by_name(id, &tag)?;
                report.tag_links += 1;
            }
            None => {
                warn!(%message_id, %tag, "tag on unknown message dropped");
                report.dropped_tag_links += 1;
            }
        }
    }

    for entry in legacy.mutations()? {
        store.import_mutation(&entry, &[])?;
        report.mutations += 1;
    }

    let index = rebuild_index(&store, &dest.index_dir(), options, &|_| {})?;
    report.indexed = index.indexed;
    dest.write_version(CURRENT_VERSION)?;
    store.close()?;

    info!(
        source = %source.display(),
        destination = %destination.display(),
        messages = report.messages,
        tags = report.tag_links,
        mutations = report.mutations,
        elapsed = ?t.elapsed(),
        "dataset upgraded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_current_datasets() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DatasetLayout::new(dir.path());
        fs::write(layout.store_file(), b"").unwrap();
        layout.write_version(CURRENT_VERSION).unwrap();
        let err = upgrade_v1(dir.path(), &dir.path().join("out"), &IndexOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::InvalidDataset { .. })
        ));
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn rejects_missing_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = upgrade_v1(dir.path(), &dir.path().join("out"), &IndexOptions::default())
            .unwrap_err();
        assert!(err.downcast_ref::<DatasetError>().is_some());
    }
}
