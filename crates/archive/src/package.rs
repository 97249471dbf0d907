//! Zip packaging of a dataset directory.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, bail};
use core_model::{
    DatasetError, DatasetLayout,
    layout::{INDEX_DIR, METADATA_FILE, STORE_FILE},
};
use tracing::{debug, info, warn};
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackReport {
    pub entries: usize,
    pub bytes: u64,
}

fn hash_reader(mut reader: impl io::Read) -> io::Result<blake3::Hash> {
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

fn entry_name(root: &Path, path: &Path) -> anyhow::Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Archive entry names mapped to the files they are read from.
fn collect_entries(layout: &DatasetLayout) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    let mut out = BTreeMap::new();
    out.insert(STORE_FILE.to_string(), layout.store_file());
    if layout.metadata_file().is_file() {
        out.insert(METADATA_FILE.to_string(), layout.metadata_file());
    }
    let mut stack = vec![layout.index_dir()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = entry_name(layout.root(), &path)?;
            if name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            out.insert(name, path);
        }
    }
    Ok(out)
}

/// Writes the dataset at `layout` into a zip file at `dest`.
///
/// The archive is first written next to `dest`, read back and checked
/// entry by entry against the source files, then moved into place. The
/// store must be closed while this runs.
pub fn write_archive(layout: &DatasetLayout, dest: &Path) -> anyhow::Result<PackReport> {
    let t = Instant::now();
    let entries = collect_entries(layout)?;
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    let result = write_entries(&entries, &partial).and_then(|report| {
        fs::rename(&partial, dest)
            .with_context(|| format!("moving archive into {}", dest.display()))?;
        Ok(report)
    });
    if result.is_err()
        && partial.exists()
        && let Err(cleanup) = fs::remove_file(&partial)
    {
        warn!(partial = %partial.display(), error = %cleanup, "could not remove partial archive");
    }
    let report = result?;
    info!(
        archive = %dest.display(),
        entries = report.entries,
        bytes = report.bytes,
        elapsed = ?t.elapsed(),
        "dataset packed"
    );
    Ok(report)
}

fn write_entries(entries: &BTreeMap<String, PathBuf>, path: &Path) -> anyhow::Result<PackReport> {
    let file =
        File::create(path).with_context(|| format!("creating archive {}", path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    zip.add_directory(format!("{INDEX_DIR}/"), options)?;
    let mut expected = BTreeMap::new();
    for (name, source) in entries {
        let hash = hash_reader(
            File::open(source).with_context(|| format!("opening {}", source.display()))?,
        )?;
        zip.start_file(name.as_str(), options)?;
        let mut reader = File::open(source)?;
        io::copy(&mut reader, &mut zip).with_context(|| format!("packing {name}"))?;
        expected.insert(name.clone(), hash);
        debug!(entry = %name, "entry packed");
    }
    zip.finish().context("finishing archive")?;

    verify_archive(path, &expected)?;
    Ok(PackReport {
        entries: expected.len(),
        bytes: fs::metadata(path)?.len(),
    })
}

/// Re-reads `path` and compares every file entry with `expected`.
fn verify_archive(path: &Path, expected: &BTreeMap<String, blake3::Hash>) -> anyhow::Result<()> {
    let mut archive = ZipArchive::new(File::open(path)?)
        .with_context(|| format!("re-reading archive {}", path.display()))?;
    let mut seen = 0;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some(want) = expected.get(&name) else {
            bail!("archive verification failed: unexpected entry {name}");
        };
        if hash_reader(entry)? != *want {
            bail!("archive verification failed: checksum mismatch for {name}");
        }
        seen += 1;
    }
    if seen != expected.len() {
        bail!(
            "archive verification failed: {seen} of {} entries present",
            expected.len()
        );
    }
    Ok(())
}

/// Picks the sibling directory an archive unpacks into: the archive stem,
/// prefixed with `_` until no file or directory of that name exists.
pub fn unpack_target(archive: &Path) -> anyhow::Result<PathBuf> {
    let stem = archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DatasetError::InvalidDataset {
            path: archive.to_path_buf(),
            reason: "archive has no file name".to_string(),
        })?;
    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    let mut name = stem;
    while parent.join(&name).exists() {
        name.insert(0, '_');
    }
    Ok(parent.join(name))
}

/// Unpacks `archive` into `dest`, which is created. Entries that would land
/// outside `dest` make the archive invalid.
pub fn extract_archive(archive: &Path, dest: &Path) -> anyhow::Result<()> {
    let invalid = |reason: String| DatasetError::InvalidDataset {
        path: archive.to_path_buf(),
        reason,
    };
    let file =
        File::open(archive).with_context(|| format!("opening archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(file).map_err(|e| invalid(format!("not a zip archive: {e}")))?;
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(invalid(format!("unsafe entry name {}", entry.name())).into());
        };
        let out = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut target =
            File::create(&out).with_context(|| format!("writing {}", out.display()))?;
        io::copy(&mut entry, &mut target)?;
    }
    info!(archive = %archive.display(), dest = %dest.display(), entries = zip.len(), "archive extracted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_dataset(root: &Path) -> DatasetLayout {
        let layout = DatasetLayout::new(root);
        fs::create_dir_all(layout.index_dir()).unwrap();
        fs::write(layout.store_file(), b"sqlite bytes").unwrap();
        fs::write(layout.index_dir().join("meta.json"), b"{}").unwrap();
        fs::write(layout.index_dir().join(".tantivy-writer.lock"), b"").unwrap();
        layout.write_version(2).unwrap();
        layout
    }

    #[test]
    fn packs_without_lock_files_and_unpacks() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = fake_dataset(&dir.path().join("ds"));
        let dest = dir.path().join("ds.zip");
        let report = write_archive(&layout, &dest).unwrap();
        assert_eq!(report.entries, 3);
        assert!(!dir.path().join("ds.zip.partial").exists());

        let target = unpack_target(&dest).unwrap();
        assert_eq!(target, dir.path().join("_ds"));
        extract_archive(&dest, &target).unwrap();
        let out = DatasetLayout::new(&target);
        assert!(out.is_complete());
        assert_eq!(fs::read(out.store_file()).unwrap(), b"sqlite bytes");
        assert!(!out.index_dir().join(".tantivy-writer.lock").exists());
        assert_eq!(out.read_version().unwrap(), 2);
    }

    #[test]
    fn unpack_target_skips_taken_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("mail.zip");
        assert_eq!(unpack_target(&archive).unwrap(), dir.path().join("mail"));
        fs::create_dir(dir.path().join("mail")).unwrap();
        fs::write(dir.path().join("_mail"), b"").unwrap();
        assert_eq!(unpack_target(&archive).unwrap(), dir.path().join("__mail"));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive = dir.path().join("bad.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();
        let err = extract_archive(&archive, &dir.path().join("bad")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::InvalidDataset { .. })
        ));
    }

    #[test]
    fn missing_store_fails_without_leaving_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DatasetLayout::new(dir.path().join("empty"));
        fs::create_dir_all(layout.index_dir()).unwrap();
        let dest = dir.path().join("empty.zip");
        assert!(write_archive(&layout, &dest).is_err());
        assert!(!dest.exists());
        assert!(!dir.path().join("empty.zip.partial").exists());
    }
}
