use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;

pub const STORE_FILE: &str = "database.db";
pub const INDEX_DIR: &str = "index";
pub const METADATA_FILE: &str = "metadata.properties";

/// Version written by this build. Datasets without a metadata file are
/// version 1.
pub const CURRENT_VERSION: u32 = 2;

/// Paths of the files that make up a dataset directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store_file(&self) -> PathBuf {
        self.root.join(STORE_FILE)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join(INDEX_DIR)
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// True when both the store file and the index directory exist.
    pub fn is_complete(&self) -> bool {
        self.store_file().is_file() && self.index_dir().is_dir()
    }

    pub fn read_version(&self) -> anyhow::Result<u32> {
        let path = self.metadata_file();
        if !path.exists() {
            return Ok(1);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading metadata {}", path.display()))?;
        parse_version(&content).with_context(|| format!("parsing metadata {}", path.display()))
    }

    pub fn write_version(&self, version: u32) -> anyhow::Result<()> {
        let path = self.metadata_file();
        fs::write(&path, format!("version={version}\n"))
            .with_context(|| format!("writing metadata {}", path.display()))
    }
}

/// Reads the `version` key from a properties file. A file without the key is
/// treated like a missing file.
fn parse_version(content: &str) -> anyhow::Result<u32> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some((key, value)) = line.split_once(['=', ':']) else {
            continue;
        };
        if key.trim() == "version" {
            return value
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid version value `{}`", value.trim()));
        }
    }
    Ok(1)
}
