use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_MAX_RESULTS: usize = 50;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub index: IndexConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub page_size: usize,
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct IndexConfig {
    /// Index workers; unset means one less than the available cores.
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mailidx")
            .join("config.toml")
    }

    /// Reads `path`, or the default location when `None`. A missing file
    /// gives the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file at {}", config_path.display()))
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.search.page_size == 0 {
            anyhow::bail!("search.page_size must be positive");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.search.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.search.max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(config.index.workers, None);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse("[search]\npage_size = 5\n\n[index]\nworkers = 3\n").unwrap();
        assert_eq!(config.search.page_size, 5);
        assert_eq!(config.search.max_results, DEFAULT_MAX_RESULTS);
        assert_eq!(config.index.workers, Some(3));
    }

    #[test]
    fn rejects_zero_page_size_and_bad_toml() {
        assert!(Config::parse("[search]\npage_size = 0\n").is_err());
        assert!(Config::parse("[search\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.search.page_size, DEFAULT_PAGE_SIZE);
    }
}
