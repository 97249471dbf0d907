use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, bail};
use chrono::{DateTime, TimeZone, Utc};
use core_model::{MessageSource, RawMessage};
use serde_json::Value;
use tracing::debug;

const EXTENSION: &str = "jsonl";

/// Reads messages from JSON Lines files, one object per line.
///
/// Recognised keys: `message_id`, `in_reply_to`, `subject`, `from`, `date`
/// (RFC 3339 text or epoch seconds), `body` and `charset`. Other keys are
/// ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlSource;

impl MessageSource for JsonlSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn discover_files(&self, location: &Path) -> anyhow::Result<Vec<PathBuf>> {
        if location.is_file() {
            return Ok(vec![location.to_path_buf()]);
        }
        if !location.is_dir() {
            bail!("source location {} does not exist", location.display());
        }
        collect_files_with_ext(location, EXTENSION)
    }

    fn read_file(&self, path: &Path) -> anyhow::Result<Vec<RawMessage>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut out = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let val: Value = serde_json::from_str(line)
                .with_context(|| format!("{} line {}: invalid JSON", path.display(), n + 1))?;
            out.push(parse_record(&val));
        }
        debug!(path = %path.display(), records = out.len(), "file read");
        Ok(out)
    }
}

/// Every file under `root` with extension `ext`, sorted. An unreadable
/// directory or entry is an error.
pub fn collect_files_with_ext(root: &Path, ext: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("inspecting {}", path.display()))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn text(val: &Value, key: &str) -> Option<String> {
    val.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

pub fn parse_record(val: &Value) -> RawMessage {
    RawMessage {
        message_id: text(val, "message_id"),
        in_reply_to: text(val, "in_reply_to"),
        subject: text(val, "subject"),
        sent_from: text(val, "from"),
        date: extract_date(val).unwrap_or_default(),
        body: text(val, "body"),
        charset: text(val, "charset"),
    }
}

pub fn extract_date(val: &Value) -> Option<DateTime<Utc>> {
    match val.get("date")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}
