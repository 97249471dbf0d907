use std::io::{self, IsTerminal};

use core_model::{MessagePreview, MutationEntry, Tag};
use owo_colors::OwoColorize;
use search::SearchPage;
use serde::Serialize;

const SUBJECT_WIDTH: usize = 60;

#[derive(Serialize)]
pub struct JsonPage<'a> {
    pub page: usize,
    pub size: usize,
    pub total: i64,
    pub page_count: usize,
    pub previews: &'a [MessagePreview],
}

#[derive(Serialize)]
pub struct JsonSearchOutput<'a> {
    pub query: &'a str,
    pub roots: &'a [MessagePreview],
}

pub fn color_enabled() -> bool {
    io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

pub fn truncate_text(input: &str, max: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max {
            out.push_str("...");
            return out;
        }
        out.push(ch);
    }
    out
}

/// One line per preview: id, date, sender, subject. Hidden rows are dimmed
/// on a terminal and marked otherwise.
pub fn preview_line(p: &MessagePreview, depth: usize, use_color: bool) -> String {
    let subject = if p.subject.is_empty() {
        "(no subject)".to_string()
    } else {
        truncate_text(&p.subject, SUBJECT_WIDTH)
    };
    let line = format!(
        "{:>6}  {}  {:<28}  {}{}",
        p.id,
        p.date.format("%Y-%m-%d %H:%M"),
        truncate_text(&p.sent_from, 25),
        "  ".repeat(depth),
        subject
    );
    match (p.hidden, use_color) {
        (true, true) => line.dimmed().to_string(),
        (true, false) => format!("{line}  [hidden]"),
        (false, _) => line,
    }
}

pub fn print_page(page: &SearchPage, json: bool) -> anyhow::Result<()> {
    if json {
        let out = JsonPage {
            page: page.page,
            size: page.size,
            total: page.total,
            page_count: page.page_count(),
            previews: &page.previews,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    let use_color = color_enabled();
    for p in &page.previews {
        println!("{}", preview_line(p, 0, use_color));
    }
    let footer = format!(
        "page {}/{} ({} messages)",
        page.page,
        page.page_count().max(1),
        page.total
    );
    if use_color {
        println!("{}", footer.bold());
    } else {
        println!("{footer}");
    }
    Ok(())
}

pub fn print_search(query: &str, roots: &[MessagePreview], json: bool) -> anyhow::Result<()> {
    if json {
        let out = JsonSearchOutput { query, roots };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    let use_color = color_enabled();
    for p in roots {
        println!("{}", preview_line(p, 0, use_color));
    }
    Ok(())
}

/// Prints a thread as an indented tree. `thread` is in walk order with
/// parents before their replies.
pub fn print_thread(thread: &[MessagePreview], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(thread)?);
        return Ok(());
    }
    let use_color = color_enabled();
    let mut depths: Vec<(i64, usize)> = Vec::with_capacity(thread.len());
    for p in thread {
        let depth = p
            .parent_id
            .and_then(|parent| depths.iter().find(|(id, _)| *id == parent))
            .map_or(0, |(_, d)| d + 1);
        depths.push((p.id, depth));
        println!("{}", preview_line(p, depth, use_color));
    }
    Ok(())
}

pub fn print_tags(tags: &[(Tag, i64)], json: bool) -> anyhow::Result<()> {
    if json {
        let rows: Vec<_> = tags
            .iter()
            .map(|(tag, count)| serde_json::json!({ "tag": tag, "messages": count }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for (tag, count) in tags {
        let description = tag.description.as_deref().unwrap_or("");
        println!("{:>3}  {:<24} {:>6}  {}", tag.seq, tag.name, count, description);
    }
    Ok(())
}

pub fn print_mutations(entries: &[MutationEntry], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    for m in entries {
        println!(
            "{}  {:>6}  {}",
            m.performed_at.format("%Y-%m-%d %H:%M:%S"),
            m.affected_count,
            m.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn preview(hidden: bool) -> MessagePreview {
        MessagePreview {
            id: 12,
            parent_id: None,
            message_id: "a@x".to_string(),
            subject: "Budget".to_string(),
            sent_from: "ann@example.org".to_string(),
            date: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap(),
            hidden,
        }
    }

    #[test]
    fn truncates_on_chars() {
        assert_eq!(truncate_text("héllo", 3), "hél...");
        assert_eq!(truncate_text("hi", 3), "hi");
    }

    #[test]
    fn preview_line_marks_hidden_without_color() {
        let line = preview_line(&preview(true), 1, false);
        assert!(line.contains("2024-01-02 03:04"));
        assert!(line.contains("  Budget"));
        assert!(line.ends_with("[hidden]"));
        assert!(!preview_line(&preview(false), 0, false).contains("[hidden]"));
    }

    #[test]
    fn empty_subject_placeholder() {
        let mut p = preview(false);
        p.subject.clear();
        assert!(preview_line(&p, 0, false).ends_with("(no subject)"));
    }
}
