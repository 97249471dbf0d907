use std::fmt;

use chrono::{DateTime, Utc};
use core_model::{MessageId, TagId};
use rusqlite::types::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    IncludeAny,
    ExcludeAny,
}

/// One predicate over messages. A list of filters matches what every
/// member matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Hidden(bool),
    Root(bool),
    Tags { ids: Vec<TagId>, mode: TagMode },
    IdIn(Vec<MessageId>),
    /// Inclusive on both ends.
    DateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    BodyContains(String),
    SubjectContains(String),
    ParentId(MessageId),
    Or(Vec<Filter>),
}

/// A SQL condition over the message table aliased as `m`, with anonymous
/// `?` placeholders bound from `values` in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub sql: String,
    pub values: Vec<Value>,
}

impl Condition {
    fn new(sql: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn integers(ids: &[i64]) -> Vec<Value> {
    ids.iter().copied().map(Value::Integer).collect()
}

impl Filter {
    /// `None` means the filter does not constrain anything.
    pub fn compile(&self) -> Option<Condition> {
        match self {
            Filter::Hidden(hidden) => Some(Condition::new(
                "m.hidden = ?",
                vec![Value::Integer(i64::from(*hidden))],
            )),
            Filter::Root(true) => Some(Condition::new("m.parent_id IS NULL", vec![])),
            Filter::Root(false) => Some(Condition::new("m.parent_id IS NOT NULL", vec![])),
            Filter::Tags { ids, mode } => match (mode, ids.is_empty()) {
                (TagMode::IncludeAny, true) => Some(Condition::new(
                    "NOT EXISTS (SELECT 1 FROM email_tag et WHERE et.email_id = m.id)",
                    vec![],
                )),
                (TagMode::ExcludeAny, true) => None,
                (TagMode::IncludeAny, false) => Some(Condition::new(
                    format!(
                        "EXISTS (SELECT 1 FROM email_tag et WHERE et.email_id = m.id AND et.tag_id IN ({}))",
                        placeholders(ids.len())
                    ),
                    integers(ids),
                )),
                (TagMode::ExcludeAny, false) => Some(Condition::new(
                    format!(
                        "NOT EXISTS (SELECT 1 FROM email_tag et WHERE et.email_id = m.id AND et.tag_id IN ({}))",
                        placeholders(ids.len())
                    ),
                    integers(ids),
                )),
            },
            Filter::IdIn(ids) if ids.is_empty() => Some(Condition::new("1 = 0", vec![])),
            Filter::IdIn(ids) => Some(Condition::new(
                format!("m.id IN ({})", placeholders(ids.len())),
                integers(ids),
            )),
            Filter::DateRange { start, end } => Some(Condition::new(
                "m.date BETWEEN ? AND ?",
                vec![
                    Value::Integer(start.timestamp()),
                    Value::Integer(end.timestamp()),
                ],
            )),
            Filter::BodyContains(text) => contains("m.body", text),
            Filter::SubjectContains(text) => contains("m.subject", text),
            Filter::ParentId(id) => Some(Condition::new("m.parent_id = ?", vec![Value::Integer(*id)])),
            Filter::Or(members) => {
                let mut parts = Vec::with_capacity(members.len());
                let mut values = Vec::new();
                for member in members {
                    let cond = member.compile()?;
                    parts.push(format!("({})", cond.sql));
                    values.extend(cond.values);
                }
                if parts.is_empty() {
                    return None;
                }
                Some(Condition::new(format!("({})", parts.join(" OR ")), values))
            }
        }
    }
}

fn contains(column: &str, text: &str) -> Option<Condition> {
    if text.is_empty() {
        return None;
    }
    Some(Condition::new(
        format!("instr(lower({column}), lower(?)) > 0"),
        vec![Value::Text(text.to_string())],
    ))
}

/// AND of every constraining filter; `None` when nothing constrains.
pub fn compile_all(filters: &[Filter]) -> Option<Condition> {
    let mut parts = Vec::new();
    let mut values = Vec::new();
    for cond in filters.iter().filter_map(Filter::compile) {
        parts.push(format!("({})", cond.sql));
        values.extend(cond.values);
    }
    if parts.is_empty() {
        None
    } else {
        Some(Condition::new(parts.join(" AND "), values))
    }
}

fn write_ids(f: &mut fmt::Formatter<'_>, ids: &[i64]) -> fmt::Result {
    let joined = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
    write!(f, "[{joined}]")
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Hidden(hidden) => write!(f, "hidden = {hidden}"),
            Filter::Root(root) => write!(f, "root = {root}"),
            Filter::Tags { ids, mode } => {
                let mode = match mode {
                    TagMode::IncludeAny => "include any",
                    TagMode::ExcludeAny => "exclude any",
                };
                write!(f, "tags {mode} ")?;
                write_ids(f, ids)
            }
            Filter::IdIn(ids) => {
                write!(f, "id in ")?;
                write_ids(f, ids)
            }
            Filter::DateRange { start, end } => {
                write!(f, "date between {} and {}", start.to_rfc3339(), end.to_rfc3339())
            }
            Filter::BodyContains(text) => write!(f, "body contains {text:?}"),
            Filter::SubjectContains(text) => write!(f, "subject contains {text:?}"),
            Filter::ParentId(id) => write!(f, "parent = {id}"),
            Filter::Or(members) => {
                let joined = members
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" OR ");
                write!(f, "({joined})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tag_sets() {
        let include = Filter::Tags {
            ids: vec![],
            mode: TagMode::IncludeAny,
        };
        assert!(include.compile().unwrap().sql.starts_with("NOT EXISTS"));
        let exclude = Filter::Tags {
            ids: vec![],
            mode: TagMode::ExcludeAny,
        };
        assert!(exclude.compile().is_none());
    }

    #[test]
    fn id_list_binds_each_value() {
        let cond = Filter::IdIn(vec![3, 9]).compile().unwrap();
        assert_eq!(cond.sql, "m.id IN (?, ?)");
        assert_eq!(cond.values, vec![Value::Integer(3), Value::Integer(9)]);
        assert_eq!(Filter::IdIn(vec![]).compile().unwrap().sql, "1 = 0");
    }

    #[test]
    fn or_is_unconstrained_when_any_member_is() {
        assert!(Filter::Or(vec![]).compile().is_none());
        let loose = Filter::Or(vec![
            Filter::Hidden(false),
            Filter::Tags {
                ids: vec![],
                mode: TagMode::ExcludeAny,
            },
        ]);
        assert!(loose.compile().is_none());
        let tight = Filter::Or(vec![Filter::Root(true), Filter::ParentId(4)]).compile().unwrap();
        assert_eq!(tight.sql, "((m.parent_id IS NULL) OR (m.parent_id = ?))");
        assert_eq!(tight.values, vec![Value::Integer(4)]);
    }

    #[test]
    fn compile_all_joins_with_and() {
        assert!(compile_all(&[]).is_none());
        let cond = compile_all(&[
            Filter::Hidden(false),
            Filter::SubjectContains(String::new()),
            Filter::BodyContains("Budget".to_string()),
        ])
        .unwrap();
        assert_eq!(
            cond.sql,
            "(m.hidden = ?) AND (instr(lower(m.body), lower(?)) > 0)"
        );
        assert_eq!(cond.values.len(), 2);
    }

    #[test]
    fn display_is_stable() {
        let filter = Filter::Or(vec![
            Filter::Hidden(true),
            Filter::Tags {
                ids: vec![1, 2],
                mode: TagMode::IncludeAny,
            },
            Filter::SubjectContains("q3".to_string()),
        ]);
        assert_eq!(
            filter.to_string(),
            "(hidden = true OR tags include any [1, 2] OR subject contains \"q3\")"
        );
    }
}
