use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use archive::{Dataset, upgrade_v1};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use core_model::{MessageId, Tag};
use ingest::{GenerationOptions, GenerationPhase, generate};
use jsonl_source::JsonlSource;
use search::{Filter, IndexOptions, IndexProgress, TagMode};
use store_sqlite::SqliteStore;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::Config;

#[derive(Parser)]
#[command(name = "mailidx")]
#[command(about = "Searchable archive of threaded email conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Config file; defaults to <config dir>/mailidx/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print results and logs as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or extend a dataset from JSON Lines message files.
    Generate {
        #[arg(long, short)]
        output: PathBuf,
        #[arg(required = true)]
        locations: Vec<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Page through messages matching filters.
    Find(FindArgs),
    /// Full-text search returning thread roots.
    Search {
        dataset: PathBuf,
        query: String,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Show the whole thread a message belongs to.
    Thread { dataset: PathBuf, id: MessageId },
    /// Hide messages by body or sender pattern (SQL LIKE syntax).
    Hide(HideArgs),
    /// Unhide one message.
    Unhide { dataset: PathBuf, id: MessageId },
    /// Permanently delete every hidden message.
    DeleteHidden { dataset: PathBuf },
    Tags {
        dataset: PathBuf,
        #[command(subcommand)]
        command: TagsCommand,
    },
    /// List the audit log of bulk changes.
    Mutations { dataset: PathBuf },
    /// Write the dataset to a zip archive.
    Export { dataset: PathBuf, archive: PathBuf },
    /// Rebuild the full-text index.
    Reindex {
        dataset: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Convert a version 1 dataset into a new current-version dataset.
    Upgrade { source: PathBuf, destination: PathBuf },
    /// Version, counts and store integrity.
    Info { dataset: PathBuf },
}

#[derive(Args)]
struct FindArgs {
    dataset: PathBuf,
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long)]
    size: Option<usize>,
    /// Include hidden messages.
    #[arg(long, default_value_t = false)]
    all: bool,
    #[arg(long, default_value_t = false)]
    roots: bool,
    /// Only messages carrying any of these tags.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Only messages carrying none of these tags.
    #[arg(long = "without-tag")]
    without_tags: Vec<String>,
    /// Only messages with no tags at all.
    #[arg(long, default_value_t = false)]
    untagged: bool,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    body: Option<String>,
    /// YYYY-MM-DD or RFC 3339, inclusive.
    #[arg(long)]
    after: Option<String>,
    /// YYYY-MM-DD or RFC 3339, inclusive.
    #[arg(long)]
    before: Option<String>,
}

#[derive(Args)]
#[command(group(ArgGroup::new("pattern").required(true).multiple(false)))]
struct HideArgs {
    dataset: PathBuf,
    #[arg(long, group = "pattern")]
    body: Option<String>,
    #[arg(long, group = "pattern")]
    sender: Option<String>,
    #[arg(long, group = "pattern")]
    id: Option<MessageId>,
}

#[derive(Subcommand)]
enum TagsCommand {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Tag a message; `--thread` tags its whole thread.
    Add {
        id: MessageId,
        name: String,
        #[arg(long, default_value_t = false)]
        thread: bool,
    },
    Remove {
        id: MessageId,
        name: String,
        #[arg(long, default_value_t = false)]
        thread: bool,
    },
    Rename { name: String, new_name: String },
    /// Move a tag to a 1-based position in the display order.
    Move { name: String, position: i64 },
    Delete { name: String },
}

fn init_logging(json: bool, default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn index_options(workers: Option<usize>, config: &Config) -> IndexOptions {
    IndexOptions {
        workers: workers.or(config.index.workers),
    }
}

fn log_index_progress(p: IndexProgress) {
    match p {
        IndexProgress::Started { total, partitions } => {
            info!(total, partitions, "indexing")
        }
        IndexProgress::PartitionDone { partition, indexed } => {
            debug!(partition, indexed, "partition indexed")
        }
        IndexProgress::PartitionFailed { partition } => {
            info!(partition, "partition failed")
        }
        IndexProgress::Committed { indexed } => info!(indexed, "index committed"),
    }
}

fn log_generation_progress(phase: GenerationPhase) {
    match phase {
        GenerationPhase::Discovering { location } => {
            info!(location = %location.display(), "discovering files")
        }
        GenerationPhase::ReadingFiles {
            location,
            file_count,
        } => info!(location = %location.display(), files = file_count, "reading files"),
        GenerationPhase::FileRead { path, messages } => {
            debug!(path = %path.display(), messages, "file read")
        }
        GenerationPhase::Resolving { message_count } => {
            info!(messages = message_count, "resolving threads")
        }
        GenerationPhase::Indexing(p) => log_index_progress(p),
        GenerationPhase::Done(_) => {}
    }
}

/// Accepts a plain date or a full RFC 3339 timestamp. A plain date means
/// its first second, or its last one when `end_of_day` is set.
fn parse_date(input: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("invalid date `{input}`, expected YYYY-MM-DD or RFC 3339"))?;
    let time = if end_of_day {
        day.and_hms_opt(23, 59, 59)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .with_context(|| format!("invalid date `{input}`"))
}

fn tag_named(store: &SqliteStore, name: &str) -> anyhow::Result<Tag> {
    store
        .get_tag_by_name(name)?
        .with_context(|| format!("no tag named `{name}`"))
}

fn build_filters(args: &FindArgs, store: &SqliteStore) -> anyhow::Result<Vec<Filter>> {
    let mut filters = Vec::new();
    if !args.all {
        filters.push(Filter::Hidden(false));
    }
    if args.roots {
        filters.push(Filter::Root(true));
    }
    if args.untagged {
        filters.push(Filter::Tags {
            ids: Vec::new(),
            mode: TagMode::IncludeAny,
        });
    }
    if !args.tags.is_empty() {
        let ids = args
            .tags
            .iter()
            .map(|n| tag_named(store, n).map(|t| t.id))
            .collect::<anyhow::Result<Vec<_>>>()?;
        filters.push(Filter::Tags {
            ids,
            mode: TagMode::IncludeAny,
        });
    }
    if !args.without_tags.is_empty() {
        let ids = args
            .without_tags
            .iter()
            .map(|n| tag_named(store, n).map(|t| t.id))
            .collect::<anyhow::Result<Vec<_>>>()?;
        filters.push(Filter::Tags {
            ids,
            mode: TagMode::ExcludeAny,
        });
    }
    if let Some(subject) = &args.subject {
        filters.push(Filter::SubjectContains(subject.clone()));
    }
    if let Some(body) = &args.body {
        filters.push(Filter::BodyContains(body.clone()));
    }
    if args.after.is_some() || args.before.is_some() {
        let start = match &args.after {
            Some(s) => parse_date(s, false)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        let end = match &args.before {
            Some(s) => parse_date(s, true)?,
            None => Utc::now(),
        };
        filters.push(Filter::DateRange { start, end });
    }
    Ok(filters)
}

fn open(path: &Path) -> anyhow::Result<Dataset> {
    info!(path = %path.display(), "opening dataset");
    Dataset::open(path)
}

fn run_tags(ds: &Dataset, command: TagsCommand, json: bool) -> anyhow::Result<()> {
    match command {
        TagsCommand::List => {
            let rows = ds.with_store(|s| {
                s.list_tags()?
                    .into_iter()
                    .map(|t| {
                        let n = s.count_messages_with_tag(t.id)?;
                        Ok((t, n))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })?;
            ui::print_tags(&rows, json)?;
        }
        TagsCommand::Create { name, description } => {
            let tag = ds.with_store(|s| s.create_tag(&name, description.as_deref()))?;
            println!("created tag {} ({})", tag.name, tag.id);
        }
        TagsCommand::Add { id, name, thread } => {
            let changed = ds.with_store(|s| {
                let tag = match s.get_tag_by_name(&name)? {
                    Some(tag) => tag,
                    None => s.create_tag(&name, None)?,
                };
                if thread {
                    let root = s.find_root_id(id)?.unwrap_or(id);
                    s.add_tag_recursive(root, tag.id)
                } else {
                    Ok(usize::from(s.add_tag(id, tag.id)?))
                }
            })?;
            println!("tagged {changed} message(s) with {name}");
        }
        TagsCommand::Remove { id, name, thread } => {
            let changed = ds.with_store(|s| {
                let tag = tag_named(s, &name)?;
                if thread {
                    let root = s.find_root_id(id)?.unwrap_or(id);
                    s.remove_tag_recursive(root, tag.id)
                } else {
                    Ok(usize::from(s.remove_tag(id, tag.id)?))
                }
            })?;
            println!("untagged {changed} message(s)");
        }
        TagsCommand::Rename { name, new_name } => {
            ds.with_store(|s| {
                let tag = tag_named(s, &name)?;
                s.rename_tag(tag.id, &new_name)
            })?;
            println!("renamed {name} to {new_name}");
        }
        TagsCommand::Move { name, position } => {
            ds.with_store(|s| {
                let tag = tag_named(s, &name)?;
                s.set_tag_seq(tag.id, position)
            })?;
            let rows = ds.with_store(|s| {
                s.list_tags()?
                    .into_iter()
                    .map(|t| {
                        let n = s.count_messages_with_tag(t.id)?;
                        Ok((t, n))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })?;
            ui::print_tags(&rows, json)?;
        }
        TagsCommand::Delete { name } => {
            ds.with_store(|s| {
                let tag = tag_named(s, &name)?;
                s.delete_tag(tag.id)
            })?;
            println!("deleted tag {name}");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(cli.json, &config.log.filter);
    let t = Instant::now();

    match cli.command {
        Commands::Generate {
            output,
            locations,
            workers,
        } => {
            let options = GenerationOptions {
                index: index_options(workers, &config),
            };
            let report = generate(&locations, &output, &JsonlSource, &options, &log_generation_progress)?;
            info!(elapsed = ?t.elapsed(), "generate done");
            println!(
                "files={} read={} inserted={} duplicates={} skipped={} unresolved={} indexed={}",
                report.files_read,
                report.messages_read,
                report.inserted,
                report.duplicates,
                report.skipped,
                report.unresolved_parents,
                report.indexed
            );
        }
        Commands::Find(args) => {
            let ds = open(&args.dataset)?;
            let filters = ds.with_store(|s| build_filters(&args, s))?;
            let size = args.size.unwrap_or(config.search.page_size);
            let page = ds.find(args.page, size, &filters)?;
            info!(total = page.total, elapsed = ?t.elapsed(), "find done");
            ui::print_page(&page, cli.json)?;
        }
        Commands::Search {
            dataset,
            query,
            max,
        } => {
            let ds = open(&dataset)?;
            let roots = ds.search(&query, max.unwrap_or(config.search.max_results))?;
            info!(query = %query, roots = roots.len(), elapsed = ?t.elapsed(), "search done");
            ui::print_search(&query, &roots, cli.json)?;
        }
        Commands::Thread { dataset, id } => {
            let ds = open(&dataset)?;
            let thread = ds.with_store(|s| {
                let root = s
                    .find_root_id(id)?
                    .with_context(|| format!("message {id} not found or its thread is broken"))?;
                s.thread(root)
            })?;
            ui::print_thread(&thread, cli.json)?;
        }
        Commands::Hide(args) => {
            let ds = open(&args.dataset)?;
            let hidden = ds.with_store(|s| match (&args.body, &args.sender, args.id) {
                (Some(pattern), _, _) => s.hide_by_body(pattern),
                (_, Some(pattern), _) => s.hide_by_sender(pattern),
                (_, _, Some(id)) => Ok(usize::from(s.set_hidden(id, true)?)),
                _ => Ok(0),
            })?;
            info!(hidden, elapsed = ?t.elapsed(), "hide done");
            println!("hidden {hidden} message(s); run `reindex` to update search results");
        }
        Commands::Unhide { dataset, id } => {
            let ds = open(&dataset)?;
            let changed = ds.with_store(|s| s.set_hidden(id, false))?;
            println!("unhidden {} message(s)", usize::from(changed));
        }
        Commands::DeleteHidden { dataset } => {
            let ds = open(&dataset)?;
            let deleted = ds.with_store(|s| s.delete_hidden())?;
            ds.regenerate_index(&index_options(None, &config), &log_index_progress)?;
            println!("deleted {deleted} message(s)");
        }
        Commands::Tags { dataset, command } => {
            let ds = open(&dataset)?;
            run_tags(&ds, command, cli.json)?;
        }
        Commands::Mutations { dataset } => {
            let ds = open(&dataset)?;
            let entries = ds.with_store(|s| s.list_mutations())?;
            ui::print_mutations(&entries, cli.json)?;
        }
        Commands::Export { dataset, archive } => {
            let ds = open(&dataset)?;
            let report = ds.export(&archive)?;
            info!(entries = report.entries, bytes = report.bytes, elapsed = ?t.elapsed(), "export done");
            println!("{}", archive.display());
        }
        Commands::Reindex { dataset, workers } => {
            let ds = open(&dataset)?;
            let report = ds.regenerate_index(&index_options(workers, &config), &log_index_progress)?;
            info!(elapsed = ?t.elapsed(), "reindex done");
            println!(
                "indexed={} skipped={} failed_partitions={}",
                report.indexed, report.skipped_without_body, report.failed_partitions
            );
        }
        Commands::Upgrade {
            source,
            destination,
        } => {
            let report = upgrade_v1(&source, &destination, &index_options(None, &config))?;
            info!(elapsed = ?t.elapsed(), "upgrade done");
            println!(
                "messages={} hidden={} tags={} dropped_tags={} mutations={} indexed={}",
                report.messages,
                report.hidden,
                report.tag_links,
                report.dropped_tag_links,
                report.mutations,
                report.indexed
            );
        }
        Commands::Info { dataset } => {
            let ds = open(&dataset)?;
            let version = ds.layout().read_version()?;
            let (messages, hidden, tags, groups, check) = ds.with_store(|s| {
                Ok((
                    s.count_messages()?,
                    search::count(s, &[Filter::Hidden(true)])?,
                    s.count_tags()?,
                    s.count_groups()?,
                    s.integrity_check()?,
                ))
            })?;
            println!("path={}", ds.root().display());
            println!("version={version}");
            println!("messages={messages}");
            println!("hidden={hidden}");
            println!("tags={tags}");
            println!("groups={groups}");
            println!("integrity_check={check}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_full_dates() {
        let start = parse_date("2024-03-01", false).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        let end = parse_date("2024-03-01", true).unwrap();
        assert_eq!(end.to_rfc3339(), "2024-03-01T23:59:59+00:00");
        let full = parse_date("2024-03-01T12:00:00+02:00", false).unwrap();
        assert_eq!(full.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(parse_date("March 1st", false).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn hide_requires_exactly_one_pattern() {
        assert!(Cli::try_parse_from(["mailidx", "hide", "ds"]).is_err());
        assert!(Cli::try_parse_from(["mailidx", "hide", "ds", "--body", "%x%", "--sender", "y"]).is_err());
        assert!(Cli::try_parse_from(["mailidx", "hide", "ds", "--sender", "%@spam.example"]).is_ok());
    }

    #[test]
    fn find_filters_follow_flags() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let Commands::Find(args) =
            Cli::try_parse_from(["mailidx", "find", "ds", "--roots", "--untagged", "--subject", "budget"])
                .unwrap()
                .command
        else {
            panic!("expected find");
        };
        let filters = build_filters(&args, &store).unwrap();
        assert_eq!(
            filters,
            vec![
                Filter::Hidden(false),
                Filter::Root(true),
                Filter::Tags {
                    ids: Vec::new(),
                    mode: TagMode::IncludeAny
                },
                Filter::SubjectContains("budget".to_string()),
            ]
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.init_schema().unwrap();
        let Commands::Find(args) = Cli::try_parse_from(["mailidx", "find", "ds", "--tag", "nope"])
            .unwrap()
            .command
        else {
            panic!("expected find");
        };
        assert!(build_filters(&args, &store).is_err());
    }
}
