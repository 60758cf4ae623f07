//! skein command line tool.
//!
//! Inspects the stored timeline of a room and replays sync batches into it.
//! Runs offline: gaps are reported, never filled.
//!
//! Usage:
//!   skein --room '!abc:example.org' fragments
//!   skein --room '!abc:example.org' live --limit 20
//!   skein --room '!abc:example.org' read --fragment 2 --index end --dir b
//!   skein --room '!abc:example.org' import batches.json

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use skein_store::TimelineStore;
use skein_timeline::{
    FetchError, PaginationResponse, PaginationSource, RoomTimeline, SyncTimeline, TimelineConfig,
    TimelineEntry,
};
use skein_types::{Direction, EntryIndex, FragmentId, RoomId, SortKey};

/// Inspect skein room timelines.
#[derive(Parser, Debug)]
#[command(name = "skein")]
#[command(about = "Inspect and replay skein room timelines")]
struct Args {
    /// Timeline database (defaults to the configured or per-user path)
    #[arg(long)]
    db: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Room to operate on
    #[arg(long)]
    room: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the room's fragments with their links and tokens
    Fragments,

    /// Newest entries ending at the live fragment
    Live {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Read from a position in one direction
    Read {
        #[arg(long)]
        fragment: u32,

        /// Entry index, or `start` / `end` for the fragment boundaries
        #[arg(long, value_parser = parse_index, default_value = "end")]
        index: EntryIndex,

        /// `b` (backward) or `f` (forward)
        #[arg(long, default_value = "b")]
        dir: Direction,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Apply sync batches from a JSON file (an array of timeline sections)
    Import { file: PathBuf },
}

fn parse_index(raw: &str) -> Result<EntryIndex, String> {
    match raw {
        "start" => Ok(EntryIndex::MIN),
        "end" => Ok(EntryIndex::MAX),
        n => n
            .parse::<i64>()
            .map(EntryIndex::new)
            .map_err(|e| format!("invalid entry index {n:?}: {e}")),
    }
}

/// Pagination source for offline use; every fetch fails.
struct Offline;

#[async_trait]
impl PaginationSource for Offline {
    async fn fetch_more(
        &self,
        _room: &RoomId,
        _token: &str,
        _direction: Direction,
        _amount: usize,
    ) -> Result<PaginationResponse, FetchError> {
        Err(FetchError::Network("offline".into()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TimelineConfig::load(path)?,
        None => TimelineConfig::default(),
    };
    if let Some(db) = &args.db {
        config = config.with_database(db);
    }

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(
        TimelineStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );
    tracing::info!(db = %db_path.display(), "opened timeline store");

    let room = RoomId::parse(args.room.as_str())?;
    let timeline = RoomTimeline::open(room, store.clone(), Arc::new(Offline), &config);
    timeline.load_fragments()?;

    match args.command {
        Command::Fragments => {
            let fragments = store.read(|txn| txn.fragments(timeline.room_id()))?;
            for fragment in fragments {
                let count = store.read(|txn| txn.event_count(timeline.room_id(), fragment.id))?;
                println!(
                    "{:>4}  events={:<5} prev={:<6} next={:<6} prev_token={:<12} next_token={:<12}{}{}",
                    fragment.id,
                    count,
                    show(fragment.previous_id),
                    show(fragment.next_id),
                    fragment.previous_token.as_deref().unwrap_or("-"),
                    fragment.next_token.as_deref().unwrap_or("-"),
                    if fragment.start_reached { "  [start]" } else { "" },
                    if fragment.is_live() { "  [live]" } else { "" },
                );
            }
        }
        Command::Live { limit } => {
            let entries = timeline
                .read_from_live_edge(limit.unwrap_or(config.page_size))
                .await?;
            print_entries(&entries);
            print_entries(&timeline.pending_entries());
        }
        Command::Read { fragment, index, dir, limit } => {
            let from = SortKey::new(FragmentId::new(fragment), index);
            let entries = timeline
                .read_from(from, dir, limit.unwrap_or(config.page_size))
                .await?;
            print_entries(&entries);
        }
        Command::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let batches: Vec<SyncTimeline> = serde_json::from_str(&raw)?;
            let mut written = 0;
            for batch in &batches {
                written += timeline.write_sync(batch)?.len();
            }
            tracing::info!(batches = batches.len(), written, "imported sync batches");
        }
    }

    Ok(())
}

fn show(id: Option<FragmentId>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".into())
}

fn print_entries(entries: &[TimelineEntry]) {
    for entry in entries {
        match entry {
            TimelineEntry::Event(e) => {
                let body = e
                    .content()
                    .get("body")
                    .and_then(|b| b.as_str())
                    .unwrap_or("");
                println!(
                    "{:<14} {:<28} {:<20} {:<16} {}",
                    e.key.to_string(),
                    e.event.event_id,
                    e.event.sender,
                    e.event_type(),
                    body
                );
            }
            TimelineEntry::Boundary(b) => {
                let edge = if b.is_start() { "start" } else { "end" };
                let state = if b.is_gap() {
                    format!("gap, token {}", b.token().unwrap_or_default())
                } else if b.edge_reached() {
                    "edge of history".to_string()
                } else if let Some(next) = b.linked_fragment_id() {
                    format!("continues in {next}")
                } else {
                    "open".to_string()
                };
                println!("── {edge} of fragment {} ({state})", b.fragment_id());
            }
            TimelineEntry::Pending(p) => {
                println!(
                    "{:<14} {:<28} {:<20} {:<16} {}",
                    format!("pending:{}", p.event.queue_index),
                    p.event.txn_id.short(),
                    "(local)",
                    p.event.event_type,
                    p.event.content.get("body").and_then(|b| b.as_str()).unwrap_or("")
                );
            }
        }
    }
}
