//! Stable embedded command surface for hosts driving ShutterRank.
//!
//! Host programs should embed behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteRankStore`].

use std::cmp::Ordering;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shutterrank_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, select_pair, MatchEventInput, MatchProposal,
    Photo, PhotoId, RankedPhoto,
};
use shutterrank_store_sqlite::{SnapshotReport, SqliteRankStore};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "sr")]
#[command(about = "ShutterRank pairwise photo ranking CLI")]
pub struct Cli {
    #[arg(long, default_value = "./shutterrank.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Vote(VoteArgs),
    Undo,
    Standings(StandingsArgs),
    Next(NextArgs),
    Replay(ReplayArgs),
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    Import(CatalogImportArgs),
    List(CatalogListArgs),
}

#[derive(Debug, Args)]
pub struct CatalogImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct CatalogListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct VoteArgs {
    #[arg(long)]
    winner: String,
    #[arg(long)]
    loser: String,
    #[arg(long)]
    occurred_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct StandingsArgs {
    #[arg(long)]
    json: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct NextArgs {
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    Export(LogExportArgs),
    Import(LogImportArgs),
}

#[derive(Debug, Args)]
pub struct LogExportArgs {
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct LogImportArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_command_with_db(db_path: &std::path::Path, command: Command) -> Result<()> {
    let mut store = SqliteRankStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, replay, or pair selection
/// fails.
pub fn run_command(command: Command, store: &mut SqliteRankStore) -> Result<()> {
    match command {
        Command::Catalog { command } => run_catalog(command, store),
        Command::Vote(args) => {
            let input = MatchEventInput {
                event_id: None,
                winner_id: PhotoId::new(args.winner),
                loser_id: PhotoId::new(args.loser),
                occurred_at: parse_optional_utc(args.occurred_at.as_deref())?,
            };

            let event = store.append_event(&input)?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        Command::Undo => {
            match store.undo_last()? {
                Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
                None => println!("match log is empty; nothing to undo"),
            }
            Ok(())
        }
        Command::Standings(args) => {
            let report = store.rebuild_snapshot()?;
            let mut entries = report.entries.clone();
            sort_standings(&mut entries);
            if let Some(limit) = args.limit {
                entries.truncate(limit);
            }

            if args.json {
                let payload = build_standings_json_payload(&report, &entries);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_standings_table(&entries);
            }
            Ok(())
        }
        Command::Next(args) => {
            let report = store.rebuild_snapshot()?;
            let config = store.active_config()?;
            let recent = store.last_presented()?;
            let recent_refs = recent.as_ref().map(|(a, b)| (a, b));

            let mut rng = match args.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };

            let proposal = select_pair(&report.entries, recent_refs, &config, &mut rng)
                .map_err(|err| anyhow!("pair selection failed: {err}"))?;
            store.record_presented(&proposal.left, &proposal.right)?;

            if args.json {
                let payload = build_next_pair_json_payload(&proposal);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_next_pair(&proposal);
            }
            Ok(())
        }
        Command::Replay(args) => {
            let report = store.rebuild_snapshot()?;
            if args.json {
                let payload = build_replay_json_payload(&report);
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_replay_report(&report);
            }
            Ok(())
        }
        Command::Log { command } => run_log(command, store),
        Command::Config { command } => match command {
            ConfigCommand::Show => {
                let config = store.active_config()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        },
    }
}

fn run_catalog(command: CatalogCommand, store: &mut SqliteRankStore) -> Result<()> {
    match command {
        CatalogCommand::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read catalog file {}", args.file.display()))?;
            let photos: Vec<Photo> = serde_json::from_str(&raw)
                .context("catalog file must be a JSON array of photos")?;

            let count = store.import_catalog(&photos)?;
            println!("imported {count} photos");
            Ok(())
        }
        CatalogCommand::List(args) => {
            let photos = store.list_photos()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&photos)?);
            } else {
                print_catalog_table(&photos);
            }
            Ok(())
        }
    }
}

fn run_log(command: LogCommand, store: &mut SqliteRankStore) -> Result<()> {
    match command {
        LogCommand::Export(args) => {
            let events = store.list_events()?;
            let payload = build_match_log_payload(&events)?;
            let serialized = serde_json::to_string_pretty(&payload)?;

            match args.output {
                Some(path) => {
                    std::fs::write(&path, serialized).with_context(|| {
                        format!("failed writing match log to {}", path.display())
                    })?;
                    println!("exported {} events to {}", events.len(), path.display());
                }
                None => println!("{serialized}"),
            }
            Ok(())
        }
        LogCommand::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read match log {}", args.file.display()))?;
            let payload: MatchLogJsonPayload =
                serde_json::from_str(&raw).context("match log file is not valid JSON")?;

            if payload.contract_version != MATCH_LOG_CONTRACT {
                return Err(anyhow!(
                    "unsupported match log contract: {} (expected {})",
                    payload.contract_version,
                    MATCH_LOG_CONTRACT
                ));
            }

            let inputs = payload
                .events
                .iter()
                .map(log_entry_to_input)
                .collect::<Result<Vec<_>>>()?;

            let count = store.replace_log(&inputs)?;
            println!("imported {count} events; snapshot will rebuild from the new log");
            Ok(())
        }
    }
}

/// Leaderboard order: rating descending, ties broken by id so repeated
/// invocations print identically.
pub fn sort_standings(entries: &mut [RankedPhoto]) {
    entries.sort_by(|a, b| {
        b.rating
            .partial_cmp(&a.rating)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

const MATCH_LOG_CONTRACT: &str = "match_log.v1";

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StandingsJsonPayload {
    contract_version: String,
    photo_count: usize,
    processed_events: usize,
    skipped_events: usize,
    last_event_seq: i64,
    entries: Vec<RankedPhoto>,
}

fn build_standings_json_payload(
    report: &SnapshotReport,
    entries: &[RankedPhoto],
) -> StandingsJsonPayload {
    StandingsJsonPayload {
        contract_version: "standings.v1".to_string(),
        photo_count: report.photo_count,
        processed_events: report.processed_events,
        skipped_events: report.skipped_events,
        last_event_seq: report.last_event_seq,
        entries: entries.to_vec(),
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct NextPairJsonPayload {
    contract_version: String,
    left: PhotoId,
    right: PhotoId,
    policy: String,
    rationale: String,
}

fn build_next_pair_json_payload(proposal: &MatchProposal) -> NextPairJsonPayload {
    NextPairJsonPayload {
        contract_version: "next_pair.v1".to_string(),
        left: proposal.left.clone(),
        right: proposal.right.clone(),
        policy: proposal.policy.as_str().to_string(),
        rationale: proposal.rationale.clone(),
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ReplayJsonPayload {
    contract_version: String,
    photo_count: usize,
    processed_events: usize,
    skipped_events: usize,
    last_event_seq: i64,
}

fn build_replay_json_payload(report: &SnapshotReport) -> ReplayJsonPayload {
    ReplayJsonPayload {
        contract_version: "replay_report.v1".to_string(),
        photo_count: report.photo_count,
        processed_events: report.processed_events,
        skipped_events: report.skipped_events,
        last_event_seq: report.last_event_seq,
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MatchLogJsonPayload {
    contract_version: String,
    exported_at: String,
    events: Vec<MatchLogEntry>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MatchLogEntry {
    event_id: String,
    winner_id: String,
    loser_id: String,
    occurred_at: String,
}

fn build_match_log_payload(
    events: &[shutterrank_core::MatchEvent],
) -> Result<MatchLogJsonPayload> {
    let entries = events
        .iter()
        .map(|event| {
            Ok(MatchLogEntry {
                event_id: event.event_id.to_string(),
                winner_id: event.winner_id.to_string(),
                loser_id: event.loser_id.to_string(),
                occurred_at: format_rfc3339(event.occurred_at)
                    .map_err(|err| anyhow!(err.to_string()))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(MatchLogJsonPayload {
        contract_version: MATCH_LOG_CONTRACT.to_string(),
        exported_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
        events: entries,
    })
}

fn log_entry_to_input(entry: &MatchLogEntry) -> Result<MatchEventInput> {
    let event_id = Ulid::from_string(&entry.event_id)
        .with_context(|| format!("invalid event_id in match log: {}", entry.event_id))?;
    let occurred_at = parse_rfc3339_utc(&entry.occurred_at)
        .map_err(|err| anyhow!("invalid occurred_at in match log: {err}"))?;

    Ok(MatchEventInput {
        event_id: Some(event_id),
        winner_id: PhotoId::new(entry.winner_id.clone()),
        loser_id: PhotoId::new(entry.loser_id.clone()),
        occurred_at,
    })
}

fn print_standings_table(entries: &[RankedPhoto]) {
    println!(
        "{:<5} {:<24} {:<10} {:<12} {:<8} {:<6} {:<6}",
        "rank", "photo_id", "rating", "uncertainty", "matches", "wins", "losses"
    );
    println!("{}", "-".repeat(78));

    for (position, entry) in entries.iter().enumerate() {
        println!(
            "{:<5} {:<24} {:<10.1} {:<12.1} {:<8} {:<6} {:<6}",
            position + 1,
            entry.id,
            entry.rating,
            entry.uncertainty,
            entry.matches,
            entry.wins,
            entry.losses
        );
    }
}

fn print_catalog_table(photos: &[Photo]) {
    println!("{:<24} {:<12} title", "photo_id", "dimensions");
    println!("{}", "-".repeat(70));
    for photo in photos {
        let dimensions = match (photo.width, photo.height) {
            (Some(width), Some(height)) => format!("{width}x{height}"),
            _ => "n/a".to_string(),
        };
        println!("{:<24} {:<12} {}", photo.id, dimensions, photo.title);
    }
}

fn print_next_pair(proposal: &MatchProposal) {
    println!("left={} right={}", proposal.left, proposal.right);
    println!(
        "policy={} rationale={}",
        proposal.policy.as_str(),
        proposal.rationale
    );
}

fn print_replay_report(report: &SnapshotReport) {
    println!(
        "photos={} processed_events={} skipped_events={} last_event_seq={}",
        report.photo_count, report.processed_events, report.skipped_events, report.last_event_seq
    );
}
