use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use pants_api::{CreateInquestRequest, PantsApi, RecordVoteRequest};
use pants_core::{InquestId, PantsError, SeenSet};
use pants_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pon")]
#[command(about = "Pants or Not CLI")]
struct Cli {
    #[arg(long, default_value = "./pants_or_not.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Inquest {
        #[command(subcommand)]
        command: Box<InquestCommand>,
    },
    Ruling {
        #[command(subcommand)]
        command: Box<RulingCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum InquestCommand {
    Add(InquestAddArgs),
    Show(InquestShowArgs),
    Latest,
    List(InquestListArgs),
    Random(InquestRandomArgs),
}

#[derive(Debug, Args)]
struct InquestAddArgs {
    #[arg(long)]
    image_url: String,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
struct InquestShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct InquestListArgs {
    #[arg(long, default_value_t = 20)]
    limit: u32,
}

#[derive(Debug, Args)]
struct InquestRandomArgs {
    /// Inquest ids to treat as already ruled on.
    #[arg(long = "exclude")]
    exclude: Vec<i64>,
}

#[derive(Debug, Subcommand)]
enum RulingCommand {
    Add(RulingAddArgs),
    List(RulingListArgs),
}

#[derive(Debug, Args)]
struct RulingAddArgs {
    #[arg(long)]
    inquest_id: i64,
    #[arg(long)]
    vote: String,
}

#[derive(Debug, Args)]
struct RulingListArgs {
    #[arg(long)]
    inquest_id: i64,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Inquest { command } => run_inquest(*command, &PantsApi::new(cli.db)),
        Command::Ruling { command } => run_ruling(*command, &cli.db),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_inquest(command: InquestCommand, api: &PantsApi) -> Result<()> {
    match command {
        InquestCommand::Add(args) => {
            let view = match args.created_at.as_deref() {
                Some(raw) => api.create_inquest_at(Some(args.image_url), parse_rfc3339(raw)?)?,
                None => api.create_inquest(CreateInquestRequest { image_url: Some(args.image_url) })?,
            };
            emit_json(serde_json::to_value(view)?)
        }
        InquestCommand::Show(args) => {
            emit_json(serde_json::to_value(api.show_inquest(InquestId(args.id))?)?)
        }
        InquestCommand::Latest => emit_json(serde_json::to_value(api.latest_inquest()?)?),
        InquestCommand::List(args) => {
            let inquests = api.list_inquests(args.limit)?;
            emit_json(serde_json::json!({
                "count": inquests.len(),
                "inquests": inquests
            }))
        }
        InquestCommand::Random(args) => {
            let seen = args.exclude.into_iter().map(InquestId).collect::<SeenSet>();
            let pick = api.random_inquest(&seen)?;
            emit_json(serde_json::json!({
                "excluded": seen,
                "pick": pick
            }))
        }
    }
}

fn run_ruling(command: RulingCommand, db: &Path) -> Result<()> {
    match command {
        RulingCommand::Add(args) => {
            let api = PantsApi::new(db.to_path_buf());
            let ruling = api.record_vote(
                InquestId(args.inquest_id),
                RecordVoteRequest { vote: Some(args.vote) },
            )?;
            emit_json(serde_json::to_value(ruling)?)
        }
        RulingCommand::List(args) => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let inquest_id = InquestId(args.inquest_id);
            if !store.inquest_exists(inquest_id)? {
                return Err(PantsError::inquest_not_found(inquest_id).into());
            }
            emit_json(serde_json::json!({
                "inquest_id": inquest_id,
                "tally": store.tally(inquest_id)?,
                "rulings": store.rulings_for(inquest_id)?
            }))
        }
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
