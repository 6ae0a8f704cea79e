use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use progress_core::model::{ChallengeId, OptionId, ProgressMutation, UserId};
use services::{
    Clock, DispatchAck, DispatchError, HttpTransport, LocalBroadcast, NetworkMonitor,
    ProgressTransport, RetryPolicy, SyncContext, SyncStatus,
};
use storage::repository::Storage;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidUser { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidUser { raw } => write!(f, "invalid --user value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- demo   [--db <sqlite_url>] [--endpoint <url>] [--user <id>]");
    eprintln!("  cargo run -p app -- status [--db <sqlite_url>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite:progress.sqlite3");
    eprintln!("  --user demo-user");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  PROGRESS_DB_URL, PROGRESS_SYNC_ENDPOINT");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Demo,
    Status,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "demo" => Some(Self::Demo),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    endpoint: Option<String>,
    user: UserId,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("PROGRESS_DB_URL")
            .ok()
            .map_or_else(|| "sqlite://progress.sqlite3".into(), normalize_sqlite_url);
        let mut endpoint = std::env::var("PROGRESS_SYNC_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let mut user = UserId::new("demo-user");

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--endpoint" => {
                    let value = require_value(args, "--endpoint")?;
                    if !value.trim().is_empty() {
                        endpoint = Some(value);
                    }
                }
                "--user" => {
                    let value = require_value(args, "--user")?;
                    user = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidUser { raw: value.clone() })?;
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            endpoint,
            user,
        })
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

/// Transport used when no endpoint is configured: logs each mutation and
/// acknowledges it, so the demo runs fully offline from any real server.
struct EchoTransport;

#[async_trait]
impl ProgressTransport for EchoTransport {
    async fn dispatch(&self, mutation: &ProgressMutation) -> Result<DispatchAck, DispatchError> {
        tracing::info!(
            owner = %mutation.owner,
            challenge = %mutation.challenge_id,
            option = %mutation.selected_option_id,
            completed = mutation.is_completed,
            "dispatch (echo)"
        );
        Ok(DispatchAck::default())
    }
}

fn print_status(label: &str, status: &SyncStatus) {
    println!(
        "[{label}] pending={} failed={} migrating={} degraded={} last_synced_at={}",
        status.pending_count,
        status.failed_count,
        status.is_migrating,
        status.storage_degraded,
        status
            .last_synced_at
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339()),
    );
}

async fn run_demo(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let storage = Storage::sqlite_or_memory(&args.db_url).await;
    let transport: Arc<dyn ProgressTransport> = match &args.endpoint {
        Some(endpoint) => Arc::new(HttpTransport::new(endpoint.clone())),
        None => Arc::new(EchoTransport),
    };

    // Start offline to show local-first buffering.
    let monitor = Arc::new(NetworkMonitor::with_initial(false));
    let ctx = SyncContext::assemble(
        Clock::default_clock(),
        storage,
        transport,
        Arc::clone(&monitor),
        Arc::new(LocalBroadcast::new()),
        RetryPolicy::default(),
    )
    .await?;
    let progress = ctx.progress();

    println!("answering as {} (offline)", progress.current_owner());
    progress
        .submit_progress(ChallengeId::new("phishing-01"), OptionId::new("opt-b"), true)
        .await;
    progress
        .submit_progress(ChallengeId::new("deepfake-02"), OptionId::new("opt-a"), false)
        .await;
    print_status("offline", &progress.status().await);

    println!("reconnecting");
    monitor.set_online(true);
    let report = ctx.queue().drain().await?;
    println!(
        "drained: acknowledged={} retried={} failed={}",
        report.acknowledged, report.retried, report.failed
    );
    print_status("online", &progress.status().await);

    println!("signing in as {}", args.user);
    if let Some(report) = progress.signed_in(args.user).await? {
        println!(
            "migrated: records={} conflicts={} requeued={}",
            report.migrated, report.conflicts, report.requeued
        );
    }
    ctx.queue().drain().await?;
    print_status("signed-in", &progress.status().await);

    let category = [ChallengeId::new("phishing-01"), ChallengeId::new("deepfake-02")];
    let summary = progress.get_category_progress(&category).await;
    println!(
        "category progress: {}/{} complete",
        summary.completed_count, summary.total
    );
    Ok(())
}

async fn run_status(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let storage = Storage::sqlite_or_memory(&args.db_url).await;
    let pending = storage.queue.pending_count().await?;
    let failed = storage.queue.failed().await?.len();
    let last_synced_at = storage.sessions.last_synced_at().await?;
    println!(
        "pending={pending} failed={failed} degraded={} last_synced_at={}",
        storage.degraded,
        last_synced_at.map_or_else(|| "never".to_string(), |at| at.to_rfc3339()),
    );
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None => Command::Demo,
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) if first.starts_with("--") => Command::Demo,
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    if !argv.is_empty() && !argv[0].starts_with("--") {
        argv.remove(0);
    }

    let mut iter = argv.into_iter();
    let args = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    if args.db_url != "sqlite::memory:" {
        prepare_sqlite_file(&args.db_url)?;
    }

    match cmd {
        Command::Demo => run_demo(args).await,
        Command::Status => run_status(args).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
