//! Command-line entry point: serve the Smart-HTTP surface, run GC or
//! compaction against a data directory, or mirror a remote.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use git_tablet::{
    config::{AuthConfig, ServerConfig, StoreConfig},
    errors::GitError,
    protocol::http::{app_state, serve},
    storage::{ObjectStore, bucket::FsBucket, chunk, compaction, gc, schema},
    transport::{ConflictPolicy, HttpRemote, MirrorMode, mirror},
};

#[derive(Parser)]
#[command(name = "git-tablet", version, about = "Git-compatible repository host on a tablet storage engine")]
struct Cli {
    /// Data directory holding buckets and per-repo databases.
    #[arg(long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the Smart-HTTP endpoints.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8418")]
        addr: String,
        /// Auth tokens; repeat for several. No tokens means open mode.
        #[arg(long)]
        token: Vec<String>,
        /// Base URL advertised in LFS batch responses.
        #[arg(long)]
        external_base: Option<String>,
    },
    /// Garbage-collect one repository.
    Gc {
        repo: String,
        #[arg(long)]
        dry_run: bool,
        /// Grace period in days.
        #[arg(long)]
        grace_days: Option<i64>,
    },
    /// Compact one repository's tablets.
    Compact { repo: String },
    /// Mirror a repository against a Smart-HTTP remote.
    Mirror {
        repo: String,
        url: String,
        #[arg(long, default_value = "pull")]
        mode: String,
        #[arg(long, default_value = "fast-forward-only")]
        policy: String,
        #[arg(long)]
        token: Option<String>,
    },
}

async fn open_repo(data_dir: &PathBuf, repo: &str) -> Result<std::sync::Arc<ObjectStore>, GitError> {
    let bucket = FsBucket::new(data_dir.join("bucket"));
    let db_dir = data_dir.join("db");
    tokio::fs::create_dir_all(&db_dir).await?;
    let db = schema::connect(&format!(
        "sqlite://{}?mode=rwc",
        db_dir.join(format!("{repo}.sqlite")).display()
    ))
    .await?;
    let mut cfg = StoreConfig::default();
    cfg.repo_prefix = repo.to_string();
    ObjectStore::open(cfg, bucket, db).await
}

async fn run(cli: Cli) -> Result<(), GitError> {
    match cli.command {
        Command::Serve {
            addr,
            token,
            external_base,
        } => {
            let config = ServerConfig {
                external_base: external_base.unwrap_or_else(|| format!("http://{addr}")),
                addr,
                auth: AuthConfig {
                    tokens: token,
                    realm: "git-tablet".to_string(),
                },
                ..ServerConfig::default()
            };
            let bucket = FsBucket::new(cli.data_dir.join("bucket"));
            let state = app_state(bucket, Some(cli.data_dir.join("db")), config);
            serve(state).await?;
            Ok(())
        }
        Command::Gc {
            repo,
            dry_run,
            grace_days,
        } => {
            let store = open_repo(&cli.data_dir, &repo).await?;
            let stats = gc::run(
                &store,
                gc::GcOptions {
                    dry_run,
                    grace_period_ms: grace_days.map(|d| d * 24 * 60 * 60 * 1000),
                },
            )
            .await?;
            println!(
                "scanned {} reachable {} unreferenced {} deleted {} freed {}B skipped-grace {} skipped-cap {}{}",
                stats.scanned,
                stats.reachable,
                stats.unreferenced,
                stats.deleted,
                stats.freed_bytes,
                stats.skipped_grace,
                stats.skipped_cap,
                if stats.dry_run { " (dry-run)" } else { "" },
            );
            Ok(())
        }
        Command::Compact { repo } => {
            let store = open_repo(&cli.data_dir, &repo).await?;
            store.flush().await?;
            let stats = compaction::compact(&store).await?;
            if stats.skipped {
                println!("nothing to compact");
            } else {
                println!("merged {} tablets into one ({} rows)", stats.merged, stats.rows);
            }
            let chunks = chunk::compact_small_objects(&store).await?;
            if chunks.objects_indexed > 0 {
                println!(
                    "chunked {} small objects into {} super-chunks",
                    chunks.objects_indexed, chunks.chunks_written
                );
            }
            Ok(())
        }
        Command::Mirror {
            repo,
            url,
            mode,
            policy,
            token,
        } => {
            let store = open_repo(&cli.data_dir, &repo).await?;
            let mut remote = HttpRemote::new(url);
            if let Some(token) = token {
                remote = remote.with_token(token);
            }
            let report = mirror(
                &store,
                &remote,
                MirrorMode::from_str(&mode)?,
                ConflictPolicy::from_str(&policy)?,
            )
            .await?;
            println!(
                "fetched {} objects, pulled {} refs, pushed {} refs, skipped {}",
                report.fetched_objects,
                report.refs_pulled,
                report.refs_pushed,
                report.skipped.len()
            );
            for line in &report.skipped {
                println!("  skipped: {line}");
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("git-tablet: {e}");
            ExitCode::FAILURE
        }
    }
}
