use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "plk")]
#[command(about = "PositionKeep loader CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> site)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// EOD pipeline commands
    Eod {
        #[command(subcommand)]
        cmd: EodCmd,
    },

    /// Batch commands
    Batch {
        #[command(subcommand)]
        cmd: BatchCmd,
    },

    /// Dead-letter queue commands
    Dlq {
        #[command(subcommand)]
        cmd: DlqCmd,
    },

    /// Move pre-cutoff archived positions into the archive table
    Archive {
        /// Cutoff business date (YYYY-MM-DD); rows strictly before it move
        #[arg(long)]
        cutoff: NaiveDate,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum EodCmd {
    /// Run (or rerun) the EOD load for one account and date
    Run {
        #[arg(long)]
        account: i64,

        /// Business date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,

        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// Show the latest run status for one account and date
    Status {
        #[arg(long)]
        account: i64,

        #[arg(long)]
        date: NaiveDate,
    },
}

#[derive(Subcommand)]
enum BatchCmd {
    /// Roll the latest promotion back to its archived predecessor
    Rollback {
        #[arg(long)]
        account: i64,

        #[arg(long)]
        date: NaiveDate,

        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DlqCmd {
    /// List entries (optionally by status: PENDING, PROCESSED, FAILED)
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Put a FAILED or manually-parked entry back in line for the replayer
    Requeue {
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = plk_db::connect_from_env(4).await?;
            match cmd {
                DbCmd::Status => {
                    let s = plk_db::status(&pool).await?;
                    println!("connectivity: {}", if s.ok { "ok" } else { "FAILED" });
                    println!(
                        "schema:       {}",
                        if s.has_batches_table {
                            "present"
                        } else {
                            "missing (run `plk db migrate`)"
                        }
                    );
                }
                DbCmd::Migrate => {
                    plk_db::migrate(&pool).await?;
                    println!("migrations applied");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            let layered = plk_config::load_layers(&refs)?;
            println!("{}", layered.canonical);
            eprintln!("config_hash: {}", layered.hash);
        }

        Commands::Eod { cmd } => match cmd {
            EodCmd::Run {
                account,
                date,
                config_paths,
            } => {
                let (pipeline, _pool) = build_eod_pipeline(&config_paths).await?;
                let outcome = pipeline
                    .run(&plk_schemas::EodTrigger {
                        account_id: account,
                        business_date: date,
                    })
                    .await?;
                match outcome {
                    plk_eod::EodOutcome::Completed {
                        batch_id,
                        position_count,
                    } => println!("COMPLETED batch={batch_id} positions={position_count}"),
                    plk_eod::EodOutcome::Noop => println!("COMPLETED_NOOP (duplicate snapshot)"),
                }
            }
            EodCmd::Status { account, date } => {
                let pool = plk_db::connect_from_env(4).await?;
                match plk_db::latest_run(&pool, account, date).await? {
                    Some(run) => println!(
                        "{} attempt={} batch={:?} positions={:?} error={:?}",
                        run.status.as_str(),
                        run.attempt,
                        run.batch_id,
                        run.position_count,
                        run.error_message
                    ),
                    None => println!("no run recorded"),
                }
            }
        },

        Commands::Batch { cmd } => match cmd {
            BatchCmd::Rollback {
                account,
                date,
                config_paths,
            } => {
                let (pipeline, _pool) = build_eod_pipeline(&config_paths).await?;
                if pipeline.rollback(account, date).await? {
                    println!("rolled back");
                } else {
                    println!("nothing to roll back (no archived predecessor)");
                }
            }
        },

        Commands::Dlq { cmd } => {
            let pool = plk_db::connect_from_env(4).await?;
            match cmd {
                DlqCmd::List { status } => {
                    let status = status
                        .as_deref()
                        .map(plk_schemas::DlqStatus::parse)
                        .transpose()?;
                    for e in plk_db::list_entries(&pool, status, 100).await? {
                        println!(
                            "{}\t{}\t{}\tretries={}\t{}",
                            e.dlq_id,
                            e.status.as_str(),
                            e.topic,
                            e.retry_count,
                            e.error_message
                        );
                    }
                }
                DlqCmd::Requeue { id } => {
                    if plk_db::requeue_entry(&pool, id).await? {
                        println!("entry {id} requeued");
                    } else {
                        println!("entry {id} is not eligible for replay; nothing done");
                    }
                }
            }
        }

        Commands::Archive { cutoff } => {
            let pool = plk_db::connect_from_env(4).await?;
            let store = plk_store::PositionStore::new(pool);
            let moved = store.archive(cutoff).await?;
            println!("archived {moved} position rows before {cutoff}");
        }
    }

    Ok(())
}

/// Build a full EOD pipeline for admin-initiated invocations. Consumers are
/// not started; admission, locking, and idempotency rules match the daemon.
async fn build_eod_pipeline(
    config_paths: &[String],
) -> Result<(plk_eod::EodPipeline, sqlx::PgPool)> {
    let config = if config_paths.is_empty() {
        plk_config::LoaderConfig::default()
    } else {
        let refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
        plk_config::load_loader_config(&refs)?.0
    };
    let config = Arc::new(config);

    let pool = plk_db::connect_from_env(4).await?;
    let store = plk_store::PositionStore::new(pool.clone());
    let locks = plk_fabric::DistributedLock::new(pool.clone());
    let bus = plk_fabric::MessageBus::new();
    let drain = plk_fabric::DrainState::new();
    let source = Arc::new(plk_eod::HttpSnapshotSource::new(&config.upstream)?);

    let pipeline =
        plk_eod::EodPipeline::new(store, source, locks, bus, drain, Arc::clone(&config));

    Ok((pipeline, pool))
}
