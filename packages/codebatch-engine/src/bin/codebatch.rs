//! CodeBatch CLI
//!
//! # Usage
//!
//! ```bash
//! codebatch init ./store
//! codebatch snapshot ./src --store ./store
//! codebatch batch init --snapshot <id> --pipeline full --store ./store
//! codebatch run --batch <b> --store ./store
//! codebatch index-build --batch <b> --store ./store
//! codebatch query diagnostics --batch <b> --store ./store
//! ```
//!
//! `CODEBATCH_STORE` supplies a default for `--store`. Exit codes: 0
//! success, 1 expected failure, 2 invalid arguments or missing store,
//! 3 internal error.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use codebatch_engine::{
    batch, cache, diff, errors::ErrorEnvelope, plan::ShardStrategy, query::StatsGroupBy, runner,
    EngineError, OutputFilter, RecordKind, RunOptions, Severity,
};
use codebatch_store::{build_snapshot, SnapshotOptions, Store};

#[derive(Parser)]
#[command(name = "codebatch")]
#[command(about = "Reproducible, queryable code-analysis batches", long_about = None)]
struct Cli {
    /// Emit machine-readable JSON (results and error envelopes)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a store root
    Init {
        /// Store root directory
        store: PathBuf,
    },

    /// Build an immutable snapshot of a directory
    Snapshot {
        /// Directory to ingest
        dir: PathBuf,

        #[arg(long)]
        store: Option<PathBuf>,

        /// Include globs (default: everything)
        #[arg(long)]
        include: Vec<String>,

        /// Exclude globs
        #[arg(long)]
        exclude: Vec<String>,

        /// Follow symlinks (cycles are rejected)
        #[arg(long)]
        follow_symlinks: bool,
    },

    /// Batch operations
    Batch {
        #[command(subcommand)]
        command: BatchCommands,
    },

    /// Execute one shard of one task
    RunShard {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        shard: String,
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Drive all shards of a batch to completion honoring deps
    Run {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        store: Option<PathBuf>,
        /// Worker pool size (default: CPU count)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Same as `run`, but skip shards already done
    Resume {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Put a terminal shard back to pending
    ResetShard {
        #[arg(long)]
        batch: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        shard: String,
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Build or refresh the derived LMDB cache
    IndexBuild {
        #[arg(long)]
        batch: String,
        /// Wipe and rebuild even when the cache is current
        #[arg(long)]
        rebuild: bool,
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Query batch outputs
    Query {
        #[command(subcommand)]
        command: QueryCommands,
    },

    /// Compare two batches' outputs
    Diff {
        #[arg(long)]
        batch_a: String,
        #[arg(long)]
        batch_b: String,
        /// List only regressions
        #[arg(long, conflicts_with = "improvements")]
        regressions: bool,
        /// List only improvements
        #[arg(long)]
        improvements: bool,
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Materialize batch.json and plan.json for a snapshot
    Init {
        #[arg(long)]
        snapshot: String,
        #[arg(long, default_value = "full")]
        pipeline: String,
        #[arg(long)]
        store: Option<PathBuf>,
        /// Shard id hex length (1 → 16 shards, 2 → 256)
        #[arg(long, default_value_t = 2)]
        shard_prefix: u8,
    },
}

#[derive(Clone, clap::Args)]
struct QueryArgs {
    #[arg(long)]
    batch: String,
    #[arg(long)]
    task: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    path: Option<String>,
    #[arg(long)]
    severity: Option<String>,
    /// Exit 1 when the result is empty
    #[arg(long)]
    strict: bool,
    /// Bypass the cache and force the scan path
    #[arg(long)]
    no_cache: bool,
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum QueryCommands {
    /// All output records
    Outputs(QueryArgs),
    /// Diagnostic records only
    Diagnostics(QueryArgs),
    /// Counts grouped by kind or by (severity, code)
    Stats {
        #[command(flatten)]
        args: QueryArgs,
        /// Grouping axis
        #[arg(long, default_value = "kind", value_parser = ["kind", "severity"])]
        group_by: String,
    },
}

fn resolve_store(store: Option<PathBuf>) -> Result<Store, EngineError> {
    let root = store
        .or_else(|| std::env::var_os("CODEBATCH_STORE").map(PathBuf::from))
        .ok_or_else(|| {
            EngineError::Store(codebatch_store::StoreError::store_not_found(
                "(no --store and CODEBATCH_STORE unset)",
            ))
        })?;
    Ok(Store::open(root)?)
}

fn filter_of(args: &QueryArgs) -> Result<OutputFilter, EngineError> {
    Ok(OutputFilter {
        task: args.task.clone(),
        kind: args.kind.as_deref().map(RecordKind::parse).transpose()?,
        path: args.path.clone(),
        severity: args.severity.as_deref().map(Severity::parse).transpose()?,
    })
}

fn print_records(records: &[codebatch_engine::OutputRecord]) -> Result<(), EngineError> {
    use std::io::Write;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        writeln!(out)?;
    }
    Ok(())
}

fn drive_batch(
    batch_id: &str,
    store: Option<PathBuf>,
    workers: Option<usize>,
    resume: bool,
) -> Result<i32, EngineError> {
    let store = resolve_store(store)?;
    let opts = RunOptions {
        workers: workers.unwrap_or_else(num_cpus::get),
        resume,
    };
    let cancel = AtomicBool::new(false);
    let summary = runner::run_batch(&store, batch_id, opts, &cancel)?;
    eprintln!(
        "done={} failed={} skipped={}",
        summary.done, summary.failed, summary.skipped
    );
    Ok(if summary.failed > 0 { 1 } else { 0 })
}

fn run_command(cli: Cli) -> Result<i32, EngineError> {
    match cli.command {
        Commands::Init { store } => {
            let store = Store::init(&store)?;
            println!("{}", store.root().display());
            Ok(0)
        }

        Commands::Snapshot {
            dir,
            store,
            include,
            exclude,
            follow_symlinks,
        } => {
            let store = resolve_store(store)?;
            let opts = SnapshotOptions {
                include,
                exclude,
                follow_symlinks,
            };
            let meta = build_snapshot(&store, &dir, &opts)?;
            println!("{}", meta.snapshot_id);
            Ok(0)
        }

        Commands::Batch {
            command:
                BatchCommands::Init {
                    snapshot,
                    pipeline,
                    store,
                    shard_prefix,
                },
        } => {
            let store = resolve_store(store)?;
            let shard = ShardStrategy::new(shard_prefix)?;
            let meta = batch::init_batch(&store, &snapshot, &pipeline, shard)?;
            println!("{}", meta.batch_id);
            Ok(0)
        }

        Commands::RunShard {
            batch: batch_id,
            task,
            shard,
            store,
        } => {
            let store = resolve_store(store)?;
            let _lock = store.lock_exclusive()?;
            let meta = batch::load_batch(&store, &batch_id)?;
            let plan = batch::load_plan(&store, &batch_id)?;
            let task = plan.task(&task)?.clone();
            let cancel = AtomicBool::new(false);
            let records = runner::run_shard(&store, &meta, &plan, &task, &shard, &cancel, None)?;
            eprintln!("shard {shard} done ({records} records)");
            Ok(0)
        }

        Commands::Run {
            batch: batch_id,
            store,
            workers,
        } => drive_batch(&batch_id, store, workers, false),

        Commands::Resume {
            batch: batch_id,
            store,
            workers,
        } => drive_batch(&batch_id, store, workers, true),

        Commands::ResetShard {
            batch: batch_id,
            task,
            shard,
            store,
        } => {
            let store = resolve_store(store)?;
            runner::reset_shard(&store, &batch_id, &task, &shard)?;
            eprintln!("shard {shard} reset to pending");
            Ok(0)
        }

        Commands::IndexBuild {
            batch: batch_id,
            rebuild,
            store,
        } => {
            let store = resolve_store(store)?;
            let _lock = store.lock_exclusive()?;
            let meta = cache::build_index(&store, &batch_id, rebuild)?;
            eprintln!("cache fingerprint {}", meta.fingerprint);
            Ok(0)
        }

        Commands::Query { command } => {
            let (args, records_or_stats) = match command {
                QueryCommands::Outputs(args) => {
                    let store = resolve_store(args.store.clone())?;
                    let filter = filter_of(&args)?;
                    let records = if args.no_cache {
                        codebatch_engine::query::scan_outputs(&store, &args.batch, &filter)?
                    } else {
                        cache::query_outputs(&store, &args.batch, &filter)?
                    };
                    print_records(&records)?;
                    (args, records.len())
                }
                QueryCommands::Diagnostics(args) => {
                    let store = resolve_store(args.store.clone())?;
                    let mut filter = filter_of(&args)?;
                    filter.kind = Some(RecordKind::Diagnostic);
                    let records = if args.no_cache {
                        codebatch_engine::query::scan_outputs(&store, &args.batch, &filter)?
                    } else {
                        cache::query_outputs(&store, &args.batch, &filter)?
                    };
                    print_records(&records)?;
                    (args, records.len())
                }
                QueryCommands::Stats { args, group_by } => {
                    let store = resolve_store(args.store.clone())?;
                    let filter = filter_of(&args)?;
                    let group_by = match group_by.as_str() {
                        "severity" => StatsGroupBy::SeverityCode,
                        _ => StatsGroupBy::Kind,
                    };
                    let stats = if args.no_cache {
                        codebatch_engine::query::scan_stats(&store, &args.batch, &filter, group_by)?
                    } else {
                        cache::query_stats(&store, &args.batch, &filter, group_by)?
                    };
                    if cli.json {
                        println!("{}", serde_json::to_string(&stats)?);
                    } else {
                        for (group, count) in &stats {
                            println!("{group}\t{count}");
                        }
                    }
                    let total: u64 = stats.values().sum();
                    (args, total as usize)
                }
            };
            if args.strict && records_or_stats == 0 {
                return Ok(1);
            }
            Ok(0)
        }

        Commands::Diff {
            batch_a,
            batch_b,
            regressions,
            improvements,
            store,
        } => {
            let store = resolve_store(store)?;
            let report = diff::diff_batches(&store, &batch_a, &batch_b)?;
            if regressions {
                print_records(&diff::regressions(&report))?;
            } else if improvements {
                print_records(&diff::improvements(&report))?;
            } else if cli.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "added={} removed={} changed={}",
                    report.added.len(),
                    report.removed.len(),
                    report.changed.len()
                );
            }
            Ok(0)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    match run_command(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if json {
                let envelope = ErrorEnvelope::from_error(&err);
                match serde_json::to_string(&envelope) {
                    Ok(body) => eprintln!("{body}"),
                    Err(_) => eprintln!("{err}"),
                }
            } else {
                eprintln!("error[{}]: {}", err.code(), err);
            }
            std::process::exit(err.exit_code());
        }
    }
}
