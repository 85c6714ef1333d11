//! # warpcore CLI
//!
//! Entry point dispatching to the agent server, a benchmark invocation, or
//! one of the offline analysis subcommands (`analyze`, `merge`, `cmp`).
//!
//! Logging setup mirrors the coordination core's teacher lineage: verbosity
//! is controlled by repeated `-v` flags, detailed logs go to a file (daily
//! rotating) or stderr, and a separate colorized layer prints clean output
//! to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use warpcore::cli::{AgentArgs, AnalyzeArgs, BenchArgs, Cli, CmpArgs, Command, MergeArgs};
use warpcore::logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;

    match cli.log_file.as_deref().and_then(|p| p.to_str()) {
        Some("stderr") => {
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            guard = None;
        }
        path => {
            let (dir, filename) = match path {
                Some(path_str) => {
                    let log_path = std::path::Path::new(path_str);
                    let dir = log_path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf();
                    let filename = log_path
                        .file_name()
                        .map(|f| f.to_string_lossy().to_string())
                        .unwrap_or_else(|| "warpcore.log".to_string());
                    (dir, filename)
                }
                None => (std::path::PathBuf::from("."), "warpcore.log".to_string()),
            };
            let file_appender = tracing_appender::rolling::daily(dir, filename);
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            guard = Some(file_guard);
        }
    }

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    info!("warpcore {} starting", warpcore::VERSION);

    let result = match cli.command {
        Command::Agent(args) => run_agent(args).await,
        Command::Bench(args) => run_bench(args).await,
        Command::Analyze(args) => run_analyze(args),
        Command::Merge(args) => run_merge(args),
        Command::Cmp(args) => run_cmp(args),
    };

    if let Err(e) = &result {
        error!("warpcore failed: {e}");
    }
    result
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let secret = std::env::var("WARP_AGENT_SECRET").unwrap_or_default();
    let state = warpcore::agent_server::AgentServerState::new(secret);
    let app = warpcore::agent_server::router(state);

    let addr = if let Some(stripped) = args.listen_addr.strip_prefix(':') {
        format!("0.0.0.0:{stripped}")
    } else {
        args.listen_addr.clone()
    };
    info!(%addr, "agent listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("agent server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down agent");
        }
    }
    Ok(())
}

async fn run_bench(args: BenchArgs) -> Result<()> {
    use chrono::Utc;
    use std::collections::HashMap;
    use warpcore::protocol::{BenchmarkCommand, FlagValue};
    use warpcore::stage::Stage;

    let endpoints = warpcore::cli::expand_agent_list(&args.agents).map_err(anyhow::Error::msg)?;
    if endpoints.is_empty() {
        anyhow::bail!("--agents must name at least one endpoint; standalone mode is not yet wired into this binary");
    }

    let coordinator_id = uuid::Uuid::new_v4().to_string();
    let secret = std::env::var("WARP_AGENT_SECRET").unwrap_or_default();
    let coordinator = warpcore::coordinator::CoordinatorClient::connect_all(endpoints, &coordinator_id, &secret, args.fail_on_error).await?;

    let mut flags = HashMap::new();
    flags.insert("bucket".to_string(), FlagValue::String(args.bucket.clone()));
    flags.insert("concurrent".to_string(), FlagValue::Int64(args.concurrent as i64));
    flags.insert("noclear".to_string(), FlagValue::Bool(args.noclear));
    flags.insert("keep_data".to_string(), FlagValue::Bool(args.keep_data));
    let benchmark = BenchmarkCommand::new(args.command.clone(), vec![], &flags);

    coordinator
        .broadcast(warpcore::protocol::ServerRequest::Benchmark { benchmark })
        .await;

    let now = Utc::now();
    let prepare_at = args
        .syncstart
        .map(|s| warpcore::clock::SyncClock::resolve_syncstart(now, s))
        .unwrap_or_else(|| warpcore::clock::SyncClock::prepare_start_deadline(now));
    coordinator.start_stage_all(Stage::Prepare, prepare_at).await;
    coordinator.wait_for_stage(Stage::Prepare, warpcore::defaults::STAGE_POLL_INTERVAL).await?;

    let benchmark_at = warpcore::clock::SyncClock::benchmark_start_deadline(Utc::now());
    coordinator.start_stage_all(Stage::Benchmark, benchmark_at).await;
    tokio::time::sleep(args.duration).await;
    coordinator.start_stage_all(Stage::Cleanup, Utc::now()).await;
    coordinator.wait_for_stage(Stage::Cleanup, warpcore::defaults::STAGE_POLL_INTERVAL).await?;

    let streams = coordinator.download_ops().await;
    let merged = warpcore::oplog::rebase_thread_ids(streams);
    info!(ops = merged.len(), "benchmark complete");

    if let Some(path) = &args.benchdata {
        warpcore::codec::write_oplog_csv_zst(path, &merged)?;
        info!(?path, "wrote oplog");
    }

    coordinator.close_all().await;
    Ok(())
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let ops = warpcore::codec::read_oplog_csv_zst(&args.file)?;
    let segment_duration = args
        .segment_duration
        .map(|d| chrono::Duration::from_std(d).unwrap_or_default())
        .unwrap_or_else(|| chrono::Duration::from_std(warpcore::defaults::SEGMENT_DURATION).unwrap());

    let aggregator = warpcore::aggregator::Aggregator::new(segment_duration);
    let stats = aggregator.aggregate(&ops, args.op_type.as_deref(), args.host.as_deref());

    if args.verbose {
        for s in &stats {
            info!(
                "{} - {}: {:.1} ops ({} full, {:.1} partial), {} errors, {}, {}",
                s.start,
                s.end,
                s.full_ops as f64 + s.partial_ops,
                s.full_ops,
                s.partial_ops,
                s.errors,
                warpcore::utils::format_throughput(s.bytes_per_sec),
                warpcore::utils::format_latency(s.mean_latency_ns as u64),
            );
        }
    }

    if let Some(out) = &args.out {
        if out.extension().and_then(|e| e.to_str()) == Some("csv") {
            warpcore::codec::write_aggregate_csv(out, &stats)?;
        } else {
            warpcore::codec::write_json_report(out, &stats)?;
        }
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let mut streams = Vec::with_capacity(args.files.len());
    for file in &args.files {
        streams.push(warpcore::codec::read_oplog_csv_zst(file)?);
    }
    let merged = warpcore::oplog::rebase_thread_ids(streams);
    info!(ops = merged.len(), "merged oplogs");

    if let Some(out) = &args.out {
        warpcore::codec::write_oplog_csv_zst(out, &merged)?;
    }
    Ok(())
}

fn run_cmp(args: CmpArgs) -> Result<()> {
    let before_ops = warpcore::codec::read_oplog_csv_zst(&args.before)?;
    let after_ops = warpcore::codec::read_oplog_csv_zst(&args.after)?;

    let segment_duration = chrono::Duration::from_std(warpcore::defaults::SEGMENT_DURATION).unwrap();
    let aggregator = warpcore::aggregator::Aggregator::new(segment_duration);
    let before = aggregator.aggregate(&before_ops, None, None);
    let after = aggregator.aggregate(&after_ops, None, None);

    let deltas = warpcore::aggregator::compare_totals(&before, &after);
    for delta in deltas {
        info!(
            "{}: {:.2} -> {:.2} ({:+.1}%)",
            delta.metric, delta.before, delta.after, delta.pct_change
        );
    }
    Ok(())
}
