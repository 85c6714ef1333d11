//! Command-line surface: `agent`, the benchmark-invocation subcommands,
//! `analyze`, `merge` and `cmp` (spec §6.4), plus the small parsers
//! (duration, sync-start, host-list ellipsis expansion) the coordinator
//! and agent binaries share.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed S3 benchmark coordination core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write detailed logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the long-lived agent WebSocket server.
    Agent(AgentArgs),
    /// Invoke a workload against one or more agents (or standalone).
    Bench(BenchArgs),
    /// Produce segmented statistics from a persisted OpLog stream.
    Analyze(AnalyzeArgs),
    /// Merge two or more OpLog streams into one.
    Merge(MergeArgs),
    /// Compare two aggregated results and report percentage deltas.
    Cmp(CmpArgs),
}

#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Address to listen on.
    #[arg(default_value = ":7761")]
    pub listen_addr: String,
}

#[derive(Parser, Debug, Clone)]
pub struct BenchArgs {
    /// Workload command name (e.g. "get", "put", "mixed").
    pub command: String,

    #[arg(long, env = "WARP_HOST")]
    pub host: String,

    #[arg(long, env = "WARP_ACCESS_KEY")]
    pub access_key: String,

    #[arg(long, env = "WARP_SECRET_KEY")]
    pub secret_key: String,

    #[arg(long, env = "WARP_TLS")]
    pub tls: bool,

    #[arg(long, env = "WARP_ENCRYPT")]
    pub encrypt: bool,

    #[arg(long, default_value_t = 20)]
    pub concurrent: usize,

    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub duration: Duration,

    #[arg(long, default_value = "warp-benchmark-bucket")]
    pub bucket: String,

    #[arg(long)]
    pub benchdata: Option<PathBuf>,

    /// Absolute clock-of-day ("HH:MM") or relative ("+3s") time at which
    /// every agent (and the coordinator itself, in standalone mode) should
    /// begin the benchmark stage.
    #[arg(long, value_parser = parse_syncstart)]
    pub syncstart: Option<SyncStart>,

    /// Comma-separated agent endpoints, supporting `host{1...4}:port`
    /// ellipsis expansion.
    #[arg(long, value_delimiter = ',')]
    pub agents: Vec<String>,

    #[arg(long)]
    pub noclear: bool,

    #[arg(long)]
    pub keep_data: bool,

    /// Abort the whole run on the first agent-level failure instead of
    /// continuing with survivors.
    #[arg(long)]
    pub fail_on_error: bool,
}

#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    pub file: PathBuf,
    #[arg(long = "analyze.dur", value_parser = parse_duration)]
    pub segment_duration: Option<Duration>,
    #[arg(long = "analyze.op")]
    pub op_type: Option<String>,
    #[arg(long = "analyze.host")]
    pub host: Option<String>,
    #[arg(long = "analyze.out")]
    pub out: Option<PathBuf>,
    #[arg(long = "analyze.v")]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
pub struct MergeArgs {
    pub files: Vec<PathBuf>,
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CmpArgs {
    pub before: PathBuf,
    pub after: PathBuf,
}

/// When the benchmark stage should start, as parsed from `--syncstart`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncStart {
    /// Next occurrence of this time of day, in the local timezone.
    ClockTime { hour: u32, minute: u32 },
    /// `delay` from "now" at the moment the coordinator evaluates it.
    Relative { delay: Duration },
}

fn parse_syncstart(s: &str) -> Result<SyncStart, String> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('+') {
        let delay = parse_duration(rest)?;
        return Ok(SyncStart::Relative { delay });
    }
    let mut parts = s.splitn(2, ':');
    let hour: u32 = parts
        .next()
        .ok_or_else(|| "expected HH:MM".to_string())?
        .parse()
        .map_err(|_| "invalid hour".to_string())?;
    let minute: u32 = parts
        .next()
        .ok_or_else(|| "expected HH:MM".to_string())?
        .parse()
        .map_err(|_| "invalid minute".to_string())?;
    if hour > 23 || minute > 59 {
        return Err("time of day out of range".to_string());
    }
    Ok(SyncStart::ClockTime { hour, minute })
}

/// Parse a human-readable duration ("30s", "5m", "1h", "1500ms", or a bare
/// number assumed to be seconds). Adapted from the teacher's duration
/// parser; fractional values are supported via a floating-point parse of
/// the numeric portion.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => unreachable!(),
    })
}

/// Render a duration back to the same short form `parse_duration` accepts,
/// used for the canonical flag-value string sent over the wire.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", d.as_millis())
    } else if secs < 60.0 {
        format!("{secs}s")
    } else if secs < 3600.0 {
        format!("{}m", secs / 60.0)
    } else {
        format!("{}h", secs / 3600.0)
    }
}

/// Expand a `host{a...b}:port`-style ellipsis pattern into individual
/// endpoints, e.g. `minio{1...4}:9000` -> `minio1:9000 .. minio4:9000`.
/// Patterns without a `{...}` block are returned unchanged as a single
/// endpoint.
pub fn expand_hosts(pattern: &str) -> Result<Vec<String>, String> {
    let Some(open) = pattern.find('{') else {
        return Ok(vec![pattern.to_string()]);
    };
    let close = pattern[open..]
        .find('}')
        .map(|i| i + open)
        .ok_or_else(|| format!("unterminated ellipsis in host pattern: {pattern}"))?;

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    let body = &pattern[open + 1..close];

    let (lo_str, hi_str) = body
        .split_once("...")
        .ok_or_else(|| format!("expected `a...b` inside braces, got `{body}`"))?;
    let lo: u64 = lo_str
        .parse()
        .map_err(|_| format!("invalid range start: {lo_str}"))?;
    let hi: u64 = hi_str
        .parse()
        .map_err(|_| format!("invalid range end: {hi_str}"))?;
    if lo > hi {
        return Err(format!("range start {lo} is after range end {hi}"));
    }

    let width = lo_str.len().max(1);
    let zero_padded = lo_str.starts_with('0') && lo_str.len() > 1;

    Ok((lo..=hi)
        .map(|n| {
            let num = if zero_padded {
                format!("{n:0width$}")
            } else {
                n.to_string()
            };
            format!("{prefix}{num}{suffix}")
        })
        .collect())
}

/// Expand every pattern in `agents` via `expand_hosts`, flattening the
/// result into the coordinator's full endpoint list.
pub fn expand_agent_list(agents: &[String]) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    for pattern in agents {
        out.extend(expand_hosts(pattern)?);
    }
    Ok(out)
}
