//! # warpcore
//!
//! Coordination core for a distributed S3 benchmark: the coordinator/agent
//! wire protocol, the per-agent benchmark engine and stage state machine,
//! the OpLog store and thread-id rebasing used to merge multi-agent runs,
//! and the segmented aggregation pipeline. Workload bodies (actual S3
//! traffic, payload generation) are out of scope — this crate drives the
//! `Benchmark` trait's lifecycle, it doesn't implement any workload beyond
//! the deterministic synthetic one used in its own tests.

pub mod agent_server;
pub mod aggregator;
pub mod cli;
pub mod clock;
pub mod codec;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod logging;
pub mod oplog;
pub mod protocol;
pub mod stage;
pub mod utils;
pub mod workload;

pub use aggregator::{Aggregator, HostBreakdown, OpTypeSummary, RequestSummary, SegmentStats, SizeBin};
pub use cli::{Cli, Command};
pub use engine::AgentState;
pub use error::{Result, WarpcoreError};
pub use oplog::{OpLog, OpStore};
pub use protocol::{AgentResponse, BenchmarkCommand, FlagValue, ServerRequest};
pub use stage::Stage;

/// The current version of the coordination core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values shared by the CLI and the test workload.
pub mod defaults {
    use std::time::Duration;

    /// Default agent listen address.
    pub const AGENT_LISTEN_ADDR: &str = ":7761";

    /// Default benchmark duration.
    pub const DURATION: Duration = Duration::from_secs(5);

    /// Default per-agent worker concurrency.
    pub const CONCURRENCY: usize = 20;

    /// Default bucket name used by workloads that don't override it.
    pub const BUCKET: &str = "warp-benchmark-bucket";

    /// Default segment duration used by `analyze` when `--analyze.dur` is
    /// not given: one segment per second of the run.
    pub const SEGMENT_DURATION: Duration = Duration::from_secs(1);

    /// Interval the coordinator waits between `wait_for_stage` polls (spec
    /// §4.2/§5: "poll `stage_status` at 1 s intervals").
    pub const STAGE_POLL_INTERVAL: Duration = Duration::from_secs(1);
}
