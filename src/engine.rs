//! Per-agent benchmark driver: owns the stage state machine, the active
//! workload, and the `OpStore` workers append to.
//!
//! `AgentState` is explicitly constructed and passed to the WebSocket
//! handler via `axum::extract::State` rather than reached via a global —
//! every agent process hosts exactly one, but nothing here assumes that.

use crate::error::{Result, WarpcoreError};
use crate::oplog::OpStore;
use crate::protocol::{AgentResponse, BenchmarkCommand, StageInfo};
use crate::stage::{Stage, StageSignal};
use crate::workload::Benchmark;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Shared, mutable state for one agent connection's lifetime: the active
/// benchmark, its per-stage signals, and the accumulated `OpLog` stream.
pub struct AgentState {
    pub client_id: String,
    ops: Arc<OpStore>,
    signals: Mutex<HashMap<Stage, StageSignal>>,
    benchmark: Mutex<Option<Arc<dyn Benchmark>>>,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AgentState {
    pub fn new(client_id: impl Into<String>) -> Self {
        let mut signals = HashMap::new();
        for stage in Stage::ALL {
            signals.insert(stage, StageSignal::new());
        }
        Self {
            client_id: client_id.into(),
            ops: Arc::new(OpStore::new()),
            signals: Mutex::new(signals),
            benchmark: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Arc<OpStore> {
        self.ops.clone()
    }

    async fn signal(&self, stage: Stage) -> StageSignal {
        self.signals.lock().await.get(&stage).cloned().expect("all stages registered at construction")
    }

    /// Install the benchmark that a `Benchmark` request instantiated.
    /// Building the concrete `Benchmark` impl from a `BenchmarkCommand`'s
    /// workload name is the job of a registry this crate doesn't ship
    /// (spec Non-goal: workload bodies); callers supply the already-built
    /// trait object.
    pub async fn install_benchmark(&self, benchmark: Arc<dyn Benchmark>) {
        *self.benchmark.lock().await = Some(benchmark);
    }

    /// Idempotently arrange for `stage` to begin at `start_time`: the first
    /// caller for a given stage spawns the timer task; later callers for the
    /// same stage are no-ops, matching the wire protocol's "start_stage is
    /// safe to retry" contract.
    pub async fn start_stage(self: &Arc<Self>, stage: Stage, start_time: DateTime<Utc>) -> Result<()> {
        let signal = self.signal(stage).await;
        if !signal.mark_start_requested() {
            debug!(?stage, "start_stage already requested, ignoring retry");
            return Ok(());
        }

        let now = Utc::now();
        let delay = (start_time - now).to_std().unwrap_or_default();
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_stage(stage).await;
        });
        Ok(())
    }

    async fn run_stage(self: &Arc<Self>, stage: Stage) {
        let signal = self.signal(stage).await;
        signal.start.close();
        info!(?stage, client_id = %self.client_id, "stage started");

        let benchmark = self.benchmark.lock().await.clone();
        let Some(benchmark) = benchmark else {
            warn!(?stage, "no benchmark installed, closing stage immediately");
            signal.done.close();
            return;
        };

        match stage {
            Stage::Prepare => {
                if let Err(e) = benchmark.prepare().await {
                    warn!(?e, "prepare stage failed");
                }
                signal.done.close();
            }
            Stage::Benchmark => {
                let common = benchmark.common().clone();
                let mut handles = Vec::with_capacity(common.concurrent);
                for thread_id in 0..common.concurrent as u16 {
                    let bm = benchmark.clone();
                    let ops = self.ops.clone();
                    let stop = signal.done.clone();
                    let client_id = self.client_id.clone();
                    handles.push(tokio::spawn(async move {
                        if let Err(e) = bm.start(&client_id, thread_id, ops, stop).await {
                            warn!(?e, "worker exited with error");
                        }
                    }));
                }
                *self.worker_handles.lock().await = handles;
            }
            Stage::Cleanup => {
                if let Err(e) = benchmark.cleanup().await {
                    warn!(?e, "cleanup stage failed");
                }
                signal.done.close();
            }
        }
    }

    /// Signal the benchmark stage's workers to stop, then await their
    /// completion and close the stage's `done` latch. Prepare/cleanup close
    /// their own `done` latch directly since they run to completion rather
    /// than being told to stop.
    pub async fn stop_benchmark_stage(&self) {
        let signal = self.signal(Stage::Benchmark).await;
        if signal.finished() {
            return;
        }
        signal.done.close();
        let handles = std::mem::take(&mut *self.worker_handles.lock().await);
        for h in handles {
            let _ = h.await;
        }
    }

    pub async fn stage_status(&self, stage: Stage) -> StageInfo {
        let signal = self.signal(stage).await;
        StageInfo {
            started: signal.started(),
            finished: signal.finished(),
            progress: None,
            custom: None,
        }
    }
}

/// Build the concrete `Benchmark` for an incoming `BenchmarkCommand`. This
/// crate ships only the `synthetic` workload (used by its own integration
/// tests); a real deployment registers additional workload names before
/// calling into `engine`/`agent_server`.
pub fn build_benchmark(cmd: &BenchmarkCommand) -> Result<Arc<dyn Benchmark>> {
    if cmd.command != "synthetic" {
        return Err(WarpcoreError::Stage(format!("unknown workload command: {}", cmd.command)));
    }
    let bucket = cmd.flags.get("bucket").cloned().unwrap_or_else(|| "warp-benchmark-bucket".to_string());
    let concurrent: usize = cmd.flags.get("concurrent").and_then(|v| v.parse().ok()).unwrap_or(1);
    let noclear = cmd.flags.get("noclear").map(|v| v == "true").unwrap_or(false);
    let keep_data = cmd.flags.get("keep_data").map(|v| v == "true").unwrap_or(false);
    let interval_ms: u64 = cmd.flags.get("op_interval_ms").and_then(|v| v.parse().ok()).unwrap_or(10);
    let size: i64 = cmd.flags.get("op_size").and_then(|v| v.parse().ok()).unwrap_or(1024);

    let common = crate::workload::CommonArgs {
        bucket,
        concurrent,
        noclear,
        keep_data,
    };
    Ok(Arc::new(crate::workload::SyntheticBenchmark::new(
        common,
        std::time::Duration::from_millis(interval_ms),
        size,
    )))
}

/// Build the agent's response to the `benchmark` handshake: installs the
/// workload and reports the local time, for the caller's clock-skew check.
pub async fn handle_benchmark_request(state: &Arc<AgentState>, cmd: &BenchmarkCommand) -> AgentResponse {
    match build_benchmark(cmd) {
        Ok(bm) => {
            state.install_benchmark(bm).await;
            AgentResponse::BenchmarkStarted {
                time: Utc::now(),
                err: String::new(),
            }
        }
        Err(e) => AgentResponse::BenchmarkStarted {
            time: Utc::now(),
            err: e.to_string(),
        },
    }
}
