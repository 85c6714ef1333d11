//! The benchmark workload contract and host-selection strategies.
//!
//! A workload module owns the actual S3 traffic (payload shapes, bucket
//! layout, request mix); this crate never speaks S3 itself. What it needs
//! from a workload is the three-stage lifecycle every agent drives it
//! through, plus enough identity (`name`, `common` flags) to report what ran.

use crate::error::Result;
use crate::oplog::OpStore;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Flags common to every workload: concurrency, bucket, and whether
/// existing bucket contents should be cleared before `prepare` runs.
#[derive(Debug, Clone)]
pub struct CommonArgs {
    pub bucket: String,
    pub concurrent: usize,
    pub noclear: bool,
    pub keep_data: bool,
}

/// The three-stage contract every workload module implements. `prepare`
/// uploads fixtures and is run once before timing starts; `start` spins up
/// `concurrent` workers that loop issuing operations until the benchmark
/// stage's latch closes, appending one `OpLog` per operation to `ops`;
/// `cleanup` removes whatever `prepare` created, unless `keep_data` was set.
///
/// Non-goal: no workload body (payload generation, request mix) is provided
/// by this crate. Implementations here exist only to drive the three-stage
/// contract in tests.
#[async_trait]
pub trait Benchmark: Send + Sync {
    fn name(&self) -> &str;

    fn common(&self) -> &CommonArgs;

    async fn prepare(&self) -> Result<()>;

    /// Run until `stop` resolves. `client_id` and `thread_id` identify the
    /// calling worker for the OpLog rows it appends.
    async fn start(&self, client_id: &str, thread_id: u16, ops: Arc<OpStore>, stop: crate::stage::Latch) -> Result<()>;

    async fn cleanup(&self) -> Result<()>;
}

/// A deterministic workload used by integration tests in place of a real S3
/// traffic generator: each worker sleeps a fixed interval and appends a
/// fixed-shape `OpLog`, so tests can assert on exact counts and timing
/// without a live endpoint.
pub struct SyntheticBenchmark {
    common: CommonArgs,
    op_interval: std::time::Duration,
    op_size: i64,
    fail_every: Option<usize>,
    prepared: std::sync::atomic::AtomicBool,
    cleaned_up: std::sync::atomic::AtomicBool,
}

impl SyntheticBenchmark {
    pub fn new(common: CommonArgs, op_interval: std::time::Duration, op_size: i64) -> Self {
        Self {
            common,
            op_interval,
            op_size,
            fail_every: None,
            prepared: std::sync::atomic::AtomicBool::new(false),
            cleaned_up: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Every `n`th operation (per worker) is recorded as an error instead of
    /// a success, used by tests that exercise error accounting.
    pub fn with_fail_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn was_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn was_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Benchmark for SyntheticBenchmark {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn common(&self) -> &CommonArgs {
        &self.common
    }

    async fn prepare(&self) -> Result<()> {
        self.prepared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, client_id: &str, thread_id: u16, ops: Arc<OpStore>, stop: crate::stage::Latch) -> Result<()> {
        let mut count: usize = 0;
        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = tokio::time::sleep(self.op_interval) => {}
            }
            let start = chrono::Utc::now();
            let end = start + chrono::Duration::from_std(self.op_interval).unwrap_or_default();
            let err = match self.fail_every {
                Some(n) if n > 0 && (count + 1) % n == 0 => "synthetic failure".to_string(),
                _ => String::new(),
            };
            ops.append(crate::oplog::OpLog {
                op_type: "GET".to_string(),
                client_id: client_id.to_string(),
                thread_id,
                endpoint: "synthetic".to_string(),
                bucket: self.common.bucket.clone(),
                object_key: format!("obj-{thread_id}-{count}"),
                obj_per_op: 1,
                size: self.op_size,
                start,
                first_byte: Some(start),
                end,
                err,
            });
            count += 1;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleaned_up.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Strategy for picking which connected agent should be handed the next
/// unit of work (a benchmark invocation, or a poll request outside a
/// broadcast-to-all operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorStrategy {
    RoundRobin,
    LeastLoaded,
}

/// A host and its current in-flight request count, tracked so
/// `LeastLoaded` can pick the idlest agent and release its claim exactly
/// once the request completes.
struct HostLoad {
    endpoint: String,
    inflight: AtomicUsize,
}

/// Picks an agent endpoint for the coordinator's per-connection RPCs.
/// `RoundRobin` cycles deterministically; `LeastLoaded` picks the host with
/// the fewest in-flight requests, breaking ties uniformly at random so a
/// pack of equally idle hosts doesn't always send to the same index.
pub struct HostSelector {
    strategy: SelectorStrategy,
    hosts: Vec<HostLoad>,
    next: AtomicUsize,
}

impl HostSelector {
    pub fn new(strategy: SelectorStrategy, endpoints: Vec<String>) -> Self {
        let hosts = endpoints
            .into_iter()
            .map(|endpoint| HostLoad {
                endpoint,
                inflight: AtomicUsize::new(0),
            })
            .collect();
        Self {
            strategy,
            hosts,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Claim a host for the duration of one request. The returned guard's
    /// `Drop` releases the claim exactly once, so a caller that forgets to
    /// await the matching response still frees the slot.
    pub fn acquire(&self) -> HostClaim<'_> {
        let idx = match self.strategy {
            SelectorStrategy::RoundRobin => self.next.fetch_add(1, Ordering::SeqCst) % self.hosts.len(),
            SelectorStrategy::LeastLoaded => self.least_loaded_index(),
        };
        self.hosts[idx].inflight.fetch_add(1, Ordering::SeqCst);
        HostClaim { selector: self, idx }
    }

    fn least_loaded_index(&self) -> usize {
        let min = self
            .hosts
            .iter()
            .map(|h| h.inflight.load(Ordering::SeqCst))
            .min()
            .unwrap_or(0);
        let candidates: Vec<usize> = self
            .hosts
            .iter()
            .enumerate()
            .filter(|(_, h)| h.inflight.load(Ordering::SeqCst) == min)
            .map(|(i, _)| i)
            .collect();
        if candidates.len() == 1 {
            return candidates[0];
        }
        let pick = rand::thread_rng().gen_range(0..candidates.len());
        candidates[pick]
    }
}

/// Exactly-once release discipline: the claimed host's in-flight count is
/// decremented the first time the guard is dropped (or released early) and
/// never again.
pub struct HostClaim<'a> {
    selector: &'a HostSelector,
    idx: usize,
}

impl<'a> HostClaim<'a> {
    pub fn endpoint(&self) -> &str {
        &self.selector.hosts[self.idx].endpoint
    }
}

impl Drop for HostClaim<'_> {
    fn drop(&mut self) {
        self.selector.hosts[self.idx].inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn synthetic_benchmark_records_ops_until_stopped() {
        let common = CommonArgs {
            bucket: "b".into(),
            concurrent: 1,
            noclear: false,
            keep_data: false,
        };
        let bench = SyntheticBenchmark::new(common, std::time::Duration::from_millis(5), 1024);
        bench.prepare().await.unwrap();
        assert!(bench.was_prepared());

        let store = Arc::new(OpStore::new());
        let stop = crate::stage::Latch::new();
        let stop2 = stop.clone();
        let store2 = store.clone();
        let handle = tokio::spawn(async move {
            bench_run(store2, stop2).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        stop.close();
        handle.await.unwrap();

        assert!(store.len() >= 2);
    }

    async fn bench_run(ops: Arc<OpStore>, stop: crate::stage::Latch) {
        let common = CommonArgs {
            bucket: "b".into(),
            concurrent: 1,
            noclear: false,
            keep_data: false,
        };
        let bench = SyntheticBenchmark::new(common, std::time::Duration::from_millis(5), 1024);
        bench.start("c1", 0, ops, stop).await.unwrap();
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let sel = HostSelector::new(
            SelectorStrategy::RoundRobin,
            vec!["a".into(), "b".into(), "c".into()],
        );
        let e1 = sel.acquire().endpoint().to_string();
        let e2 = sel.acquire().endpoint().to_string();
        let e3 = sel.acquire().endpoint().to_string();
        let e4 = sel.acquire().endpoint().to_string();
        assert_eq!(vec![e1, e2, e3, e4], vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn least_loaded_picks_idlest_host() {
        let sel = HostSelector::new(SelectorStrategy::LeastLoaded, vec!["a".into(), "b".into()]);
        let claim_a = sel.acquire();
        // "a" now has 1 in-flight; the next acquire must prefer "b".
        let claim_b = sel.acquire();
        assert_ne!(claim_a.endpoint(), claim_b.endpoint());
    }

    #[test]
    fn claim_release_is_exactly_once() {
        let sel = HostSelector::new(SelectorStrategy::RoundRobin, vec!["a".into()]);
        {
            let _claim = sel.acquire();
            assert_eq!(sel.hosts[0].inflight.load(Ordering::SeqCst), 1);
        }
        assert_eq!(sel.hosts[0].inflight.load(Ordering::SeqCst), 0);
    }
}
