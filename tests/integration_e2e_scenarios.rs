//! End-to-end scenario coverage beyond the coordinator/agent handshake
//! (spec §8 E1, E2, E5, E6): synchronized multi-agent start, surviving a
//! mid-benchmark agent failure, merging overlapping multi-agent streams,
//! and incremental `send_ops` polling mid-run.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use warpcore::agent_server::{router, AgentServerState};
use warpcore::aggregator::Aggregator;
use warpcore::coordinator::{ConnectionSlot, CoordinatorClient};
use warpcore::oplog::{rebase_thread_ids, OpLog};
use warpcore::protocol::{AgentResponse, BenchmarkCommand, ServerRequest};
use warpcore::stage::Stage;

async fn spawn_agent(secret: &str) -> String {
    let state = AgentServerState::new(secret);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let app = router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr.to_string()
}

/// Like `spawn_agent`, but returns a sender that triggers a graceful shutdown
/// of the listener, simulating an agent process that disappears mid-run.
async fn spawn_stoppable_agent(secret: &str) -> (String, tokio::sync::oneshot::Sender<()>) {
    let state = AgentServerState::new(secret);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let app = router(state);
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
    });
    (addr.to_string(), tx)
}

fn synthetic_command(concurrent: usize, op_interval_ms: u64) -> BenchmarkCommand {
    let mut flags = HashMap::new();
    flags.insert("bucket".to_string(), "e2e-bucket".to_string());
    flags.insert("concurrent".to_string(), concurrent.to_string());
    flags.insert("op_interval_ms".to_string(), op_interval_ms.to_string());
    BenchmarkCommand {
        command: "synthetic".to_string(),
        args: vec![],
        flags,
    }
}

/// E1: broadcasting `start_stage(benchmark, T0)` to two agents lands both
/// of them in the running state close enough together (well under the
/// poll/segment granularity) that the merged stream's earliest ops are
/// effectively simultaneous, not staggered by per-agent RPC latency.
#[tokio::test]
async fn e1_two_agents_start_benchmark_stage_in_sync() {
    let a = spawn_agent("s3cr3t").await;
    let b = spawn_agent("s3cr3t").await;
    let coordinator = CoordinatorClient::connect_all(vec![a, b], "coord-e1", "s3cr3t", true).await.expect("both agents reachable");

    coordinator
        .broadcast(ServerRequest::Benchmark { benchmark: synthetic_command(2, 5) })
        .await;

    coordinator.start_stage_all(Stage::Prepare, Utc::now()).await;
    coordinator.wait_for_stage(Stage::Prepare, StdDuration::from_millis(20)).await.expect("prepare completes");

    let start_time = Utc::now() + ChronoDuration::milliseconds(300);
    coordinator.start_stage_all(Stage::Benchmark, start_time).await;

    tokio::time::sleep(StdDuration::from_millis(500)).await;

    let statuses = coordinator.broadcast(ServerRequest::StageStatus { stage: Stage::Benchmark }).await;
    for status in &statuses {
        match status {
            Ok(AgentResponse::BenchmarkStatus { stage_info, .. }) => assert!(stage_info.started, "agent must have entered the benchmark stage"),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    let streams = coordinator.download_ops().await;
    assert_eq!(streams.len(), 2);
    let first_starts: Vec<_> = streams
        .iter()
        .map(|s| s.iter().map(|op| op.start).min().expect("each agent produced at least one op"))
        .collect();

    let skew = (first_starts[0] - first_starts[1]).num_milliseconds().abs();
    assert!(skew < 100, "agents' first ops should start within 100ms of each other, got {skew}ms");

    for first_start in &first_starts {
        let delta = (*first_start - start_time).num_milliseconds();
        assert!(delta >= -50 && delta < 400, "first op should start close to the scheduled start_time, delta={delta}ms");
    }

    coordinator.close_all().await;
}

/// E2: one agent disappears mid-benchmark. The coordinator's subsequent
/// broadcasts must exclude that slot rather than block or retry it forever,
/// and must keep driving the surviving agent.
#[tokio::test]
async fn e2_agent_failure_mid_benchmark_is_excluded_and_survivors_continue() {
    let (a, _a_keepalive) = spawn_stoppable_agent("s3cr3t").await;
    let (b, b_stop) = spawn_stoppable_agent("s3cr3t").await;
    let coordinator = CoordinatorClient::connect_all(vec![a, b], "coord-e2", "s3cr3t", false)
        .await
        .expect("both agents reachable at connect time");

    coordinator
        .broadcast(ServerRequest::Benchmark { benchmark: synthetic_command(1, 5) })
        .await;
    coordinator.start_stage_all(Stage::Prepare, Utc::now()).await;
    coordinator.wait_for_stage(Stage::Prepare, StdDuration::from_millis(20)).await.expect("prepare completes before failure");

    // Agent b disappears mid-run.
    let _ = b_stop.send(());
    tokio::time::sleep(StdDuration::from_millis(150)).await;

    let results = coordinator.broadcast(ServerRequest::StageStatus { stage: Stage::Prepare }).await;
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok(), "surviving agent must still answer broadcasts");
    assert!(results[1].is_err(), "dead agent's rpc must fail");
    assert!(coordinator.slots[1].is_excluded(), "dead agent's slot must be excluded after the failure");
    assert!(!coordinator.slots[0].is_excluded(), "surviving agent must not be excluded");

    // A later broadcast round must still succeed overall and must not try
    // to reconnect the excluded slot: the surviving agent keeps answering.
    let again = coordinator.broadcast(ServerRequest::StageStatus { stage: Stage::Prepare }).await;
    assert!(again[0].is_ok());
    assert!(again[1].is_err());

    let streams = coordinator.download_ops().await;
    assert_eq!(streams.len(), 2);
    assert!(streams[1].is_empty(), "excluded slot must contribute no ops rather than blocking the download");

    coordinator.close_all().await;
}

/// E5: two agents' OpLog streams, rebased into one merged stream, must be
/// aggregated over the intersection of their active windows rather than the
/// union — the overlapping ~5s window both agents were concurrently active
/// in, not the full ~9s span either one individually covered.
#[tokio::test]
async fn e5_merge_overlap_active_window_is_the_intersection() {
    fn op(base: chrono::DateTime<Utc>, thread_id: u16, start_ms: i64, end_ms: i64) -> OpLog {
        OpLog {
            op_type: "GET".to_string(),
            client_id: "agent".to_string(),
            thread_id,
            endpoint: "localhost:9000".to_string(),
            bucket: "b".to_string(),
            object_key: "k".to_string(),
            obj_per_op: 1,
            size: 4096,
            start: base + ChronoDuration::milliseconds(start_ms),
            first_byte: None,
            end: base + ChronoDuration::milliseconds(end_ms),
            err: String::new(),
        }
    }

    let base = Utc::now();
    // Agent 1: two threads, active from t=0ms to t=9000ms.
    let agent1 = vec![
        op(base, 0, 0, 50),
        op(base, 0, 4000, 4050),
        op(base, 0, 9000, 9050),
        op(base, 1, 500, 550),
        op(base, 1, 4500, 4550),
        op(base, 1, 8000, 8050),
    ];
    // Agent 2: two threads that ramp up later and ramp down earlier,
    // overlapping agent 1 only across [2000ms, 7000ms].
    let agent2 = vec![
        op(base, 0, 2000, 2050),
        op(base, 0, 5000, 5050),
        op(base, 1, 3000, 3050),
        op(base, 1, 7000, 7050),
    ];

    let merged = rebase_thread_ids(vec![agent1, agent2]);
    // Agent 1 used thread ids 0,1; agent 2's must be rebased to 2,3.
    let rebased_ids: Vec<u16> = merged.iter().filter(|o| o.client_id == "agent").map(|o| o.thread_id).collect();
    assert!(rebased_ids.contains(&2) && rebased_ids.contains(&3));

    // Intersection across all four threads: max(first starts) = 3000ms
    // (thread 3's first start), min(last starts) = 5000ms (thread 2's last
    // start). A single wide segment makes the window visible directly.
    let agg = Aggregator::new(ChronoDuration::seconds(20));
    let stats = agg.aggregate(&merged, None, None);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].start, base + ChronoDuration::milliseconds(3000));
    assert_eq!(stats[0].end, base + ChronoDuration::milliseconds(5000));
}

/// E6: polling `send_ops` mid-benchmark returns a prefix of the eventual
/// full stream; a later poll (or a poll after the stage completes) returns
/// a strict superset that starts with that same prefix.
#[tokio::test]
async fn e6_partial_send_ops_is_a_prefix_of_the_eventual_superset() {
    let endpoint = spawn_agent("s3cr3t").await;
    let slot = ConnectionSlot::connect(&endpoint, "coord-e6", "s3cr3t").await.expect("connect");

    slot.rpc(&ServerRequest::Benchmark { benchmark: synthetic_command(2, 5) }).await.expect("benchmark rpc");
    slot.rpc(&ServerRequest::StartStage { stage: Stage::Prepare, start_time: Utc::now() }).await.expect("start prepare");

    loop {
        let resp = slot.rpc(&ServerRequest::StageStatus { stage: Stage::Prepare }).await.expect("stage status");
        if let AgentResponse::BenchmarkStatus { stage_info, .. } = resp {
            if stage_info.finished {
                break;
            }
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }

    slot.rpc(&ServerRequest::StartStage { stage: Stage::Benchmark, start_time: Utc::now() }).await.expect("start benchmark");
    tokio::time::sleep(StdDuration::from_millis(60)).await;

    let prefix = match slot.rpc(&ServerRequest::SendOps).await.expect("first send_ops") {
        AgentResponse::Ops { ops, .. } => ops,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(!prefix.is_empty(), "benchmark stage should have produced some ops already");

    tokio::time::sleep(StdDuration::from_millis(80)).await;

    let superset = match slot.rpc(&ServerRequest::SendOps).await.expect("second send_ops") {
        AgentResponse::Ops { ops, .. } => ops,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(superset.len() >= prefix.len(), "a later snapshot must be at least as large as an earlier one");
    assert_eq!(&superset[..prefix.len()], &prefix[..], "the earlier snapshot must be an exact prefix of the later one");

    let (since, next_idx) = match slot.rpc(&ServerRequest::SendOpsSince { idx: prefix.len() }).await.expect("send_ops_since") {
        AgentResponse::Ops { ops, next_idx, .. } => (ops, next_idx.expect("send_ops_since always reports next_idx")),
        other => panic!("unexpected response: {other:?}"),
    };
    // The store only grows between calls, so `since` must at least cover
    // everything `superset` had beyond the prefix, in the same order.
    assert!(since.len() >= superset.len() - prefix.len());
    assert!(since.starts_with(&superset[prefix.len()..]));
    assert_eq!(next_idx, prefix.len() + since.len());

    slot.rpc(&ServerRequest::Disconnect).await.ok();
}
