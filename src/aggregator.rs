//! Segmented aggregation over a merged `OpLog` stream: throughput and
//! latency statistics per fixed-width time segment, with partial operations
//! prorated across segment boundaries rather than attributed wholesale to
//! whichever segment they end in.
//!
//! Percentile/latency plumbing follows the same shape as the teacher's
//! `LatencyCollector` (HDR histogram plus separately tracked exact min/max,
//! since histogram buckets quantize away the true extremes).

use crate::oplog::OpLog;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Segments are capped at this count regardless of the requested segment
/// duration, so a long benchmark with a very short `--analyze.dur` doesn't
/// produce an unusably large report.
pub const MAX_SEGMENTS: usize = 400;

/// A closed-open time window `[start, end)` that ops are attributed into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Segment {
    pub fn duration(&self) -> ChronoDuration {
        self.end - self.start
    }

    fn overlap(&self, op_start: DateTime<Utc>, op_end: DateTime<Utc>) -> Option<ChronoDuration> {
        let lo = self.start.max(op_start);
        let hi = self.end.min(op_end);
        if hi > lo {
            Some(hi - lo)
        } else {
            None
        }
    }
}

/// Choose segment boundaries covering `[run_start, run_end)`. If
/// `requested` would produce more than [`MAX_SEGMENTS`] segments, the
/// segment width is widened to the smallest value that keeps the count at
/// or under the cap.
pub fn choose_segments(run_start: DateTime<Utc>, run_end: DateTime<Utc>, requested: ChronoDuration) -> Vec<Segment> {
    let total = run_end - run_start;
    if total <= ChronoDuration::zero() || requested <= ChronoDuration::zero() {
        return vec![Segment { start: run_start, end: run_end }];
    }

    let mut width = requested;
    let naive_count = (total.num_milliseconds() as f64 / width.num_milliseconds().max(1) as f64).ceil() as usize;
    if naive_count > MAX_SEGMENTS {
        let widened_ms = (total.num_milliseconds() as f64 / MAX_SEGMENTS as f64).ceil() as i64;
        width = ChronoDuration::milliseconds(widened_ms.max(1));
    }

    let mut segments = Vec::new();
    let mut cursor = run_start;
    while cursor < run_end && segments.len() < MAX_SEGMENTS {
        let next = (cursor + width).min(run_end);
        segments.push(Segment { start: cursor, end: next });
        cursor = next;
    }
    segments
}

/// The fraction of `op`'s size, object count, and duration attributed to
/// each segment it overlaps. An op that falls entirely within one segment
/// contributes its whole size there and is a "full" op for that segment; an
/// op spanning a boundary is split proportionally to the wall-clock
/// overlap and is a "partial" op in each segment it touches, so summing
/// `contributions` across all segments reproduces the op's original size
/// and duration exactly (conservation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub segment_index: usize,
    pub fraction: f64,
    pub size: f64,
    pub objects: f64,
    pub duration: ChronoDuration,
    pub full: bool,
}

/// Pure function: attribute one op's size/duration across the segments it
/// overlaps. Errored ops (non-empty `err`) contribute nothing to any
/// segment's throughput/latency — they are counted separately as errors.
pub fn attribute(op: &OpLog, segments: &[Segment]) -> Vec<Contribution> {
    if op.is_error() {
        return Vec::new();
    }
    let total_duration = op.duration();
    if total_duration <= ChronoDuration::zero() {
        return Vec::new();
    }
    let total_ms = total_duration.num_milliseconds().max(1) as f64;

    let mut raw = Vec::new();
    for (i, seg) in segments.iter().enumerate() {
        if let Some(overlap) = seg.overlap(op.start, op.end) {
            let fraction = (overlap.num_milliseconds() as f64 / total_ms).min(1.0);
            raw.push((i, fraction, overlap));
        }
    }

    // An op strictly interior to a single segment (neither end clipped) is
    // a full op there rather than a prorated partial one.
    let full = raw.len() == 1 && (raw[0].1 - 1.0).abs() < 1e-9;

    raw.into_iter()
        .map(|(i, fraction, overlap)| Contribution {
            segment_index: i,
            fraction,
            size: op.size as f64 * fraction,
            objects: op.obj_per_op as f64 * fraction,
            duration: overlap,
            full,
        })
        .collect()
}

/// Percentile value at a requested quantile, reported alongside the
/// histogram's quantization error so a reader can judge precision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PercentileValue {
    pub quantile: f64,
    pub value_ns: u64,
}

/// Latency distribution for one segment (or for the whole run), built from
/// an HDR histogram plus separately tracked exact min/max to avoid the
/// quantization drift a histogram-derived min/max would show.
pub struct LatencyCollector {
    histogram: Histogram<u64>,
    observed_min_ns: u64,
    observed_max_ns: u64,
    count: u64,
}

impl LatencyCollector {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, 60_000_000_000, 3).expect("valid histogram bounds"),
            observed_min_ns: u64::MAX,
            observed_max_ns: 0,
            count: 0,
        }
    }

    pub fn record(&mut self, latency: ChronoDuration) {
        let ns = latency.num_nanoseconds().unwrap_or(0).max(1) as u64;
        let _ = self.histogram.record(ns);
        self.observed_min_ns = self.observed_min_ns.min(ns);
        self.observed_max_ns = self.observed_max_ns.max(ns);
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn percentile(&self, quantile: f64) -> PercentileValue {
        PercentileValue {
            quantile,
            value_ns: self.histogram.value_at_quantile(quantile),
        }
    }

    pub fn min_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.observed_min_ns
        }
    }

    pub fn max_ns(&self) -> u64 {
        self.observed_max_ns
    }

    pub fn mean_ns(&self) -> f64 {
        self.histogram.mean()
    }

    pub fn stdev_ns(&self) -> f64 {
        self.histogram.stdev()
    }
}

impl Default for LatencyCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Throughput and latency statistics for one segment of one op-type's
/// active window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentStats {
    pub op_type: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Ops attributed wholly to this segment (neither end clipped).
    pub full_ops: u64,
    /// Prorated share of ops that straddle a segment boundary; fractional
    /// since an op split across N segments contributes `frac` to each.
    pub partial_ops: f64,
    /// Ops whose `start` timestamp falls in this segment, full or partial.
    pub ops_started: u64,
    /// Ops whose `end` timestamp falls in this segment, full or partial.
    pub ops_ended: u64,
    pub errors: u64,
    pub bytes: f64,
    pub objects: f64,
    pub bytes_per_sec: f64,
    pub ops_per_sec: f64,
    pub objs_per_sec: f64,
    pub percentiles: Vec<PercentileValue>,
    pub min_latency_ns: u64,
    pub max_latency_ns: u64,
    pub mean_latency_ns: f64,
    pub stdev_latency_ns: f64,
}

pub const DEFAULT_PERCENTILES: [f64; 4] = [0.50, 0.90, 0.99, 0.999];

/// Per-host throughput and object totals over an op-type's whole active
/// window (not split into segments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBreakdown {
    pub endpoint: String,
    pub full_ops: u64,
    pub partial_ops: f64,
    pub errors: u64,
    pub bytes: f64,
    pub objects: f64,
    pub bytes_per_sec: f64,
    pub ops_per_sec: f64,
    pub mean_first_byte_latency_ns: f64,
}

/// Throughput for one distinct object size, for multi-size workloads where
/// a single request-duration distribution would conflate sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeBin {
    pub size: i64,
    pub ops: u64,
    pub bytes: f64,
    pub bytes_per_sec: f64,
}

/// Request-level latency summary. Single-size workloads get one latency
/// distribution; multi-size workloads are split into per-size bins instead,
/// since a blended distribution across sizes is not a useful number (spec
/// §4.7: request-level summary depends on whether the workload used one
/// object size or several).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RequestSummary {
    SingleSize {
        size: i64,
        mean_ns: f64,
        median_ns: u64,
        p90_ns: u64,
        p99_ns: u64,
        min_ns: u64,
        max_ns: u64,
        stdev_ns: f64,
    },
    MultiSize {
        bins: Vec<SizeBin>,
    },
    Empty,
}

/// Full per-op-type summary: the segmented series plus the whole-window
/// totals, per-host breakdown, and request-level latency view (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpTypeSummary {
    pub op_type: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub segments: Vec<SegmentStats>,
    pub totals: SegmentStats,
    pub hosts: Vec<HostBreakdown>,
    pub mean_first_byte_latency_ns: f64,
    pub mean_of_host_mean_first_byte_latency_ns: f64,
    pub fastest_segment_index: Option<usize>,
    pub median_segment_index: Option<usize>,
    pub slowest_segment_index: Option<usize>,
    pub request_summary: RequestSummary,
    pub sample_errors: Vec<String>,
}

/// Aggregate a merged, rebased `OpLog` stream into per-segment statistics,
/// optionally filtered to one `op_type` and/or one `endpoint` before
/// segmenting (spec's `analyze.op` / `analyze.host` flags).
pub struct Aggregator {
    segment_duration: ChronoDuration,
    percentiles: Vec<f64>,
}

impl Aggregator {
    pub fn new(segment_duration: ChronoDuration) -> Self {
        Self {
            segment_duration,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
        }
    }

    pub fn with_percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.percentiles = percentiles;
        self
    }

    /// The window of stable concurrency across `ops`'s threads: the latest
    /// of all threads' first-op starts, to the earliest of all threads'
    /// last-op starts. This excludes ramp-up (while some threads haven't
    /// started yet) and ramp-down (once some thread has already issued its
    /// final op) so throughput is only measured while every thread was
    /// active — the intersection of per-thread activity, not the union of
    /// the whole run.
    fn active_window(ops: &[&OpLog]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut per_thread: HashMap<u16, (DateTime<Utc>, DateTime<Utc>)> = HashMap::new();
        for op in ops {
            let entry = per_thread.entry(op.thread_id).or_insert((op.start, op.start));
            if op.start < entry.0 {
                entry.0 = op.start;
            }
            if op.start > entry.1 {
                entry.1 = op.start;
            }
        }
        if per_thread.is_empty() {
            return None;
        }
        let t_start = per_thread.values().map(|(first, _)| *first).max().unwrap();
        let t_end = per_thread.values().map(|(_, last)| *last).min().unwrap();
        Some((t_start, t_end))
    }

    /// Filter `ops` to `op_type`/`host`, then narrow to the active window
    /// and the ops that intersect it. Returns `None` if nothing survives.
    fn eligible<'a>(
        &self,
        ops: &'a [OpLog],
        op_type: Option<&str>,
        host: Option<&str>,
    ) -> Option<(Vec<&'a OpLog>, DateTime<Utc>, DateTime<Utc>)> {
        let filtered: Vec<&OpLog> = ops
            .iter()
            .filter(|o| op_type.map(|t| o.op_type == t).unwrap_or(true))
            .filter(|o| host.map(|h| o.endpoint == h).unwrap_or(true))
            .collect();
        if filtered.is_empty() {
            return None;
        }
        let (t_start, t_end) = Self::active_window(&filtered)?;
        if t_end < t_start {
            return None;
        }
        let eligible: Vec<&OpLog> = filtered.into_iter().filter(|o| o.end >= t_start && o.start <= t_end).collect();
        if eligible.is_empty() {
            return None;
        }
        Some((eligible, t_start, t_end))
    }

    /// Accumulate `ops` (already filtered to the active window) into one
    /// `SegmentStats` per segment. `label` is always the op-type the caller
    /// filtered to (or `"ALL"` if every type was combined).
    fn accumulate(&self, label: &str, ops: &[&OpLog], segments: &[Segment]) -> Vec<SegmentStats> {
        let mut bytes = vec![0f64; segments.len()];
        let mut objects = vec![0f64; segments.len()];
        let mut full_ops = vec![0u64; segments.len()];
        let mut partial_ops = vec![0f64; segments.len()];
        let mut ops_started = vec![0u64; segments.len()];
        let mut ops_ended = vec![0u64; segments.len()];
        let mut error_count = vec![0u64; segments.len()];
        let mut collectors: Vec<LatencyCollector> = (0..segments.len()).map(|_| LatencyCollector::new()).collect();

        let index_of = |t: DateTime<Utc>| segments.iter().position(|s| t >= s.start && t < s.end);

        for op in ops {
            if op.is_error() {
                if let Some(idx) = index_of(op.start) {
                    error_count[idx] += 1;
                }
                continue;
            }
            for c in attribute(op, segments) {
                bytes[c.segment_index] += c.size;
                objects[c.segment_index] += c.objects;
                if c.full {
                    full_ops[c.segment_index] += 1;
                } else {
                    partial_ops[c.segment_index] += c.fraction;
                }
                collectors[c.segment_index].record(c.duration);
            }
            if let Some(idx) = index_of(op.start) {
                ops_started[idx] += 1;
            }
            if let Some(idx) = index_of(op.end) {
                ops_ended[idx] += 1;
            }
        }

        segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                let secs = seg.duration().num_milliseconds() as f64 / 1000.0;
                let secs = if secs > 0.0 { secs } else { 1.0 };
                let total_ops = full_ops[i] as f64 + partial_ops[i];
                SegmentStats {
                    op_type: label.to_string(),
                    start: seg.start,
                    end: seg.end,
                    full_ops: full_ops[i],
                    partial_ops: partial_ops[i],
                    ops_started: ops_started[i],
                    ops_ended: ops_ended[i],
                    errors: error_count[i],
                    bytes: bytes[i],
                    objects: objects[i],
                    bytes_per_sec: bytes[i] / secs,
                    ops_per_sec: total_ops / secs,
                    objs_per_sec: objects[i] / secs,
                    percentiles: self.percentiles.iter().map(|q| collectors[i].percentile(*q)).collect(),
                    min_latency_ns: collectors[i].min_ns(),
                    max_latency_ns: collectors[i].max_ns(),
                    mean_latency_ns: collectors[i].mean_ns(),
                    stdev_latency_ns: collectors[i].stdev_ns(),
                }
            })
            .collect()
    }

    /// Per-segment throughput/latency series for `op_type` (or every type
    /// combined, if `None`), within its active window.
    pub fn aggregate(&self, ops: &[OpLog], op_type: Option<&str>, host: Option<&str>) -> Vec<SegmentStats> {
        let Some((eligible, t_start, t_end)) = self.eligible(ops, op_type, host) else {
            return Vec::new();
        };
        let segments = choose_segments(t_start, t_end, self.segment_duration);
        self.accumulate(op_type.unwrap_or("ALL"), &eligible, &segments)
    }

    /// Full per-op-type summary (segments, totals, per-host breakdown,
    /// first-byte latency, fastest/slowest segment, request-level latency)
    /// for every distinct op_type present in `ops`.
    pub fn summarize(&self, ops: &[OpLog]) -> Vec<OpTypeSummary> {
        let mut op_types: Vec<&str> = ops.iter().map(|o| o.op_type.as_str()).collect();
        op_types.sort_unstable();
        op_types.dedup();

        op_types.into_iter().filter_map(|op_type| self.summarize_one(ops, op_type)).collect()
    }

    fn summarize_one(&self, ops: &[OpLog], op_type: &str) -> Option<OpTypeSummary> {
        let (eligible, t_start, t_end) = self.eligible(ops, Some(op_type), None)?;
        let segments = choose_segments(t_start, t_end, self.segment_duration);
        let per_segment = self.accumulate(op_type, &eligible, &segments);
        let whole = [Segment { start: t_start, end: t_end }];
        let totals = self.accumulate(op_type, &eligible, &whole).into_iter().next().expect("one whole-window segment");

        let mut hosts_order: Vec<&str> = eligible.iter().map(|o| o.endpoint.as_str()).collect();
        hosts_order.sort_unstable();
        hosts_order.dedup();
        let hosts: Vec<HostBreakdown> = hosts_order
            .into_iter()
            .map(|host| {
                let host_ops: Vec<&OpLog> = eligible.iter().filter(|o| o.endpoint == host).copied().collect();
                let host_totals = self.accumulate(op_type, &host_ops, &whole).into_iter().next().expect("one segment");
                let fb_latencies: Vec<i64> = host_ops
                    .iter()
                    .filter(|o| !o.is_error())
                    .filter_map(|o| o.first_byte.map(|fb| (fb - o.start).num_nanoseconds().unwrap_or(0)))
                    .collect();
                let mean_fb = if fb_latencies.is_empty() {
                    0.0
                } else {
                    fb_latencies.iter().sum::<i64>() as f64 / fb_latencies.len() as f64
                };
                HostBreakdown {
                    endpoint: host.to_string(),
                    full_ops: host_totals.full_ops,
                    partial_ops: host_totals.partial_ops,
                    errors: host_totals.errors,
                    bytes: host_totals.bytes,
                    objects: host_totals.objects,
                    bytes_per_sec: host_totals.bytes_per_sec,
                    ops_per_sec: host_totals.ops_per_sec,
                    mean_first_byte_latency_ns: mean_fb,
                }
            })
            .collect();

        let mean_of_host_means = if hosts.is_empty() {
            0.0
        } else {
            hosts.iter().map(|h| h.mean_first_byte_latency_ns).sum::<f64>() / hosts.len() as f64
        };

        let successful: Vec<&&OpLog> = eligible.iter().filter(|o| !o.is_error()).collect();
        let all_fb: Vec<i64> =
            successful.iter().filter_map(|o| o.first_byte.map(|fb| (fb - o.start).num_nanoseconds().unwrap_or(0))).collect();
        let mean_first_byte = if all_fb.is_empty() { 0.0 } else { all_fb.iter().sum::<i64>() as f64 / all_fb.len() as f64 };

        let ranked = |metric: fn(&SegmentStats) -> f64| -> Option<(usize, usize, usize)> {
            if per_segment.is_empty() {
                return None;
            }
            let mut idx: Vec<usize> = (0..per_segment.len()).collect();
            idx.sort_by(|&a, &b| metric(&per_segment[a]).partial_cmp(&metric(&per_segment[b])).unwrap());
            let fastest = *idx.last().unwrap();
            let slowest = idx[0];
            let median = idx[idx.len() / 2];
            Some((fastest, median, slowest))
        };
        let has_bytes = per_segment.iter().any(|s| s.bytes > 0.0);
        let rank_metric: fn(&SegmentStats) -> f64 = if has_bytes { |s| s.bytes_per_sec } else { |s| s.ops_per_sec };
        let (fastest_segment_index, median_segment_index, slowest_segment_index) = match ranked(rank_metric) {
            Some((f, m, s)) => (Some(f), Some(m), Some(s)),
            None => (None, None, None),
        };

        let mut sizes: Vec<i64> = successful.iter().map(|o| o.size).collect();
        sizes.sort_unstable();
        sizes.dedup();
        let request_summary = if sizes.is_empty() {
            RequestSummary::Empty
        } else if sizes.len() == 1 {
            let mut collector = LatencyCollector::new();
            for op in &successful {
                collector.record(op.duration());
            }
            RequestSummary::SingleSize {
                size: sizes[0],
                mean_ns: collector.mean_ns(),
                median_ns: collector.percentile(0.5).value_ns,
                p90_ns: collector.percentile(0.9).value_ns,
                p99_ns: collector.percentile(0.99).value_ns,
                min_ns: collector.min_ns(),
                max_ns: collector.max_ns(),
                stdev_ns: collector.stdev_ns(),
            }
        } else {
            let window_secs = ((t_end - t_start).num_milliseconds() as f64 / 1000.0).max(1.0);
            let bins = sizes
                .into_iter()
                .map(|size| {
                    let in_bin: Vec<&&OpLog> = successful.iter().filter(|o| o.size == size).collect();
                    let bytes: f64 = in_bin.iter().map(|o| o.size as f64).sum();
                    SizeBin {
                        size,
                        ops: in_bin.len() as u64,
                        bytes,
                        bytes_per_sec: bytes / window_secs,
                    }
                })
                .collect();
            RequestSummary::MultiSize { bins }
        };

        let mut sample_errors = Vec::new();
        for op in eligible.iter().filter(|o| o.is_error()) {
            if sample_errors.len() >= 10 {
                break;
            }
            if !sample_errors.contains(&op.err) {
                sample_errors.push(op.err.clone());
            }
        }

        Some(OpTypeSummary {
            op_type: op_type.to_string(),
            window_start: t_start,
            window_end: t_end,
            segments: per_segment,
            totals,
            hosts,
            mean_first_byte_latency_ns: mean_first_byte,
            mean_of_host_mean_first_byte_latency_ns: mean_of_host_means,
            fastest_segment_index,
            median_segment_index,
            slowest_segment_index,
            request_summary,
            sample_errors,
        })
    }
}

/// Percentage delta between a "before" and "after" aggregate, used by the
/// `cmp` subcommand. Positive means "after" is larger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonDelta {
    pub metric: String,
    pub before: f64,
    pub after: f64,
    pub pct_change: f64,
}

pub fn compare_totals(before: &[SegmentStats], after: &[SegmentStats]) -> Vec<ComparisonDelta> {
    let sum = |stats: &[SegmentStats], f: fn(&SegmentStats) -> f64| -> f64 { stats.iter().map(f).sum() };
    let pct = |b: f64, a: f64| if b == 0.0 { 0.0 } else { (a - b) / b * 100.0 };

    let before_bytes = sum(before, |s| s.bytes_per_sec);
    let after_bytes = sum(after, |s| s.bytes_per_sec);
    let before_ops = sum(before, |s| s.ops_per_sec);
    let after_ops = sum(after, |s| s.ops_per_sec);
    let before_objs = sum(before, |s| s.objs_per_sec);
    let after_objs = sum(after, |s| s.objs_per_sec);

    vec![
        ComparisonDelta {
            metric: "bytes_per_sec".to_string(),
            before: before_bytes,
            after: after_bytes,
            pct_change: pct(before_bytes, after_bytes),
        },
        ComparisonDelta {
            metric: "ops_per_sec".to_string(),
            before: before_ops,
            after: after_ops,
            pct_change: pct(before_ops, after_ops),
        },
        ComparisonDelta {
            metric: "objs_per_sec".to_string(),
            before: before_objs,
            after: after_objs,
            pct_change: pct(before_objs, after_objs),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_at(base: DateTime<Utc>, thread_id: u16, start_ms: i64, end_ms: i64, size: i64) -> OpLog {
        OpLog {
            op_type: "GET".into(),
            client_id: "c".into(),
            thread_id,
            endpoint: "e".into(),
            bucket: "b".into(),
            object_key: "k".into(),
            obj_per_op: 1,
            size,
            start: base + ChronoDuration::milliseconds(start_ms),
            first_byte: None,
            end: base + ChronoDuration::milliseconds(end_ms),
            err: String::new(),
        }
    }

    fn op(start_ms: i64, end_ms: i64, size: i64) -> OpLog {
        op_at(Utc::now(), 0, start_ms, end_ms, size)
    }

    #[test]
    fn choose_segments_caps_at_max() {
        let start = Utc::now();
        let end = start + ChronoDuration::seconds(1_000_000);
        let segments = choose_segments(start, end, ChronoDuration::milliseconds(1));
        assert!(segments.len() <= MAX_SEGMENTS);
    }

    #[test]
    fn attribute_conserves_size_across_boundary() {
        let start = Utc::now();
        let segments = vec![
            Segment { start, end: start + ChronoDuration::milliseconds(100) },
            Segment { start: start + ChronoDuration::milliseconds(100), end: start + ChronoDuration::milliseconds(200) },
        ];
        let o = OpLog {
            start,
            end: start + ChronoDuration::milliseconds(150),
            size: 1000,
            ..op(0, 150, 1000)
        };
        let contributions = attribute(&o, &segments);
        let total_size: f64 = contributions.iter().map(|c| c.size).sum();
        assert!((total_size - 1000.0).abs() < 1e-6);
        assert_eq!(contributions.len(), 2);
        assert!(contributions.iter().all(|c| !c.full));
    }

    #[test]
    fn attribute_marks_interior_op_as_full() {
        let start = Utc::now();
        let segments = vec![Segment { start, end: start + ChronoDuration::seconds(1) }];
        let o = op(100, 200, 1000);
        let o = OpLog { start: start + ChronoDuration::milliseconds(100), end: start + ChronoDuration::milliseconds(200), ..o };
        let contributions = attribute(&o, &segments);
        assert_eq!(contributions.len(), 1);
        assert!(contributions[0].full);
        assert!((contributions[0].fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn attribute_skips_errored_ops() {
        let start = Utc::now();
        let segments = vec![Segment { start, end: start + ChronoDuration::seconds(1) }];
        let mut o = op(0, 100, 1000);
        o.err = "boom".to_string();
        assert!(attribute(&o, &segments).is_empty());
    }

    /// Two threads, each issuing several ops across a 1s window; the active
    /// window must be the intersection of their activity, not the union.
    #[test]
    fn aggregate_uses_per_thread_intersection_not_whole_run_union() {
        let base = Utc::now();
        let mut ops = Vec::new();
        // thread 0 starts at t=0ms, last op starts at t=900ms
        for t in [0, 300, 600, 900] {
            ops.push(op_at(base, 0, t, t + 50, 100));
        }
        // thread 1 starts late (t=200ms, simulating ramp-up) and its last
        // op starts earlier, at t=700ms (simulating ramp-down).
        for t in [200, 450, 700] {
            ops.push(op_at(base, 1, t, t + 50, 100));
        }
        let agg = Aggregator::new(ChronoDuration::milliseconds(100));
        let stats = agg.aggregate(&ops, None, None);
        let window_start = stats.iter().map(|s| s.start).min().unwrap();
        let window_end = stats.iter().map(|s| s.end).max().unwrap();
        // t_start = max(thread0 first=0, thread1 first=200) = 200
        assert_eq!(window_start, base + ChronoDuration::milliseconds(200));
        // t_end = min(thread0 last=900, thread1 last=700) = 700
        assert_eq!(window_end, base + ChronoDuration::milliseconds(700));
    }

    #[test]
    fn aggregate_filters_by_op_type_and_host() {
        let base = Utc::now();
        let mut ops: Vec<OpLog> = (0..5).map(|i| op_at(base, 0, i * 100, i * 100 + 10, 100)).collect();
        ops[1].op_type = "PUT".to_string();
        let agg = Aggregator::new(ChronoDuration::seconds(1));
        let stats = agg.aggregate(&ops, Some("GET"), None);
        let total_ops: f64 = stats.iter().map(|s| s.full_ops as f64 + s.partial_ops).sum();
        assert_eq!(total_ops, 4.0);
    }

    #[test]
    fn aggregate_counts_full_vs_partial_ops() {
        let base = Utc::now();
        let ops = vec![
            // wholly inside the first segment once segmented at 1s
            op_at(base, 0, 0, 50, 100),
            op_at(base, 0, 5000, 5900, 100),
        ];
        let agg = Aggregator::new(ChronoDuration::seconds(1));
        let stats = agg.aggregate(&ops, Some("GET"), None);
        let total_full: u64 = stats.iter().map(|s| s.full_ops).sum();
        assert_eq!(total_full, 2);
    }

    #[test]
    fn summarize_reports_request_summary_and_errors() {
        let base = Utc::now();
        let mut ops: Vec<OpLog> = (0..6).map(|i| op_at(base, 0, i * 100, i * 100 + 20, 4096)).collect();
        ops[2].err = "connection reset".to_string();
        let agg = Aggregator::new(ChronoDuration::milliseconds(200));
        let summaries = agg.summarize(&ops);
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.op_type, "GET");
        assert_eq!(s.sample_errors, vec!["connection reset".to_string()]);
        matches!(s.request_summary, RequestSummary::SingleSize { size: 4096, .. });
    }

    #[test]
    fn summarize_bins_by_size_for_multi_size_workloads() {
        let base = Utc::now();
        let mut ops: Vec<OpLog> = (0..4).map(|i| op_at(base, 0, i * 100, i * 100 + 20, 1024)).collect();
        ops.push(op_at(base, 0, 500, 520, 4096));
        let agg = Aggregator::new(ChronoDuration::milliseconds(200));
        let summaries = agg.summarize(&ops);
        match &summaries[0].request_summary {
            RequestSummary::MultiSize { bins } => assert_eq!(bins.len(), 2),
            other => panic!("expected MultiSize, got {other:?}"),
        }
    }

    #[test]
    fn latency_collector_tracks_exact_extremes() {
        let mut collector = LatencyCollector::new();
        collector.record(ChronoDuration::milliseconds(5));
        collector.record(ChronoDuration::milliseconds(500));
        assert_eq!(collector.min_ns(), 5_000_000);
        assert_eq!(collector.max_ns(), 500_000_000);
    }

    fn sample_segment_stats(bytes_per_sec: f64, ops_per_sec: f64, objs_per_sec: f64) -> SegmentStats {
        SegmentStats {
            op_type: "GET".to_string(),
            start: Utc::now(),
            end: Utc::now(),
            full_ops: 10,
            partial_ops: 0.0,
            ops_started: 10,
            ops_ended: 10,
            errors: 0,
            bytes: 1000.0,
            objects: 10.0,
            bytes_per_sec,
            ops_per_sec,
            objs_per_sec,
            percentiles: vec![],
            min_latency_ns: 0,
            max_latency_ns: 0,
            mean_latency_ns: 0.0,
            stdev_latency_ns: 0.0,
        }
    }

    #[test]
    fn compare_totals_reports_positive_change() {
        let before = vec![sample_segment_stats(1000.0, 10.0, 10.0)];
        let after = vec![sample_segment_stats(2000.0, 20.0, 10.0)];
        let deltas = compare_totals(&before, &after);
        assert!(deltas.iter().find(|d| d.metric == "bytes_per_sec").unwrap().pct_change > 0.0);
    }
}
