//! On-disk persistence: raw `OpLog` streams as zstd-compressed CSV with a
//! stable column order, plus the aggregated-results report in either CSV or
//! JSON form, so files written by one version stay readable by readers that
//! only know the documented schema.
//!
//! Grounded in the teacher's `results.rs` CSV row shape (`HEADINGS` const,
//! explicit column-by-column serialization) adapted from a single
//! `MessageLatencyRecord` to the coordinator's `OpLog`.

use crate::aggregator::SegmentStats;
use crate::error::{Result, WarpcoreError};
use crate::oplog::OpLog;
use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::path::Path;

/// Column order for the persisted raw-OpLog CSV. Any reader of a `.csv.zst`
/// file written by this crate can rely on this exact order.
pub const HEADINGS: &[&str] = &[
    "idx",
    "thread",
    "op",
    "client_id",
    "n_objects",
    "bytes",
    "endpoint",
    "file",
    "error",
    "start",
    "first_byte",
    "end",
];

fn to_record(idx: usize, op: &OpLog) -> Vec<String> {
    vec![
        idx.to_string(),
        op.thread_id.to_string(),
        op.op_type.clone(),
        op.client_id.clone(),
        op.obj_per_op.to_string(),
        op.size.to_string(),
        op.endpoint.clone(),
        format!("{}/{}", op.bucket, op.object_key),
        op.err.clone(),
        op.start.to_rfc3339(),
        op.first_byte.map(|t| t.to_rfc3339()).unwrap_or_default(),
        op.end.to_rfc3339(),
    ]
}

fn from_record(record: &csv::StringRecord) -> Result<OpLog> {
    let get = |i: usize, name: &str| -> Result<&str> {
        record.get(i).ok_or_else(|| WarpcoreError::Persistence(format!("missing column {name}")))
    };

    let parse_time = |s: &str, name: &str| -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| WarpcoreError::Persistence(format!("invalid timestamp in column {name}: {e}")))
    };

    // column 0 ("idx") is the row's position in the original stream; it is
    // informational only and is not round-tripped into `OpLog`.
    let file = get(7, "file")?;
    let (bucket, object_key) = match file.split_once('/') {
        Some((b, k)) => (b.to_string(), k.to_string()),
        None => (String::new(), file.to_string()),
    };
    let first_byte_str = get(10, "first_byte")?;
    Ok(OpLog {
        thread_id: get(1, "thread")?.parse().map_err(|_| WarpcoreError::Persistence("invalid thread".to_string()))?,
        op_type: get(2, "op")?.to_string(),
        client_id: get(3, "client_id")?.to_string(),
        obj_per_op: get(4, "n_objects")?
            .parse()
            .map_err(|_| WarpcoreError::Persistence("invalid n_objects".to_string()))?,
        size: get(5, "bytes")?.parse().map_err(|_| WarpcoreError::Persistence("invalid bytes".to_string()))?,
        endpoint: get(6, "endpoint")?.to_string(),
        bucket,
        object_key,
        err: get(8, "error")?.to_string(),
        start: parse_time(get(9, "start")?, "start")?,
        first_byte: if first_byte_str.is_empty() { None } else { Some(parse_time(first_byte_str, "first_byte")?) },
        end: parse_time(get(11, "end")?, "end")?,
    })
}

/// Write `ops` to `path` as zstd-compressed CSV with a header row.
pub fn write_oplog_csv_zst(path: impl AsRef<Path>, ops: &[OpLog]) -> Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    let encoder = zstd::stream::Encoder::new(file, 0)?;
    let mut writer = csv::WriterBuilder::new().from_writer(encoder);

    writer.write_record(HEADINGS)?;
    for (idx, op) in ops.iter().enumerate() {
        writer.write_record(to_record(idx, op))?;
    }
    let encoder = writer.into_inner().map_err(|e| WarpcoreError::Persistence(e.to_string()))?;
    encoder.finish()?;
    Ok(())
}

/// Read a zstd-compressed CSV produced by `write_oplog_csv_zst`. Rows
/// failing `OpLog::validate` are rejected rather than silently accepted,
/// since a corrupt log should fail loudly at load time.
pub fn read_oplog_csv_zst(path: impl AsRef<Path>) -> Result<Vec<OpLog>> {
    let file = std::fs::File::open(path.as_ref())?;
    let decoder = zstd::stream::Decoder::new(file)?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(decoder);

    let mut ops = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| WarpcoreError::Persistence(e.to_string()))?;
        let op = from_record(&record)?;
        op.validate().map_err(WarpcoreError::Persistence)?;
        ops.push(op);
    }
    Ok(ops)
}

impl From<csv::Error> for WarpcoreError {
    fn from(e: csv::Error) -> Self {
        WarpcoreError::Persistence(e.to_string())
    }
}

/// Column order for the aggregated-results CSV (one row per segment). This
/// is a distinct on-disk form from the raw-OpLog CSV above — `merge` must
/// never mix the two.
pub const AGGREGATE_HEADINGS: &[&str] = &[
    "index",
    "op",
    "duration_s",
    "objects_per_op",
    "bytes",
    "full_ops",
    "partial_ops",
    "ops_started",
    "ops_ended",
    "errors",
    "mb_per_sec",
    "ops_ended_per_sec",
    "objs_per_sec",
    "start_time",
    "end_time",
];

fn to_aggregate_record(index: usize, s: &SegmentStats) -> Vec<String> {
    let total_ops = s.full_ops as f64 + s.partial_ops;
    let objects_per_op = if total_ops > 0.0 { s.objects / total_ops } else { 0.0 };
    let secs = ((s.end - s.start).num_milliseconds() as f64 / 1000.0).max(1.0);
    let fmt = |f: f64| format!("{f:.6}");
    vec![
        index.to_string(),
        s.op_type.clone(),
        fmt((s.end - s.start).num_milliseconds() as f64 / 1000.0),
        fmt(objects_per_op),
        fmt(s.bytes),
        fmt(s.full_ops as f64),
        fmt(s.partial_ops),
        fmt(s.ops_started as f64),
        fmt(s.ops_ended as f64),
        fmt(s.errors as f64),
        fmt(s.bytes_per_sec / (1024.0 * 1024.0)),
        fmt(s.ops_ended as f64 / secs),
        fmt(s.objs_per_sec),
        s.start.to_rfc3339(),
        s.end.to_rfc3339(),
    ]
}

fn from_aggregate_record(record: &csv::StringRecord) -> Result<SegmentStats> {
    let get = |i: usize, name: &str| -> Result<&str> {
        record.get(i).ok_or_else(|| WarpcoreError::Persistence(format!("missing column {name}")))
    };
    let parse_f64 = |s: &str, name: &str| -> Result<f64> {
        s.parse().map_err(|_| WarpcoreError::Persistence(format!("invalid {name}")))
    };
    let parse_time = |s: &str, name: &str| -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| WarpcoreError::Persistence(format!("invalid timestamp in column {name}: {e}")))
    };

    let start = parse_time(get(13, "start_time")?, "start_time")?;
    let end = parse_time(get(14, "end_time")?, "end_time")?;
    let full_ops = parse_f64(get(5, "full_ops")?, "full_ops")? as u64;
    let partial_ops = parse_f64(get(6, "partial_ops")?, "partial_ops")?;
    let bytes = parse_f64(get(4, "bytes")?, "bytes")?;
    let objs_per_sec = parse_f64(get(12, "objs_per_sec")?, "objs_per_sec")?;
    let objects_per_op = parse_f64(get(3, "objects_per_op")?, "objects_per_op")?;
    let ops_started = parse_f64(get(7, "ops_started")?, "ops_started")? as u64;
    let ops_ended = parse_f64(get(8, "ops_ended")?, "ops_ended")? as u64;
    let errors = parse_f64(get(9, "errors")?, "errors")? as u64;
    let mb_per_sec = parse_f64(get(10, "mb_per_sec")?, "mb_per_sec")?;

    Ok(SegmentStats {
        op_type: get(1, "op")?.to_string(),
        start,
        end,
        full_ops,
        partial_ops,
        ops_started,
        ops_ended,
        errors,
        bytes,
        objects: objects_per_op * (full_ops as f64 + partial_ops),
        bytes_per_sec: mb_per_sec * 1024.0 * 1024.0,
        ops_per_sec: (full_ops as f64 + partial_ops) / ((end - start).num_milliseconds() as f64 / 1000.0).max(1.0),
        objs_per_sec,
        percentiles: Vec::new(),
        min_latency_ns: 0,
        max_latency_ns: 0,
        mean_latency_ns: 0.0,
        stdev_latency_ns: 0.0,
    })
}

/// Write the aggregated-results report as plain (uncompressed) CSV.
pub fn write_aggregate_csv(path: impl AsRef<Path>, stats: &[SegmentStats]) -> Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    let mut writer = csv::WriterBuilder::new().from_writer(file);
    writer.write_record(AGGREGATE_HEADINGS)?;
    for (i, s) in stats.iter().enumerate() {
        writer.write_record(to_aggregate_record(i, s))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read an aggregated-results CSV produced by `write_aggregate_csv`.
pub fn read_aggregate_csv(path: impl AsRef<Path>) -> Result<Vec<SegmentStats>> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
    let mut stats = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| WarpcoreError::Persistence(e.to_string()))?;
        stats.push(from_aggregate_record(&record)?);
    }
    Ok(stats)
}

/// Write `value` as pretty-printed JSON, used for the `analyze`/`cmp`
/// subcommands' optional `--*.out` report files, and for the JSON
/// alternative to the aggregated-results CSV above.
pub fn write_json_report<T: serde::Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let file = std::fs::File::create(path.as_ref())?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Read a JSON report written by `write_json_report`.
pub fn read_json_report<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let file = std::fs::File::open(path.as_ref())?;
    Ok(serde_json::from_reader(file)?)
}

/// Decompress a whole `.csv.zst` file into memory without parsing it,
/// used by `merge` to validate a file's checksum-free integrity before
/// attempting a structured read.
pub fn peek_decompressed_len(path: impl AsRef<Path>) -> Result<usize> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut decoder = zstd::stream::Decoder::new(file)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf.len())
}

/// Merge aggregated-results reports. `merge` dispatches on the first file's
/// extension and refuses to mix forms (spec §6.2): `.csv` stays CSV,
/// anything else is read/written as JSON.
pub fn merge_aggregate_reports(paths: &[impl AsRef<Path>], out: impl AsRef<Path>) -> Result<()> {
    let Some(first) = paths.first() else {
        return Err(WarpcoreError::Persistence("merge requires at least one input file".to_string()));
    };
    let is_csv = first.as_ref().extension().and_then(|e| e.to_str()) == Some("csv");

    let mut merged = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let this_is_csv = path.as_ref().extension().and_then(|e| e.to_str()) == Some("csv");
        if this_is_csv != is_csv {
            return Err(WarpcoreError::Persistence(format!(
                "cannot merge aggregated reports across formats: file {i} does not match the first file's form"
            )));
        }
        let mut stats = if is_csv { read_aggregate_csv(path)? } else { read_json_report::<Vec<SegmentStats>>(path)? };
        merged.append(&mut stats);
    }

    if is_csv {
        write_aggregate_csv(out, &merged)
    } else {
        write_json_report(out, &merged)
    }
}
