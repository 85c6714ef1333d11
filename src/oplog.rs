//! Immutable records of completed S3 operations, and the in-agent store
//! that accumulates them during a run.
//!
//! An `OpLog` is append-only data: once a worker finishes an operation it is
//! pushed into the owning agent's `OpStore` and never mutated again. Readers
//! (the `send_ops` RPC, the finalize-to-disk path) take a cloned snapshot
//! under the store's mutex rather than holding a reference across an await
//! point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One immutable record of a completed (or failed) S3 operation.
///
/// Invariant: `start <= first_byte <= end` when `first_byte` is present, and
/// `start < end` unless `err` is non-empty. An errored OpLog contributes to
/// error counts only; its size/duration are excluded from throughput.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpLog {
    pub op_type: String,
    pub client_id: String,
    pub thread_id: u16,
    pub endpoint: String,
    pub bucket: String,
    pub object_key: String,
    pub obj_per_op: u32,
    pub size: i64,
    pub start: DateTime<Utc>,
    pub first_byte: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub err: String,
}

impl OpLog {
    pub fn is_error(&self) -> bool {
        !self.err.is_empty()
    }

    /// Wall-clock duration of the operation. Zero for errored ops whose
    /// `start`/`end` may coincide.
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Validate the timestamp invariants documented on the type. Used by
    /// the CSV decoder and by property tests generating random streams.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(fb) = self.first_byte {
            if fb < self.start || fb > self.end {
                return Err(format!(
                    "first_byte {fb} not within [start={}, end={}]",
                    self.start, self.end
                ));
            }
        }
        if self.err.is_empty() && self.start >= self.end {
            return Err(format!(
                "start {} must be strictly before end {} for a successful op",
                self.start, self.end
            ));
        }
        if self.obj_per_op < 1 {
            return Err("obj_per_op must be >= 1".to_string());
        }
        if self.size < 0 {
            return Err("size must not be negative".to_string());
        }
        Ok(())
    }
}

/// Append-mostly, mutex-protected sequence of `OpLog` for a single agent
/// process. Concurrent workers append; the protocol layer takes consistent
/// snapshot copies for `send_ops` and for the finalize-to-disk path.
#[derive(Default)]
pub struct OpStore {
    ops: Mutex<Vec<OpLog>>,
}

impl OpStore {
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, op: OpLog) {
        self.ops.lock().unwrap().push(op);
    }

    /// Consistent snapshot of everything appended so far. May be called
    /// before or after the benchmark stage completes (spec E6): a call
    /// mid-run returns a prefix; a call after completion returns the full
    /// stream, which is always a superset of any earlier partial snapshot.
    pub fn snapshot(&self) -> Vec<OpLog> {
        self.ops.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rebase thread-ids across merged per-agent OpLog streams so the merged
/// stream has globally unique thread-ids, per the coordinator's download
/// step. `streams` is consumed in order; each stream's thread-ids are
/// offset by the cumulative max thread-id seen in all prior streams plus
/// one, so ids never collide and never leave a gap at the seam.
pub fn rebase_thread_ids(streams: Vec<Vec<OpLog>>) -> Vec<OpLog> {
    let mut merged = Vec::new();
    let mut offset: u32 = 0;
    for stream in streams {
        let mut local_max: u32 = 0;
        for mut op in stream {
            let rebased = offset + op.thread_id as u32;
            local_max = local_max.max(op.thread_id as u32 + 1);
            op.thread_id = rebased as u16;
            merged.push(op);
        }
        offset += local_max;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn op(thread_id: u16, start_secs: i64, end_secs: i64) -> OpLog {
        let start = Utc::now() + ChronoDuration::seconds(start_secs);
        let end = Utc::now() + ChronoDuration::seconds(end_secs);
        OpLog {
            op_type: "GET".into(),
            client_id: "a1".into(),
            thread_id,
            endpoint: "localhost:9000".into(),
            bucket: "b".into(),
            object_key: "k".into(),
            obj_per_op: 1,
            size: 1024,
            start,
            first_byte: None,
            end,
            err: String::new(),
        }
    }

    #[test]
    fn store_snapshot_is_consistent() {
        let store = OpStore::new();
        store.append(op(0, 0, 1));
        store.append(op(1, 1, 2));
        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        store.append(op(2, 2, 3));
        // earlier snapshot unaffected by subsequent appends
        assert_eq!(snap.len(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn rebase_produces_globally_unique_ids_no_gaps() {
        let s1 = vec![op(0, 0, 1), op(1, 0, 1), op(2, 0, 1)];
        let s2 = vec![op(0, 0, 1), op(1, 0, 1)];
        let merged = rebase_thread_ids(vec![s1, s2]);
        let ids: Vec<u16> = merged.iter().map(|o| o.thread_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn validate_rejects_first_byte_outside_window() {
        let mut o = op(0, 0, 1);
        o.first_byte = Some(o.end + ChronoDuration::seconds(1));
        assert!(o.validate().is_err());
    }

    #[test]
    fn validate_allows_errored_op_with_equal_start_end() {
        let mut o = op(0, 0, 0);
        o.err = "timeout".into();
        assert!(o.validate().is_ok());
    }
}
