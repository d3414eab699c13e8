//! Durable local result buffer.
//!
//! A bounded FIFO of probe results awaiting broker acknowledgement,
//! backed by an append-only JSON-lines segment file that is fsynced on
//! every append. Restart recovery replays the segment; duplicate delivery
//! after a crash is expected and absorbed by the aggregator's dedup.
//! Single-writer / single-reader; all mutation happens under one
//! process-local mutex.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use guardant_core::ProbeResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
/// Rewrite the segment once acknowledged records outnumber live ones by
/// this factor.
const COMPACT_SLACK: usize = 4;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer segment corrupt: {0}")]
    Corrupt(String),
    #[error("record encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SegmentRecord {
    Add { result: ProbeResult },
    Ack { result_id: Uuid },
}

struct BufferState {
    file: File,
    entries: VecDeque<ProbeResult>,
    logged_records: usize,
    drops: u64,
}

pub struct ResultBuffer {
    path: PathBuf,
    max_entries: usize,
    state: Mutex<BufferState>,
}

impl ResultBuffer {
    /// Open (or create) the segment at `path`, replaying any existing
    /// records. A segment that fails to parse at all is reported as
    /// corrupt rather than silently truncated.
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Result<Self, BufferError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (entries, logged_records) = Self::replay(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !entries.is_empty() {
            info!(depth = entries.len(), path = %path.display(), "recovered buffered results");
        }

        let buffer = Self {
            path,
            max_entries,
            state: Mutex::new(BufferState {
                file,
                entries,
                logged_records,
                drops: 0,
            }),
        };
        buffer.maybe_compact()?;
        Ok(buffer)
    }

    fn replay(path: &Path) -> Result<(VecDeque<ProbeResult>, usize), BufferError> {
        let Ok(file) = File::open(path) else {
            return Ok((VecDeque::new(), 0));
        };
        let reader = BufReader::new(file);
        let mut entries: VecDeque<ProbeResult> = VecDeque::new();
        let mut records = 0usize;
        let mut bad_lines = 0usize;
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records += 1;
            match serde_json::from_str::<SegmentRecord>(&line) {
                Ok(SegmentRecord::Add { result }) => entries.push_back(result),
                Ok(SegmentRecord::Ack { result_id }) => {
                    entries.retain(|r| r.result_id != result_id);
                }
                Err(err) => {
                    // A torn tail line from a crash mid-write is tolerated;
                    // anything beyond that means the segment is unusable.
                    bad_lines += 1;
                    if bad_lines > 1 {
                        return Err(BufferError::Corrupt(format!(
                            "line {}: {err}",
                            line_no + 1
                        )));
                    }
                    warn!(line = line_no + 1, "skipping torn segment line");
                }
            }
        }
        Ok((entries, records))
    }

    fn write_record(state: &mut BufferState, record: &SegmentRecord) -> Result<(), BufferError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        state.file.sync_data()?;
        state.logged_records += 1;
        Ok(())
    }

    /// Append a result; returns once the record is on disk. At capacity
    /// the oldest entry is evicted and counted.
    pub fn append(&self, result: ProbeResult) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        Self::write_record(
            &mut state,
            &SegmentRecord::Add {
                result: result.clone(),
            },
        )?;
        state.entries.push_back(result);

        while state.entries.len() > self.max_entries {
            if let Some(evicted) = state.entries.pop_front() {
                state.drops += 1;
                metrics::counter!("guardant_worker_buffer_drops_total", 1);
                Self::write_record(
                    &mut state,
                    &SegmentRecord::Ack {
                        result_id: evicted.result_id,
                    },
                )?;
                warn!(result_id = %evicted.result_id, "buffer full; evicted oldest result");
            }
        }
        Ok(())
    }

    /// Oldest unacknowledged result, if any.
    pub fn peek_oldest(&self) -> Option<ProbeResult> {
        self.state.lock().entries.front().cloned()
    }

    /// Remove a delivered result and log the acknowledgement.
    pub fn ack(&self, result_id: Uuid) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        state.entries.retain(|r| r.result_id != result_id);
        Self::write_record(&mut state, &SegmentRecord::Ack { result_id })?;
        drop(state);
        self.maybe_compact()
    }

    pub fn depth(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn drop_count(&self) -> u64 {
        self.state.lock().drops
    }

    /// Depth as a fraction of capacity, for backpressure decisions.
    pub fn fill_ratio(&self) -> f64 {
        self.depth() as f64 / self.max_entries as f64
    }

    fn maybe_compact(&self) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        let live = state.entries.len();
        if state.logged_records <= (live + 1) * COMPACT_SLACK {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for result in &state.entries {
                let mut line = serde_json::to_vec(&SegmentRecord::Add {
                    result: result.clone(),
                })?;
                line.push(b'\n');
                tmp.write_all(&line)?;
            }
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        state.file = OpenOptions::new().append(true).open(&self.path)?;
        state.logged_records = live;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use guardant_core::ProbeTask;

    fn result() -> ProbeResult {
        ProbeResult::for_task(&ProbeTask::synthetic_template(), "w-test", Utc::now())
    }

    #[test]
    fn append_ack_depth() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = ResultBuffer::open(dir.path().join("wal.jsonl"), 10).unwrap();
        let r = result();
        buffer.append(r.clone()).unwrap();
        assert_eq!(buffer.depth(), 1);
        buffer.ack(r.result_id).unwrap();
        assert_eq!(buffer.depth(), 0);
    }

    #[test]
    fn recovery_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let first = result();
        let second = result();
        {
            let buffer = ResultBuffer::open(&path, 10).unwrap();
            buffer.append(first.clone()).unwrap();
            buffer.append(second.clone()).unwrap();
            buffer.ack(first.result_id).unwrap();
        }
        let buffer = ResultBuffer::open(&path, 10).unwrap();
        assert_eq!(buffer.depth(), 1);
        assert_eq!(buffer.peek_oldest().unwrap().result_id, second.result_id);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = ResultBuffer::open(dir.path().join("wal.jsonl"), 3).unwrap();
        let results: Vec<ProbeResult> = (0..4).map(|_| result()).collect();
        for r in &results {
            buffer.append(r.clone()).unwrap();
        }
        assert_eq!(buffer.depth(), 3);
        assert_eq!(buffer.drop_count(), 1);
        // Oldest was evicted; the second-oldest is now at the head.
        assert_eq!(
            buffer.peek_oldest().unwrap().result_id,
            results[1].result_id
        );
    }

    #[test]
    fn torn_tail_line_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let kept = result();
        {
            let buffer = ResultBuffer::open(&path, 10).unwrap();
            buffer.append(kept.clone()).unwrap();
        }
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"op\":\"add\",\"result\":{\"trunc").unwrap();
        }
        let buffer = ResultBuffer::open(&path, 10).unwrap();
        assert_eq!(buffer.depth(), 1);
        assert_eq!(buffer.peek_oldest().unwrap().result_id, kept.result_id);
    }

    #[test]
    fn compaction_shrinks_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.jsonl");
        let buffer = ResultBuffer::open(&path, 100).unwrap();
        for _ in 0..50 {
            let r = result();
            buffer.append(r.clone()).unwrap();
            buffer.ack(r.result_id).unwrap();
        }
        assert_eq!(buffer.depth(), 0);
        let replayed = ResultBuffer::open(&path, 100).unwrap();
        assert_eq!(replayed.depth(), 0);
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len < 10_000, "segment did not compact: {len} bytes");
    }
}
