//! File-backed persistence for the replicated log.
//!
//! Records are framed as `[u32 len][u32 crc32][json payload]`. Loading is
//! corruption tolerant: a short or checksum-failing tail (torn write on
//! crash) is truncated and replay stops there.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::types::{LogEntry, LogIndex, NodeId, Term};

/// Durable vote/term metadata, persisted before any vote or term bump takes
/// effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    Entry(LogEntry),
    TruncateFrom { index: LogIndex },
    Hard(HardState),
}

/// Append-only log file for one replica.
pub struct ReplWal {
    file: File,
    path: PathBuf,
}

impl ReplWal {
    /// Open (or create) the log at `path` and replay it.
    ///
    /// Returns the surviving entries in index order plus the last durable
    /// hard state.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<(Self, Vec<LogEntry>, HardState)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create wal dir")?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open wal {}", path.display()))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).context("read wal")?;

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut hard = HardState::default();
        let mut offset = 0usize;
        let mut valid_end = 0usize;

        while offset + 8 <= raw.len() {
            let len = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(raw[offset + 4..offset + 8].try_into().unwrap());
            let body_start = offset + 8;
            let body_end = body_start + len;
            if body_end > raw.len() {
                break;
            }
            let body = &raw[body_start..body_end];
            if crc32fast::hash(body) != crc {
                break;
            }
            let record: WalRecord = match serde_json::from_slice(body) {
                Ok(record) => record,
                Err(_) => break,
            };
            match record {
                WalRecord::Entry(entry) => {
                    // Replay of an index we already hold replaces the suffix:
                    // it was written after a truncation record that may itself
                    // have been the torn tail.
                    while entries
                        .last()
                        .map(|last| last.index >= entry.index)
                        .unwrap_or(false)
                    {
                        entries.pop();
                    }
                    entries.push(entry);
                }
                WalRecord::TruncateFrom { index } => {
                    entries.retain(|e| e.index < index);
                }
                WalRecord::Hard(state) => hard = state,
            }
            offset = body_end;
            valid_end = body_end;
        }

        if valid_end < raw.len() {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = raw.len() - valid_end,
                "truncating corrupt wal tail"
            );
            file.set_len(valid_end as u64).context("truncate wal tail")?;
            file.sync_all().context("sync wal after tail truncation")?;
        }
        file.seek(SeekFrom::End(0)).context("seek wal end")?;

        Ok((Self { file, path }, entries, hard))
    }

    fn write_record(&mut self, record: &WalRecord) -> anyhow::Result<()> {
        let body = serde_json::to_vec(record).context("serialize wal record")?;
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        self.file
            .write_all(&frame)
            .with_context(|| format!("append wal record to {}", self.path.display()))?;
        Ok(())
    }

    /// Durably append entries.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> anyhow::Result<()> {
        for entry in entries {
            self.write_record(&WalRecord::Entry(entry.clone()))?;
        }
        self.file.sync_data().context("sync wal")
    }

    /// Durably record that every entry at or above `index` is discarded.
    pub fn truncate_from(&mut self, index: LogIndex) -> anyhow::Result<()> {
        self.write_record(&WalRecord::TruncateFrom { index })?;
        self.file.sync_data().context("sync wal")
    }

    /// Durably record term/vote state.
    pub fn save_hard_state(&mut self, hard: HardState) -> anyhow::Result<()> {
        self.write_record(&WalRecord::Hard(hard))?;
        self.file.sync_data().context("sync wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::types::OpPayload;
    use bytes::Bytes;

    fn entry(term: Term, index: LogIndex, data: &str) -> LogEntry {
        LogEntry {
            term,
            index,
            operation: OpPayload::Application(Bytes::copy_from_slice(data.as_bytes())),
            commit_timestamp: None,
        }
    }

    #[test]
    fn append_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, entries, hard) = ReplWal::open(&path).unwrap();
            assert!(entries.is_empty());
            assert_eq!(hard, HardState::default());
            wal.save_hard_state(HardState {
                term: 3,
                voted_for: Some(2),
            })
            .unwrap();
            wal.append_entries(&[entry(1, 1, "a"), entry(1, 2, "b"), entry(3, 3, "c")])
                .unwrap();
        }

        let (_, entries, hard) = ReplWal::open(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].term, 3);
        assert_eq!(hard.term, 3);
        assert_eq!(hard.voted_for, Some(2));
    }

    #[test]
    fn truncate_record_discards_suffix_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, _, _) = ReplWal::open(&path).unwrap();
            wal.append_entries(&[entry(1, 1, "a"), entry(1, 2, "b"), entry(1, 3, "c")])
                .unwrap();
            wal.truncate_from(2).unwrap();
            wal.append_entries(&[entry(2, 2, "b2")]).unwrap();
        }

        let (_, entries, _) = ReplWal::open(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].index, 2);
        assert_eq!(entries[1].term, 2);
    }

    #[test]
    fn corrupt_tail_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let (mut wal, _, _) = ReplWal::open(&path).unwrap();
            wal.append_entries(&[entry(1, 1, "a"), entry(1, 2, "b")])
                .unwrap();
        }
        // Simulate a torn write.
        let mut raw = fs::read(&path).unwrap();
        let keep = raw.len() - 5;
        raw.truncate(keep);
        raw.extend_from_slice(&[0xFF; 3]);
        fs::write(&path, &raw).unwrap();

        let (_, entries, _) = ReplWal::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 1);
    }
}
