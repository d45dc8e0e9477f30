use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::EngineError;

/// Delivery state of one checkpointed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Unsent,
    Sending,
    Acked,
}

impl CheckpointState {
    fn to_u8(self) -> u8 {
        match self {
            CheckpointState::Unsent => 0,
            CheckpointState::Sending => 1,
            CheckpointState::Acked => 2,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CheckpointState::Unsent),
            1 => Some(CheckpointState::Sending),
            2 => Some(CheckpointState::Acked),
            _ => None,
        }
    }
}

/// Persistent record of a byte range for exactly-once send accounting.
///
/// One checkpoint owns at most one in-flight sender item; for each
/// `hash_key` at most one checkpoint is ever in `Sending` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCheckpoint {
    pub hash_key: String,
    pub sequence_id: u64,
    pub read_offset: u64,
    pub write_offset: u64,
    pub state: CheckpointState,
}

fn encode_record(cp: &RangeCheckpoint, buf: &mut BytesMut) {
    let body_len = 2 + cp.hash_key.len() + 8 + 8 + 8 + 1;
    buf.put_u32(body_len as u32);
    buf.put_u16(cp.hash_key.len() as u16);
    buf.put_slice(cp.hash_key.as_bytes());
    buf.put_u64(cp.sequence_id);
    buf.put_u64(cp.read_offset);
    buf.put_u64(cp.write_offset);
    buf.put_u8(cp.state.to_u8());
}

fn decode_record(buf: &mut impl Buf) -> Option<RangeCheckpoint> {
    if buf.remaining() < 4 {
        return None;
    }
    let body_len = buf.get_u32() as usize;
    if buf.remaining() < body_len || body_len < 2 + 8 + 8 + 8 + 1 {
        return None;
    }
    let key_len = buf.get_u16() as usize;
    if body_len != 2 + key_len + 8 + 8 + 8 + 1 || buf.remaining() < body_len - 2 {
        return None;
    }
    let mut key = vec![0u8; key_len];
    buf.copy_to_slice(&mut key);
    let hash_key = String::from_utf8(key).ok()?;
    let sequence_id = buf.get_u64();
    let read_offset = buf.get_u64();
    let write_offset = buf.get_u64();
    let state = CheckpointState::from_u8(buf.get_u8())?;
    Some(RangeCheckpoint { hash_key, sequence_id, read_offset, write_offset, state })
}

/// Append-mostly checkpoint file: a sequence of length-prefixed records.
/// Compaction rewrites the file once at least half the records are acked.
struct CheckpointFile {
    path: PathBuf,
    file: File,
    total_records: usize,
    acked_records: usize,
}

const COMPACT_MIN_RECORDS: usize = 64;

impl CheckpointFile {
    fn open(path: &Path) -> std::io::Result<(Self, Vec<RangeCheckpoint>)> {
        let mut records = Vec::new();
        let mut total = 0;
        let mut acked = 0;
        if path.exists() {
            let mut raw = Vec::new();
            File::open(path)?.read_to_end(&mut raw)?;
            let mut buf = raw.as_slice();
            while let Some(cp) = decode_record(&mut buf) {
                total += 1;
                if cp.state == CheckpointState::Acked {
                    acked += 1;
                }
                records.push(cp);
            }
            if buf.has_remaining() {
                tracing::warn!(
                    path = %path.display(),
                    trailing = buf.remaining(),
                    "checkpoint file has a truncated tail, ignoring it"
                );
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((
            Self { path: path.to_path_buf(), file, total_records: total, acked_records: acked },
            records,
        ))
    }

    fn append(&mut self, cp: &RangeCheckpoint) -> std::io::Result<()> {
        let mut buf = BytesMut::new();
        encode_record(cp, &mut buf);
        self.file.write_all(&buf)?;
        // Durable-before-send: the state must hit disk before the flusher
        // is invoked.
        self.file.sync_data()?;
        self.total_records += 1;
        if cp.state == CheckpointState::Acked {
            self.acked_records += 1;
        }
        Ok(())
    }

    fn should_compact(&self) -> bool {
        self.total_records >= COMPACT_MIN_RECORDS && self.acked_records * 2 >= self.total_records
    }

    /// Rewrite the file keeping only the live checkpoints.
    fn compact<'a>(
        &mut self,
        live: impl Iterator<Item = &'a RangeCheckpoint>,
    ) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let mut buf = BytesMut::new();
        let mut total = 0;
        for cp in live {
            encode_record(cp, &mut buf);
            total += 1;
        }
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.total_records = total;
        self.acked_records = 0;
        Ok(())
    }
}

/// In-memory checkpoint map plus its backing file. The latest record per
/// hash key wins on replay.
pub struct CheckpointStore {
    file: CheckpointFile,
    map: HashMap<String, RangeCheckpoint>,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let (file, records) = CheckpointFile::open(path)
            .map_err(|e| EngineError::Checkpoint(format!("{}: {e}", path.display())))?;
        let mut map = HashMap::new();
        for cp in records {
            map.insert(cp.hash_key.clone(), cp);
        }
        Ok(Self { file, map })
    }

    pub fn get(&self, hash_key: &str) -> Option<&RangeCheckpoint> {
        self.map.get(hash_key)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &RangeCheckpoint> {
        self.map.values()
    }

    /// Insert or replace the checkpoint for its hash key, persisting the
    /// record before returning.
    pub fn put(&mut self, cp: RangeCheckpoint) -> Result<(), EngineError> {
        self.append(&cp)?;
        self.map.insert(cp.hash_key.clone(), cp);
        Ok(())
    }

    /// Persist a state transition. Acked checkpoints never regress;
    /// duplicate acks are idempotent no-ops.
    pub fn transition(&mut self, hash_key: &str, state: CheckpointState) -> Result<(), EngineError> {
        let Some(current) = self.map.get(hash_key) else {
            return Err(EngineError::Checkpoint(format!(
                "no checkpoint for hash key '{hash_key}'"
            )));
        };
        if current.state == CheckpointState::Acked {
            if state == CheckpointState::Acked {
                return Ok(());
            }
            return Err(EngineError::Checkpoint(format!(
                "checkpoint '{hash_key}' is acked, refusing regression"
            )));
        }
        let mut cp = current.clone();
        cp.state = state;
        self.append(&cp)?;
        self.map.insert(hash_key.to_string(), cp);
        self.compact_if_needed();
        Ok(())
    }

    fn append(&mut self, cp: &RangeCheckpoint) -> Result<(), EngineError> {
        self.file
            .append(cp)
            .map_err(|e| EngineError::Checkpoint(format!("{}: {e}", self.file.path.display())))
    }

    fn compact_if_needed(&mut self) {
        if !self.file.should_compact() {
            return;
        }
        let live: Vec<&RangeCheckpoint> = self
            .map
            .values()
            .filter(|cp| cp.state != CheckpointState::Acked)
            .collect();
        if let Err(e) = self.file.compact(live.into_iter()) {
            tracing::warn!(path = %self.file.path.display(), error = %e, "checkpoint compaction failed");
            return;
        }
        self.map.retain(|_, cp| cp.state != CheckpointState::Acked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(hash_key: &str, seq: u64, state: CheckpointState) -> RangeCheckpoint {
        RangeCheckpoint {
            hash_key: hash_key.to_string(),
            sequence_id: seq,
            read_offset: seq * 100,
            write_offset: seq * 100 + 50,
            state,
        }
    }

    #[test]
    fn codec_roundtrip() {
        let mut buf = BytesMut::new();
        let original = cp("file-1", 7, CheckpointState::Sending);
        encode_record(&original, &mut buf);
        let mut slice = &buf[..];
        assert_eq!(decode_record(&mut slice), Some(original));
        assert!(!slice.has_remaining());
    }

    #[test]
    fn decode_stops_at_truncated_tail() {
        let mut buf = BytesMut::new();
        encode_record(&cp("k", 1, CheckpointState::Unsent), &mut buf);
        let full_len = buf.len();
        encode_record(&cp("k2", 2, CheckpointState::Unsent), &mut buf);
        let mut slice = &buf[..full_len + 5];
        assert!(decode_record(&mut slice).is_some());
        assert!(decode_record(&mut slice).is_none());
    }

    #[test]
    fn store_replays_latest_state_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.bin");
        {
            let mut store = CheckpointStore::open(&path).unwrap();
            store.put(cp("a", 1, CheckpointState::Unsent)).unwrap();
            store.put(cp("b", 2, CheckpointState::Unsent)).unwrap();
            store.transition("a", CheckpointState::Sending).unwrap();
        }
        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap().state, CheckpointState::Sending);
        assert_eq!(store.get("b").unwrap().state, CheckpointState::Unsent);
    }

    #[test]
    fn acked_checkpoint_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.bin");
        let mut store = CheckpointStore::open(&path).unwrap();
        store.put(cp("a", 1, CheckpointState::Sending)).unwrap();
        store.transition("a", CheckpointState::Acked).unwrap();
        // Duplicate ack is idempotent.
        assert!(store.transition("a", CheckpointState::Acked).is_ok());
        assert!(store.transition("a", CheckpointState::Unsent).is_err());
        assert_eq!(store.get("a").unwrap().state, CheckpointState::Acked);
    }

    #[test]
    fn compaction_drops_acked_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.bin");
        let mut store = CheckpointStore::open(&path).unwrap();
        for i in 0..COMPACT_MIN_RECORDS as u64 {
            let key = format!("k{i}");
            store.put(cp(&key, i, CheckpointState::Sending)).unwrap();
            store.transition(&key, CheckpointState::Acked).unwrap();
        }
        store.put(cp("live", 999, CheckpointState::Unsent)).unwrap();
        // Compaction fired along the way: early acked keys are gone from
        // the store and from the file.
        assert!(store.get("k0").is_none());
        assert!(store.checkpoints().count() < COMPACT_MIN_RECORDS);

        let store = CheckpointStore::open(&path).unwrap();
        assert!(store.get("live").is_some());
        assert!(store.get("k0").is_none());
    }
}
