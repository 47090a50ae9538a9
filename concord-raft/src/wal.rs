// SPDX-License-Identifier: MIT

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use concord_core::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Entries larger than this are treated as corruption.
const MAX_ENTRY_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// Durable `(current_term, voted_for)`, kept in a companion file next to
/// the log and rewritten atomically (temp + rename).
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
}

/// Append-only log of `len | crc32 | bincode(LogEntry)` records with an
/// in-memory copy for reads. Recovery stops at the first torn or corrupt
/// record and truncates the file there.
pub struct WriteAheadLog {
    path: PathBuf,
    state_path: PathBuf,
    entries: Vec<LogEntry>,
    hard_state: HardState,
}

impl WriteAheadLog {
    pub fn open(storage_path: &Path) -> Result<Self> {
        if let Some(parent) = storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut wal = Self {
            path: storage_path.to_path_buf(),
            state_path: storage_path.with_extension("state"),
            entries: Vec::new(),
            hard_state: HardState::default(),
        };
        wal.recover()?;
        Ok(wal)
    }

    fn recover(&mut self) -> Result<()> {
        if self.state_path.exists() {
            let bytes = std::fs::read(&self.state_path)?;
            self.hard_state = bincode::deserialize(&bytes).unwrap_or_default();
        }

        if !self.path.exists() {
            return Ok(());
        }
        let mut file = File::open(&self.path)?;
        let mut good_end: u64 = 0;
        let mut len_buf = [0u8; 8];
        let mut crc_buf = [0u8; 4];
        loop {
            if file.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u64::from_le_bytes(len_buf);
            if len > MAX_ENTRY_SIZE {
                warn!("[WAL] Oversized record at offset {}, stopping recovery", good_end);
                break;
            }
            if file.read_exact(&mut crc_buf).is_err() {
                break;
            }
            let expected_crc = u32::from_le_bytes(crc_buf);
            let mut buf = vec![0u8; len as usize];
            if file.read_exact(&mut buf).is_err() {
                break;
            }
            if crc32fast::hash(&buf) != expected_crc {
                warn!("[WAL] CRC mismatch at offset {}, stopping recovery", good_end);
                break;
            }
            match bincode::deserialize::<LogEntry>(&buf) {
                Ok(entry) => {
                    self.entries.push(entry);
                    good_end = file.stream_position()?;
                }
                Err(_) => {
                    warn!("[WAL] Undecodable record at offset {}, stopping recovery", good_end);
                    break;
                }
            }
        }
        drop(file);

        // Drop whatever trails the last intact record.
        let on_disk = std::fs::metadata(&self.path)?.len();
        if on_disk > good_end {
            warn!("[WAL] Truncating {} torn bytes", on_disk - good_end);
            OpenOptions::new().write(true).open(&self.path)?.set_len(good_end)?;
        }
        if !self.entries.is_empty() {
            info!("[WAL] Recovered {} entries", self.entries.len());
        }
        Ok(())
    }

    pub fn save_hard_state(&mut self, term: u64, voted_for: Option<PeerId>) -> Result<()> {
        self.hard_state = HardState { current_term: term, voted_for };
        let tmp = self.state_path.with_extension("state.tmp");
        std::fs::write(&tmp, bincode::serialize(&self.hard_state)?)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    /// Append one entry. The entry's index must be the next log index.
    pub fn append(&mut self, entry: LogEntry) -> Result<u64> {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        let bytes = bincode::serialize(&entry)?;
        let mut record = Vec::with_capacity(12 + bytes.len());
        record.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&bytes).to_le_bytes());
        record.extend_from_slice(&bytes);

        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        file.write_all(&record)?;
        file.sync_data()?;

        self.entries.push(entry);
        Ok(self.last_index())
    }

    /// Append a fresh command as the next index in `term`.
    pub fn append_command(&mut self, term: u64, command: Vec<u8>) -> Result<u64> {
        let entry = LogEntry { term, index: self.last_index() + 1, command };
        self.append(entry)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 || index > self.entries.len() as u64 {
            return None;
        }
        Some(&self.entries[(index - 1) as usize])
    }

    pub fn term_at(&self, index: u64) -> u64 {
        self.get(index).map(|e| e.term).unwrap_or(0)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_log_info(&self) -> (u64, u64) {
        let idx = self.last_index();
        (idx, self.term_at(idx))
    }

    /// Delete `index` and everything after it, then rewrite the file.
    /// Only used when a conflicting suffix must go.
    pub fn truncate_suffix(&mut self, index: u64) -> Result<()> {
        if index == 0 || index > self.last_index() {
            return Ok(());
        }
        self.entries.truncate((index - 1) as usize);

        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            let bytes = bincode::serialize(entry)?;
            writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
            writer.write_all(&crc32fast::hash(&bytes).to_le_bytes())?;
            writer.write_all(&bytes)?;
        }
        writer.flush()?;
        writer.into_inner()?.sync_data()?;
        Ok(())
    }

    pub fn entries_from(&self, start: u64) -> Vec<LogEntry> {
        if start == 0 || start > self.last_index() {
            return Vec::new();
        }
        self.entries[(start - 1) as usize..].to_vec()
    }
}
