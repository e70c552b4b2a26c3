//! Periodic checkpoints of the per-key state table.
//!
//! Each checkpoint is one file holding the full state table after a
//! committed batch. Files are framed like this:
//!
//! ```text
//! magic (4) | version (1) | body length (8, LE) | rmp body | crc32 (4, LE)
//! ```
//!
//! A checkpoint is written to a temporary name, synced, and renamed into
//! place, so a crash mid-write never leaves a torn file under a final name.
//! Recovery picks the newest file that decodes and verifies.

use crate::error::{EngineError, Result};
use crate::types::{BatchId, KeyState, Timestamp};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for checkpoint files and the directory manifest.
const CHECKPOINT_MAGIC: &[u8; 4] = b"HCK\0";

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u8 = 1;

const CHECKPOINT_EXT: &str = "hck";

/// Bytes around the body: magic, version, length and checksum.
const FRAME_OVERHEAD: u64 = 4 + 1 + 8 + 4;

/// Checkpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding checkpoint files.
    pub path: PathBuf,

    /// Write a checkpoint after this many committed batches.
    pub every_batches: u64,

    /// Number of checkpoint files to keep.
    pub retain: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./checkpoint"),
            every_batches: 10,
            retain: 3,
        }
    }
}

/// Full state table as of one committed batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last batch reflected in `entries`.
    pub batch: BatchId,

    pub timestamp: Timestamp,

    /// Threshold the shard layouts were computed with.
    pub tau_local: usize,

    /// Key states, sorted by key.
    pub entries: Vec<(String, KeyState)>,
}

/// Directory of checkpoint files, exclusively locked while open.
pub struct CheckpointStore {
    path: PathBuf,
    retain: usize,

    /// Lock file for exclusive access.
    _lock_file: File,
}

impl CheckpointStore {
    /// Open (or create) a checkpoint directory.
    pub fn open(config: &CheckpointConfig) -> Result<Self> {
        let path = config.path.clone();
        fs::create_dir_all(&path)?;

        let manifest = path.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&manifest)?;
        } else {
            Self::write_manifest(&manifest)?;
        }

        let lock_file = Self::acquire_lock(&path)?;

        Ok(Self {
            path,
            retain: config.retain.max(1),
            _lock_file: lock_file,
        })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a checkpoint and prune old ones. Returns the file path.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let final_path = self.file_for(checkpoint.batch);
        let tmp_path = final_path.with_extension("tmp");

        let body = rmp_serde::to_vec(checkpoint)?;
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(CHECKPOINT_MAGIC)?;
            writer.write_all(&[CHECKPOINT_VERSION])?;
            writer.write_all(&(body.len() as u64).to_le_bytes())?;
            writer.write_all(&body)?;
            writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        debug!(
            batch = checkpoint.batch.0,
            keys = checkpoint.entries.len(),
            bytes = body.len(),
            "checkpoint written"
        );

        self.prune()?;
        Ok(final_path)
    }

    /// Read and verify one checkpoint file.
    pub fn read(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid checkpoint magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported checkpoint version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > file_len.saturating_sub(FRAME_OVERHEAD) {
            return Err(EngineError::Corruption(format!(
                "Checkpoint body length {} exceeds file size {}",
                len, file_len
            )));
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&body);
        if expected != got {
            return Err(EngineError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&body)?)
    }

    /// Checkpoint files by batch, oldest first.
    pub fn list(&self) -> Result<Vec<(BatchId, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                continue;
            }
            if let Some(batch) = Self::batch_of(&path) {
                files.push((batch, path));
            }
        }
        files.sort_by_key(|(batch, _)| *batch);
        Ok(files)
    }

    /// Newest checkpoint that passes verification, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        for (batch, path) in self.list()?.into_iter().rev() {
            match Self::read(&path) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(batch = batch.0, error = %e, "skipping unreadable checkpoint"),
            }
        }
        Ok(None)
    }

    /// Delete all but the newest `retain` checkpoints. Returns how many
    /// files were removed.
    pub fn prune(&self) -> Result<usize> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(self.retain);
        for (_, path) in files.iter().take(excess) {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }

    fn file_for(&self, batch: BatchId) -> PathBuf {
        self.path
            .join(format!("checkpoint-{:020}.{}", batch.0, CHECKPOINT_EXT))
    }

    fn batch_of(path: &Path) -> Option<BatchId> {
        path.file_stem()?
            .to_str()?
            .strip_prefix("checkpoint-")?
            .parse()
            .ok()
            .map(BatchId)
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(CHECKPOINT_MAGIC)?;
        file.write_all(&[CHECKPOINT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid checkpoint directory magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported checkpoint directory version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| EngineError::Locked)?;
        Ok(lock_file)
    }
}
