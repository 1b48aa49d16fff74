//! Checkpoint persistence and recovery
//!
//! A single JSON document carrying the last published pool assignment and
//! NUMA headroom, protected by a 32-bit checksum over the canonical encoding
//! (checksum field zeroed). Writes are atomic: temp file, fsync, rename.
//! A checksum mismatch on startup means the state is discarded and the
//! advisor starts empty.

use crate::models::CpuResource;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CPU_CHECKPOINT_FILE: &str = "cpu_plugin_checkpoint";
pub const MEMORY_CHECKPOINT_FILE: &str = "memory_plugin_checkpoint";

/// Persisted advisor state. All maps are ordered so the JSON encoding is
/// canonical and the checksum deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "policyName")]
    pub policy_name: String,
    /// numa id -> pool name -> allocation
    #[serde(rename = "machineState")]
    pub machine_state: BTreeMap<i32, BTreeMap<String, CpuResource>>,
    #[serde(rename = "numa_headroom")]
    pub numa_headroom: BTreeMap<i32, i64>,
    /// pod uid -> container name -> owner pool
    #[serde(rename = "pod_resource_entries")]
    pub pod_resource_entries: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(rename = "socket_topology")]
    pub socket_topology: BTreeMap<i32, String>,
    pub checksum: u32,
}

impl Checkpoint {
    pub fn new(policy_name: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            ..Default::default()
        }
    }

    fn compute_checksum(&self) -> Result<u32> {
        let mut zeroed = self.clone();
        zeroed.checksum = 0;
        let encoded = serde_json::to_vec(&zeroed).context("Failed to encode checkpoint")?;
        let digest = Sha256::digest(&encoded);
        Ok(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Encode with a freshly computed checksum
    pub fn marshal(&mut self) -> Result<Vec<u8>> {
        self.checksum = self.compute_checksum()?;
        serde_json::to_vec(self).context("Failed to encode checkpoint")
    }

    pub fn unmarshal(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob).context("Failed to decode checkpoint")
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let expected = self.compute_checksum()?;
        if self.checksum != expected {
            bail!(
                "checkpoint checksum mismatch: stored {}, computed {}",
                self.checksum,
                expected
            );
        }
        Ok(())
    }
}

/// Owns one checkpoint file
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(data_dir: impl AsRef<Path>, file_name: &str) -> Self {
        Self {
            path: data_dir.as_ref().join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist atomically via temp file and rename
    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        let encoded = checkpoint.marshal()?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&encoded)
            .context("Failed to write checkpoint data")?;
        file.sync_all().context("Failed to sync checkpoint file")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;
        Ok(())
    }

    /// Load and verify. Returns `None` when no checkpoint exists yet; a
    /// corrupt checkpoint is an error and the caller starts empty.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no checkpoint found, starting empty");
            return Ok(None);
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open checkpoint {:?}", self.path))?;
        let mut blob = Vec::new();
        file.read_to_end(&mut blob)
            .context("Failed to read checkpoint file")?;

        let checkpoint = Checkpoint::unmarshal(&blob)?;
        checkpoint.verify_checksum()?;
        info!(
            path = %self.path.display(),
            policy = %checkpoint.policy_name,
            "checkpoint restored"
        );
        Ok(Some(checkpoint))
    }

    /// Load, degrading corruption to an empty start with a loud warning
    pub fn load_or_empty(&self, policy_name: &str) -> Checkpoint {
        match self.load() {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::new(policy_name),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "checkpoint verification failed, starting empty"
                );
                Checkpoint::new(policy_name)
            }
        }
    }
}
