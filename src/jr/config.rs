use crate::jr::cgroup::CgroupConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_outpath() -> PathBuf {
    std::env::temp_dir().join("jobmanager")
}

/// Worker configuration. Every field has a default so a missing config
/// file yields a usable worker; a provided YAML file overlays fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Size of the chunks emitted by Output, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Directory holding one capture file per job, named by handle.
    #[serde(default = "default_outpath")]
    pub outpath: PathBuf,

    /// Cgroup hierarchy root and per-controller parameter tables.
    #[serde(default)]
    pub cgroup: CgroupConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            outpath: default_outpath(),
            cgroup: CgroupConfig::default(),
        }
    }
}

pub fn load(config_path: &Path) -> anyhow::Result<WorkerConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let cfg: WorkerConfig = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;
    anyhow::ensure!(cfg.chunk_size > 0, "chunk_size must be > 0");
    Ok(cfg)
}
