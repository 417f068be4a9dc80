use crate::jr::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_controllers() -> BTreeMap<String, BTreeMap<String, String>> {
    let mut controllers = BTreeMap::new();
    controllers.insert(
        "blkio".to_string(),
        BTreeMap::from([("blkio.bfq.weight".to_string(), "500".to_string())]),
    );
    controllers.insert(
        "cpu,cpuacct".to_string(),
        BTreeMap::from([("cpu.shares".to_string(), "128".to_string())]),
    );
    controllers.insert(
        "memory".to_string(),
        BTreeMap::from([("memory.limit_in_bytes".to_string(), "32M".to_string())]),
    );
    controllers
}

/// Cgroup v1 layout: one directory per job under each configured
/// controller, named after the helper pid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CgroupConfig {
    /// Top of the mounted v1 hierarchy.
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,

    /// controller name -> { parameter file -> value }
    #[serde(default = "default_controllers")]
    pub controllers: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
            controllers: default_controllers(),
        }
    }
}

impl CgroupConfig {
    pub fn dir_for(&self, controller: &str, pid: &str) -> PathBuf {
        self.root.join(controller).join(pid)
    }
}

fn append_file(path: &Path, content: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .append(true)
        .open(path)
        .map_err(|e| WorkerError::Cgroup(format!("open {} for write: {e}", path.display())))?;
    f.write_all(content.as_bytes())
        .map_err(|e| WorkerError::Cgroup(format!("write {}: {e}", path.display())))
}

fn configure(dir: &Path, params: &BTreeMap<String, String>) -> Result<()> {
    for (param, value) in params {
        append_file(&dir.join(param), &format!("{value}\n"))?;
    }
    // Writing "0" moves the calling process into this cgroup.
    // See "Creating cgroups and moving processes" in cgroups(7).
    append_file(&dir.join("cgroup.procs"), "0")
}

/// Create `<root>/<controller>/<pid>` for every configured controller,
/// write the parameter files, and attach the calling process.
///
/// Aborts on the first failure without rolling back what was already
/// created; the stale directories are swept when the parent's reaper
/// calls [`remove`].
pub fn create(cfg: &CgroupConfig, pid: &str) -> Result<()> {
    for (controller, params) in &cfg.controllers {
        let dir = cfg.dir_for(controller, pid);
        fs::create_dir(&dir)
            .map_err(|e| WorkerError::Cgroup(format!("create {}: {e}", dir.display())))?;
        configure(&dir, params)?;
    }
    Ok(())
}

/// Remove every per-job cgroup directory, best effort. A directory that
/// is already gone counts as removed; every other failure is collected
/// and reported as one composite error after all controllers were tried.
pub fn remove(cfg: &CgroupConfig, pid: i32) -> Result<()> {
    let pid = pid.to_string();
    let mut errors: Vec<String> = Vec::new();
    for controller in cfg.controllers.keys() {
        let dir = cfg.dir_for(controller, &pid);
        // A leaf cgroup with no processes left is removed with a plain
        // rmdir; its control files vanish with the directory.
        match fs::remove_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => errors.push(format!("remove {}: {e}", dir.display())),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::Cgroup(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_controller_table() {
        let cfg = CgroupConfig::default();
        assert_eq!(
            cfg.controllers["blkio"]["blkio.bfq.weight"],
            "500".to_string()
        );
        assert_eq!(cfg.controllers["cpu,cpuacct"]["cpu.shares"], "128".to_string());
        assert_eq!(
            cfg.controllers["memory"]["memory.limit_in_bytes"],
            "32M".to_string()
        );
    }

    #[test]
    fn dir_for_joins_controller_and_pid() {
        let cfg = CgroupConfig::default();
        assert_eq!(
            cfg.dir_for("memory", "4242"),
            PathBuf::from("/sys/fs/cgroup/memory/4242")
        );
    }

    #[test]
    fn remove_missing_dirs_is_ok() {
        let cfg = CgroupConfig {
            root: std::env::temp_dir().join("jobrunner-cgroup-gone"),
            ..CgroupConfig::default()
        };
        // Nothing was ever created under this root.
        assert!(remove(&cfg, 999_999).is_ok());
    }

    #[test]
    fn remove_accumulates_errors_across_controllers() {
        // Plant regular files where the cgroup directories would be so
        // rmdir fails with ENOTDIR for every controller.
        let root = std::env::temp_dir().join(format!("jobrunner-cgroup-{}", std::process::id()));
        let cfg = CgroupConfig {
            root: root.clone(),
            ..CgroupConfig::default()
        };
        for controller in cfg.controllers.keys() {
            let dir = root.join(controller);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("31337"), b"x").unwrap();
        }
        let err = remove(&cfg, 31337).unwrap_err();
        let msg = err.to_string();
        for controller in cfg.controllers.keys() {
            assert!(msg.contains(controller.as_str()), "missing {controller} in {msg}");
        }
        fs::remove_dir_all(&root).unwrap();
    }
}
