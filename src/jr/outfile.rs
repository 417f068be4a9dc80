use crate::jr::error::{Result, WorkerError};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::info;

/// Path of the capture file for a job, `<outpath>/<handle>`.
pub fn path_for(outpath: &Path, handle: &str) -> PathBuf {
    outpath.join(handle)
}

/// Open the append-only capture file for a job, creating the output
/// directory on first use. The file carries the merged stdout+stderr of
/// the job's child in arrival order.
pub fn create(outpath: &Path, handle: &str) -> Result<File> {
    if let Err(e) = fs::metadata(outpath) {
        if e.kind() == io::ErrorKind::NotFound {
            info!("creating job output directory {}", outpath.display());
            DirBuilder::new().mode(0o644).create(outpath).map_err(|e| {
                WorkerError::Filesystem(format!("create directory {}: {e}", outpath.display()))
            })?;
        } else {
            return Err(WorkerError::Filesystem(format!(
                "stat {}: {e}",
                outpath.display()
            )));
        }
    }

    let path = path_for(outpath, handle);
    OpenOptions::new()
        .write(true)
        .create(true)
        .append(true)
        .mode(0o644)
        .open(&path)
        .map_err(|e| WorkerError::Filesystem(format!("open {}: {e}", path.display())))
}
