use crate::jr::cgroup::{self, CgroupConfig};
use crate::jr::config::WorkerConfig;
use crate::jr::error::{Result, WorkerError};
use crate::jr::outfile;
use crate::jr::procstat;
use crate::jr::rexec;
use crate::jr::tail;
use crate::jr::tasks::TaskTracker;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Point-in-time status of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// RUNNING, STOPPED, ZOMBIE or EXITED; an unrecognized /proc state
    /// letter passes through raw.
    pub state: String,
    /// True iff Stop was called on this job.
    pub terminated: bool,
    /// True once the reaper observed child termination.
    pub exited: bool,
    /// Meaningful only when `exited` is true; -1 when the child was
    /// killed by a signal.
    pub exit_code: i32,
}

/// An arbitrary Linux process scheduled by the worker. Jobs are owned
/// exclusively by the registry and never removed, so Status and Output
/// stay answerable after the process is gone.
struct Job {
    pid: i32,
    /// Writer end of the capture file; the reaper takes and drops it.
    outfile: Option<File>,
    /// Fires once when the reaper records the exit.
    exit_tx: watch::Sender<bool>,
    status: Status,
}

type Registry = Arc<RwLock<HashMap<String, Job>>>;

fn read_registry(jobs: &Registry) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Job>>> {
    jobs.read()
        .map_err(|e| WorkerError::Internal(format!("registry lock poisoned: {e}")))
}

fn write_registry(
    jobs: &Registry,
) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Job>>> {
    jobs.write()
        .map_err(|e| WorkerError::Internal(format!("registry lock poisoned: {e}")))
}

fn map_proc_state(letter: &str) -> String {
    match letter {
        "R" | "S" | "D" => "RUNNING".to_string(),
        "Z" => "ZOMBIE".to_string(),
        "T" => "STOPPED".to_string(),
        other => other.to_string(),
    }
}

/// The job worker: spawns isolated children, tracks their lifecycle and
/// serves their captured output. Thread-safe and re-entrant; every
/// method may be called concurrently with every other. Methods must be
/// called within a tokio runtime (background reapers and tailers are
/// spawned onto it).
pub struct Worker {
    jobs: Registry,
    tasks: TaskTracker,
    pub config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tasks: TaskTracker::new(),
            config,
        }
    }

    pub fn task_tracker(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Start a new job running `name` with `args` under the two-stage
    /// launcher and return its handle. The job is registered only after
    /// the helper spawned; a failed spawn allocates nothing.
    pub fn start(&self, name: &str, args: &[String]) -> Result<String> {
        // A fresh handle identifies the job; a pid could be reused.
        let handle = Uuid::new_v4().to_string();
        let outfile = outfile::create(&self.config.outpath, &handle)?;
        let child = rexec::spawn_helper(name, args, &outfile)?;
        let pid = child.id().ok_or_else(|| {
            WorkerError::SpawnFailed("helper exited before its pid was observed".to_string())
        })? as i32;

        let (exit_tx, _) = watch::channel(false);
        {
            let mut jobs = write_registry(&self.jobs)?;
            jobs.insert(
                handle.clone(),
                Job {
                    pid,
                    outfile: Some(outfile),
                    exit_tx,
                    status: Status::default(),
                },
            );
        }
        info!(handle = %handle, pid, command = name, "started job");

        let jobs = Arc::clone(&self.jobs);
        let cgroup_cfg = self.config.cgroup.clone();
        let reaper_handle = handle.clone();
        self.tasks
            .spawn(async move { reap(jobs, cgroup_cfg, reaper_handle, pid, child).await });

        Ok(handle)
    }

    /// Terminate a job with SIGKILL. Whether signalling an already-dead
    /// child succeeds is up to the OS; its error is passed through.
    pub fn stop(&self, handle: &str) -> Result<()> {
        let pid = {
            let jobs = read_registry(&self.jobs)?;
            jobs.get(handle)
                .ok_or_else(|| WorkerError::NotFound(handle.to_string()))?
                .pid
        };

        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| WorkerError::Signal(format!("SIGKILL pid {pid}: {e}")))?;

        // The flag is written after the signal lands; a Status racing in
        // between may see EXITED with terminated still false.
        let mut jobs = write_registry(&self.jobs)?;
        if let Some(job) = jobs.get_mut(handle) {
            job.status.terminated = true;
        }
        Ok(())
    }

    /// Snapshot the job's status, deriving the live state from
    /// `/proc/<pid>/stat` while the reaper has not recorded an exit.
    pub fn status(&self, handle: &str) -> Result<Status> {
        let (pid, exited, exit_code) = {
            let jobs = read_registry(&self.jobs)?;
            let job = jobs
                .get(handle)
                .ok_or_else(|| WorkerError::NotFound(handle.to_string()))?;
            (job.pid, job.status.exited, job.status.exit_code)
        };

        let state = if !exited && exit_code == 0 {
            let stat = procstat::read(&pid.to_string())?;
            map_proc_state(&stat.state)
        } else {
            "EXITED".to_string()
        };

        let mut jobs = write_registry(&self.jobs)?;
        let job = jobs
            .get_mut(handle)
            .ok_or_else(|| WorkerError::NotFound(handle.to_string()))?;
        job.status.state = state;
        Ok(job.status.clone())
    }

    /// Stream the job's captured output from position zero as a lazy
    /// sequence of byte chunks. The stream closes once end-of-file
    /// coincides with the job having exited, or when `token` is
    /// cancelled. Subscribers are independent: each gets its own read
    /// handle and inotify watch and sees the file in strict append
    /// order.
    pub fn output(
        &self,
        token: CancellationToken,
        handle: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let exit_rx = {
            let jobs = read_registry(&self.jobs)?;
            jobs.get(handle)
                .ok_or_else(|| WorkerError::NotFound(handle.to_string()))?
                .exit_tx
                .subscribe()
        };

        let path = outfile::path_for(&self.config.outpath, handle);
        let file = File::open(&path)
            .map_err(|e| WorkerError::Filesystem(format!("open {}: {e}", path.display())))?;
        // Watch before the initial drain so no write between the two is
        // missed.
        let events = tail::watch(token.clone(), &path)?;

        let (tx, rx) = mpsc::channel(1);
        let pump = OutputPump {
            jobs: Arc::clone(&self.jobs),
            handle: handle.to_string(),
            file: tokio::fs::File::from_std(file),
            events,
            exit_rx,
            tx,
            token,
            chunk_size: self.config.chunk_size,
        };
        self.tasks.spawn(pump.run());
        Ok(rx)
    }
}

/// One reaper per job: waits for the helper to terminate, records the
/// exit under the registry lock, sweeps the job's cgroups and closes
/// the capture file. The Job itself stays registered for post-mortem
/// queries.
async fn reap(jobs: Registry, cgroup_cfg: CgroupConfig, handle: String, pid: i32, mut child: Child) {
    let exit_code = match child.wait().await {
        // code() is None when the child was signal-killed.
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            error!(handle = %handle, pid, "waiting on job child: {e}");
            -1
        }
    };
    info!(handle = %handle, pid, exit_code, "job finished");

    let outfile = {
        let mut jobs = match jobs.write() {
            Ok(guard) => guard,
            Err(e) => {
                error!(handle = %handle, "registry lock poisoned: {e}");
                return;
            }
        };
        match jobs.get_mut(&handle) {
            Some(job) => {
                // exit_code and exited are published in the same critical
                // section so Status never observes one without the other.
                job.status.exit_code = exit_code;
                job.status.exited = true;
                let _ = job.exit_tx.send(true);
                job.outfile.take()
            }
            None => None,
        }
    };

    if let Err(e) = cgroup::remove(&cgroup_cfg, pid) {
        warn!(handle = %handle, pid, "removing job cgroups: {e}");
    }
    drop(outfile);
}

enum Drained {
    /// End-of-file reached; everything readable was emitted.
    Eof,
    /// The stream is finished (cancelled, subscriber gone, read error).
    Done,
}

/// Background half of an Output subscription.
struct OutputPump {
    jobs: Registry,
    handle: String,
    file: tokio::fs::File,
    events: mpsc::Receiver<u32>,
    exit_rx: watch::Receiver<bool>,
    tx: mpsc::Sender<Vec<u8>>,
    token: CancellationToken,
    chunk_size: usize,
}

impl OutputPump {
    async fn run(mut self) {
        // Initial drain: end-of-file on an already-exited job means the
        // stream is complete.
        match self.drain().await {
            Drained::Eof => {
                if self.job_exited() {
                    return;
                }
            }
            Drained::Done => return,
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = self.exit_rx.changed() => {
                    // The job exited; emit whatever is left, then close.
                    let _ = self.drain().await;
                    return;
                }
                event = self.events.recv() => {
                    if event.is_none() {
                        // Watcher ended on its own; nothing more arrives.
                        return;
                    }
                    match self.drain().await {
                        Drained::Eof => {
                            if self.job_exited() {
                                return;
                            }
                        }
                        Drained::Done => return,
                    }
                }
            }
        }
    }

    fn job_exited(&self) -> bool {
        match self.jobs.read() {
            Ok(jobs) => jobs
                .get(&self.handle)
                .map(|job| job.status.exited)
                .unwrap_or(true),
            Err(e) => {
                error!(handle = %self.handle, "registry lock poisoned: {e}");
                true
            }
        }
    }

    /// Read and emit fixed-size chunks until end-of-file, honouring the
    /// cancel token at every send.
    async fn drain(&mut self) -> Drained {
        loop {
            let mut chunk = vec![0u8; self.chunk_size];
            let n = match self.file.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    error!(handle = %self.handle, "reading capture file: {e}");
                    return Drained::Done;
                }
            };
            if n == 0 {
                return Drained::Eof;
            }
            chunk.truncate(n);
            tokio::select! {
                _ = self.token.cancelled() => return Drained::Done,
                sent = self.tx.send(chunk) => {
                    if sent.is_err() {
                        // Subscriber went away.
                        return Drained::Done;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use sha2::{Digest, Sha256};
    use std::io::Write as _;
    use std::time::Duration;

    fn test_worker(tag: &str) -> Worker {
        let outpath =
            std::env::temp_dir().join(format!("jobrunner-worker-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&outpath).unwrap();
        Worker::new(WorkerConfig {
            outpath,
            ..WorkerConfig::default()
        })
    }

    fn insert_job(worker: &Worker, handle: &str, exited: bool) {
        let (exit_tx, _) = watch::channel(exited);
        worker.jobs.write().unwrap().insert(
            handle.to_string(),
            Job {
                pid: 0,
                outfile: None,
                exit_tx,
                status: Status {
                    exited,
                    ..Status::default()
                },
            },
        );
    }

    fn write_capture(worker: &Worker, handle: &str, data: &[u8]) {
        let mut f = outfile::create(&worker.config.outpath, handle).unwrap();
        f.write_all(data).unwrap();
    }

    async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut got = Vec::new();
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for output chunk");
            match chunk {
                Some(chunk) => got.extend_from_slice(&chunk),
                None => return got,
            }
        }
    }

    #[tokio::test]
    async fn output_of_an_exited_job_delivers_the_whole_file() {
        let worker = test_worker("roundtrip");
        let handle = Uuid::new_v4().to_string();
        insert_job(&worker, &handle, true);

        let mut data = vec![0u8; 512];
        rand::thread_rng().fill_bytes(&mut data);
        write_capture(&worker, &handle, &data);

        let rx = worker.output(CancellationToken::new(), &handle).unwrap();
        let got = collect(rx).await;
        assert_eq!(Sha256::digest(&got), Sha256::digest(&data));
    }

    #[tokio::test]
    async fn subscribers_each_see_the_file_from_position_zero() {
        let worker = test_worker("two-subs");
        let handle = Uuid::new_v4().to_string();
        insert_job(&worker, &handle, true);

        // Larger than one chunk so both streams emit several of them.
        let chunk_size = worker.config.chunk_size;
        let mut data = vec![0u8; chunk_size * 2 + 17];
        rand::thread_rng().fill_bytes(&mut data);
        write_capture(&worker, &handle, &data);

        let first = worker.output(CancellationToken::new(), &handle).unwrap();
        let second = worker.output(CancellationToken::new(), &handle).unwrap();
        assert_eq!(collect(first).await, data);
        assert_eq!(collect(second).await, data);
    }

    #[tokio::test]
    async fn output_cancellation_releases_a_blocked_subscriber() {
        let worker = test_worker("cancel");
        let handle = Uuid::new_v4().to_string();
        insert_job(&worker, &handle, false);
        write_capture(&worker, &handle, b"");

        let token = CancellationToken::new();
        let mut rx = worker.output(token.clone(), &handle).unwrap();

        // The pump is parked on the inotify watch of a quiet file.
        token.cancel();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("cancelled subscription did not close promptly");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn exit_notification_finishes_a_waiting_subscriber() {
        let worker = test_worker("exit-note");
        let handle = Uuid::new_v4().to_string();
        insert_job(&worker, &handle, false);

        let mut data = vec![0u8; 64];
        rand::thread_rng().fill_bytes(&mut data);
        write_capture(&worker, &handle, &data);

        let rx = worker.output(CancellationToken::new(), &handle).unwrap();

        // Flip the job to exited the way the reaper does.
        {
            let mut jobs = worker.jobs.write().unwrap();
            let job = jobs.get_mut(&handle).unwrap();
            job.status.exit_code = 0;
            job.status.exited = true;
            let _ = job.exit_tx.send(true);
        }

        assert_eq!(collect(rx).await, data);
    }

    #[test]
    fn status_of_a_recorded_exit_is_exited() {
        let worker = test_worker("status-exited");
        let handle = Uuid::new_v4().to_string();
        insert_job(&worker, &handle, true);

        let status = worker.status(&handle).unwrap();
        assert_eq!(status.state, "EXITED");
        assert!(!status.terminated);
        assert!(status.exited);
    }

    #[test]
    fn proc_state_letters_map_to_api_states() {
        for letter in ["R", "S", "D"] {
            assert_eq!(map_proc_state(letter), "RUNNING");
        }
        assert_eq!(map_proc_state("Z"), "ZOMBIE");
        assert_eq!(map_proc_state("T"), "STOPPED");
        // Unrecognized letters pass through raw.
        assert_eq!(map_proc_state("I"), "I");
    }
}
