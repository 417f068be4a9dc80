use crate::jr::cgroup;
use crate::jr::config::WorkerConfig;
use crate::jr::error::{Result, WorkerError};
use crate::jr::procstat;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use std::fs::File;
use std::process::Stdio;
use tokio::process::{Child, Command};

fn errno_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn helper_command(name: &str, args: &[String]) -> Command {
    let mut cmd = Command::new("/proc/self/exe");
    cmd.arg("rexec").arg(name).args(args);
    cmd
}

/// Stage 1: spawn `/proc/self/exe rexec <name> <args...>` with both
/// stdio streams pointed at the capture file.
///
/// The helper runs under a parent-death SIGTERM and with fresh pid and
/// mount namespaces unshared before exec; with fork+exec the new pid
/// namespace applies to the helper's children, i.e. the user command.
/// Mount propagation is made private so nothing leaks back to the
/// server's namespace.
pub fn spawn_helper(name: &str, args: &[String], outfile: &File) -> Result<Child> {
    let stdout = outfile
        .try_clone()
        .map_err(|e| WorkerError::Filesystem(format!("clone capture fd: {e}")))?;
    let stderr = outfile
        .try_clone()
        .map_err(|e| WorkerError::Filesystem(format!("clone capture fd: {e}")))?;

    let mut cmd = helper_command(name, args);
    cmd.stdout(Stdio::from(stdout));
    cmd.stderr(Stdio::from(stderr));
    // SAFETY: the closure runs between fork and exec; it only performs
    // raw syscalls. Raw io::Errors are kept unwrapped so the parent
    // receives the actual errno from a failed setup step.
    unsafe {
        cmd.pre_exec(|| {
            prctl::set_pdeathsig(Some(Signal::SIGTERM)).map_err(errno_io)?;
            unshare(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS).map_err(errno_io)?;
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .map_err(errno_io)?;
            Ok(())
        });
    }

    cmd.spawn().map_err(|e| {
        WorkerError::SpawnFailed(format!(
            "spawn {name}: kind={:?} os_error={:?} err={e}",
            e.kind(),
            e.raw_os_error()
        ))
    })
}

/// Stage 2: body of the `rexec` subcommand, running inside the helper.
///
/// Creates the per-job cgroups named after the helper's own pid and
/// attaches the helper to them *before* the user command starts, then
/// runs the command to completion on the inherited stdio (already the
/// capture file) and hands back its exit code. The grandchild gets a
/// parent-death SIGKILL: the helper has no cleanup of its own.
pub fn run(cfg: &WorkerConfig, name: &str, args: &[String]) -> Result<i32> {
    let stat = procstat::read("self")?;
    cgroup::create(&cfg.cgroup, &stat.pid)?;

    let mut cmd = std::process::Command::new(name);
    cmd.args(args);
    // SAFETY: post-fork pre-exec; single raw prctl call.
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(|| prctl::set_pdeathsig(Some(Signal::SIGKILL)).map_err(errno_io));
    }

    let status = cmd
        .status()
        .map_err(|e| WorkerError::SpawnFailed(format!("run {name}: {e}")))?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn helper_reexecs_self_with_rexec_subcommand() {
        let cmd = helper_command("top", &["-b".to_string(), "-n1".to_string()]);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), OsStr::new("/proc/self/exe"));
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["rexec", "top", "-b", "-n1"]);
    }
}
