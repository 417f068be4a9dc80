use crate::jr::error::{Result, WorkerError};
use std::path::Path;

/// The first and third fields of `/proc/<pid>/stat`. The pid is kept as
/// a string because it doubles as the cgroup directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub pid: String,
    pub state: String,
}

/// Read `/proc/<token>/stat` for a numeric pid or the literal `self`.
///
/// Only the pid and the state letter are surfaced; the comm field in
/// between is discarded. The field scan assumes comm contains no
/// whitespace, which holds for the rexec helper (always
/// `/proc/self/exe`) but not for arbitrary processes.
pub fn read(pid: &str) -> Result<ProcessStat> {
    let path = Path::new("/proc").join(pid).join("stat");
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| WorkerError::ProcRead(format!("read {}: {e}", path.display())))?;
    parse(&raw).ok_or_else(|| WorkerError::ProcRead(format!("malformed {}", path.display())))
}

fn parse(raw: &str) -> Option<ProcessStat> {
    let mut fields = raw.split_whitespace();
    let pid = fields.next()?;
    let _comm = fields.next()?;
    let state = fields.next()?;
    Some(ProcessStat {
        pid: pid.to_string(),
        state: state.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pid_and_state() {
        let raw = "1234 (top) S 1 1234 1234 0 -1 4194304 1096 0 0 0 3 5 0 0 20 0 1 0";
        let stat = parse(raw).unwrap();
        assert_eq!(stat.pid, "1234");
        assert_eq!(stat.state, "S");
    }

    #[test]
    fn short_line_is_rejected() {
        assert!(parse("1234 (top)").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn reads_self() {
        let stat = read("self").unwrap();
        assert_eq!(stat.pid, std::process::id().to_string());
        // The state letter belongs to the main thread, which may be
        // running or parked while a test thread reads this.
        assert!(matches!(stat.state.as_str(), "R" | "S" | "D"));
    }

    #[test]
    fn missing_pid_is_proc_read_error() {
        let err = read("0").unwrap_err();
        assert!(matches!(err, WorkerError::ProcRead(_)));
    }
}
