use crate::jr::error::{Result, WorkerError};
use nix::errno::Errno;
use std::ffi::CString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Longest filename component an event record can carry.
const NAME_MAX: usize = 255;

/// Sized for at least 20 maximum-length events so a burst of writes does
/// not force short reads.
const EVENT_BUF_LEN: usize = (mem::size_of::<libc::inotify_event>() + NAME_MAX + 1) * 20;

/// Watch `path` for IN_MODIFY events and deliver one event mask per
/// coalesced burst of writes, in arrival order, until the token is
/// cancelled or the receiver is dropped.
///
/// The watch does not subscribe to IN_MOVE/IN_DELETE_SELF: if the file
/// is moved or deleted the stream silently goes quiet. Capture files
/// live in a server-owned directory, so nothing else mutates them.
pub fn watch(token: CancellationToken, path: &Path) -> Result<mpsc::Receiver<u32>> {
    // SAFETY: plain syscall; returns -1 and sets errno on failure.
    let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
    if fd < 0 {
        return Err(WorkerError::Watcher(format!(
            "inotify_init1: {}",
            Errno::last()
        )));
    }
    // SAFETY: fd was just returned by inotify_init1 and is owned here.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| WorkerError::Watcher(format!("path contains NUL: {}", path.display())))?;
    // SAFETY: owned fd is a valid inotify instance; cpath is a valid C string.
    let wd = unsafe { libc::inotify_add_watch(owned.as_raw_fd(), cpath.as_ptr(), libc::IN_MODIFY) };
    if wd < 0 {
        // owned drops here, closing the descriptor.
        return Err(WorkerError::Watcher(format!(
            "inotify_add_watch {}: {}",
            path.display(),
            Errno::last()
        )));
    }

    let afd = AsyncFd::new(owned)
        .map_err(|e| WorkerError::Watcher(format!("register inotify fd: {e}")))?;

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(e) = pump_events(&afd, &token, &tx).await {
            error!("inotify read failed: {e}");
        }
        remove_watch(afd.get_ref().as_raw_fd(), wd);
        // afd drops here: descriptor closed, channel closed with tx.
    });

    Ok(rx)
}

fn remove_watch(fd: RawFd, wd: libc::c_int) {
    // SAFETY: fd/wd come from the init/add calls above.
    let rc = unsafe { libc::inotify_rm_watch(fd, wd) };
    if rc < 0 {
        warn!("inotify_rm_watch: {}", Errno::last());
    }
}

/// Read raw event records and forward the mask of every IN_MODIFY one.
/// Returns Ok on cancellation or receiver drop, Err on a read failure.
async fn pump_events(
    afd: &AsyncFd<OwnedFd>,
    token: &CancellationToken,
    tx: &mpsc::Sender<u32>,
) -> std::io::Result<()> {
    let mut buf = [0u8; EVENT_BUF_LEN];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            r = read_events(afd, &mut buf) => r?,
        };

        let mut offset = 0usize;
        while offset + mem::size_of::<libc::inotify_event>() <= n {
            // SAFETY: the kernel writes whole inotify_event records; the
            // bounds check above guarantees the header is in the buffer.
            // read_unaligned because the byte buffer has no alignment
            // guarantee.
            let event: libc::inotify_event =
                unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset).cast()) };
            offset += mem::size_of::<libc::inotify_event>() + event.len as usize;

            if event.mask & libc::IN_MODIFY == 0 {
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                sent = tx.send(event.mask) => {
                    if sent.is_err() {
                        // Subscriber went away; stop watching.
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn read_events(afd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        let r = guard.try_io(|inner| {
            // SAFETY: fd is a valid inotify descriptor; buf is valid for
            // writes of buf.len() bytes.
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let errno = Errno::last();
                if errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK {
                    return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
                }
                return Err(std::io::Error::from_raw_os_error(errno as i32));
            }
            Ok(n as usize)
        });
        match r {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn scratch_file(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("jobrunner-tail-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(tag);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[tokio::test]
    async fn delivers_modify_events_in_order() {
        let path = scratch_file("modify");
        let token = CancellationToken::new();
        let mut rx = watch(token.clone(), &path).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"hello").unwrap();
        f.flush().unwrap();

        let mask = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for modify event")
            .expect("stream closed early");
        assert_eq!(mask & libc::IN_MODIFY, libc::IN_MODIFY);
        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_the_stream() {
        let path = scratch_file("cancel");
        let token = CancellationToken::new();
        let mut rx = watch(token.clone(), &path).unwrap();

        token.cancel();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("cancelled watch did not close its channel promptly");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn missing_path_is_watcher_error() {
        let token = CancellationToken::new();
        let err = watch(token, Path::new("/nonexistent/jobrunner/nope")).unwrap_err();
        assert!(matches!(err, WorkerError::Watcher(_)));
    }
}
