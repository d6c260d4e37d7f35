//! dnotify notification channel
//!
//! Each watched directory stays open and the kernel raises a real-time signal
//! carrying the directory's descriptor whenever something inside it changes.
//! Events therefore arrive on the control channel, never through a read.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use kwatch_core::{BackendId, BackendKind, NotificationEvent, Result, WatchError};
use tracing::{debug, warn};

use crate::channel::NotificationChannel;

const F_SETSIG: libc::c_int = 10;
const F_NOTIFY: libc::c_int = 1026;

const DN_ACCESS: u32 = 0x0000_0001;
const DN_MODIFY: u32 = 0x0000_0002;
const DN_CREATE: u32 = 0x0000_0004;
const DN_DELETE: u32 = 0x0000_0008;
const DN_RENAME: u32 = 0x0000_0010;
const DN_ATTRIB: u32 = 0x0000_0020;
const DN_MULTISHOT: u32 = 0x8000_0000;

/// Everything dnotify can report, kept armed after the first event
const DNOTIFY_MASK: u32 =
    DN_ACCESS | DN_MODIFY | DN_CREATE | DN_DELETE | DN_RENAME | DN_ATTRIB | DN_MULTISHOT;

/// Real-time signal used for notifications. SIGRTMIN itself is often taken by
/// the threading runtime.
pub fn dnotify_signal() -> i32 {
    #[allow(unused_unsafe)]
    unsafe {
        libc::SIGRTMIN() + 1
    }
}

/// Raised in place of the real-time signal when its queue overflows. The
/// default action terminates the process, so it must be blocked as well.
pub fn dnotify_overflow_signal() -> i32 {
    libc::SIGIO
}

/// Directory watches delivered as signals
#[derive(Debug)]
pub struct DnotifyChannel {
    dirs: HashMap<BackendId, OwnedFd>,
    signal: i32,
}

impl DnotifyChannel {
    pub fn open() -> Self {
        Self {
            dirs: HashMap::new(),
            signal: dnotify_signal(),
        }
    }
}

impl NotificationChannel for DnotifyChannel {
    fn backend(&self) -> BackendKind {
        BackendKind::Dnotify
    }

    fn register_path(&mut self, path: &Path) -> Result<BackendId> {
        let dir = File::open(path).map_err(|err| WatchError::registration(path, err))?;
        let fd = dir.as_raw_fd();

        if unsafe { libc::fcntl(fd, F_SETSIG, self.signal) } < 0
            || unsafe { libc::fcntl(fd, F_NOTIFY, DNOTIFY_MASK as libc::c_int) } < 0
        {
            return Err(WatchError::registration(path, io::Error::last_os_error()));
        }

        let id = BackendId(fd);
        self.dirs.insert(id, OwnedFd::from(dir));
        Ok(id)
    }

    fn deregister(&mut self, id: BackendId) -> io::Result<()> {
        let fd = self.dirs.remove(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no directory open as {id}"))
        })?;

        // Disarm before the descriptor closes on drop
        if unsafe { libc::fcntl(fd.as_raw_fd(), F_NOTIFY, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn read_raw(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(WatchError::io(
            "Cannot read dnotify events",
            io::Error::new(
                io::ErrorKind::Unsupported,
                "dnotify delivers events through signals",
            ),
        ))
    }

    fn decode(&mut self, _bytes: &[u8]) -> Result<Vec<NotificationEvent>> {
        Ok(Vec::new())
    }

    fn delivery_signal(&self) -> Option<i32> {
        Some(self.signal)
    }

    fn overflow_signal(&self) -> Option<i32> {
        Some(dnotify_overflow_signal())
    }

    fn close(&mut self) -> io::Result<()> {
        for (id, fd) in self.dirs.drain() {
            if unsafe { libc::fcntl(fd.as_raw_fd(), F_NOTIFY, 0) } < 0 {
                warn!(fd = id.0, error = %io::Error::last_os_error(), "Failed to disarm directory notifications");
            }
        }
        debug!("Closed dnotify channel");
        Ok(())
    }
}
