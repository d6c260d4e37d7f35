//! inotify notification channel

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

use kwatch_core::{
    decode_inotify, BackendId, BackendKind, EventKinds, NotificationEvent, Result, WatchError,
};
use tracing::debug;

use crate::channel::NotificationChannel;
use crate::sys;

/// Per-path watches read from one inotify descriptor
#[derive(Debug)]
pub struct InotifyChannel {
    fd: Option<OwnedFd>,
}

impl InotifyChannel {
    pub fn open() -> Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(WatchError::BackendUnavailable {
                backend: BackendKind::Inotify,
                source: io::Error::last_os_error(),
            });
        }

        debug!(fd, "Initialized inotify instance");
        Ok(Self {
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
        })
    }

    /// Every change kind; the kernel adds overflow and ignored records itself
    pub fn event_mask() -> u32 {
        EventKinds::watchable().bits()
    }

    fn raw_fd(&self) -> io::Result<libc::c_int> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "inotify channel is closed"))
    }
}

impl NotificationChannel for InotifyChannel {
    fn backend(&self) -> BackendKind {
        BackendKind::Inotify
    }

    fn register_path(&mut self, path: &Path) -> Result<BackendId> {
        let fd = self
            .raw_fd()
            .map_err(|err| WatchError::registration(path, err))?;
        let c_path = sys::path_to_cstring(path)?;

        let wd = unsafe { libc::inotify_add_watch(fd, c_path.as_ptr(), Self::event_mask()) };
        if wd < 0 {
            return Err(WatchError::registration(path, io::Error::last_os_error()));
        }

        Ok(BackendId(wd))
    }

    fn deregister(&mut self, id: BackendId) -> io::Result<()> {
        let fd = self.raw_fd()?;
        if unsafe { libc::inotify_rm_watch(fd, id.0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        sys::read_records(self.readiness_fd(), buf, "inotify")
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<NotificationEvent>> {
        decode_inotify(bytes)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(fd) = self.fd.take() {
            debug!(fd = fd.as_raw_fd(), "Closing inotify instance");
        }
        Ok(())
    }
}
