//! fanotify notification channel
//!
//! Marks cover a whole mount, so events are not tied to a registration. Each
//! record carries an open descriptor of the affected file; the channel turns
//! it into an absolute path and the dispatcher correlates by path prefix.
//! Requires `CAP_SYS_ADMIN`.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;

use kwatch_core::{
    decode_fanotify, BackendId, BackendKind, NotificationEvent, Result, WatchError,
};
use tracing::{debug, trace};

use crate::channel::NotificationChannel;
use crate::sys;

const FAN_CLOEXEC: libc::c_uint = 0x0000_0001;
const FAN_CLASS_NOTIF: libc::c_uint = 0x0000_0000;

const FAN_MARK_ADD: libc::c_uint = 0x0000_0001;
const FAN_MARK_REMOVE: libc::c_uint = 0x0000_0002;
const FAN_MARK_MOUNT: libc::c_uint = 0x0000_0010;

const FAN_ACCESS: u64 = 0x0000_0001;
const FAN_MODIFY: u64 = 0x0000_0002;
const FAN_CLOSE_WRITE: u64 = 0x0000_0008;
const FAN_CLOSE_NOWRITE: u64 = 0x0000_0010;
const FAN_OPEN: u64 = 0x0000_0020;
const FAN_EVENT_ON_CHILD: u64 = 0x0800_0000;
const FAN_ONDIR: u64 = 0x4000_0000;

const FANOTIFY_MASK: u64 = FAN_ACCESS
    | FAN_MODIFY
    | FAN_CLOSE_WRITE
    | FAN_CLOSE_NOWRITE
    | FAN_OPEN
    | FAN_EVENT_ON_CHILD
    | FAN_ONDIR;

/// Mount-wide marks read from one fanotify descriptor
#[derive(Debug)]
pub struct FanotifyChannel {
    fd: Option<OwnedFd>,
    marks: HashMap<BackendId, CString>,
    next_mark: i32,
    own_pid: i32,
}

impl FanotifyChannel {
    pub fn open() -> Result<Self> {
        let event_flags = (libc::O_RDONLY | libc::O_LARGEFILE | libc::O_CLOEXEC) as libc::c_uint;
        let fd = unsafe { libc::fanotify_init(FAN_CLASS_NOTIF | FAN_CLOEXEC, event_flags) };
        if fd < 0 {
            return Err(WatchError::BackendUnavailable {
                backend: BackendKind::Fanotify,
                source: io::Error::last_os_error(),
            });
        }

        debug!(fd, "Initialized fanotify instance");
        Ok(Self {
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
            marks: HashMap::new(),
            next_mark: 1,
            own_pid: std::process::id() as i32,
        })
    }

    fn raw_fd(&self) -> io::Result<libc::c_int> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "fanotify channel is closed"))
    }

    fn mark(&self, flags: libc::c_uint, path: &CString) -> io::Result<()> {
        let fd = self.raw_fd()?;
        let rc = unsafe {
            libc::fanotify_mark(
                fd,
                flags | FAN_MARK_MOUNT,
                FANOTIFY_MASK,
                libc::AT_FDCWD,
                path.as_ptr(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl NotificationChannel for FanotifyChannel {
    fn backend(&self) -> BackendKind {
        BackendKind::Fanotify
    }

    fn register_path(&mut self, path: &Path) -> Result<BackendId> {
        let c_path = sys::path_to_cstring(path)?;
        self.mark(FAN_MARK_ADD, &c_path)
            .map_err(|err| WatchError::registration(path, err))?;

        let id = BackendId(self.next_mark);
        self.next_mark += 1;
        self.marks.insert(id, c_path);
        Ok(id)
    }

    fn deregister(&mut self, id: BackendId) -> io::Result<()> {
        let c_path = self.marks.remove(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no mount mark {id}"))
        })?;
        removal_result(self.mark(FAN_MARK_REMOVE, &c_path))
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        sys::read_records(self.readiness_fd(), buf, "fanotify")
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<NotificationEvent>> {
        decode_events(bytes, self.own_pid)
    }

    fn close(&mut self) -> io::Result<()> {
        self.marks.clear();
        if let Some(fd) = self.fd.take() {
            debug!(fd = fd.as_raw_fd(), "Closing fanotify instance");
        }
        Ok(())
    }
}

/// Paths on one mount share a single mark, so only the first removal finds it
fn removal_result(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
            trace!("Mount mark already removed");
            Ok(())
        }
        other => other,
    }
}

/// Turns one read into events, resolving each descriptor to the path it
/// names. Events caused by `own_pid` are dropped. Every attached descriptor
/// is closed, including when resolution fails part way.
fn decode_events(bytes: &[u8], own_pid: i32) -> Result<Vec<NotificationEvent>> {
    let records: Vec<_> = decode_fanotify(bytes)?
        .into_iter()
        .map(|record| {
            let fd = record
                .has_fd()
                .then(|| unsafe { OwnedFd::from_raw_fd(record.fd) });
            (record, fd)
        })
        .collect();
    let mut events = Vec::with_capacity(records.len());

    for (record, subject_fd) in records {
        if record.is_overflow() {
            events.push(NotificationEvent::overflow());
            continue;
        }
        let Some(subject_fd) = subject_fd else {
            continue;
        };
        if record.pid == own_pid {
            trace!(fd = record.fd, "Skipping event caused by this process");
            continue;
        }

        let link = format!("/proc/self/fd/{}", subject_fd.as_raw_fd());
        let subject = fs::read_link(&link).map_err(|err| {
            WatchError::io(format!("Failed to resolve event descriptor {link}"), err)
        })?;

        events.push(NotificationEvent {
            kinds: record.kinds(),
            is_dir: record.is_dir(),
            subject: Some(subject),
            pid: Some(record.pid),
            ..Default::default()
        });
    }

    Ok(events)
}
