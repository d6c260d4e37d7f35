//! In-process stand-ins for the kernel handles
//!
//! Both fakes read from one end of a Unix socket pair; tests write synthetic
//! inotify records and signalfd records into the other end.

use std::collections::HashSet;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use kwatch_core::{
    decode_inotify, BackendId, BackendKind, ControlMessage, NotificationEvent, Result, WatchError,
    FANOTIFY_METADATA_LEN, INOTIFY_HEADER_LEN, SIGINFO_LEN,
};

use crate::channel::{ControlChannel, NotificationChannel};
use crate::sys;

/// Encodes one inotify record, padding the name to a multiple of four
pub(crate) fn inotify_record(wd: i32, mask: u32, cookie: u32, name: &str) -> Vec<u8> {
    let padded = if name.is_empty() {
        0
    } else {
        (name.len() + 1 + 3) & !3
    };
    let mut record = Vec::with_capacity(INOTIFY_HEADER_LEN + padded);
    record.extend_from_slice(&wd.to_ne_bytes());
    record.extend_from_slice(&mask.to_ne_bytes());
    record.extend_from_slice(&cookie.to_ne_bytes());
    record.extend_from_slice(&(padded as u32).to_ne_bytes());
    record.extend_from_slice(name.as_bytes());
    record.resize(INOTIFY_HEADER_LEN + padded, 0);
    record
}

/// Encodes one `fanotify_event_metadata` record
pub(crate) fn fanotify_record(mask: u64, fd: i32, pid: i32) -> Vec<u8> {
    let mut record = Vec::with_capacity(FANOTIFY_METADATA_LEN);
    record.extend_from_slice(&(FANOTIFY_METADATA_LEN as u32).to_ne_bytes());
    record.push(3);
    record.push(0);
    record.extend_from_slice(&(FANOTIFY_METADATA_LEN as u16).to_ne_bytes());
    record.extend_from_slice(&mask.to_ne_bytes());
    record.extend_from_slice(&fd.to_ne_bytes());
    record.extend_from_slice(&pid.to_ne_bytes());
    record
}

/// Notification channel decoding inotify records written by the test
#[derive(Debug)]
pub(crate) struct FakeChannel {
    reader: Option<UnixStream>,
    next_id: i32,
    /// Hand out this id for every registration instead of a fresh one
    pub fixed_id: Option<i32>,
    pub failing: HashSet<PathBuf>,
    pub fail_deregister: HashSet<BackendId>,
    pub registration_calls: usize,
    pub registered: Vec<(PathBuf, BackendId)>,
    pub deregistered: Vec<BackendId>,
    pub delivery_signal: Option<i32>,
    pub overflow_signal: Option<i32>,
    pub closed: bool,
}

impl FakeChannel {
    pub fn new() -> (Self, UnixStream) {
        let (writer, reader) = UnixStream::pair().unwrap();
        let channel = Self {
            reader: Some(reader),
            next_id: 1,
            fixed_id: None,
            failing: HashSet::new(),
            fail_deregister: HashSet::new(),
            registration_calls: 0,
            registered: Vec::new(),
            deregistered: Vec::new(),
            delivery_signal: None,
            overflow_signal: None,
            closed: false,
        };
        (channel, writer)
    }

    pub fn failing_on(mut self, path: impl Into<PathBuf>) -> Self {
        self.failing.insert(path.into());
        self
    }
}

impl NotificationChannel for FakeChannel {
    fn backend(&self) -> BackendKind {
        BackendKind::Inotify
    }

    fn register_path(&mut self, path: &Path) -> Result<BackendId> {
        self.registration_calls += 1;
        if self.closed {
            return Err(WatchError::registration(path, "channel is closed"));
        }
        if self.failing.contains(path) {
            return Err(WatchError::registration(path, "No such file or directory"));
        }

        let id = match self.fixed_id {
            Some(id) => BackendId(id),
            None => {
                let id = BackendId(self.next_id);
                self.next_id += 1;
                id
            }
        };
        self.registered.push((path.to_path_buf(), id));
        Ok(id)
    }

    fn deregister(&mut self, id: BackendId) -> io::Result<()> {
        self.deregistered.push(id);
        if self.fail_deregister.contains(&id) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(|reader| reader.as_fd())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        sys::read_records(self.readiness_fd(), buf, "fake")
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<NotificationEvent>> {
        decode_inotify(bytes)
    }

    fn delivery_signal(&self) -> Option<i32> {
        self.delivery_signal
    }

    fn overflow_signal(&self) -> Option<i32> {
        self.overflow_signal
    }

    fn close(&mut self) -> io::Result<()> {
        self.reader = None;
        self.closed = true;
        Ok(())
    }
}

/// Control channel reading signalfd-shaped records written by the test
#[derive(Debug)]
pub(crate) struct FakeControl {
    reader: Option<UnixStream>,
    pub closed: bool,
}

impl FakeControl {
    pub fn new() -> (Self, ControlWriter) {
        let (writer, reader) = UnixStream::pair().unwrap();
        let control = Self {
            reader: Some(reader),
            closed: false,
        };
        (control, ControlWriter(writer))
    }
}

impl ControlChannel for FakeControl {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(|reader| reader.as_fd())
    }

    fn read_message(&mut self) -> Result<ControlMessage> {
        let fd = self.readiness_fd().ok_or_else(|| {
            WatchError::io("Cannot read control message", io::ErrorKind::NotConnected.into())
        })?;
        let mut record = [0u8; SIGINFO_LEN];
        let n = sys::read_fd(fd, &mut record)
            .map_err(|err| WatchError::io("Failed to read control message", err))?;
        ControlMessage::decode(&record[..n])
    }

    fn close(&mut self) -> io::Result<()> {
        self.reader = None;
        self.closed = true;
        Ok(())
    }
}

/// Test end of a fake control channel
#[derive(Debug)]
pub(crate) struct ControlWriter(pub UnixStream);

impl ControlWriter {
    pub fn send(&mut self, message: ControlMessage) {
        self.0.write_all(&message.to_bytes()).unwrap();
    }

    pub fn signal(&mut self, signal: i32) {
        self.send(ControlMessage::new(signal));
    }
}
