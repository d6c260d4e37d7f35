//! Channel abstractions the dispatcher multiplexes
//!
//! A notification channel owns the kernel registration handle and turns raw
//! reads into events. A control channel delivers signals as messages. Both
//! expose a descriptor the dispatcher can wait on.

use std::io;
use std::os::fd::BorrowedFd;
use std::path::Path;

use kwatch_core::{
    BackendId, BackendKind, ControlMessage, EventKinds, NotificationEvent, Result,
    INOTIFY_HEADER_LEN,
};

use crate::{DnotifyChannel, FanotifyChannel, InotifyChannel};

/// Read size large enough to hold many batched records
pub const DEFAULT_READ_BUFFER: usize = 8192;

/// Smallest buffer that fits one record with a maximal name (`NAME_MAX + 1`)
pub const MIN_READ_BUFFER: usize = INOTIFY_HEADER_LEN + 256;

/// Kernel notification facility wrapped behind one handle
pub trait NotificationChannel: Send {
    fn backend(&self) -> BackendKind;

    /// Registers `path` with the fixed event mask. Issues exactly one backend
    /// registration call.
    fn register_path(&mut self, path: &Path) -> Result<BackendId>;

    fn deregister(&mut self, id: BackendId) -> io::Result<()>;

    /// Descriptor to wait on, `None` when events arrive on the control channel
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>>;

    /// One blocking read into `buf`, returning the number of bytes read
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<NotificationEvent>>;

    /// Signal the backend raises for each event, if it delivers through signals
    fn delivery_signal(&self) -> Option<i32> {
        None
    }

    /// Signal the kernel raises instead once its signal queue is full
    fn overflow_signal(&self) -> Option<i32> {
        None
    }

    /// Builds the event carried by a delivery signal. The message names the
    /// registered descriptor but not what changed.
    fn signal_event(&self, message: &ControlMessage) -> NotificationEvent {
        NotificationEvent::new(BackendId(message.fd), EventKinds::empty())
    }

    /// Releases the handle. Calling it again is a no-op.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: NotificationChannel + ?Sized> NotificationChannel for Box<T> {
    fn backend(&self) -> BackendKind {
        (**self).backend()
    }

    fn register_path(&mut self, path: &Path) -> Result<BackendId> {
        (**self).register_path(path)
    }

    fn deregister(&mut self, id: BackendId) -> io::Result<()> {
        (**self).deregister(id)
    }

    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        (**self).readiness_fd()
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_raw(buf)
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<Vec<NotificationEvent>> {
        (**self).decode(bytes)
    }

    fn delivery_signal(&self) -> Option<i32> {
        (**self).delivery_signal()
    }

    fn overflow_signal(&self) -> Option<i32> {
        (**self).overflow_signal()
    }

    fn signal_event(&self, message: &ControlMessage) -> NotificationEvent {
        (**self).signal_event(message)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Pollable source of control messages
pub trait ControlChannel: Send {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Reads exactly one message; a short read is fatal
    fn read_message(&mut self) -> Result<ControlMessage>;

    fn close(&mut self) -> io::Result<()>;
}

/// Opens the notification channel for `kind`
pub fn open_backend(kind: BackendKind) -> Result<Box<dyn NotificationChannel>> {
    let channel: Box<dyn NotificationChannel> = match kind {
        BackendKind::Inotify => Box::new(InotifyChannel::open()?),
        BackendKind::Dnotify => Box::new(DnotifyChannel::open()),
        BackendKind::Fanotify => Box::new(FanotifyChannel::open()?),
    };
    Ok(channel)
}
