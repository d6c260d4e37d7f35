//! Signal control channel
//!
//! The signals the service reacts to are blocked for the calling thread and
//! read back synchronously from a signalfd. Open it before spawning any other
//! thread so every thread inherits the blocked mask and none of them receives
//! the signals asynchronously.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use kwatch_core::{BackendKind, ControlMessage, Result, WatchError, SIGINFO_LEN};
use tracing::debug;

use crate::channel::ControlChannel;
use crate::dnotify::{dnotify_overflow_signal, dnotify_signal};
use crate::sys;

/// Signals that stop the dispatcher
pub fn is_shutdown_signal(signal: i32) -> bool {
    signal == libc::SIGINT || signal == libc::SIGTERM
}

/// Ordered set of signal numbers without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalSet {
    signals: Vec<i32>,
}

impl SignalSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Interrupt and terminate requests
    pub fn shutdown() -> Self {
        Self::empty().with(libc::SIGINT).with(libc::SIGTERM)
    }

    /// Shutdown signals plus whatever `kind` delivers its events and queue
    /// overflows with
    pub fn for_backend(kind: BackendKind) -> Self {
        let set = Self::shutdown();
        if kind.is_signal_delivered() {
            set.with(dnotify_signal()).with(dnotify_overflow_signal())
        } else {
            set
        }
    }

    pub fn with(mut self, signal: i32) -> Self {
        if !self.contains(signal) {
            self.signals.push(signal);
        }
        self
    }

    pub fn contains(&self, signal: i32) -> bool {
        self.signals.contains(&signal)
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.signals.iter().copied()
    }

    fn to_sigset(&self) -> io::Result<libc::sigset_t> {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            for signal in self.iter() {
                if libc::sigaddset(&mut mask, signal) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(mask)
        }
    }
}

/// Control channel fed by a signalfd
#[derive(Debug)]
pub struct SignalControl {
    fd: Option<OwnedFd>,
    signals: SignalSet,
}

impl SignalControl {
    /// Blocks `signals` for the calling thread and opens a descriptor that
    /// reports them. The mask stays blocked after the channel closes.
    pub fn open(signals: SignalSet) -> Result<Self> {
        let mask = signals
            .to_sigset()
            .map_err(|err| WatchError::io("Failed to build signal mask", err))?;

        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(WatchError::io(
                "Failed to block control signals",
                io::Error::from_raw_os_error(rc),
            ));
        }

        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(WatchError::io(
                "Failed to open signal descriptor",
                io::Error::last_os_error(),
            ));
        }

        debug!(fd, signals = ?signals.signals, "Opened signal control channel");
        Ok(Self {
            fd: Some(unsafe { OwnedFd::from_raw_fd(fd) }),
            signals,
        })
    }

    pub fn signals(&self) -> &SignalSet {
        &self.signals
    }
}

impl ControlChannel for SignalControl {
    fn readiness_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    fn read_message(&mut self) -> Result<ControlMessage> {
        let fd = self.readiness_fd().ok_or_else(|| {
            WatchError::io(
                "Cannot read control message",
                io::Error::new(io::ErrorKind::NotConnected, "control channel is closed"),
            )
        })?;

        let mut record = [0u8; SIGINFO_LEN];
        let n = sys::read_fd(fd, &mut record)
            .map_err(|err| WatchError::io("Failed to read control message", err))?;
        ControlMessage::decode(&record[..n])
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(fd) = self.fd.take() {
            debug!(fd = fd.as_raw_fd(), "Closing signal control channel");
        }
        Ok(())
    }
}
