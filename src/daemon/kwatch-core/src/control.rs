//! Control channel messages
//!
//! A control message is one `signalfd_siginfo` record. Only the fields the
//! dispatcher acts on are kept.

use crate::error::{Result, WatchError};

/// Size of one `signalfd_siginfo` record
pub const SIGINFO_LEN: usize = 128;

const SIGNO_OFFSET: usize = 0;
const PID_OFFSET: usize = 12;
const FD_OFFSET: usize = 20;

/// A signal observed through the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub signal: i32,
    /// Descriptor the signal refers to (`ssi_fd`), set for notification signals
    pub fd: i32,
    pub pid: u32,
}

impl ControlMessage {
    pub fn new(signal: i32) -> Self {
        Self {
            signal,
            fd: -1,
            pid: 0,
        }
    }

    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = fd;
        self
    }

    /// Decodes one record. Anything shorter than a full record is a short
    /// read and cannot be interpreted.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SIGINFO_LEN {
            return Err(WatchError::ControlRead {
                expected: SIGINFO_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            signal: read_u32(bytes, SIGNO_OFFSET) as i32,
            pid: read_u32(bytes, PID_OFFSET),
            fd: read_u32(bytes, FD_OFFSET) as i32,
        })
    }

    /// Encodes into the record layout, zero-filling the unused fields
    pub fn to_bytes(&self) -> [u8; SIGINFO_LEN] {
        let mut record = [0u8; SIGINFO_LEN];
        record[SIGNO_OFFSET..SIGNO_OFFSET + 4].copy_from_slice(&(self.signal as u32).to_ne_bytes());
        record[PID_OFFSET..PID_OFFSET + 4].copy_from_slice(&self.pid.to_ne_bytes());
        record[FD_OFFSET..FD_OFFSET + 4].copy_from_slice(&self.fd.to_ne_bytes());
        record
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(field)
}
