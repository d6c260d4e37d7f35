//! kwatch Core - event model and record decoding
//!
//! Platform-neutral building blocks shared by the system layer and the daemon:
//! the structured event types, the error taxonomy, and decoders for the
//! kernel's notification and control record layouts. Nothing in this crate
//! performs I/O.

pub mod control;
pub mod decode;
pub mod error;
pub mod event;

pub use control::{ControlMessage, SIGINFO_LEN};
pub use decode::{
    decode_fanotify, decode_inotify, FanotifyRecord, FanotifyRecords, InotifyRecords,
    FANOTIFY_METADATA_LEN, INOTIFY_HEADER_LEN,
};
pub use error::{Result, WatchError};
pub use event::{BackendId, BackendKind, EventKind, EventKinds, MonitoredPath, NotificationEvent};
