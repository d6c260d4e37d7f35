//! Structured notification events
//!
//! `EventKinds` bit values are the Linux inotify mask bits. fanotify reuses the
//! same values for the subset of kinds it reports, so both kernel masks convert
//! with a truncating cast.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Identifier the backend assigned to a registration
///
/// A watch descriptor for inotify, a directory file descriptor for dnotify,
/// or a mark sequence number for fanotify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub i32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kernel notification mechanism used to watch paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Per-path watches, events read from a dedicated descriptor
    #[default]
    Inotify,
    /// Per-directory notifications delivered as real-time signals
    Dnotify,
    /// Mount-wide marks, events carry an open descriptor of the subject
    Fanotify,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Inotify,
        BackendKind::Dnotify,
        BackendKind::Fanotify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Inotify => "inotify",
            BackendKind::Dnotify => "dnotify",
            BackendKind::Fanotify => "fanotify",
        }
    }

    /// Whether events arrive as signals on the control channel instead of a
    /// dedicated notification descriptor.
    pub fn is_signal_delivered(self) -> bool {
        matches!(self, BackendKind::Dnotify)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown backend '{s}' (expected inotify, dnotify or fanotify)")
            })
    }
}

bitflags! {
    /// Set of event categories reported by one record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventKinds: u32 {
        const ACCESSED = 0x0000_0001;
        const MODIFIED = 0x0000_0002;
        const ATTRIBUTE_CHANGED = 0x0000_0004;
        const CLOSED_WRITABLE = 0x0000_0008;
        const CLOSED_READ_ONLY = 0x0000_0010;
        const OPENED = 0x0000_0020;
        const MOVED_FROM = 0x0000_0040;
        const MOVED_TO = 0x0000_0080;
        const CREATED = 0x0000_0100;
        const DELETED = 0x0000_0200;
        const SELF_DELETED = 0x0000_0400;
        const SELF_MOVED = 0x0000_0800;
        const QUEUE_OVERFLOW = 0x0000_4000;
    }
}

impl EventKinds {
    /// Every change kind a watch can request. Queue overflow is always
    /// reported by the kernel and is not part of a registration mask.
    pub fn watchable() -> Self {
        EventKinds::all() - EventKinds::QUEUE_OVERFLOW
    }

    /// Keeps the bits of a kernel mask that name an event kind.
    pub fn from_kernel_mask(mask: u64) -> Self {
        EventKinds::from_bits_truncate(mask as u32)
    }

    pub fn kinds(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(kind.flag()))
    }
}

/// One category of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Accessed,
    AttributeChanged,
    Opened,
    ClosedWritable,
    ClosedReadOnly,
    Created,
    Deleted,
    SelfDeleted,
    Modified,
    SelfMoved,
    MovedFrom,
    MovedTo,
    QueueOverflow,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Accessed,
        EventKind::AttributeChanged,
        EventKind::Opened,
        EventKind::ClosedWritable,
        EventKind::ClosedReadOnly,
        EventKind::Created,
        EventKind::Deleted,
        EventKind::SelfDeleted,
        EventKind::Modified,
        EventKind::SelfMoved,
        EventKind::MovedFrom,
        EventKind::MovedTo,
        EventKind::QueueOverflow,
    ];

    pub fn flag(self) -> EventKinds {
        match self {
            EventKind::Accessed => EventKinds::ACCESSED,
            EventKind::AttributeChanged => EventKinds::ATTRIBUTE_CHANGED,
            EventKind::Opened => EventKinds::OPENED,
            EventKind::ClosedWritable => EventKinds::CLOSED_WRITABLE,
            EventKind::ClosedReadOnly => EventKinds::CLOSED_READ_ONLY,
            EventKind::Created => EventKinds::CREATED,
            EventKind::Deleted => EventKinds::DELETED,
            EventKind::SelfDeleted => EventKinds::SELF_DELETED,
            EventKind::Modified => EventKinds::MODIFIED,
            EventKind::SelfMoved => EventKinds::SELF_MOVED,
            EventKind::MovedFrom => EventKinds::MOVED_FROM,
            EventKind::MovedTo => EventKinds::MOVED_TO,
            EventKind::QueueOverflow => EventKinds::QUEUE_OVERFLOW,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Accessed => "accessed",
            EventKind::AttributeChanged => "attribute_changed",
            EventKind::Opened => "opened",
            EventKind::ClosedWritable => "closed_writable",
            EventKind::ClosedReadOnly => "closed_read_only",
            EventKind::Created => "created",
            EventKind::Deleted => "deleted",
            EventKind::SelfDeleted => "self_deleted",
            EventKind::Modified => "modified",
            EventKind::SelfMoved => "self_moved",
            EventKind::MovedFrom => "moved_from",
            EventKind::MovedTo => "moved_to",
            EventKind::QueueOverflow => "queue_overflow",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A path under watch and the identifier its backend registration returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredPath {
    pub path: PathBuf,
    pub backend_id: BackendId,
}

/// One decoded kernel event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationEvent {
    /// Registration the event correlates to. `None` for queue overflows and
    /// for events correlated by `subject` instead.
    pub backend_id: Option<BackendId>,
    pub kinds: EventKinds,
    /// Child name inside a watched directory, absent when the event concerns
    /// the watched entity itself
    pub name: Option<OsString>,
    /// Pairs the two halves of a rename
    pub cookie: Option<u32>,
    pub is_dir: bool,
    /// The kernel dropped the watch (deleted, unmounted or removed)
    pub watch_removed: bool,
    /// Absolute path of the affected file, for backends that report one
    pub subject: Option<PathBuf>,
    /// Process that caused the event, for backends that report one
    pub pid: Option<i32>,
}

impl NotificationEvent {
    pub fn new(backend_id: BackendId, kinds: EventKinds) -> Self {
        Self {
            backend_id: Some(backend_id),
            kinds,
            ..Default::default()
        }
    }

    pub fn overflow() -> Self {
        Self {
            kinds: EventKinds::QUEUE_OVERFLOW,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<OsString>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_overflow(&self) -> bool {
        self.kinds.contains(EventKinds::QUEUE_OVERFLOW)
    }

    pub fn name(&self) -> Option<&OsStr> {
        self.name.as_deref()
    }

    /// Full path of the affected entry given the watched path it resolved to
    pub fn target_path(&self, watched: &Path) -> PathBuf {
        match &self.name {
            Some(name) => watched.join(name),
            None => watched.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_mask_keeps_only_event_bits() {
        // IN_CREATE | IN_ISDIR
        let kinds = EventKinds::from_kernel_mask(0x4000_0100);
        assert_eq!(kinds, EventKinds::CREATED);

        // FAN_OPEN | FAN_EVENT_ON_CHILD
        let kinds = EventKinds::from_kernel_mask(0x0800_0020);
        assert_eq!(kinds, EventKinds::OPENED);
    }

    #[test]
    fn test_kinds_iterate_in_declaration_order() {
        let kinds = EventKinds::MOVED_TO | EventKinds::CREATED | EventKinds::ACCESSED;
        let listed: Vec<_> = kinds.kinds().collect();
        assert_eq!(
            listed,
            vec![EventKind::Accessed, EventKind::Created, EventKind::MovedTo]
        );
    }

    #[test]
    fn test_every_kind_has_a_distinct_flag() {
        let combined = EventKind::ALL
            .into_iter()
            .fold(EventKinds::empty(), |acc, kind| {
                assert!(!acc.contains(kind.flag()), "{kind} overlaps");
                acc | kind.flag()
            });
        assert_eq!(combined, EventKinds::all());
        assert!(!EventKinds::watchable().contains(EventKinds::QUEUE_OVERFLOW));
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("inotify".parse::<BackendKind>(), Ok(BackendKind::Inotify));
        assert_eq!("FANOTIFY".parse::<BackendKind>(), Ok(BackendKind::Fanotify));
        assert!("kqueue".parse::<BackendKind>().is_err());
        assert!(BackendKind::Dnotify.is_signal_delivered());
        assert!(!BackendKind::Inotify.is_signal_delivered());
    }

    #[test]
    fn test_target_path_joins_child_name() {
        let event = NotificationEvent::new(BackendId(1), EventKinds::CREATED).with_name("x");
        assert_eq!(event.target_path(Path::new("/tmp/a")), PathBuf::from("/tmp/a/x"));

        let event = NotificationEvent::new(BackendId(1), EventKinds::SELF_DELETED);
        assert_eq!(event.target_path(Path::new("/tmp/a")), PathBuf::from("/tmp/a"));
    }
}
