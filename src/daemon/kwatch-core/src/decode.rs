//! Decoders for the kernel's event record streams
//!
//! Records are laid out back to back. Each read is decoded on its own: the
//! kernel only hands out whole records, so a record split across two reads
//! is reported as malformed rather than reassembled.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use crate::error::{Result, WatchError};
use crate::event::{BackendId, EventKinds, NotificationEvent};

/// Fixed part of `struct inotify_event`: wd, mask, cookie, len
pub const INOTIFY_HEADER_LEN: usize = 16;

/// Size of `struct fanotify_event_metadata`
pub const FANOTIFY_METADATA_LEN: usize = 24;

const FANOTIFY_METADATA_VERSION: u8 = 3;

const IN_Q_OVERFLOW: u32 = 0x0000_4000;
const IN_IGNORED: u32 = 0x0000_8000;
const IN_ISDIR: u32 = 0x4000_0000;

const FAN_Q_OVERFLOW: u64 = 0x0000_4000;
const FAN_ONDIR: u64 = 0x4000_0000;

/// Lazy iterator over the inotify records in one read buffer
///
/// Cloning restarts from the clone point. After the first malformed record
/// the iterator yields the error once and then ends.
#[derive(Debug, Clone)]
pub struct InotifyRecords<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> InotifyRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    fn fail(&mut self, reason: String) -> Option<Result<NotificationEvent>> {
        self.failed = true;
        Some(Err(WatchError::malformed(self.pos, reason)))
    }
}

impl Iterator for InotifyRecords<'_> {
    type Item = Result<NotificationEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }

        let remaining = self.buf.len() - self.pos;
        if remaining < INOTIFY_HEADER_LEN {
            return self.fail(format!(
                "{remaining} trailing bytes cannot hold a {INOTIFY_HEADER_LEN}-byte header"
            ));
        }

        let header = &self.buf[self.pos..];
        let wd = read_u32(header, 0) as i32;
        let mask = read_u32(header, 4);
        let cookie = read_u32(header, 8);
        let name_len = read_u32(header, 12) as usize;

        let record_len = match INOTIFY_HEADER_LEN.checked_add(name_len) {
            Some(len) if len <= remaining => len,
            _ => {
                return self.fail(format!(
                    "name length {name_len} exceeds the {} bytes left after the header",
                    remaining - INOTIFY_HEADER_LEN
                ))
            }
        };

        let name = &header[INOTIFY_HEADER_LEN..record_len];
        self.pos += record_len;

        Some(Ok(inotify_event(wd, mask, cookie, name)))
    }
}

fn inotify_event(wd: i32, mask: u32, cookie: u32, name: &[u8]) -> NotificationEvent {
    if mask & IN_Q_OVERFLOW != 0 {
        return NotificationEvent::overflow();
    }

    let kinds = EventKinds::from_kernel_mask(mask as u64);
    let mut event = NotificationEvent::new(BackendId(wd), kinds);

    // The name is NUL-padded up to an alignment boundary
    let name = name.split(|b| *b == 0).next().unwrap_or_default();
    if !name.is_empty() {
        event.name = Some(OsString::from_vec(name.to_vec()));
    }

    if kinds.intersects(EventKinds::MOVED_FROM | EventKinds::MOVED_TO) && cookie != 0 {
        event.cookie = Some(cookie);
    }
    event.is_dir = mask & IN_ISDIR != 0;
    event.watch_removed = mask & IN_IGNORED != 0;
    event
}

/// Decodes every inotify record in `buf`.
///
/// Either all records decode or none are returned.
pub fn decode_inotify(buf: &[u8]) -> Result<Vec<NotificationEvent>> {
    InotifyRecords::new(buf).collect()
}

/// One fanotify event before its descriptor is resolved to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanotifyRecord {
    pub mask: u64,
    /// Open descriptor of the subject, negative when none was attached
    pub fd: i32,
    pub pid: i32,
}

impl FanotifyRecord {
    pub fn kinds(&self) -> EventKinds {
        EventKinds::from_kernel_mask(self.mask)
    }

    pub fn is_overflow(&self) -> bool {
        self.mask & FAN_Q_OVERFLOW != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mask & FAN_ONDIR != 0
    }

    pub fn has_fd(&self) -> bool {
        self.fd >= 0
    }
}

/// Lazy iterator over the fanotify metadata records in one read buffer
#[derive(Debug, Clone)]
pub struct FanotifyRecords<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> FanotifyRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    fn fail(&mut self, reason: String) -> Option<Result<FanotifyRecord>> {
        self.failed = true;
        Some(Err(WatchError::malformed(self.pos, reason)))
    }
}

impl Iterator for FanotifyRecords<'_> {
    type Item = Result<FanotifyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }

        let remaining = self.buf.len() - self.pos;
        if remaining < FANOTIFY_METADATA_LEN {
            return self.fail(format!(
                "{remaining} trailing bytes cannot hold {FANOTIFY_METADATA_LEN}-byte metadata"
            ));
        }

        let record = &self.buf[self.pos..];
        let event_len = read_u32(record, 0) as usize;
        let version = record[4];
        let metadata_len = u16::from_ne_bytes([record[6], record[7]]) as usize;

        if version != FANOTIFY_METADATA_VERSION {
            return self.fail(format!("unsupported metadata version {version}"));
        }
        if event_len < FANOTIFY_METADATA_LEN || metadata_len > event_len {
            return self.fail(format!(
                "event length {event_len} is shorter than its metadata ({metadata_len} bytes)"
            ));
        }
        if event_len > remaining {
            return self.fail(format!(
                "event length {event_len} exceeds the {remaining} bytes remaining"
            ));
        }

        let parsed = FanotifyRecord {
            mask: read_u64(record, 8),
            fd: read_u32(record, 16) as i32,
            pid: read_u32(record, 20) as i32,
        };
        self.pos += event_len;

        Some(Ok(parsed))
    }
}

/// Decodes every fanotify record in `buf`, all or nothing
pub fn decode_fanotify(buf: &[u8]) -> Result<Vec<FanotifyRecord>> {
    FanotifyRecords::new(buf).collect()
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(field)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut field = [0u8; 8];
    field.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    const IN_CREATE: u32 = 0x100;
    const IN_MODIFY: u32 = 0x2;
    const IN_MOVED_FROM: u32 = 0x40;
    const IN_MOVED_TO: u32 = 0x80;
    const IN_DELETE_SELF: u32 = 0x400;

    fn inotify_record(wd: i32, mask: u32, cookie: u32, name: &str) -> Vec<u8> {
        // The kernel pads names with NULs to a multiple of 16 bytes
        let padded = if name.is_empty() {
            0
        } else {
            (name.len() + 1).div_ceil(16) * 16
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

    fn fanotify_record(mask: u64, fd: i32, pid: i32) -> Vec<u8> {
        let mut record = Vec::with_capacity(FANOTIFY_METADATA_LEN);
        record.extend_from_slice(&(FANOTIFY_METADATA_LEN as u32).to_ne_bytes());
        record.push(FANOTIFY_METADATA_VERSION);
        record.push(0);
        record.extend_from_slice(&(FANOTIFY_METADATA_LEN as u16).to_ne_bytes());
        record.extend_from_slice(&mask.to_ne_bytes());
        record.extend_from_slice(&fd.to_ne_bytes());
        record.extend_from_slice(&pid.to_ne_bytes());
        record
    }

    #[test]
    fn test_created_child_is_decoded_with_name() {
        let buf = inotify_record(1, IN_CREATE, 0, "x");
        let events = decode_inotify(&buf).unwrap();

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.backend_id, Some(BackendId(1)));
        assert_eq!(event.kinds, EventKinds::CREATED);
        assert_eq!(event.name.as_deref(), Some(std::ffi::OsStr::new("x")));
        assert_eq!(event.cookie, None);
        assert!(!event.is_dir);
    }

    #[test]
    fn test_batched_records_decode_in_order() {
        let mut buf = inotify_record(1, IN_CREATE, 0, "first.txt");
        buf.extend(inotify_record(2, IN_MODIFY, 0, "a-much-longer-file-name.log"));
        buf.extend(inotify_record(1, IN_DELETE_SELF, 0, ""));

        let events = decode_inotify(&buf).unwrap();
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.backend_id.unwrap().0, e.kinds, e.name.clone()))
            .collect();

        assert_eq!(
            summary,
            vec![
                (1, EventKinds::CREATED, Some(OsString::from("first.txt"))),
                (
                    2,
                    EventKinds::MODIFIED,
                    Some(OsString::from("a-much-longer-file-name.log"))
                ),
                (1, EventKinds::SELF_DELETED, None),
            ]
        );
    }

    #[test]
    fn test_multiple_kinds_in_one_record() {
        let buf = inotify_record(3, IN_CREATE | IN_MODIFY | 0x4000_0000, 0, "dir");
        let event = &decode_inotify(&buf).unwrap()[0];
        let kinds: Vec<_> = event.kinds.kinds().collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Modified]);
        assert!(event.is_dir);
    }

    #[test]
    fn test_rename_halves_share_cookie() {
        let mut buf = inotify_record(1, IN_MOVED_FROM, 77, "old");
        buf.extend(inotify_record(1, IN_MOVED_TO, 77, "new"));

        let events = decode_inotify(&buf).unwrap();
        assert_eq!(events[0].cookie, Some(77));
        assert_eq!(events[1].cookie, Some(77));
        assert_eq!(events[0].kinds, EventKinds::MOVED_FROM);
        assert_eq!(events[1].kinds, EventKinds::MOVED_TO);
    }

    #[test]
    fn test_cookie_ignored_outside_renames() {
        let buf = inotify_record(1, IN_CREATE, 12, "x");
        assert_eq!(decode_inotify(&buf).unwrap()[0].cookie, None);
    }

    #[test]
    fn test_name_longer_than_buffer_is_malformed() {
        let mut buf = inotify_record(1, IN_CREATE, 0, "good");
        let mut bad = inotify_record(1, IN_CREATE, 0, "truncated-name");
        bad.truncate(INOTIFY_HEADER_LEN + 4);
        buf.extend(bad);

        match decode_inotify(&buf) {
            Err(WatchError::MalformedRecord { offset, .. }) => {
                assert_eq!(offset, INOTIFY_HEADER_LEN + 16);
            }
            other => panic!("expected malformed record, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let buf = inotify_record(1, IN_CREATE, 0, "x");
        let result = decode_inotify(&buf[..10]);
        assert!(matches!(result, Err(WatchError::MalformedRecord { offset: 0, .. })));
    }

    #[test]
    fn test_iterator_stops_after_first_error() {
        let mut buf = inotify_record(1, IN_CREATE, 0, "x");
        buf.extend_from_slice(&[0u8; 5]);

        let mut records = InotifyRecords::new(&buf);
        assert!(records.next().unwrap().is_ok());
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
    }

    #[test]
    fn test_cloned_iterator_restarts_from_clone_point() {
        let mut buf = inotify_record(1, IN_CREATE, 0, "a");
        buf.extend(inotify_record(1, IN_CREATE, 0, "b"));

        let mut records = InotifyRecords::new(&buf);
        let replay = records.clone();
        records.next();
        assert_eq!(records.count(), 1);
        assert_eq!(replay.count(), 2);
    }

    #[test]
    fn test_queue_overflow_is_a_single_unresolved_event() {
        let mut buf = inotify_record(-1, IN_Q_OVERFLOW, 0, "");
        buf.extend(inotify_record(4, IN_CREATE, 0, "after"));

        let events = decode_inotify(&buf).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_overflow());
        assert_eq!(events[0].kinds, EventKinds::QUEUE_OVERFLOW);
        assert_eq!(events[0].backend_id, None);
        assert_eq!(events[1].backend_id, Some(BackendId(4)));
    }

    #[test]
    fn test_ignored_marks_watch_removed() {
        let buf = inotify_record(5, IN_IGNORED, 0, "");
        let event = &decode_inotify(&buf).unwrap()[0];
        assert!(event.watch_removed);
        assert!(event.kinds.is_empty());
    }

    #[test]
    fn test_empty_buffer_yields_nothing() {
        assert!(decode_inotify(&[]).unwrap().is_empty());
        assert!(decode_fanotify(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_fanotify_records_decode() {
        let mut buf = fanotify_record(0x20 | FAN_ONDIR, 9, 100);
        buf.extend(fanotify_record(0x2, 10, 101));

        let records = decode_fanotify(&buf).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kinds(), EventKinds::OPENED);
        assert!(records[0].is_dir());
        assert_eq!(records[0].fd, 9);
        assert_eq!(records[1].kinds(), EventKinds::MODIFIED);
        assert_eq!(records[1].pid, 101);
    }

    #[test]
    fn test_fanotify_overflow_has_no_descriptor() {
        let buf = fanotify_record(FAN_Q_OVERFLOW, -1, 0);
        let record = decode_fanotify(&buf).unwrap()[0];
        assert!(record.is_overflow());
        assert!(!record.has_fd());
        assert_eq!(record.kinds(), EventKinds::QUEUE_OVERFLOW);
    }

    #[test]
    fn test_fanotify_length_checks() {
        let mut record = fanotify_record(0x20, 3, 1);
        record[0..4].copy_from_slice(&64u32.to_ne_bytes());
        assert!(matches!(
            decode_fanotify(&record),
            Err(WatchError::MalformedRecord { .. })
        ));

        let mut record = fanotify_record(0x20, 3, 1);
        record[0..4].copy_from_slice(&8u32.to_ne_bytes());
        assert!(decode_fanotify(&record).is_err());

        let mut record = fanotify_record(0x20, 3, 1);
        record[4] = 2;
        assert!(decode_fanotify(&record).is_err());
    }
}
