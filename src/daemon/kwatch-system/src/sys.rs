//! Thin wrappers over the raw syscalls shared by the channels

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use kwatch_core::{Result, WatchError};

/// Blocks until at least one descriptor is readable or the timeout expires.
///
/// `None` entries are skipped (poll ignores negative descriptors). Hang-up and
/// error conditions count as readable so the following read surfaces them.
pub(crate) fn poll_readable(
    fds: &[Option<BorrowedFd<'_>>],
    timeout: Option<Duration>,
) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.map_or(-1, |fd| fd.as_raw_fd()),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = match timeout {
        Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as libc::c_int,
        None => -1,
    };

    loop {
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

/// One blocking read, retried when interrupted
pub(crate) fn read_fd(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Reads one buffer of notification records from a stream descriptor
pub(crate) fn read_records(
    fd: Option<BorrowedFd<'_>>,
    buf: &mut [u8],
    backend: &str,
) -> Result<usize> {
    let fd = fd.ok_or_else(|| {
        WatchError::io(
            format!("Cannot read {backend} events"),
            io::Error::new(io::ErrorKind::NotConnected, "channel is closed"),
        )
    })?;

    match read_fd(fd, buf) {
        Ok(0) => Err(WatchError::io(
            format!("Cannot read {backend} events"),
            io::Error::new(io::ErrorKind::UnexpectedEof, "descriptor reached end of file"),
        )),
        Ok(n) => Ok(n),
        Err(err) => Err(WatchError::io(format!("Failed to read {backend} events"), err)),
    }
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| WatchError::registration(path, "path contains an interior NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_reports_only_ready_descriptors() {
        let (mut writer, idle) = UnixStream::pair().unwrap();
        let (_other_writer, busy) = UnixStream::pair().unwrap();
        writer.write_all(b"ping").unwrap();

        let ready = poll_readable(
            &[Some(idle.as_fd()), None, Some(busy.as_fd())],
            Some(Duration::from_millis(100)),
        )
        .unwrap();
        assert_eq!(ready, vec![true, false, false]);
    }

    #[test]
    fn test_poll_times_out_without_data() {
        let (_writer, reader) = UnixStream::pair().unwrap();
        let ready = poll_readable(&[Some(reader.as_fd())], Some(Duration::from_millis(10))).unwrap();
        assert_eq!(ready, vec![false]);
    }

    #[test]
    fn test_end_of_file_is_an_error() {
        let (writer, reader) = UnixStream::pair().unwrap();
        drop(writer);
        let mut buf = [0u8; 16];
        let result = read_records(Some(reader.as_fd()), &mut buf, "inotify");
        assert!(matches!(result, Err(WatchError::Io { .. })));
    }

    #[test]
    fn test_interior_nul_is_rejected() {
        let path = Path::new("/tmp/bad\0path");
        assert!(matches!(
            path_to_cstring(path),
            Err(WatchError::Registration { .. })
        ));
    }
}
