//! Console descriptor handover tests.
//!
//! Exercises `recv_console` against descriptors sent the way an OCI runtime
//! sends a pty master over its console socket.

mod common;

use common::{openpty, send_fds};
use magikbuild::console::{RawModeGuard, is_terminal, recv_console, set_window_size, window_size};
use magikbuild::spec::OciBox;
use magikbuild::sys;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

// =============================================================================
// Descriptor Passing Tests
// =============================================================================

#[test]
fn test_recv_console_accepts_single_fd() {
    let (a, b) = UnixStream::pair().unwrap();
    let (master, _slave) = openpty();
    send_fds(&a, "/dev/pts/9", &[master.as_raw_fd()]).unwrap();
    let fd = recv_console(&b).unwrap();
    assert!(is_terminal(fd.as_raw_fd()), "received descriptor is the pty master");
}

#[test]
fn test_recv_console_rejects_multiple_fds() {
    let (a, b) = UnixStream::pair().unwrap();
    let (r, w) = sys::pipe().unwrap();
    send_fds(&a, "pts", &[r.as_raw_fd(), w.as_raw_fd()]).unwrap();
    let err = recv_console(&b).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
}

#[test]
fn test_recv_console_rejects_closed_socket() {
    let (a, b) = UnixStream::pair().unwrap();
    drop(a);
    let err = recv_console(&b).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

// =============================================================================
// Terminal Tests
// =============================================================================

#[test]
fn test_window_size_round_trip_on_pty() {
    let (master, slave) = openpty();
    let size = OciBox { height: 40, width: 132 };
    set_window_size(master.as_raw_fd(), size).unwrap();
    assert_eq!(window_size(slave.as_raw_fd()), Some(size));
}

#[test]
fn test_raw_mode_is_restored_on_drop() {
    let (_master, slave) = openpty();
    let before = common::local_flags(slave.as_raw_fd());
    assert_ne!(before & libc::ICANON, 0, "a fresh pty starts canonical");
    {
        let _guard = RawModeGuard::enter(slave.as_raw_fd()).unwrap().unwrap();
        assert_eq!(common::local_flags(slave.as_raw_fd()) & libc::ICANON, 0);
    }
    assert_eq!(common::local_flags(slave.as_raw_fd()), before);
}
