//! Stdio relay between the caller and a running container.
//!
//! Runs on its own OS thread with a `poll(2)` loop. Each direction is a
//! [`Stream`]: a source descriptor, a destination descriptor, and a buffer
//! of bytes read but not yet written. Reads never wait on a slow writer;
//! data is buffered (up to [`MAX_RELAY_BUFFER`]) and flushed as the writer
//! accepts it.
//!
//! ```text
//!   pipes:     caller stdin ──► container stdin
//!              container stdout ──► caller stdout
//!              container stderr ──► caller stderr
//!
//!   terminal:  caller stdin ──► pty master ──► caller stdout
//! ```
//!
//! The loop ends when every stream is finished or the stop descriptor
//! becomes readable (its write end closed by the orchestrator).

use crate::console::{RawModeGuard, recv_console, set_window_size, window_size};
use crate::constants::{MAX_RELAY_BUFFER, RELAY_FLUSH_INTERVAL, RELAY_READ_SIZE};
use crate::error::{Error, Result};
use crate::spec::OciBox;
use crate::sys;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// How an I/O result should be treated by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Transient; try again on the next iteration.
    Retry,
    /// The peer went away; finish this direction.
    Eof,
    /// Unexpected; stop relaying.
    Fatal,
}

/// Classifies an I/O error.
///
/// A pty master reports `EIO` once the last slave descriptor closes, which is
/// how a terminal session ends; `EPIPE` is the same for pipes.
pub fn classify(err: &io::Error) -> IoOutcome {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => IoOutcome::Retry,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => IoOutcome::Eof,
        _ if err.raw_os_error() == Some(libc::EIO) => IoOutcome::Eof,
        _ => IoOutcome::Fatal,
    }
}

/// The caller's side of the relay. Descriptors are borrowed, not closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayEndpoints {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

impl Default for RelayEndpoints {
    fn default() -> Self {
        Self {
            stdin: libc::STDIN_FILENO,
            stdout: libc::STDOUT_FILENO,
            stderr: libc::STDERR_FILENO,
        }
    }
}

/// The container's side of the relay.
#[derive(Debug)]
pub enum ContainerSide {
    /// Engine ends of the stdio pipes.
    Pipes {
        /// Write end feeding container stdin.
        stdin: OwnedFd,
        /// Read end of container stdout.
        stdout: OwnedFd,
        /// Read end of container stderr.
        stderr: OwnedFd,
    },
    /// Console socket the runtime connects to and sends the pty master over.
    Console {
        listener: UnixListener,
        size: Option<OciBox>,
    },
}

/// A relay ready to be started.
#[derive(Debug)]
pub struct StdioRelay {
    caller: RelayEndpoints,
    container: ContainerSide,
}

/// A running relay.
#[derive(Debug)]
pub struct RelayHandle {
    stop: Option<OwnedFd>,
    finished: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl StdioRelay {
    pub fn new(caller: RelayEndpoints, container: ContainerSide) -> Self {
        Self { caller, container }
    }

    /// Starts the relay on a dedicated thread.
    pub fn spawn(self) -> Result<RelayHandle> {
        let (stop_r, stop_w) = sys::pipe()?;
        let (done_tx, done_rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("stdio-relay".to_string())
            .spawn(move || {
                let result = self.run(stop_r);
                if let Err(e) = &result {
                    tracing::error!(error = %e, "stdio relay failed");
                }
                let _ = done_tx.send(());
                result
            })?;
        Ok(RelayHandle {
            stop: Some(stop_w),
            finished: Some(done_rx),
            thread: Some(thread),
        })
    }

    /// Runs the relay on the current thread until done or stopped.
    ///
    /// `stop` is closed before returning.
    pub fn run(self, stop: OwnedFd) -> Result<()> {
        let caller = self.caller;
        match self.container {
            ContainerSide::Pipes { stdin, stdout, stderr } => {
                let _flags = FlagGuard::nonblocking(&[caller.stdin, caller.stdout, caller.stderr])?;
                sys::set_nonblocking(stdin.as_raw_fd(), true)?;
                sys::set_nonblocking(stdout.as_raw_fd(), true)?;
                sys::set_nonblocking(stderr.as_raw_fd(), true)?;
                let streams = vec![
                    Stream::new("stdin", caller.stdin, stdin.as_raw_fd()).closing_writer(stdin),
                    Stream::new("stdout", stdout.as_raw_fd(), caller.stdout).owning_reader(stdout),
                    Stream::new("stderr", stderr.as_raw_fd(), caller.stderr).owning_reader(stderr),
                ];
                relay_loop(streams, &stop)
            }
            ContainerSide::Console { listener, size } => {
                let Some(pty) = accept_console(&listener, &stop)? else {
                    return Ok(());
                };
                drop(listener);
                if let Some(size) = size.or_else(|| window_size(caller.stdin)) {
                    if let Err(e) = set_window_size(pty.as_raw_fd(), size) {
                        tracing::warn!(error = %e, "failed to size console");
                    }
                }
                let _raw = RawModeGuard::enter(caller.stdin)?;
                let _flags = FlagGuard::nonblocking(&[caller.stdin, caller.stdout])?;
                sys::set_nonblocking(pty.as_raw_fd(), true)?;
                let streams = vec![
                    Stream::new("stdin", caller.stdin, pty.as_raw_fd()),
                    Stream::new("console", pty.as_raw_fd(), caller.stdout),
                ];
                relay_loop(streams, &stop)
            }
        }
    }
}

impl RelayHandle {
    /// Resolves once the relay thread has finished.
    pub fn finished(&mut self) -> Option<&mut oneshot::Receiver<()>> {
        self.finished.as_mut()
    }

    /// Signals the relay to stop by closing the stop pipe. Idempotent.
    pub fn stop(&mut self) {
        self.stop.take();
    }

    /// Stops the relay and waits for its thread.
    pub fn join(mut self) -> Result<()> {
        self.stop();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Internal("stdio relay thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

/// Waits for the runtime to connect and send the pty master.
fn accept_console(listener: &UnixListener, stop: &OwnedFd) -> Result<Option<OwnedFd>> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((conn, _)) => {
                conn.set_nonblocking(false)?;
                let pty = recv_console(&conn)?;
                tracing::debug!("received console descriptor");
                return Ok(Some(pty));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        let mut fds = [
            libc::pollfd { fd: listener.as_raw_fd(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: stop.as_raw_fd(), events: libc::POLLIN, revents: 0 },
        ];
        // SAFETY: `fds` is a valid array of two pollfds.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if classify(&err) == IoOutcome::Retry {
                continue;
            }
            return Err(err.into());
        }
        if fds[1].revents != 0 {
            tracing::debug!("relay stopped before the console was received");
            return Ok(None);
        }
    }
}

/// One relayed direction.
#[derive(Debug)]
struct Stream {
    label: &'static str,
    reader: RawFd,
    writer: RawFd,
    buffer: Vec<u8>,
    read_done: bool,
    write_done: bool,
    /// Owned reader, closed when the stream finishes.
    owned_reader: Option<OwnedFd>,
    /// Owned writer, closed once the reader hits EOF and the buffer drains.
    owned_writer: Option<OwnedFd>,
}

impl Stream {
    fn new(label: &'static str, reader: RawFd, writer: RawFd) -> Self {
        Self {
            label,
            reader,
            writer,
            buffer: Vec::new(),
            read_done: false,
            write_done: false,
            owned_reader: None,
            owned_writer: None,
        }
    }

    fn owning_reader(mut self, fd: OwnedFd) -> Self {
        self.owned_reader = Some(fd);
        self
    }

    fn closing_writer(mut self, fd: OwnedFd) -> Self {
        self.owned_writer = Some(fd);
        self
    }

    fn finished(&self) -> bool {
        (self.read_done && self.buffer.is_empty()) || self.write_done
    }

    fn wants_read(&self) -> bool {
        !self.read_done && !self.write_done && self.buffer.len() < MAX_RELAY_BUFFER
    }

    /// Reads what is available. Returns false on a fatal error.
    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; RELAY_READ_SIZE];
        loop {
            // SAFETY: reading into a stack buffer of the given length.
            let n = unsafe { libc::read(self.reader, chunk.as_mut_ptr().cast(), chunk.len()) };
            if n > 0 {
                self.buffer.extend_from_slice(&chunk[..n as usize]);
                if self.buffer.len() >= MAX_RELAY_BUFFER {
                    return true;
                }
                continue;
            }
            if n == 0 {
                tracing::debug!(stream = self.label, "end of input");
                self.read_done = true;
                return true;
            }
            let err = io::Error::last_os_error();
            match classify(&err) {
                IoOutcome::Retry => return true,
                IoOutcome::Eof => {
                    self.read_done = true;
                    return true;
                }
                IoOutcome::Fatal => {
                    tracing::error!(stream = self.label, error = %err, "read failed");
                    return false;
                }
            }
        }
    }

    /// Writes buffered data. Returns false on a fatal error.
    fn flush(&mut self) -> bool {
        while !self.buffer.is_empty() && !self.write_done {
            // SAFETY: writing from the live buffer with its length.
            let n = unsafe { libc::write(self.writer, self.buffer.as_ptr().cast(), self.buffer.len()) };
            if n >= 0 {
                self.buffer.drain(..n as usize);
                continue;
            }
            let err = io::Error::last_os_error();
            match classify(&err) {
                IoOutcome::Retry => return true,
                IoOutcome::Eof => {
                    tracing::debug!(stream = self.label, "destination closed, discarding output");
                    self.buffer.clear();
                    self.write_done = true;
                }
                IoOutcome::Fatal => {
                    tracing::error!(stream = self.label, error = %err, "write failed");
                    return false;
                }
            }
        }
        if self.read_done && self.buffer.is_empty() {
            self.owned_writer.take();
            self.owned_reader.take();
        }
        true
    }
}

fn relay_loop(mut streams: Vec<Stream>, stop: &OwnedFd) -> Result<()> {
    loop {
        streams.retain(|s| {
            if s.finished() {
                tracing::debug!(stream = s.label, "stream finished");
                false
            } else {
                true
            }
        });
        if streams.is_empty() {
            return Ok(());
        }

        let mut fds = vec![libc::pollfd {
            fd: stop.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut polled = Vec::new();
        for (i, stream) in streams.iter().enumerate() {
            if stream.wants_read() {
                fds.push(libc::pollfd {
                    fd: stream.reader,
                    events: libc::POLLIN,
                    revents: 0,
                });
                polled.push(i);
            }
        }
        let pending = streams.iter().any(|s| !s.buffer.is_empty());
        let timeout = if pending {
            RELAY_FLUSH_INTERVAL.as_millis() as libc::c_int
        } else {
            -1
        };

        // SAFETY: `fds` is a valid, correctly sized pollfd array.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match classify(&err) {
                IoOutcome::Retry => continue,
                _ => return Err(err.into()),
            }
        }

        for (slot, &i) in polled.iter().enumerate() {
            let revents = fds[slot + 1].revents;
            if revents == 0 {
                continue;
            }
            if revents & libc::POLLNVAL != 0 {
                tracing::debug!(stream = streams[i].label, "descriptor closed under the relay");
                streams[i].read_done = true;
                continue;
            }
            // POLLHUP with data still queued: fill drains it and sees EOF.
            if !streams[i].fill() {
                return Err(Error::Internal(format!("relay read failed on {}", streams[i].label)));
            }
        }

        for stream in &mut streams {
            if !stream.flush() {
                return Err(Error::Internal(format!("relay write failed on {}", stream.label)));
            }
        }

        if fds[0].revents != 0 {
            tracing::debug!("relay stop requested");
            // Deliver output the container wrote just before exiting.
            for stream in streams.iter_mut().filter(|s| s.wants_read()) {
                stream.fill();
            }
            for stream in &mut streams {
                stream.flush();
            }
            return Ok(());
        }
    }
}

/// Sets descriptors non-blocking and restores their flags on drop.
struct FlagGuard {
    saved: Vec<(RawFd, libc::c_int)>,
}

impl FlagGuard {
    fn nonblocking(fds: &[RawFd]) -> io::Result<Self> {
        let mut guard = Self { saved: Vec::new() };
        for &fd in fds {
            if guard.saved.iter().any(|(f, _)| *f == fd) {
                continue;
            }
            let flags = sys::set_nonblocking(fd, true)?;
            guard.saved.push((fd, flags));
        }
        Ok(guard)
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        for (fd, flags) in self.saved.drain(..) {
            if let Err(e) = sys::restore_flags(fd, flags) {
                tracing::debug!(fd, error = %e, "could not restore descriptor flags");
            }
        }
    }
}

/// Reads whatever is immediately available on `fd` without blocking.
///
/// Used to collect a failed runtime's output from the relay pipes.
pub fn drain_available(fd: &impl AsFd) -> String {
    let raw = fd.as_fd().as_raw_fd();
    let Ok(flags) = sys::set_nonblocking(raw, true) else {
        return String::new();
    };
    let mut out = Vec::new();
    let mut chunk = [0u8; RELAY_READ_SIZE];
    while out.len() < MAX_RELAY_BUFFER {
        // SAFETY: reading into a stack buffer of the given length.
        let n = unsafe { libc::read(raw, chunk.as_mut_ptr().cast(), chunk.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n as usize]);
    }
    let _ = sys::restore_flags(raw, flags);
    String::from_utf8_lossy(&out).into_owned()
}
