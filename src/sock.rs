use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
};

use libc::c_void;

/// Thin wrapper over an epoll instance. Level-triggered, blocking waits,
/// EINTR retried.
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Watches `fd` for `events`; `token` comes back verbatim in the ready
    /// events. Closing a watched fd removes it from the set.
    pub fn add(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rc =
            unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &raw mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [libc::epoll_event]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as i32,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }
}

/// A CLOCK_REALTIME timerfd: absolute first expiry, periodic interval.
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new_realtime() -> io::Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_REALTIME, libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Arms the timer: first expiry at `first_epoch_ns` nanoseconds after
    /// the epoch (absolute), then every `interval_ns`.
    pub fn arm_absolute(&self, first_epoch_ns: u64, interval_ns: u64) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: timespec_from_ns(interval_ns),
            it_value: timespec_from_ns(first_epoch_ns),
        };
        let rc = unsafe {
            libc::timerfd_settime(
                self.fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &raw const spec,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Expirations since the last read; blocks until at least one. A value
    /// above 1 means deadlines were missed.
    pub fn read_expirations(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), 8)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n != 8 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short read on timerfd",
                ));
            }
            return Ok(u64::from_ne_bytes(buf));
        }
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn timespec_from_ns(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    }
}

/// Creates the connection-handoff pipe: every sender writes single fd
/// numbers into it, the receiver reads them out. Returns the receiver's
/// read end and the shared write handle.
pub fn handoff_pipe() -> io::Result<(OwnedFd, HandoffSender)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((
        unsafe { OwnedFd::from_raw_fd(fds[0]) },
        HandoffSender {
            fd: fds[1],
            closed: AtomicBool::new(false),
        },
    ))
}

/// Write side of the handoff pipe, shared by all sender threads.
///
/// A failing sender closes it; the close is the cascade signal that wakes
/// the other senders' liveness watchers and, once it was the last write
/// end, EOFs the receiver. The close must happen at most once even though
/// several threads may race into their failure paths.
pub struct HandoffSender {
    fd: RawFd,
    closed: AtomicBool,
}

impl HandoffSender {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Transfers ownership of `conn` to the receiver. A 4-byte write stays
    /// below PIPE_BUF, so concurrent senders never interleave.
    pub fn send_fd(&self, conn: RawFd) -> io::Result<()> {
        FdIo(self.fd).write_all(&conn.to_ne_bytes())
    }

    /// Idempotent close of the shared write end.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe { libc::close(self.fd) };
        }
    }
}

impl Drop for HandoffSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// `Read`/`Write` over a raw fd this handle does not own. Used on the
/// connection fds whose close is someone else's job.
#[derive(Clone, Copy)]
pub struct FdIo(pub RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast::<c_void>(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Half-closes both directions. The fd stays open and registered in the
/// receiver's epoll set, which is the point: the receiver gets its HUP
/// wakeup and performs the close.
pub fn shutdown_rdwr(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Final close of a handed-off connection fd. Errors are ignored: by the
/// time this runs the connection is either drained or part of a teardown.
pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
