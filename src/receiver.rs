use std::{
    collections::HashSet,
    io::{self, Read},
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use anyhow::bail;
use wire::{FrameConfig, FrameError};

use crate::{
    logging::CadenceLogger,
    sock::{self, Epoll, FdIo},
};

/// Single monolithic read buffer shared across all connections. Frames
/// larger than this are an error; the bound is deliberately not
/// configurable.
pub const RECV_BUF_LEN: usize = 64 * 1024;

const PIPE_TOKEN: u64 = u64::MAX;

pub struct ReceiverOutcome {
    pub received: u64,
    pub result: anyhow::Result<()>,
}

/// The single response consumer. Adopts connections from the handoff pipe
/// and is, from that moment, the only component that ever closes them.
pub struct Receiver {
    frame: FrameConfig,
    pipe: OwnedFd,
    conn_fds: HashSet<RawFd>,
    receive_count: u64,
}

impl Receiver {
    pub fn new(frame: FrameConfig, pipe: OwnedFd) -> Self {
        Self {
            frame,
            pipe,
            conn_fds: HashSet::new(),
            receive_count: 0,
        }
    }

    /// Runs until the last connection closes or something fatal happens.
    /// Either way the pipe read end closes on drop, which fires every
    /// sender's liveness watcher.
    pub fn run(mut self) -> ReceiverOutcome {
        let result = self.run_inner();
        ReceiverOutcome {
            received: self.receive_count,
            result,
        }
    }

    fn run_inner(&mut self) -> anyhow::Result<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.pipe.as_raw_fd(), libc::EPOLLIN as u32, PIPE_TOKEN)?;

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];

        loop {
            let ready = epoll.wait(&mut events)?;
            for ev in &events[..ready] {
                let token = ev.u64;
                let revents = ev.events;

                if token == PIPE_TOKEN {
                    if !self.accept_handoff(&epoll)? {
                        return Ok(());
                    }
                    continue;
                }

                let fd = token as RawFd;
                if revents & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                    // Either a sender shut its connection down or the server
                    // did; both end the connection's life here.
                    if self.close_conn(fd) {
                        return Ok(());
                    }
                    continue;
                }

                match self.frame.receive_next(&mut FdIo(fd), &mut buf) {
                    Ok(_tag) => self.receive_count += 1,
                    Err(FrameError::EarlyEof) => {
                        CadenceLogger::closing_after_eof(fd);
                        if self.close_conn(fd) {
                            return Ok(());
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    /// Reads one fd number off the pipe and starts watching it. Returns
    /// `false` when the pipe reported EOF: a sender failed and closed the
    /// write end, so every tracked connection is closed (errors ignored,
    /// this is already the error path) and the receiver is done.
    fn accept_handoff(&mut self, epoll: &Epoll) -> anyhow::Result<bool> {
        let mut bytes = [0u8; 4];
        let n = loop {
            match FdIo(self.pipe.as_raw_fd()).read(&mut bytes) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };

        if n == 0 {
            CadenceLogger::pipe_closed();
            for fd in std::mem::take(&mut self.conn_fds) {
                CadenceLogger::closing_conn(fd);
                sock::close_fd(fd);
            }
            return Ok(false);
        }
        if n != bytes.len() {
            bail!("short read on handoff pipe");
        }

        let fd = RawFd::from_ne_bytes(bytes);
        epoll.add(
            fd,
            (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            fd as u64,
        )?;
        self.conn_fds.insert(fd);
        CadenceLogger::connection_adopted(fd);
        Ok(true)
    }

    /// Closes and untracks a connection; `true` once none remain.
    fn close_conn(&mut self, fd: RawFd) -> bool {
        self.conn_fds.remove(&fd);
        CadenceLogger::closing_conn(fd);
        sock::close_fd(fd);
        self.conn_fds.is_empty()
    }
}
