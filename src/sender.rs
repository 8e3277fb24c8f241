use std::{
    io::Write,
    net::TcpStream,
    os::fd::{AsRawFd, IntoRawFd, RawFd},
    sync::Arc,
};

use anyhow::{Context, bail};
use wire::{FrameConfig, Packet, VarDecls, VarStore};

use crate::{
    logging::CadenceLogger,
    receiver::RECV_BUF_LEN,
    sched::{self, StartSchedule},
    sock::{self, Epoll, FdIo, HandoffSender, TimerFd},
};

/// Epoll token of the handoff-pipe liveness watcher; session tokens are the
/// session's index, so this must stay out of that range.
const PIPE_TOKEN: u64 = u64::MAX;

/// One long-lived connection with its own pacing and local variables.
#[derive(Debug)]
pub struct Session {
    pub start_off_ns: u64,
    pub interval_ns: u64,
    pub vars: VarStore,
    conn: Option<RawFd>,
    flow_pos: usize,
}

impl Session {
    pub fn new(start_off_ns: u64, interval_ns: u64, vars: VarStore) -> Self {
        Self {
            start_off_ns,
            interval_ns,
            vars,
            conn: None,
            flow_pos: 0,
        }
    }
}

/// Everything a sender thread needs besides its own state. Cheap to clone
/// per spawned thread; the variable declaration table and frame layout are
/// plain copies, the global store and pipe handle are shared.
#[derive(Clone)]
pub struct SenderContext {
    pub host: Arc<str>,
    pub port: u16,
    /// Main-flow packets to emit before initiating shutdown.
    pub budget: u64,
    pub schedule: StartSchedule,
    pub frame: FrameConfig,
    pub decls: VarDecls,
    pub globals: Arc<VarStore>,
    pub pipe: Arc<HandoffSender>,
}

pub struct SenderOutcome {
    pub core: usize,
    pub sent: u64,
    pub missed_timers: u64,
    pub result: anyhow::Result<()>,
}

/// One sender per configured core. Owns its sessions and its own copy of
/// both flows, since packet payloads are rewritten in place per session.
#[derive(Debug)]
pub struct Sender {
    pub core: usize,
    pub sessions: Vec<Session>,
    prelude_flow: Vec<Packet>,
    main_flow: Vec<Packet>,
    send_count: u64,
    missed_timers: u64,
}

impl Sender {
    pub fn new(core: usize, prelude_flow: Vec<Packet>, main_flow: Vec<Packet>) -> Self {
        Self {
            core,
            sessions: Vec::new(),
            prelude_flow,
            main_flow,
            send_count: 0,
            missed_timers: 0,
        }
    }

    /// Drives the sender to completion. On failure the shared pipe write end
    /// is closed, which is the cascade signal for everyone else.
    pub fn run(mut self, ctx: SenderContext) -> SenderOutcome {
        let result = self.run_inner(&ctx);
        if result.is_err() {
            ctx.pipe.close();
        }
        SenderOutcome {
            core: self.core,
            sent: self.send_count,
            missed_timers: self.missed_timers,
            result,
        }
    }

    fn run_inner(&mut self, ctx: &SenderContext) -> anyhow::Result<()> {
        let epoll = Epoll::new()?;
        epoll.add(ctx.pipe.as_raw_fd(), libc::EPOLLERR as u32, PIPE_TOKEN)?;

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut timers = Vec::with_capacity(self.sessions.len());
        for index in 0..self.sessions.len() {
            let timer = self.start_session(index, ctx, &mut buf)?;
            epoll.add(timer.as_raw_fd(), libc::EPOLLIN as u32, index as u64)?;
            timers.push(timer);
        }

        self.emit_loop(ctx, &epoll, &timers)
    }

    /// Connects one session, runs the prelude call-and-response, hands the
    /// connection to the receiver, and arms the session's timer.
    fn start_session(
        &mut self,
        index: usize,
        ctx: &SenderContext,
        buf: &mut [u8],
    ) -> anyhow::Result<TimerFd> {
        let session = &mut self.sessions[index];

        let mut stream = TcpStream::connect((ctx.host.as_ref(), ctx.port))
            .with_context(|| format!("couldn't connect to {}:{}", ctx.host, ctx.port))?;
        if let Err(err) = stream.set_nodelay(true) {
            CadenceLogger::tcp_nodelay_failed(&err);
        }
        CadenceLogger::session_connected(self.core, stream.as_raw_fd());

        for packet in &mut self.prelude_flow {
            packet.apply_variables(&ctx.decls, &ctx.globals, &mut session.vars)?;
            stream.write_all(packet.payload())?;

            let tag = ctx.frame.receive_next(&mut stream, buf)?;
            if tag != packet.answer_tag {
                bail!(
                    "unexpected answer tag: {tag} (expected: {})",
                    packet.answer_tag
                );
            }
        }

        // Ownership transfer: from here on the receiver polls and closes
        // this fd; we only write to it.
        let fd = stream.into_raw_fd();
        session.conn = Some(fd);
        ctx.pipe
            .send_fd(fd)
            .context("handoff pipe write failed")?;
        CadenceLogger::session_handed_off(self.core, fd);

        let timer = TimerFd::new_realtime()?;
        timer.arm_absolute(
            sched::first_expiry_ns(ctx.schedule, session.start_off_ns),
            session.interval_ns,
        )?;
        Ok(timer)
    }

    fn emit_loop(
        &mut self,
        ctx: &SenderContext,
        epoll: &Epoll,
        timers: &[TimerFd],
    ) -> anyhow::Result<()> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];

        'run: loop {
            let ready = epoll.wait(&mut events)?;
            for ev in &events[..ready] {
                let token = ev.u64;
                if token == PIPE_TOKEN {
                    bail!("receiver terminated early");
                }
                let index = token as usize;

                let expirations = timers[index].read_expirations()?;
                if expirations != 1 {
                    CadenceLogger::timer_overrun(self.core, expirations);
                    self.missed_timers += 1;
                }

                if self.send_count >= ctx.budget {
                    // Shut down, never close: a close here would drop the fd
                    // from the receiver's epoll set without a wakeup.
                    for session in &self.sessions {
                        if let Some(conn) = session.conn {
                            CadenceLogger::shutting_down(conn);
                            sock::shutdown_rdwr(conn)?;
                        }
                    }
                    break 'run;
                }

                let session = &mut self.sessions[index];
                let flow_index = session.flow_pos % self.main_flow.len();
                session.flow_pos += 1;
                let packet = &mut self.main_flow[flow_index];

                packet.apply_variables(&ctx.decls, &ctx.globals, &mut session.vars)?;
                let conn = session.conn.context("session has no connection")?;
                FdIo(conn).write_all(packet.payload())?;
                self.send_count += 1;
            }
        }
        Ok(())
    }
}
