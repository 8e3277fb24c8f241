use std::{sync::Arc, thread};

use anyhow::{Context, anyhow};
use wire::{FrameConfig, VarDecls, VarStore};

use crate::{
    logging::CadenceLogger,
    receiver::Receiver,
    sched::{self, Policy, StartSchedule},
    sender::{Sender, SenderContext},
    sock,
};

/// Run options resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Main-flow packets each sender emits before shutting down.
    pub budget: u64,
    pub policy: Policy,
    pub affinity: bool,
    pub schedule: StartSchedule,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            budget: 0,
            policy: Policy::Default,
            affinity: true,
            schedule: StartSchedule::MinuteBoundary,
        }
    }
}

/// Everything lowered from the configuration file: the senders with their
/// sessions and flow copies, the response wire layout, and the variable
/// machinery shared by all of them.
#[derive(Debug)]
pub struct Plan {
    pub senders: Vec<Sender>,
    pub receiver_core: usize,
    pub frame: FrameConfig,
    pub decls: VarDecls,
    pub globals: VarStore,
}

#[derive(Debug, Clone, Copy)]
pub struct SenderStats {
    pub core: usize,
    pub sent: u64,
    pub missed_timers: u64,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub received: u64,
    pub senders: Vec<SenderStats>,
    /// False when any thread reported a failure.
    pub success: bool,
}

/// Wires the handoff pipe between senders and receiver, spawns the threads
/// with their affinity and scheduling policy, joins them, and aggregates
/// the counters.
pub struct Cadence {
    plan: Plan,
    host: Arc<str>,
    port: u16,
    opts: RunOpts,
}

impl Cadence {
    pub fn new(plan: Plan, host: &str, port: u16, opts: RunOpts) -> Self {
        Self {
            plan,
            host: Arc::from(host),
            port,
            opts,
        }
    }

    pub fn run(self) -> anyhow::Result<RunSummary> {
        let Self {
            plan,
            host,
            port,
            opts,
        } = self;

        let (pipe_read, pipe_write) = sock::handoff_pipe()?;
        let pipe = Arc::new(pipe_write);
        let globals = Arc::new(plan.globals);

        let receiver = Receiver::new(plan.frame, pipe_read);
        let affinity = opts.affinity;
        let receiver_core = plan.receiver_core;
        let receiver_handle = thread::Builder::new()
            .name("cadence-recv".to_string())
            .spawn(move || {
                if affinity {
                    sched::try_pin("receiver", receiver_core);
                }
                receiver.run()
            })
            .context("failed to spawn receiver thread")?;

        let mut sender_handles = Vec::with_capacity(plan.senders.len());
        for sender in plan.senders {
            let ctx = SenderContext {
                host: Arc::clone(&host),
                port,
                budget: opts.budget,
                schedule: opts.schedule,
                frame: plan.frame,
                decls: plan.decls,
                globals: Arc::clone(&globals),
                pipe: Arc::clone(&pipe),
            };
            let core = sender.core;
            let policy = opts.policy;
            let handle = thread::Builder::new()
                .name(format!("cadence-send-{core}"))
                .spawn(move || {
                    if affinity {
                        sched::try_pin("sender", core);
                    }
                    sched::apply_policy(policy);
                    sender.run(ctx)
                })
                .with_context(|| format!("failed to spawn sender thread for core {core}"))?;
            sender_handles.push(handle);
        }

        // The receiver finishes once the last connection closes; joining it
        // first matches the teardown order the pipe protocol assumes. The
        // orchestrator's pipe handle stays alive across the joins so a
        // normally-exiting sender never EOFs the receiver by accident.
        let receiver_outcome = receiver_handle
            .join()
            .map_err(|_| anyhow!("receiver thread panicked"))?;
        let mut success = receiver_outcome.result.is_ok();
        if let Err(err) = &receiver_outcome.result {
            CadenceLogger::receiver_failed(err);
        }

        let mut senders = Vec::with_capacity(sender_handles.len());
        for handle in sender_handles {
            let outcome = handle
                .join()
                .map_err(|_| anyhow!("sender thread panicked"))?;
            if let Err(err) = &outcome.result {
                CadenceLogger::sender_failed(outcome.core, err);
            }
            success &= outcome.result.is_ok();
            senders.push(SenderStats {
                core: outcome.core,
                sent: outcome.sent,
                missed_timers: outcome.missed_timers,
            });
        }
        drop(pipe);

        Ok(RunSummary {
            received: receiver_outcome.received,
            senders,
            success,
        })
    }
}
