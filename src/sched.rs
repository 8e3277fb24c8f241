use std::{io, time::Duration};

use log::{debug, warn};

/// Emit-loop timing strategy, applied inside each sender thread right after
/// spawn. The loop itself is identical under every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    Default,
    /// SCHED_FIFO at priority 1.
    RealtimeFifo,
    /// Keep the default policy but shrink this thread's timer slack to 1 ns.
    LowTimerslack,
}

/// When a sender's sessions take their first tick.
#[derive(Debug, Clone, Copy, Default)]
pub enum StartSchedule {
    /// The next wall-clock minute boundary at least two seconds away, so a
    /// fleet of generators sharing a clock ticks in unison.
    #[default]
    MinuteBoundary,
    /// A fixed delay from now. Lets test runs skip the minute wait.
    After(Duration),
}

/// Next whole-minute epoch second at least 2 and at most 62 seconds after
/// `now_sec`.
pub const fn next_minute_sec(now_sec: u64) -> u64 {
    (now_sec + 62) / 60 * 60
}

/// Nanoseconds since the epoch on CLOCK_REALTIME.
pub fn realtime_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &raw mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Absolute CLOCK_REALTIME expiry of a session's first tick.
pub fn first_expiry_ns(schedule: StartSchedule, start_off_ns: u64) -> u64 {
    match schedule {
        StartSchedule::MinuteBoundary => {
            next_minute_sec(realtime_now_ns() / 1_000_000_000) * 1_000_000_000 + start_off_ns
        }
        StartSchedule::After(delay) => realtime_now_ns() + delay.as_nanos() as u64 + start_off_ns,
    }
}

fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(core, &mut cpu_set);
        let result = libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &raw const cpu_set,
        );
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pins the calling thread if the machine actually has `core`. A generator
/// on an undersized dev box still runs, with degraded determinism.
pub fn try_pin(name: &str, core: usize) {
    if core >= num_cpus::get() {
        warn!("Not pinning {name}: core {core} out of range");
        return;
    }
    match pin_to_core(core) {
        Ok(()) => debug!("Pinned {name} to core {core}"),
        Err(err) => warn!("Failed to pin {name} to core {core}: {err}"),
    }
}

/// Applies the timing policy to the calling thread. Failures (typically a
/// missing CAP_SYS_NICE) are warnings, not fatal.
pub fn apply_policy(policy: Policy) {
    match policy {
        Policy::Default => {}
        Policy::RealtimeFifo => {
            let param = libc::sched_param { sched_priority: 1 };
            let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &raw const param) };
            if rc != 0 {
                warn!(
                    "Failed to set SCHED_FIFO: {}",
                    io::Error::last_os_error()
                );
            }
        }
        Policy::LowTimerslack => {
            let rc = unsafe { libc::prctl(libc::PR_SET_TIMERSLACK, 1 as libc::c_ulong) };
            if rc != 0 {
                warn!(
                    "Failed to set timerslack: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}
