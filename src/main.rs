use std::process;

use anyhow::Context;
use cadence::{
    args,
    cadence::{Cadence, RunOpts},
    config::LoadConfig,
    sched::{Policy, StartSchedule},
};

fn main() {
    let _ = dotenvy::dotenv();
    #[cfg(debug_assertions)]
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    #[cfg(not(debug_assertions))]
    env_logger::init();

    match run() {
        Ok(success) => process::exit(i32::from(!success)),
        Err(err) => {
            log::error!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<bool> {
    let args = args::parse()?;

    let config = LoadConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let plan = config.build((args.senders > 0).then_some(args.senders))?;

    let opts = RunOpts {
        budget: args.budget,
        policy: if args.timerslack {
            Policy::LowTimerslack
        } else {
            Policy::RealtimeFifo
        },
        affinity: args.affinity,
        schedule: StartSchedule::MinuteBoundary,
    };

    let summary = Cadence::new(plan, &args.host, args.port, opts).run()?;

    println!("Received messages: {}", summary.received);
    for sender in &summary.senders {
        println!("Sent messages on core {}: {}", sender.core, sender.sent);
        println!(
            "Missed timer events on core {}: {}",
            sender.core, sender.missed_timers
        );
    }
    Ok(summary.success)
}
