use std::{env, path::PathBuf};

use anyhow::{Context, bail};

#[derive(Debug)]
pub struct Args {
    pub host: String,
    pub port: u16,
    pub config: PathBuf,
    /// `-j`: cap on sender threads; 0 means "all configured".
    pub senders: usize,
    /// `-n`: main-flow packets per sender.
    pub budget: u64,
    /// `-s`: 1 ns timerslack instead of the realtime scheduling policy.
    pub timerslack: bool,
    /// `-A` clears this.
    pub affinity: bool,
}

pub fn parse() -> anyhow::Result<Args> {
    parse_from(env::args().skip(1))
}

pub fn parse_from<I>(args: I) -> anyhow::Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut host = None;
    let mut port = None;
    let mut senders = 0usize;
    let mut budget = 0u64;
    let mut timerslack = false;
    let mut affinity = true;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" => {
                let v = iter.next().context("-c requires a value")?;
                config = Some(PathBuf::from(v));
            }
            "-j" => {
                let v = iter.next().context("-j requires a value")?;
                senders = v.parse().context("-j expects a number")?;
            }
            "-n" => {
                let v = iter.next().context("-n requires a value")?;
                budget = v.parse().context("-n expects a number")?;
            }
            "-s" => timerslack = true,
            "-A" => affinity = false,
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unexpected option: {other}"),
            other => {
                if host.is_none() {
                    host = Some(other.to_string());
                } else if port.is_none() {
                    port = Some(other.parse().context("PORT expects a port number")?);
                } else {
                    bail!("too many positional arguments");
                }
            }
        }
    }

    Ok(Args {
        config: config.context("no configuration file specified (cf. -c FILENAME)")?,
        host: host.context("no host specified (positional argument)")?,
        port: port.context("no port specified (positional argument)")?,
        senders,
        budget,
        timerslack,
        affinity,
    })
}

fn print_help() {
    println!("cadence - tcp load generator");
    println!("Usage: cadence -c FILENAME HOST PORT");
    println!();
    println!("Options:");
    println!("  -A             do NOT set thread CPU affinities");
    println!("  -c FILENAME    TOML configuration");
    println!("  -j #SENDERS    number of sender threads");
    println!("  -h             display this help");
    println!("  -n #PKTS       packets to send for each sender");
    println!("  -s             use 1 ns timerslack instead of realtime sched policy");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_the_full_surface() {
        let args = parse_from(strings(&[
            "-c", "load.toml", "-j", "2", "-n", "100", "-s", "-A", "host.example", "9000",
        ]))
        .unwrap();

        assert_eq!(args.config, PathBuf::from("load.toml"));
        assert_eq!(args.host, "host.example");
        assert_eq!(args.port, 9000);
        assert_eq!(args.senders, 2);
        assert_eq!(args.budget, 100);
        assert!(args.timerslack);
        assert!(!args.affinity);
    }

    #[test]
    fn positionals_may_precede_flags() {
        let args = parse_from(strings(&["host", "1234", "-c", "x.toml"])).unwrap();
        assert_eq!(args.host, "host");
        assert_eq!(args.port, 1234);
    }

    #[test]
    fn missing_required_pieces_fail() {
        assert!(parse_from(strings(&["host", "1234"])).is_err());
        assert!(parse_from(strings(&["-c", "x.toml", "host"])).is_err());
        assert!(parse_from(strings(&["-c", "x.toml"])).is_err());
    }

    #[test]
    fn rejects_extra_positionals_and_unknown_flags() {
        assert!(parse_from(strings(&["-c", "x.toml", "a", "1", "b"])).is_err());
        assert!(parse_from(strings(&["-c", "x.toml", "-z", "a", "1"])).is_err());
    }
}
