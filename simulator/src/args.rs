use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Deterministic odbc-middleware pool simulator")]
pub(crate) struct Args {
    #[arg(long, value_parser = humantime::parse_duration)]
    pub(crate) duration: Option<Duration>,
    #[arg(long)]
    pub(crate) iterations: Option<u64>,
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    #[arg(long, default_value_t = 2)]
    pub(crate) minsize: usize,
    #[arg(long, default_value_t = 8)]
    pub(crate) pool_size: usize,
    #[arg(long, default_value_t = 16)]
    pub(crate) tasks: usize,
    /// Chance a statement fails with a recoverable driver error.
    #[arg(long, default_value_t = 0.02)]
    pub(crate) fail_rate: f64,
    /// Chance a statement loses the link to the server.
    #[arg(long, default_value_t = 0.005)]
    pub(crate) disconnect_rate: f64,
    /// Chance the next new connection fails to open.
    #[arg(long, default_value_t = 0.01)]
    pub(crate) connect_fault_rate: f64,
    #[arg(long, default_value_t = 0.002)]
    pub(crate) clear_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    pub(crate) sleep_rate: f64,
    #[arg(long)]
    pub(crate) log: Option<PathBuf>,
    #[arg(long)]
    pub(crate) quick: bool,
    #[arg(long)]
    pub(crate) stress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimConfig {
    pub(crate) duration_ms: Option<u64>,
    pub(crate) iterations: Option<u64>,
    pub(crate) seed: u64,
    pub(crate) minsize: usize,
    pub(crate) pool_size: usize,
    pub(crate) tasks: usize,
    pub(crate) fail_rate: f64,
    pub(crate) disconnect_rate: f64,
    pub(crate) connect_fault_rate: f64,
    pub(crate) clear_rate: f64,
    pub(crate) sleep_rate: f64,
    pub(crate) log: Option<PathBuf>,
    pub(crate) preset: Option<String>,
    pub(crate) first_steps: usize,
    pub(crate) tail_steps: usize,
}

impl SimConfig {
    pub(crate) fn from_args(args: Args) -> Self {
        let pool_size = args.pool_size.max(1);
        let mut config = SimConfig {
            duration_ms: args
                .duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            iterations: args.iterations,
            seed: args.seed.unwrap_or_else(random_seed),
            minsize: args.minsize.min(pool_size),
            pool_size,
            tasks: args.tasks.max(1),
            fail_rate: clamp_rate(args.fail_rate),
            disconnect_rate: clamp_rate(args.disconnect_rate),
            connect_fault_rate: clamp_rate(args.connect_fault_rate),
            clear_rate: clamp_rate(args.clear_rate),
            sleep_rate: clamp_rate(args.sleep_rate),
            log: args.log,
            preset: None,
            first_steps: 30,
            tail_steps: 80,
        };

        if args.quick {
            config.apply_quick();
        }
        if args.stress {
            config.apply_stress();
        }

        config
    }

    fn apply_quick(&mut self) {
        self.preset = Some("quick".to_string());
        self.iterations = Some(5_000);
        self.duration_ms = None;
        self.minsize = 1;
        self.pool_size = 3;
        self.tasks = 6;
        self.fail_rate = 0.03;
        self.disconnect_rate = 0.01;
        self.connect_fault_rate = 0.02;
        self.clear_rate = 0.005;
    }

    fn apply_stress(&mut self) {
        self.preset = Some("stress".to_string());
        self.iterations = Some(100_000);
        self.duration_ms = None;
        self.minsize = 4;
        self.pool_size = 16;
        self.tasks = 64;
        self.fail_rate = 0.05;
        self.disconnect_rate = 0.02;
        self.connect_fault_rate = 0.03;
        self.clear_rate = 0.01;
        self.sleep_rate = 0.08;
    }
}

fn clamp_rate(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn random_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.as_secs() ^ u64::from(now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rate_limits_bounds() {
        assert_eq!(clamp_rate(-1.0), 0.0);
        assert_eq!(clamp_rate(2.0), 1.0);
        assert_eq!(clamp_rate(f64::NAN), 0.0);
        assert_eq!(clamp_rate(0.5), 0.5);
    }

    #[test]
    fn minsize_never_exceeds_pool_size() {
        let args = Args::parse_from(["simulator", "--minsize", "9", "--pool-size", "4"]);
        let config = SimConfig::from_args(args);
        assert_eq!(config.minsize, 4);
    }
}
