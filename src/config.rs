//! Runtime configuration.
//!
//! Every knob is a `serve` flag with a `FISHBOWL_*` environment fallback; the
//! parsed arguments are folded into a plain [`Config`] that the rest of the
//! crate consumes.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Resource ceilings applied to each sandbox container.
#[derive(Debug, Clone)]
pub struct Limits {
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub pids: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_shares: 512,
            pids: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub image: String,
    pub network: String,
    pub limits: Limits,
    pub storage_root: PathBuf,
    pub credentials_file: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Capacity of every connection's outbound frame queue.
    pub outbound_queue: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            image: "fishbowl-sandbox:latest".to_string(),
            network: "fishbowl-isolated".to_string(),
            limits: Limits::default(),
            storage_root: PathBuf::from("/var/lib/fishbowl/homes"),
            credentials_file: Some(PathBuf::from("/var/lib/fishbowl/users.json")),
            idle_timeout: Duration::from_secs(20 * 60),
            sweep_interval: Duration::from_secs(2 * 60),
            outbound_queue: 256,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

/// `serve` subcommand arguments.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "FISHBOWL_PORT", default_value = "3001")]
    pub port: u16,

    /// Base image every sandbox is created from; built from the bundled
    /// Dockerfile when it can be neither found nor pulled
    #[arg(long, env = "FISHBOWL_IMAGE", default_value = "fishbowl-sandbox:latest")]
    pub image: String,

    /// Docker network sandboxes are attached to (created if missing)
    #[arg(long, env = "FISHBOWL_NETWORK", default_value = "fishbowl-isolated")]
    pub network: String,

    /// Memory ceiling per sandbox in MiB
    #[arg(
        long,
        env = "FISHBOWL_MEMORY_MB",
        default_value = "512",
        value_parser = clap::value_parser!(i64).range(6..=1_048_576)
    )]
    pub memory_mb: i64,

    /// Relative CPU weight per sandbox
    #[arg(long, env = "FISHBOWL_CPU_SHARES", default_value = "512")]
    pub cpu_shares: i64,

    /// Maximum number of processes per sandbox
    #[arg(long, env = "FISHBOWL_PIDS_LIMIT", default_value = "256")]
    pub pids_limit: i64,

    /// Host directory holding per-user home directories
    #[arg(long, env = "FISHBOWL_STORAGE_ROOT", default_value = "/var/lib/fishbowl/homes")]
    pub storage_root: PathBuf,

    /// JSON file holding registered users
    #[arg(long, env = "FISHBOWL_CREDENTIALS", default_value = "/var/lib/fishbowl/users.json")]
    pub credentials_file: PathBuf,

    /// Keep registered users in memory only
    #[arg(long)]
    pub ephemeral_credentials: bool,

    /// Minutes of inactivity before a sandbox is reclaimed
    #[arg(
        long,
        env = "FISHBOWL_IDLE_MINUTES",
        default_value = "20",
        value_parser = clap::value_parser!(u64).range(1..=7 * 24 * 60)
    )]
    pub idle_minutes: u64,

    /// Seconds between idle sweeps
    #[arg(long, env = "FISHBOWL_SWEEP_SECS", default_value = "120")]
    pub sweep_secs: u64,

    /// Outbound frames buffered per connection before an observer is dropped
    #[arg(long, env = "FISHBOWL_OUTBOUND_QUEUE", default_value = "256")]
    pub outbound_queue: usize,
}

impl From<ServeArgs> for Config {
    fn from(args: ServeArgs) -> Self {
        Self {
            port: args.port,
            image: args.image,
            network: args.network,
            limits: Limits {
                memory_bytes: args.memory_mb.saturating_mul(1024 * 1024),
                cpu_shares: args.cpu_shares,
                pids: args.pids_limit,
            },
            storage_root: args.storage_root,
            credentials_file: (!args.ephemeral_credentials).then_some(args.credentials_file),
            idle_timeout: Duration::from_secs(args.idle_minutes.saturating_mul(60)),
            sweep_interval: Duration::from_secs(args.sweep_secs.max(1)),
            outbound_queue: args.outbound_queue.max(1),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        let argv = std::iter::once("fishbowl").chain(args.iter().copied());
        Cli::try_parse_from(argv).map(|cli| cli.serve.into())
    }

    #[test]
    fn defaults_match_config_default() {
        let parsed = parse(&[]).unwrap();
        let default = Config::default();
        assert_eq!(parsed.port, default.port);
        assert_eq!(parsed.image, default.image);
        assert_eq!(parsed.limits.memory_bytes, default.limits.memory_bytes);
        assert_eq!(parsed.idle_timeout, default.idle_timeout);
        assert_eq!(parsed.credentials_file, default.credentials_file);
    }

    #[test]
    fn rejects_out_of_range_limits() {
        assert!(parse(&["--memory-mb", "9223372036854775807"]).is_err());
        assert!(parse(&["--memory-mb", "0"]).is_err());
        assert!(parse(&["--idle-minutes", "18446744073709551615"]).is_err());
        assert!(parse(&["--idle-minutes", "0"]).is_err());

        let big = parse(&["--memory-mb", "1048576", "--idle-minutes", "10080"]).unwrap();
        assert_eq!(big.limits.memory_bytes, 1 << 40);
        assert_eq!(big.idle_timeout, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn ephemeral_flag_drops_credentials_file() {
        let config = parse(&["--ephemeral-credentials"]).unwrap();
        assert!(config.credentials_file.is_none());
    }
}
