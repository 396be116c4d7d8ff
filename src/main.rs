//! timedmap demo
//!
//! Walks through the map's lifecycle: temporary and permanent keys, a
//! stopped reaper holding back an expiry, and a restart that lets it fire.

use bytes::Bytes;
use std::time::Duration;
use timedmap::TimedMap;
use tokio::time::{sleep, Instant};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Demo configuration
struct Config {
    /// Dispatch workers for expiration callbacks
    workers: usize,
    /// Scale factor applied to every TTL and pause
    tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            tick: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        let mut config = Config::default();
        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--workers" | "-w" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--workers requires a value"))?;
                    config.workers = value.parse()?;
                }
                "--tick-ms" | "-t" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--tick-ms requires a value"))?;
                    config.tick = Duration::from_millis(value.parse()?);
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("timedmap version {}", timedmap::VERSION);
                    std::process::exit(0);
                }
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }

        Ok(config)
    }
}

fn print_help() {
    println!(
        r#"
timedmap demo - a key-value map whose entries expire on their own

USAGE:
    timedmap [OPTIONS]

OPTIONS:
    -w, --workers <N>      Expiration callback workers (default: 4)
    -t, --tick-ms <MS>     Length of one demo tick in ms (default: 1000)
    -v, --version          Print version information
        --help             Print this help message
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .init();

    let tick = config.tick;
    let map: TimedMap<Bytes, Bytes> = TimedMap::new(
        |key: Bytes, value: Bytes| {
            info!(key = ?key, value = ?value, "expired");
        },
        config.workers,
    )?;

    let expires_at = Instant::now() + tick * 5;
    info!(after = ?(tick * 5), "test-1 scheduled");
    map.set_temporary(Bytes::from("1"), Bytes::from("test-1"), expires_at);

    info!(after = ?tick, "test-2 scheduled");
    map.set_with_ttl(Bytes::from("2"), Bytes::from("test-2"), tick);

    sleep(tick * 6).await;

    map.set_with_ttl(Bytes::from("session1"), Bytes::from("user42"), tick * 3);
    map.set_permanent(Bytes::from("config"), Bytes::from("always"));

    sleep(tick * 2).await;
    info!("Stopping reaper temporarily");
    map.stop().await;

    map.set_with_ttl(Bytes::from("late"), Bytes::from("user99"), tick * 2);
    info!("Reaper stopped, 'late' will not expire yet");

    sleep(tick * 3).await;
    info!(
        late_present = map.contains_key(&Bytes::from("late")),
        "Restarting reaper"
    );
    map.restart().await;

    sleep(tick * 2).await;
    info!(stats = ?map.stats(), size = map.len(), "Done");

    map.stop().await;
    Ok(())
}
