//! Parses the command line and runs the chosen scenario.
//!
//! Running the DHCP scenario with a JSON log:
//!
//! ```cargo run -- --log dhcp```

use crate::scenarios;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{
    fs::{create_dir_all, OpenOptions},
    sync::Arc,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(version, about = "Runs scenarios on the conduit network stack")]
struct Args {
    /// Writes a JSON log to ./logs instead of the console.
    #[arg(short, long)]
    log: bool,
    /// Logs every packet and state transition.
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    /// Echo a datagram and a ping through the loopback interface.
    Loopback,
    /// Two hosts claim link-local addresses and ping each other.
    LinkLocal,
    /// Three clients lease addresses from a server.
    Dhcp,
}

/// Parses the arguments, sets up logging and runs the scenario.
pub async fn initialize_from_arguments() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    if args.log {
        initialize_logging(level)?;
    } else {
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    run(args.scenario).await
}

async fn run(scenario: Scenario) -> anyhow::Result<()> {
    info!(?scenario, "starting");
    match scenario {
        Scenario::Loopback => scenarios::loopback().await?,
        Scenario::LinkLocal => scenarios::link_local().await?,
        Scenario::Dhcp => {
            for lease in scenarios::dhcp().await? {
                println!(
                    "leased {}/{} for {} s from {}",
                    lease.address, lease.prefix, lease.timers.lease, lease.server
                );
            }
        }
    }
    Ok(())
}

/// Sends every event to a JSON file named for the current time. Only call
/// once per process.
fn initialize_logging(level: Level) -> anyhow::Result<()> {
    let main_path = "./logs";
    create_dir_all(main_path).context("creating the log directory")?;
    let file_path = format!(
        "{}/debug-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&file_path)
        .with_context(|| format!("opening {file_path}"))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(Arc::new(file))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenarios_are_subcommands() {
        let args = Args::try_parse_from(["conduit", "--verbose", "link-local"]).unwrap();
        assert!(args.verbose);
        assert!(!args.log);
        assert_eq!(args.scenario, Scenario::LinkLocal);
        assert!(Args::try_parse_from(["conduit"]).is_err());
    }
}
