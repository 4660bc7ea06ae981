//! Inspect and exercise the simulation profile resolved from the environment.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use exo_simulation::{
    config, network,
    throttle::{self, Tuning},
};
use std::{
    io::{self, Read, Write},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

const SHOW_CMD: &str = "show";
const ESTIMATE_CMD: &str = "estimate";
const CORRUPT_CMD: &str = "corrupt";

#[derive(Error, Debug)]
enum Failure {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("simulation error: {0}")]
    Simulation(#[from] exo_simulation::Error),
}

/// Entrypoint for the exo-sim CLI
fn main() -> ExitCode {
    // Define application
    let matches = Command::new("exo-sim")
        .version(crate_version())
        .about("Inspect and exercise the active fault-and-performance simulation profile.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new(SHOW_CMD).about("Print the resolved simulation profile as JSON."),
        )
        .subcommand(
            Command::new(ESTIMATE_CMD)
                .about("Print the delays the active profile would insert for a workload.")
                .arg(
                    Arg::new("bytes")
                        .long("bytes")
                        .required(true)
                        .help("Payload size in bytes")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("gbps")
                        .long("gbps")
                        .help("Link rate in gigabits per second")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("layers")
                        .long("layers")
                        .help("Layers per token (defaults to 32)")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("tokens")
                        .long("tokens")
                        .default_value("1")
                        .help("Tokens processed")
                        .value_parser(value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new(CORRUPT_CMD)
                .about("Flip bits of stdin and write the result to stdout.")
                .arg(
                    Arg::new("ber")
                        .long("ber")
                        .required(true)
                        .help("Probability that any bit is flipped")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .help("Seed for reproducible corruption")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .get_matches();

    // Initialize logging
    let level = if matches.get_flag(VERBOSE_FLAG) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    // Parse subcommands
    let result = match matches.subcommand() {
        Some((SHOW_CMD, _)) => show(),
        Some((ESTIMATE_CMD, matches)) => estimate(matches),
        Some((CORRUPT_CMD, matches)) => corrupt(matches),
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = result {
        error!(?err, "command failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn show() -> Result<(), Failure> {
    let resolver = config::global();
    match resolver.outcome() {
        Ok(config) => {
            if !config.enable {
                info!("simulation disabled");
            }
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        Err(err) => info!(%err, "simulation inactive"),
    }
    Ok(())
}

fn estimate(matches: &ArgMatches) -> Result<(), Failure> {
    let bytes = *matches.get_one::<usize>("bytes").unwrap();
    let gbps = matches.get_one::<f64>("gbps").copied();
    let layers = matches.get_one::<usize>("layers").copied();
    let tokens = *matches.get_one::<usize>("tokens").unwrap();

    let tuning = Tuning::from_env();
    let speed = throttle::multiplier(config::global().active(), &tuning);
    let compute = throttle::compute_delay(speed, &tuning, layers, tokens)?;
    println!("transmission: {:?}", network::transmission_delay(bytes, gbps));
    println!("multiplier: {speed}");
    println!("compute: {compute:?}");
    Ok(())
}

fn corrupt(matches: &ArgMatches) -> Result<(), Failure> {
    let ber = matches.get_one::<f64>("ber").copied();
    let seed = matches.get_one::<u64>("seed").copied();

    let mut input = Vec::new();
    io::stdin().read_to_end(&mut input)?;
    let output = network::corrupt_bytes(&input, ber, seed);
    io::stdout().write_all(&output)?;
    Ok(())
}
