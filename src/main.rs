use clap::{Arg, ArgMatches, Command};
use dotenv::dotenv;
use poolwarden::{logging, Config};
use std::path::PathBuf;
use std::process;

mod cli;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv().ok();

    let matches = build_cli().get_matches();

    if let Err(e) = run_command(matches).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn build_cli() -> Command {
    Command::new("poolwarden")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Shared PostgreSQL pool manager with verified, self-healing connections")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("check")
                .about("Build and verify the pool once, then shut it down")
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .help("Output format")
                        .value_parser(["text", "json"])
                        .default_value("text")
                )
        )
        .subcommand(
            Command::new("watch")
                .about("Keep the pool alive and report its health until Ctrl-C")
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .help("Seconds between health reports")
                        .value_parser(clap::value_parser!(u64).range(1..))
                        .default_value("30")
                )
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
        )
        .arg(
            Arg::new("config-dir")
                .long("config-dir")
                .help("Directory containing config.toml")
                .global(true)
                .value_parser(clap::value_parser!(PathBuf))
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    match matches.get_one::<PathBuf>("config-dir") {
        Some(dir) => Config::load_from_dir(dir),
        None => Config::load(),
    }
}

async fn run_command(matches: ArgMatches) -> anyhow::Result<()> {
    let config = load_config(&matches)?;
    logging::init_tracing(&config.logging)?;

    match matches.subcommand() {
        Some(("check", sub_matches)) => {
            cli::commands::check::handle_check(sub_matches, &config).await?
        }
        Some(("watch", sub_matches)) => {
            cli::commands::watch::handle_watch(sub_matches, &config).await?
        }
        Some(("config", _)) => {
            cli::commands::config::handle_config(&config)?
        }
        _ => {
            unreachable!("Command parsing should ensure we never reach this");
        }
    }

    Ok(())
}
