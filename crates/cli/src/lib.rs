pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "poltergeist",
    about = "Poltergeist operator CLI",
    long_about = "Operate Poltergeist migrations, config inspection, readiness checks, and purchase-history audits.",
    after_help = "Examples:\n  poltergeist doctor --json\n  poltergeist config\n  poltergeist verify --user casper@example.com"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, provider credential readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Re-derive a user's purchase-history hash chain and report tampering")]
    Verify {
        #[arg(long, help = "User identifier (the buyer's email)")]
        user: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Verify { user } => commands::verify::run(&user),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
