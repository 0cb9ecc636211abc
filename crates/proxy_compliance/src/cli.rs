use clap::{Parser, Subcommand};

use crate::correlate::{CorrelateArgs, run_correlate};
use crate::doctor::{DoctorArgs, run_doctor};
use crate::error::Result;
use crate::matrix::default_matrix;
use crate::suite::{SuiteArgs, run_suite};

#[derive(Debug, Parser)]
#[command(
    name = "proxy_compliance",
    about = "Verify that a package client honours proxy and TLS settings",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the proxy compliance matrix against a client.
    Suite(SuiteArgs),

    /// Check a saved client report against a proxy URL dump.
    Correlate(CorrelateArgs),

    /// Print the built-in case ids.
    #[command(name = "list-cases")]
    ListCases,

    /// Validate that the client and proxy executables are usable.
    Doctor(DoctorArgs),
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Suite(args) => run_suite(args),
        Commands::Correlate(args) => run_correlate(args),
        Commands::ListCases => {
            print_cases();
            Ok(())
        }
        Commands::Doctor(args) => run_doctor(args),
    }
}

fn print_cases() {
    for case in default_matrix() {
        println!("{}", case.id());
    }
}
