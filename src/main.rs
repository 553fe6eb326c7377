use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use kmerforge::builder::CommandBuilder;
use kmerforge::cli::Args;
use kmerforge::run::execute;

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut builder = CommandBuilder::new();
    for token in &args.tokens {
        builder.process_word(token);
    }

    let plan = match builder.finish() {
        Ok(plan) => plan,
        Err(errors) => {
            eprintln!("{}", "Problem with command line:".red().bold());
            for error in &errors.errors {
                eprintln!("  {}", error.red());
            }
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = execute(&plan) {
        eprintln!("{}\n  {}", "Engine error:".red().bold(), error.to_string().red());
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
