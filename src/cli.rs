//! Command-line interface definition.
//!
//! The engine itself consumes an ordered list of command tokens; the only
//! flags handled here are verbosity. Resource options (`memory`, `threads`)
//! travel as ordinary tokens so they can trail the command, as in
//! `kmerforge count k=21 reads.fa output db memory 16 threads 8`.

use clap::Parser;

/// A command-driven engine for building, combining and filtering k-mer
/// databases.
///
/// # Examples
///
/// ```bash
/// # Count 21-mers from a FASTA file into a database
/// kmerforge count k=21 reads.fa output reads.db
///
/// # Union of two databases, keeping the larger value
/// kmerforge union-max a.db b.db output merged.db
///
/// # Keep k-mers seen at least 4 times, print them
/// kmerforge value:ge4 reads.db print
///
/// # Intersect three databases, keeping the smallest value
/// kmerforge intersect-min a.db b.db c.db output common.db
/// ```
#[derive(Parser, Debug)]
#[command(name = "kmerforge")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Command tokens building the operation tree
    #[arg(required = true)]
    pub tokens: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// The tracing filter directive implied by the verbosity flags.
    /// `RUST_LOG` overrides this when set.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "kmerforge=error";
        }
        match self.verbose {
            0 => "kmerforge=warn",
            1 => "kmerforge=info",
            2 => "kmerforge=debug",
            _ => "kmerforge=trace",
        }
    }
}
