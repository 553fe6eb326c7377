//! # kmerforge
//!
//! A command-driven engine for building, combining and filtering k-mer
//! databases. A command line declaratively builds a tree of operations over
//! k-mer databases and raw sequence files; the engine evaluates the tree
//! and produces new databases, histograms, statistics, or textual dumps.
//!
//! The pipeline, in order:
//!
//! - [`builder`] turns the token stream into a tree of [`template`] nodes,
//!   collecting every parse and validation problem instead of bailing on
//!   the first;
//! - [`counting`] builds fresh databases from raw sequence, one sorted
//!   prefix shard at a time;
//! - [`run`] clones the tree into per-shard [`compute`] twins and walks 64
//!   shards in parallel, each twin merging its sorted inputs in lockstep,
//!   applying the [`filter`] expression and [`modify`] recipes, and feeding
//!   the [`output`] sinks.
//!
//! ```bash
//! # Count 21-mers, then keep those seen at least twice
//! kmerforge count k=21 reads.fa output all.db
//! kmerforge at-least 2 all.db output solid.db
//! ```

pub mod builder;
pub mod cli;
pub mod compute;
pub mod counting;
pub mod database;
pub mod error;
pub mod filter;
pub mod histogram;
pub mod input;
pub mod kmer;
pub mod modify;
pub mod output;
pub mod run;
pub mod sequence;
pub mod template;

pub use builder::{CommandBuilder, CommandPlan};
pub use database::Database;
pub use error::{CommandErrors, EngineError};
pub use kmer::{Kmer, KmerLabel, KmerLength, KmerValue, Record};
pub use run::{execute, run_command};
