//! Command-line interface for `harvest`, built on clap.
//!
//! Subcommands cover the session lifecycle (start, resume, status, validate,
//! requeue) and housekeeping (sessions, cleanup). Global flags select the
//! config file, worker count and verbosity.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resumable, rate-aware collector of research paper metadata.
#[derive(Debug, Parser)]
#[command(name = "harvest", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML config file (defaults to ./harvest.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the number of concurrent workers.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new collection session over sources × domains × years.
    Start {
        /// Source to query (repeatable).
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        /// Research domain used as the search terms (repeatable).
        #[arg(long = "domain", required = true)]
        domains: Vec<String>,

        /// Inclusive year range such as 2015-2020, or a single year.
        #[arg(long, value_parser = parse_years)]
        years: Option<YearRange>,
    },

    /// Validate an interrupted session and continue it.
    Resume { session_id: String },

    /// Show unit counts and source health for a session.
    Status { session_id: String },

    /// Run recovery validation only and print recommendations.
    Validate { session_id: String },

    /// Put every failed unit of a session back in the queue.
    Requeue { session_id: String },

    /// List stored sessions, newest first.
    Sessions,

    /// Delete old sessions according to the retention policy.
    Cleanup {
        /// Remove sessions not updated for this many days.
        #[arg(long)]
        max_age_days: Option<u32>,

        /// Always keep this many of the newest sessions.
        #[arg(long)]
        keep_last: Option<usize>,

        /// Also remove paused and interrupted sessions.
        #[arg(long, default_value_t = false)]
        include_incomplete: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearRange {
    pub from: u16,
    pub to: u16,
}

impl YearRange {
    pub fn years(&self) -> Vec<u16> {
        (self.from..=self.to).collect()
    }
}

fn parse_years(raw: &str) -> Result<YearRange, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid year '{s}'"))
    };
    let range = match raw.split_once('-') {
        Some((from, to)) => YearRange {
            from: parse(from)?,
            to: parse(to)?,
        },
        None => {
            let year = parse(raw)?;
            YearRange { from: year, to: year }
        }
    };
    if range.from > range.to {
        return Err(format!("year range {raw} is reversed"));
    }
    Ok(range)
}
