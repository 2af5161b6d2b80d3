//! Command-line interface definitions for redo.
//!
//! The same arguments are accepted under every tool name (`redo`,
//! `redo-ifchange`, `redo-ifcreate`); the name decides what they mean.

use clap::{ArgAction, Parser};

/// Lowest accepted `--jobs` value.
pub const MIN_JOBS: usize = 1;
/// Highest accepted `--jobs` value.
pub const MAX_JOBS: usize = 1000;

/// Incremental build tool driven by `.do` shell scripts.
#[derive(Parser, Debug)]
#[command(name = "redo", version, about)]
pub struct Cli {
    /// Maximum number of recipes running at once across the whole build.
    #[arg(long, short = 'j', default_value_t = 1)]
    pub jobs: usize,

    /// Print dependency checks (repeat for do-file probes and more).
    #[arg(long, short = 'd', action = ArgAction::Count)]
    pub debug: u8,

    /// Echo recipe lines as they run and report timings.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Build the named targets in random order.
    #[arg(long)]
    pub shuffle: bool,

    /// Targets to build; `redo` alone builds `all`.
    pub targets: Vec<String>,
}

impl Cli {
    /// Whether `--jobs` is within the accepted range.
    pub fn jobs_valid(&self) -> bool {
        (MIN_JOBS..=MAX_JOBS).contains(&self.jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_targets() {
        let cli = Cli::parse_from(["redo", "-j4", "-dd", "-v", "--shuffle", "a", "b/c"]);
        assert_eq!(cli.jobs, 4);
        assert_eq!(cli.debug, 2);
        assert!(cli.verbose);
        assert!(cli.shuffle);
        assert_eq!(cli.targets, ["a", "b/c"]);
        assert!(cli.jobs_valid());
    }

    #[test]
    fn jobs_range() {
        assert!(Cli::parse_from(["redo"]).jobs_valid());
        assert!(!Cli::parse_from(["redo", "-j0"]).jobs_valid());
        assert!(Cli::parse_from(["redo", "-j1000"]).jobs_valid());
        assert!(!Cli::parse_from(["redo", "-j1001"]).jobs_valid());
    }
}
