/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::{Config, PipelineConfig};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the tools, then capture and replay traffic for every connection count
    Run(RunArgs),

    /// Write an example replaybench.toml to the current directory
    Init,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Repository of the record/replay tool
    #[arg(long, default_value = "https://github.com/mongodb/mongo-tools")]
    pub repo: String,

    /// Branch, tag or commit of the record/replay tool to build
    #[arg(long, default_value = "master")]
    pub checkout: String,

    /// Target database host
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Target database port
    #[arg(short, long, default_value_t = 27017)]
    pub port: u16,

    /// Comma separated connection counts to sweep, e.g. 10,20,50
    #[arg(short, long, value_parser = parse_connections, default_value = "10,20,50,100")]
    pub connections: ConnectionList,

    /// Network interface to capture on
    #[arg(short, long, default_value = "lo")]
    pub interface: String,

    /// Ask the replay tool for a profiling report
    #[arg(long)]
    pub profile: bool,

    /// Rebuild the tools and rerun every stage
    #[arg(short, long)]
    pub force: bool,

    /// Print which stages would run without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding the tool checkouts, captures, traces and logs
    #[arg(short, long, default_value = ".")]
    pub work_dir: PathBuf,

    /// Path to a replaybench.toml (defaults to ./replaybench.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
impl RunArgs {
    pub fn into_pipeline_config(self) -> anyhow::Result<PipelineConfig> {
        let settings = Config::load(self.config.as_deref())?;
        let config = PipelineConfig {
            repository: self.repo,
            revision: self.checkout,
            host: self.host,
            port: self.port,
            connections: self.connections.0,
            interface: self.interface,
            profile: self.profile,
            force: self.force,
            dry_run: self.dry_run,
            work_dir: self.work_dir,
            settings,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionList(pub Vec<u32>);

/// Parses `10,20,50`. Every entry must be a distinct positive integer.
pub fn parse_connections(s: &str) -> Result<ConnectionList, String> {
    let connections = s
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return Err(format!("empty connection count in '{}'", s));
            }
            match entry.parse::<u32>() {
                Ok(0) => Err("connection counts must be positive".to_string()),
                Ok(n) => Ok(n),
                Err(_) => Err(format!("'{}' is not a valid connection count", entry)),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(dup) = connections.iter().duplicates().next() {
        return Err(format!("connection count {} is listed more than once", dup));
    }

    Ok(ConnectionList(connections))
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_connection_list() {
        assert_eq!(parse_connections("10,20,50"), Ok(ConnectionList(vec![10, 20, 50])));
        assert_eq!(parse_connections(" 10 , 20 "), Ok(ConnectionList(vec![10, 20])));
    }

    #[test]
    fn rejects_malformed_connection_lists() {
        assert!(parse_connections("").is_err());
        assert!(parse_connections("10,,20").is_err());
        assert!(parse_connections("10,").is_err());
        assert!(parse_connections("ten").is_err());
        assert!(parse_connections("-5").is_err());
        assert!(parse_connections("0").is_err());
        assert!(parse_connections("10,20,10").is_err());
    }

    #[test]
    fn run_flags_are_parsed() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "replaybench",
            "run",
            "--repo",
            "https://github.com/someone/mongo-tools",
            "--checkout",
            "r3.6.0",
            "--connections",
            "10,20",
            "--port",
            "27018",
            "--profile",
            "--force",
        ])?;
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.connections, ConnectionList(vec![10, 20]));
                assert_eq!(run.checkout, "r3.6.0");
                assert_eq!(run.port, 27018);
                assert!(run.profile && run.force && !run.dry_run);
            }
            other => panic!("expected run, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn empty_connection_entry_fails_argument_parsing() {
        let res = Args::try_parse_from(["replaybench", "run", "--connections", "10,,20"]);
        assert!(res.is_err());
    }

    #[test]
    fn defaults_are_applied() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["replaybench", "-v", "run"])?;
        assert!(args.verbose);
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.connections, ConnectionList(vec![10, 20, 50, 100]));
                assert_eq!(run.interface, "lo");
                assert_eq!(run.port, 27017);
            }
            other => panic!("expected run, got {:?}", other),
        }
        Ok(())
    }
}
