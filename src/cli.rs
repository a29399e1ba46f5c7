use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::pipeline::dispatch::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "ado-trigger")]
#[command(about = "Trigger GitHub Actions test runs for Azure DevOps board items", version)]
#[command(after_help = "EXAMPLES:
    ado-trigger                       Poll the board column until stopped
    ado-trigger cycle                 Run a single cycle and exit
    ado-trigger inspect 4821          Show what would be dispatched for an item
    ado-trigger runs --limit 5        Show recent workflow runs")]
pub struct Cli {
    /// Config file (default: ~/.ado-trigger/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Poll the board column and dispatch workflows (default)
    Monitor,
    /// Run one cycle, persist and exit
    Cycle,
    /// List the work items currently in the target column
    Items,
    /// Show the customer, branch and markers resolved for a work item
    Inspect {
        /// Work item id
        id: u64,
    },
    /// List recent workflow runs
    Runs {
        /// Number of runs to show
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=100))]
        limit: u8,
    },
    /// Answer JSON tool calls on stdin/stdout
    Serve,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Monitor)
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn handle_items(dispatcher: &Dispatcher) -> Result<()> {
    let items = dispatcher.column_items().await?;
    print_json(&items)
}

#[derive(Serialize)]
struct Inspection<'a> {
    id: u64,
    title: &'a str,
    eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ineligible_reason: Option<String>,
    #[serde(flatten)]
    extraction: crate::extract::Extraction,
}

pub async fn handle_inspect(dispatcher: &Dispatcher, id: u64) -> Result<()> {
    let item = dispatcher.fetch_item(id).await?;
    let reason = dispatcher.ineligible_reason(&item);
    print_json(&Inspection {
        id: item.id,
        title: &item.title,
        eligible: reason.is_none(),
        ineligible_reason: reason,
        extraction: dispatcher.inspect(&item),
    })
}

pub async fn handle_runs(dispatcher: &Dispatcher, limit: u8) -> Result<()> {
    let runs = dispatcher.recent_runs(limit).await?;
    print_json(&runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ado-trigger").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn no_subcommand_means_monitor() {
        let cli = parse(&[]);
        assert_eq!(cli.command(), Commands::Monitor);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn config_flag_is_global() {
        let cli = parse(&["cycle", "--config", "/tmp/c.toml"]);
        assert_eq!(cli.command(), Commands::Cycle);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn inspect_takes_an_id() {
        assert_eq!(parse(&["inspect", "4821"]).command(), Commands::Inspect { id: 4821 });
        assert!(Cli::try_parse_from(["ado-trigger", "inspect", "abc"]).is_err());
    }

    #[test]
    fn runs_limit_defaults_and_is_bounded() {
        assert_eq!(parse(&["runs"]).command(), Commands::Runs { limit: 10 });
        assert_eq!(
            parse(&["runs", "--limit", "3"]).command(),
            Commands::Runs { limit: 3 }
        );
        assert!(Cli::try_parse_from(["ado-trigger", "runs", "--limit", "0"]).is_err());
    }
}
