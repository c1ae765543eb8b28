//! CLI commands for the userscript runtime.
//!
//! Provides tooling around a script catalog: match, inject, check.

pub mod check;
pub mod inject;
pub mod surfaces;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "userscript-runtime")]
#[command(about = "Decide which userscripts run on a page and what gets injected", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: platform config dir)
    #[arg(long, global = true, env = "USERSCRIPT_RUNTIME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Script catalog directory, overrides the config
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the scripts that apply to a URL, with their state
    Match {
        url: String,
    },

    /// Print the injection instructions for a page load as JSON
    Inject {
        url: String,

        /// Tab the page is loaded in
        #[arg(long, default_value_t = 1)]
        tab: u32,

        /// Frame within the tab, 0 is the top-level document
        #[arg(long, default_value_t = 0)]
        frame: u32,
    },

    /// Validate every pattern and dependency in the catalog
    Check,
}

impl Cli {
    /// Config from `--config`, the default location, or defaults.
    pub fn load_config(&self) -> Config {
        let mut config = match &self.config {
            Some(path) => Config::load_or_default(path),
            None => Config::load(),
        };
        if let Some(dir) = &self.catalog {
            config.catalog.directory = dir.display().to_string();
        }
        config
    }
}

/// Run the parsed command.
pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Commands::Match { url } => inject::run_match(&config, &url).await,
        Commands::Inject { url, tab, frame } => inject::run_inject(&config, &url, tab, frame).await,
        Commands::Check => check::run_check(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inject() {
        let cli = Cli::parse_from([
            "userscript-runtime",
            "inject",
            "https://example.com/",
            "--tab",
            "7",
            "--catalog",
            "/tmp/scripts",
        ]);
        match &cli.command {
            Commands::Inject { url, tab, frame } => {
                assert_eq!(url, "https://example.com/");
                assert_eq!(*tab, 7);
                assert_eq!(*frame, 0);
            }
            _ => panic!("expected inject"),
        }
        assert_eq!(
            cli.load_config().catalog.directory,
            PathBuf::from("/tmp/scripts").display().to_string()
        );
    }

    #[test]
    fn test_check_takes_no_arguments() {
        assert!(Cli::try_parse_from(["userscript-runtime", "check", "extra"]).is_err());
    }
}
