//! `userscript-runtime` command line.

use clap::Parser;

use userscript_runtime::cli::{self, Cli};
use userscript_runtime::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config();
    logging::init(&config.logging.filter);

    cli::run(cli, config).await
}
