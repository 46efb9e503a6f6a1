use anyhow::Result;
use clap::Parser;

use blockproc::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run()
}
