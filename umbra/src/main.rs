//! The simulator binary.

use anyhow::Result;
use clap::Parser as _;
use umbra::{cli::Cli, controller};

fn main() -> Result<()> {
    let cli = Cli::parse();

    controller::run(&cli)
}
