mod capture;

use anyhow::Result;
use clap::Parser;

use crate::capture::{AppConfig, CliArgs};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = AppConfig::try_from(CliArgs::parse())?;
    let _telemetry = capture::init_telemetry(&config.telemetry, config.verbose);
    capture::run(config)
}
