use std::process::ExitCode;
use clap::Parser;
use log::{error, info, LevelFilter};
use afterburner_link::cli::Cli;
use afterburner_link::error::{AppRunError, ConfigError};
use afterburner_link::{init_logging, run};

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    info!(concat!("Afterburner Link ", env!("CARGO_PKG_VERSION")));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another instance already owns the device link");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
    }
}
