#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery, clippy::cargo)]

mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use cli::Options;
use ntfsvolume::{report, Volume};

fn main() -> ExitCode {
    let options = match cli::args() {
        Ok(options) => options,
        Err(code) => return code,
    };

    init_logging(&options);

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to **STDERR**, `RUST_LOG` directives override the level chosen
/// on the command line.
fn init_logging(options: &Options) {
    let filter = EnvFilter::builder()
        .with_default_directive(options.log_filter().into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Mounts the device, prints its geometry report and unmounts it again,
/// also when deriving the report fails.
fn run(options: &Options) -> Result<()> {
    let volume = Volume::mount(&options.device, options.mount_flags())
        .with_context(|| format!("mounting {}", options.device.display()))?;

    let report = ntfsvolume::derive(&volume.geometry()).with_context(|| {
        format!("deriving geometry of {}", volume.device().display())
    })?;

    let text = report::to_text(&report)
        .with_context(|| "converting geometry report to text")?;

    print!("{text}");

    Ok(())
}
