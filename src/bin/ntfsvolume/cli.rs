use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use ntfsvolume::MountFlags;
use tracing::level_filters::LevelFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Options {
    pub device: PathBuf,
    pub force: bool,
    pub verbosity: Verbosity,
    pub log_level: Option<LevelFilter>,
}

impl Options {
    /// Volumes are always mounted read-only, `--force` adds recovery.
    pub fn mount_flags(&self) -> MountFlags {
        if self.force {
            MountFlags::RDONLY | MountFlags::RECOVER
        } else {
            MountFlags::RDONLY
        }
    }

    pub fn log_filter(&self) -> LevelFilter {
        self.log_level.unwrap_or(match self.verbosity {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::WARN,
            Verbosity::Verbose => LevelFilter::INFO,
        })
    }
}

/// A fully read command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Proceed(Options),
    Help,
    Version,
}

#[derive(Debug)]
pub enum CliError {
    /// Unknown option or malformed value, detected by clap itself.
    Clap(clap::Error),
    MissingDevice,
    MultipleDevices,
    QuietAndVerbose,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clap(err) => {
                // clap renders a whole block, keep its first line only
                let text = err.render().to_string();
                let line = text.lines().next().unwrap_or_default();
                write!(f, "{}", line.strip_prefix("error: ").unwrap_or(line))
            }
            Self::MissingDevice | Self::MultipleDevices => {
                write!(f, "You must specify exactly one device.")
            }
            Self::QuietAndVerbose => write!(
                f,
                "You may not use --quiet and --verbose at the same time."
            ),
        }
    }
}

impl TryFrom<ArgMatches> for Options {
    type Error = CliError;

    fn try_from(args: ArgMatches) -> Result<Self, Self::Error> {
        let devices = args
            .get_many::<PathBuf>("device")
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        let device = match devices.as_slice() {
            [] => return Err(CliError::MissingDevice),
            [device] => (*device).clone(),
            _ => return Err(CliError::MultipleDevices),
        };

        let quiet = args.get_flag("quiet") || args.get_flag("log-quiet");
        let verbose = args.get_flag("verbose") || args.get_flag("log-verbose");

        let verbosity = match (quiet, verbose) {
            (true, true) => return Err(CliError::QuietAndVerbose),
            (true, false) => Verbosity::Quiet,
            (false, true) => Verbosity::Verbose,
            (false, false) => Verbosity::Normal,
        };

        let log_level = if args.get_flag("log-trace") {
            Some(LevelFilter::TRACE)
        } else if args.get_flag("log-debug") {
            Some(LevelFilter::DEBUG)
        } else {
            None
        };

        Ok(Self {
            device,
            force: args.get_flag("force"),
            verbosity,
            log_level,
        })
    }
}

/// Parses the command line.
///
/// # Errors
///
/// Returns the exit status to terminate with, after help, version, or a
/// syntax error followed by the usage has been printed.
pub fn args() -> Result<Options, ExitCode> {
    match parse_from(std::env::args_os()) {
        Ok(Outcome::Proceed(options)) => Ok(options),
        Ok(Outcome::Help) => {
            print!("{}", build().render_long_help());
            Err(ExitCode::SUCCESS)
        }
        Ok(Outcome::Version) => {
            print!("{}", build().render_version());
            Err(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!();
            eprint!("{}", build().render_help());
            Err(ExitCode::FAILURE)
        }
    }
}

/// Reads every argument before deciding: syntax errors beat help and
/// version, which in turn beat device and verbosity checks.
pub fn parse_from<I, T>(itr: I) -> Result<Outcome, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let arguments =
        build().try_get_matches_from(itr).map_err(CliError::Clap)?;

    if arguments.get_flag("help") {
        Ok(Outcome::Help)
    } else if arguments.get_flag("version") {
        Ok(Outcome::Version)
    } else {
        Options::try_from(arguments).map(Outcome::Proceed)
    }
}

fn flag(name: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue)
}

pub fn build() -> Command {
    let device = Arg::new("device")
        .value_name("DEVICE")
        .value_parser(value_parser!(PathBuf))
        .num_args(1..)
        .action(ArgAction::Append)
        .help("device or image file")
        .long_help("Device or image file holding the NTFS volume.");

    let force = flag("force").short('f').help("use less caution").long_help(
        "Use less caution: fall back to $MFTMirr if MFT record 0 is \
         unreadable.",
    );

    let quiet = flag("quiet").short('q').help("less output");
    let verbose = flag("verbose").short('v').help("more output");

    let log_debug = flag("log-debug")
        .hide_short_help(true)
        .help("log debug messages");

    let log_trace = flag("log-trace")
        .hide_short_help(true)
        .help("log trace messages");

    let log_verbose = flag("log-verbose")
        .hide_short_help(true)
        .help("same as --verbose");

    let log_quiet = flag("log-quiet")
        .hide_short_help(true)
        .help("same as --quiet");

    let help = flag("help")
        .short('h')
        .short_alias('?')
        .help("print help")
        .long_help("Print help.");

    let version = flag("version")
        .short('V')
        .hide_short_help(true)
        .long_help("Print version.");

    Command::new("ntfsvolume")
        .about("print volume information")
        .version(crate_version!())
        .override_usage("ntfsvolume [OPTIONS] DEVICE")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .args_override_self(true)
        .arg(device)
        .arg(force)
        .arg(quiet)
        .arg(verbose)
        .arg(log_debug)
        .arg(log_trace)
        .arg(log_verbose)
        .arg(log_quiet)
        .arg(help)
        .arg(version)
}
