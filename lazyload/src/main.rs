use clap::{ArgAction, Parser};
use lazyload::{Config, LoaderError};
use log::LevelFilter;
use std::{ffi::OsString, path::PathBuf, process::ExitCode};

/// Runs a statically-linked executable, loading its pages on first access.
#[derive(Parser, Debug)]
#[command(name = "lazyload", version, about)]
struct Cli {
    /// More output (-v: info, -vv: debug, -vvv: trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// No output from the loader at all.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Size of the program's initial stack, in bytes.
    #[arg(long)]
    stack_size: Option<usize>,

    /// Do not reserve the address ranges of the segments up front.
    #[arg(long, default_value_t = false)]
    no_reserve: bool,

    /// The executable to run.
    program: PathBuf,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

impl Cli {
    fn config(&self) -> Config {
        let mut builder = Config::builder().env_log_level();
        if self.quiet {
            builder = builder.log_level(LevelFilter::Off);
        } else if self.verbose > 0 {
            builder = builder.log_level(match self.verbose {
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            });
        }
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.reserve_segments(!self.no_reserve).build()
    }
}

fn run(cli: Cli) -> Result<(), LoaderError> {
    lazyload::initialize_with(cli.config())?;
    let mut argv = Vec::with_capacity(cli.args.len() + 1);
    argv.push(cli.program.clone().into_os_string());
    argv.extend(cli.args);
    match lazyload::execute(&cli.program, &argv)? {}
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
