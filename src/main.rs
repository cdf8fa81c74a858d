use std::process::ExitCode;

use clap::Parser;
use slidefe::{cli, logger};

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();

    // Initialize session log (overwrites previous session log)
    match &args.log_file {
        Some(path) => {
            if let Err(e) = logger::init_at(path, args.verbose) {
                eprintln!("warning: could not open log file '{}': {}", path.display(), e);
            }
        }
        None => logger::init(args.verbose),
    }

    cli::run(args)
}
