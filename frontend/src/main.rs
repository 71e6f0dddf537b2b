use std::process::ExitCode;
use std::time::Instant;

use octavr_core::prelude::*;

mod cli;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let (opts, arch) = match cli::parse(&args) {
        Ok(cli::Parsed::Help) => {
            print!("{}", cli::usage_text());
            return ExitCode::SUCCESS;
        }
        Ok(cli::Parsed::GraphHelp) => {
            println!("{}", cli::GRAPH_USAGE);
            return ExitCode::SUCCESS;
        }
        Ok(cli::Parsed::Run(opts, arch)) => (*opts, arch),
        Err(leave) => {
            eprint!("{}", cli::usage_text());
            eprintln!("octavr: {}", leave.reason());
            return ExitCode::from(leave.exit_code() as u8);
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if opts.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let runtime = opts.runtime;
    let quiet = opts.quiet;
    let mut sim = Simulator::new(*arch, opts);

    let started = Instant::now();
    let leave = match sim.prepare() {
        Ok(()) => sim.run(),
        Err(leave) => {
            sim.finalize(&leave);
            leave
        }
    };

    if runtime && !quiet {
        let elapsed = started.elapsed();
        eprintln!(
            "octavr: run time: {} ({} instructions, {} cycles)",
            humantime::format_duration(elapsed),
            sim.program.n_insns,
            sim.program.n_cycles
        );
    }

    ExitCode::from(leave.exit_code() as u8)
}
