use std::process::ExitCode;

use clap::Parser;
use rotcp::{cli, config, logging, signals};
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let cfg = match config::Config::from_cli(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            logging::init(cli.debug_level());
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };
    logging::init(cfg.debug);

    let signals = match signals::install() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let mut reactor = match rotcp_core::Reactor::new(cfg.reactor_config()) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to start reactor");
            return ExitCode::FAILURE;
        }
    };

    info!(role = ?cfg.role, local = %cfg.local_addr, remote = %cfg.remote_addr, "starting");

    match reactor.run(&signals.shutdown, &signals.dump) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "reactor loop exited with an error");
            ExitCode::FAILURE
        }
    }
}
