// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use args::{CmdArgs, Parser, Properties};
use daemon::{EXIT_BIND, EXIT_CONFIG, bootstrap};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();
}

fn main() {
    init_logging();
    let args = CmdArgs::parse();
    let props = match Properties::from_args(args) {
        Ok(props) => props,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };
    info!(port = props.port, fanout = props.fanout, "starting latticed");

    let daemon = match bootstrap(props) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!(%err, "failed to start");
            std::process::exit(EXIT_BIND);
        }
    };

    let gate = daemon.gate.clone();
    if let Err(err) = ctrlc::set_handler(move || gate.notify(0)) {
        error!(%err, "failed to install the signal handler");
    }

    let code = daemon.gate.wait();
    daemon.shutdown();
    info!(code, "latticed exiting");
    std::process::exit(code);
}
