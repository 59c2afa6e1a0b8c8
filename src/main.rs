mod attach;
mod cli;
mod config;
mod container;
mod error;
mod hooks;
mod logging;
mod signal;
mod starter;
mod state;
mod store;
mod sync;

use std::process;

use clap::Parser;
use cli::Cli;
use log::{debug, error};

fn main() {
    if let Err(err) = logging::init() {
        eprintln!("failed to initialize logging: {err:#}");
    }

    debug!(args:? = std::env::args(); "received cli args");

    let cli = Cli::parse();
    match cli.run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{err:#}");
            process::exit(1);
        }
    }
}
