use std::{io, path::PathBuf};

use clap::{Parser, Subcommand};
use log::debug;

use crate::{
    attach::Streams,
    container::{CreateOptions, RunOptions, Runtime, RuntimeConfig, StateOptions},
    starter::DEFAULT_STARTER,
    store::FileStore,
};

#[derive(Debug, Parser)]
#[command(name = "oci", about = "OCI container lifecycle controller")]
pub struct Cli {
    /// Directory holding container instance records
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Path of the starter binary
    #[arg(long, global = true, hide = true, default_value = DEFAULT_STARTER)]
    starter: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a container from an OCI bundle
    Create {
        id: String,

        /// OCI bundle path
        #[arg(short, long)]
        bundle: PathBuf,

        /// Unix socket for state synchronization (internal)
        #[arg(short, long)]
        sync_socket: Option<PathBuf>,

        /// Container log file path
        #[arg(short, long)]
        log_path: Option<PathBuf>,

        /// Set up the container without running its process (eg: pod container)
        #[arg(long)]
        empty_process: bool,
    },
    /// Create, start and attach to a container in a row
    Run {
        id: String,

        /// OCI bundle path
        #[arg(short, long)]
        bundle: PathBuf,

        /// Container log file path
        #[arg(short, long)]
        log_path: Option<PathBuf>,
    },
    /// Start a created container
    Start { id: String },
    /// Send a signal to a container (default SIGTERM)
    Kill {
        id: String,

        signal: Option<String>,

        #[arg(short = 's', long = "signal", conflicts_with = "signal")]
        signal_flag: Option<String>,
    },
    /// Delete a stopped container
    Delete { id: String },
    /// Print the state of a container
    State {
        id: String,

        /// Unix socket for state synchronization (internal)
        #[arg(short, long)]
        sync_socket: Option<PathBuf>,
    },
    /// Attach to a running container
    Attach { id: String },
    /// Execute a process inside a container
    Exec {
        id: String,

        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
}

impl Cli {
    /// Runs the requested operation and returns the process exit status.
    pub fn run(self) -> anyhow::Result<i32> {
        let config = RuntimeConfig {
            root: self.root.unwrap_or_else(FileStore::default_root),
            starter: self.starter,
        };
        debug!(root:? = config.root, starter:? = config.starter; "runtime configuration");

        let runtime = Runtime::new(&config);

        match self.command {
            Command::Create {
                id,
                bundle,
                sync_socket,
                log_path,
                empty_process,
            } => runtime.create(
                &id,
                &CreateOptions {
                    bundle,
                    sync_socket,
                    log_path,
                    empty_process,
                },
            )?,
            Command::Run {
                id,
                bundle,
                log_path,
            } => {
                return Ok(runtime.run(&id, &RunOptions { bundle, log_path }, Streams::stdio())?)
            }
            Command::Start { id } => runtime.start(&id)?,
            Command::Kill {
                id,
                signal,
                signal_flag,
            } => runtime.kill(&id, signal.or(signal_flag).as_deref())?,
            Command::Delete { id } => runtime.delete(&id)?,
            Command::State { id, sync_socket } => {
                runtime.state(&id, &StateOptions { sync_socket }, &mut io::stdout())?
            }
            Command::Attach { id } => return Ok(runtime.attach(&id, Streams::stdio())?),
            Command::Exec { id, args } => runtime.exec(&id, args)?,
        }

        Ok(0)
    }
}
