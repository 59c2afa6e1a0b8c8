use std::{
    fs::File,
    io::{self, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::process::CommandExt,
    },
    path::PathBuf,
    process::Command,
};

use log::debug;
use nix::{
    fcntl::{self, FcntlArg, FdFlag, OFlag},
    unistd,
};

use crate::error::{Error, Result};

/// Default installation path of the starter binary.
pub const DEFAULT_STARTER: &str = "/usr/local/libexec/ocictl/bin/starter";

/// File descriptor the starter reads its configuration from.
pub const CONFIG_FD: RawFd = 3;

/// One starter invocation.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Process label, passed as argv[0].
    pub label: String,
    /// Complete environment of the starter.
    pub env: Vec<(String, String)>,
    /// Serialized configuration blob.
    pub config: Vec<u8>,
    pub cwd: Option<PathBuf>,
}

pub trait Launcher: Send + Sync {
    /// Runs the starter and waits for it to return.
    fn launch(&self, launch: Launch) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Starter {
    path: PathBuf,
}

impl Starter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Launcher for Starter {
    fn launch(&self, launch: Launch) -> Result<()> {
        let (pipe_read, pipe_write) = unistd::pipe2(OFlag::O_CLOEXEC)?;
        let read_fd = pipe_read.as_raw_fd();

        let mut command = Command::new(&self.path);
        command.arg0(&launch.label).env_clear().envs(launch.env);
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        // dup2 only touches the child's descriptor table
        unsafe {
            command.pre_exec(move || {
                if read_fd == CONFIG_FD {
                    fcntl::fcntl(read_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                } else {
                    unistd::dup2(read_fd, CONFIG_FD)?;
                }
                Ok(())
            });
        }

        debug!(starter:? = self.path, label = launch.label.as_str(); "launching starter");
        let mut child = command
            .spawn()
            .map_err(|err| Error::Starter(format!("{}: {err}", self.path.display())))?;
        drop(pipe_read);

        let mut pipe = File::from(pipe_write);
        let written = pipe.write_all(&launch.config).and_then(|_| pipe.flush());
        drop(pipe);

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Starter(format!(
                "{} exited with {status}",
                self.path.display()
            )));
        }

        written.map_err(|err: io::Error| Error::Starter(format!("sending configuration: {err}")))
    }
}
