use std::{
    fs,
    io::Write,
    ops::ControlFlow,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, SyncSender},
        Arc,
    },
    thread,
};

use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use crate::{
    attach::{AttachSession, Mode, Streams},
    config::{CommonConfig, OciEngineConfig, OCI_ENGINE},
    error::{Error, Result},
    hooks, logging,
    signal::{self, ProcessSignaller, Signaller, DEFAULT_KILL_SIGNAL},
    starter::{Launch, Launcher, Starter},
    state::{State, Status},
    store::{self, FileStore, InstanceStore},
    sync::{self, SyncAction, SyncServer, SYNC_SOCKET},
};

/// Settings shared by every operation of one invocation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding one instance directory per container.
    pub root: PathBuf,
    pub starter: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub bundle: PathBuf,
    /// Socket the starter reports state transitions to.
    pub sync_socket: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    /// Set up the container without executing its process.
    pub empty_process: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub bundle: PathBuf,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    /// Send the state over this socket instead of printing it.
    pub sync_socket: Option<PathBuf>,
}

/// Drives container lifecycles. The starter does the actual process setup;
/// the runtime validates transitions, launches it and follows its reports.
#[derive(Clone)]
pub struct Runtime {
    store: Arc<dyn InstanceStore>,
    launcher: Arc<dyn Launcher>,
    signaller: Arc<dyn Signaller>,
}

impl Runtime {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_parts(
            Arc::new(FileStore::new(&config.root)),
            Arc::new(Starter::new(&config.starter)),
            Arc::new(ProcessSignaller),
        )
    }

    pub fn with_parts(
        store: Arc<dyn InstanceStore>,
        launcher: Arc<dyn Launcher>,
        signaller: Arc<dyn Signaller>,
    ) -> Self {
        Self {
            store,
            launcher,
            signaller,
        }
    }

    pub fn create(&self, id: &str, options: &CreateOptions) -> Result<()> {
        store::validate_id(id)?;
        if self.store.exists(id) {
            return Err(Error::AlreadyExists(id.to_owned()));
        }

        let bundle = options.bundle.canonicalize().map_err(|err| {
            Error::Config(format!(
                "failed to determine bundle absolute path {}: {err}",
                options.bundle.display()
            ))
        })?;
        let config_path = bundle.join("config.json");
        let spec = Spec::load(&config_path).map_err(|err| {
            Error::Config(format!("failed to load {}: {err}", config_path.display()))
        })?;

        let state = State {
            oci_version: spec.version().to_owned(),
            id: id.to_owned(),
            status: Status::Creating,
            pid: None,
            bundle_path: bundle.display().to_string(),
            annotations: spec.annotations().clone().unwrap_or_default(),
        };
        let record = CommonConfig::oci(
            id,
            OciEngineConfig {
                state,
                oci_config: spec,
                sync_socket: path_string(options.sync_socket.as_deref()),
                log_path: path_string(options.log_path.as_deref()),
                empty_process: options.empty_process,
                exec: false,
            },
        );

        self.store.save(id, &record)?;
        info!(id = id, bundle:? = bundle; "creating container");

        if let Err(err) = self.launch(&record, Some(bundle)) {
            if let Err(cleanup) = self.store.delete(id) {
                warn!(id = id; "failed to remove record of failed container: {cleanup}");
            }
            return Err(err);
        }

        Ok(())
    }

    pub fn start(&self, id: &str) -> Result<()> {
        let record = self.store.load(id)?;
        let state = record.state();

        if !state.status.can_start() {
            return Err(invalid_state(state, "created"));
        }

        self.signaller.deliver(pid(state)?, Signal::SIGCONT)
    }

    /// Sends `signal` (SIGTERM when `None`) to the container process.
    pub fn kill(&self, id: &str, signal_name: Option<&str>) -> Result<()> {
        let record = self.store.load(id)?;
        let state = record.state();

        if !state.status.can_kill() {
            return Err(invalid_state(state, "created or running"));
        }

        let signal = match signal_name {
            Some(name) => signal::convert(name)?,
            None => DEFAULT_KILL_SIGNAL,
        };

        self.signaller.deliver(pid(state)?, signal)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let record = self.store.load(id)?;
        let config = record.oci_config();

        if !config.state.status.can_delete() {
            return Err(invalid_state(&config.state, "stopped"));
        }

        hooks::run_poststop(config.oci_config.hooks().as_ref(), &config.state);

        self.store.delete(id)
    }

    pub fn state(&self, id: &str, options: &StateOptions, out: &mut dyn Write) -> Result<()> {
        let record = self.store.load(id)?;
        let state = record.state();

        if let Some(socket) = &options.sync_socket {
            return sync::send_state(socket, state);
        }

        let mut serializer =
            serde_json::Serializer::with_formatter(&mut *out, PrettyFormatter::with_indent(b"\t"));
        state.serialize(&mut serializer)?;
        writeln!(out)?;

        Ok(())
    }

    /// Attaches to a running container. Returns the exit status the caller
    /// should terminate with.
    pub fn attach(&self, id: &str, streams: Streams) -> Result<i32> {
        let record = self.store.load(id)?;
        let state = record.state();

        let attach_socket = state.attach_socket().ok_or(Error::AttachUnavailable {
            what: "attach socket",
            status: state.status,
        })?;

        self.session(&record, attach_socket)?.run(streams)?;

        Ok(self.conclude(id))
    }

    /// Creates, starts and attaches in one go, then removes the container
    /// once it stopped. Returns the container's exit code.
    pub fn run(&self, id: &str, options: &RunOptions, streams: Streams) -> Result<i32> {
        store::validate_id(id)?;
        if self.store.exists(id) {
            return Err(Error::AlreadyExists(id.to_owned()));
        }

        let dir = self.store.instance_dir(id)?;
        fs::create_dir_all(&dir)?;
        let server = SyncServer::bind(dir.join(SYNC_SOCKET))?;

        let created = self.create(
            id,
            &CreateOptions {
                bundle: options.bundle.clone(),
                sync_socket: Some(server.path().to_owned()),
                log_path: options.log_path.clone(),
                empty_process: false,
            },
        );
        if let Err(err) = created {
            drop(server);
            let _ = fs::remove_dir(&dir);
            return Err(err);
        }

        let (attach_tx, attach_rx) = mpsc::sync_channel(1);
        let listener = server.listener()?;
        let observer = {
            let runtime = self.clone();
            let id = id.to_owned();
            thread::Builder::new()
                .name("sync-accept".to_owned())
                .spawn(move || runtime.observe(&id, listener, attach_tx))?
        };

        let attach_socket = match attach_rx.recv() {
            Ok(Some(socket)) => socket,
            Ok(None) => {
                return Err(Error::AttachUnavailable {
                    what: "attach socket",
                    status: Status::Running,
                })
            }
            Err(_) => {
                let _ = observer.join();
                self.conclude(id);
                return Err(Error::Starter(
                    "container stopped before it was running".to_owned(),
                ));
            }
        };

        let record = self.store.load(id)?;
        self.session(&record, &attach_socket)?.run(streams)?;

        // the starter reports `stopped` once the container process is gone
        if observer.join().is_err() {
            error!(id = id; "sync accept loop panicked");
        }

        Ok(self.conclude(id))
    }

    /// Relaunches the starter to execute `args` inside an existing container.
    pub fn exec(&self, id: &str, args: Vec<String>) -> Result<()> {
        let mut record = self.store.load(id)?;
        record.oci_config_mut().set_exec_args(args);

        self.launch(&record, None)
    }

    fn launch(&self, record: &CommonConfig, cwd: Option<PathBuf>) -> Result<()> {
        let config = serde_json::to_vec(record)?;
        debug!(
            id = record.container_id.as_str(),
            engine = record.engine_name();
            "launching starter"
        );

        self.launcher.launch(Launch {
            label: format!("OCI {}", record.container_id),
            env: vec![
                logging::env_pair(),
                ("SRUNTIME".to_owned(), OCI_ENGINE.to_owned()),
            ],
            config,
            cwd,
        })
    }

    fn session(&self, record: &CommonConfig, attach_socket: &str) -> Result<AttachSession> {
        let config = record.oci_config();
        let state = &config.state;

        let mode = if config.has_terminal() {
            let control_socket = state.control_socket().ok_or(Error::AttachUnavailable {
                what: "control socket",
                status: state.status,
            })?;
            Mode::Terminal {
                control_socket: control_socket.into(),
            }
        } else {
            Mode::Forward {
                pid: pid(state)?,
                signaller: self.signaller.clone(),
            }
        };

        Ok(AttachSession::new(attach_socket, mode))
    }

    /// Follows the starter's reports for `id` until it reports `stopped` or
    /// goes away. The attach socket of the first `running` report is handed
    /// to `attach_tx`.
    fn observe(&self, id: &str, listener: UnixListener, attach_tx: SyncSender<Option<String>>) {
        sync::accept_loop(listener, |snapshot| {
            let state = match self.record_transition(id, &snapshot) {
                Ok(Some(state)) => state,
                Ok(None) => return ControlFlow::Continue(()),
                Err(err) => {
                    warn!(id = id; "failed to record reported state: {err}");
                    return ControlFlow::Continue(());
                }
            };

            match SyncAction::for_state(&state) {
                SyncAction::Wait => ControlFlow::Continue(()),
                SyncAction::Start => match self.start(id) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        error!(id = id; "failed to start container: {err}");
                        ControlFlow::Break(())
                    }
                },
                SyncAction::Attach(socket) => {
                    // only the first report is waited on
                    let _ = attach_tx.try_send(socket);
                    ControlFlow::Continue(())
                }
                SyncAction::Finish => ControlFlow::Break(()),
            }
        });
    }

    /// Persists a reported snapshot. Returns `None` for reports that would
    /// move the container backwards.
    fn record_transition(&self, id: &str, snapshot: &State) -> Result<Option<State>> {
        let mut record = self.store.load(id)?;
        let state = &mut record.oci_config_mut().state;

        if !state.advance(snapshot) {
            warn!(id = id; "ignoring {} report for {} container", snapshot.status, state.status);
            return Ok(None);
        }

        let state = state.clone();
        self.store.save(id, &record)?;
        debug!(id = id, status = state.status.as_str(); "recorded transition");

        Ok(Some(state))
    }

    /// Reads the exit code and removes a stopped container after its session
    /// ended. A container that is still alive keeps its record.
    fn conclude(&self, id: &str) -> i32 {
        let record = match self.store.load(id) {
            Ok(record) => record,
            Err(err) => {
                error!(id = id; "{err}");
                return 1;
            }
        };
        let state = record.state();
        let code = state.exit_code();

        if state.status.can_delete() {
            if let Err(err) = self.delete(id) {
                error!(id = id; "{err}");
            }
        } else {
            warn!(id = id; "container is {}, keeping its record", state.status);
        }

        code
    }
}

fn pid(state: &State) -> Result<i32> {
    state.pid.ok_or_else(|| Error::MissingPid(state.id.clone()))
}

fn invalid_state(state: &State, expected: &'static str) -> Error {
    Error::InvalidState {
        id: state.id.clone(),
        actual: state.status,
        expected,
    }
}

fn path_string(path: Option<&Path>) -> String {
    path.map(|path| path.display().to_string())
        .unwrap_or_default()
}
