use std::{
    io::Write,
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use oci_spec::runtime::{Hook, Hooks};

use crate::{
    error::{Error, Result},
    state::State,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs every post-stop hook in order. Failures are logged and skipped.
pub fn run_poststop(hooks: Option<&Hooks>, state: &State) {
    let Some(poststop) = hooks.and_then(|hooks| hooks.poststop().as_ref()) else {
        return;
    };

    for hook in poststop {
        if let Err(err) = run_hook(hook, state) {
            warn!(id = state.id.as_str(); "{err}");
        }
    }
}

/// Executes one hook with the container state as JSON on its stdin.
pub fn run_hook(hook: &Hook, state: &State) -> Result<()> {
    let path = hook.path();
    let failed = |reason: String| Error::Hook {
        path: path.display().to_string(),
        reason,
    };

    let mut command = Command::new(path);
    if let Some((argv0, args)) = hook.args().as_deref().and_then(<[String]>::split_first) {
        command.arg0(argv0).args(args);
    }
    command.env_clear();
    for var in hook.env().iter().flatten() {
        match var.split_once('=') {
            Some((key, value)) => {
                command.env(key, value);
            }
            None => warn!(path:? = path; "ignoring hook env entry without '=': {var:?}"),
        }
    }
    command.stdin(Stdio::piped());

    debug!(path:? = path; "running hook");
    let mut child = command.spawn().map_err(|err| failed(err.to_string()))?;

    let state_json = serde_json::to_vec(state)?;
    if let Some(mut stdin) = child.stdin.take() {
        // a hook that ignores its input may exit before reading it
        if let Err(err) = stdin.write_all(&state_json) {
            debug!(path:? = path; "hook did not read state: {err}");
        }
    }

    let deadline = hook
        .timeout()
        .filter(|secs| *secs > 0)
        .map(|secs| Instant::now() + Duration::from_secs(secs.unsigned_abs()));

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(failed("timed out".to_owned()));
        }

        thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
        return Err(failed(format!("exited with {status}")));
    }

    Ok(())
}
