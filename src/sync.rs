use std::{
    fs,
    io::{self, Write},
    ops::ControlFlow,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::{
    error::{Error, Result},
    state::{State, Status},
};

/// File name of the synchronization socket inside the instance directory.
pub const SYNC_SOCKET: &str = "run.sock";

/// What the orchestration does in reaction to a reported status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Wait,
    Start,
    Attach(Option<String>),
    Finish,
}

impl SyncAction {
    pub fn for_state(state: &State) -> Self {
        match state.status {
            Status::Creating => Self::Wait,
            Status::Created => Self::Start,
            Status::Running => Self::Attach(state.attach_socket().map(str::to_owned)),
            Status::Stopped => Self::Finish,
        }
    }
}

/// Listening end of the synchronization channel. The socket file is removed
/// when the server is dropped.
#[derive(Debug)]
pub struct SyncServer {
    listener: UnixListener,
    path: PathBuf,
}

impl SyncServer {
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match fs::remove_file(&path) {
            Ok(()) => debug!(path:? = path; "removed stale sync socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Independent handle on the listening socket, for an accept loop
    /// running on another thread.
    pub fn listener(&self) -> Result<UnixListener> {
        Ok(self.listener.try_clone()?)
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path:? = self.path; "failed to remove sync socket: {err}");
            }
        }
    }
}

/// Decodes exactly one state snapshot from a connection.
pub fn receive(stream: &UnixStream) -> Result<State> {
    let mut messages = serde_json::Deserializer::from_reader(stream).into_iter::<State>();

    match messages.next() {
        Some(state) => Ok(state?),
        None => Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a state was sent",
        ))),
    }
}

/// Accepts connections one at a time, decoding one state per connection and
/// handing it to `on_state` in arrival order. Stops when the handler breaks or
/// when accepting or decoding fails, which means the starter went away.
pub fn accept_loop<F>(listener: UnixListener, mut on_state: F)
where
    F: FnMut(State) -> ControlFlow<()>,
{
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                debug!("sync accept loop ended: {err}");
                return;
            }
        };

        let state = match receive(&stream) {
            Ok(state) => state,
            Err(err) => {
                debug!("sync accept loop ended: {err}");
                return;
            }
        };
        drop(stream);

        debug!(id = state.id.as_str(), status = state.status.as_str(); "received state");

        if on_state(state).is_break() {
            return;
        }
    }
}

/// Sends one state snapshot: connect, write, close.
pub fn send_state(path: impl AsRef<Path>, state: &State) -> Result<()> {
    let data = serde_json::to_vec(state)?;

    let mut stream = UnixStream::connect(path)?;
    stream.write_all(&data)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::mpsc, thread};

    use super::*;
    use crate::state::ANNOTATION_ATTACH_SOCKET;

    fn state(status: Status) -> State {
        State {
            oci_version: "1.0.2".to_owned(),
            id: "sync".to_owned(),
            status,
            pid: Some(99),
            bundle_path: "/bundle".to_owned(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn action_table() {
        assert_eq!(SyncAction::for_state(&state(Status::Creating)), SyncAction::Wait);
        assert_eq!(SyncAction::for_state(&state(Status::Created)), SyncAction::Start);
        assert_eq!(SyncAction::for_state(&state(Status::Running)), SyncAction::Attach(None));
        assert_eq!(SyncAction::for_state(&state(Status::Stopped)), SyncAction::Finish);

        let mut running = state(Status::Running);
        running
            .annotations
            .insert(ANNOTATION_ATTACH_SOCKET.to_owned(), "/a.sock".to_owned());
        assert_eq!(
            SyncAction::for_state(&running),
            SyncAction::Attach(Some("/a.sock".to_owned()))
        );
    }

    #[test]
    fn bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SYNC_SOCKET);
        fs::write(&path, b"stale").unwrap();

        let server = SyncServer::bind(&path).unwrap();
        assert_eq!(server.path(), path);
        assert!(path.exists());

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn messages_arrive_in_order_once_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::bind(dir.path().join(SYNC_SOCKET)).unwrap();
        let listener = server.listener().unwrap();

        let (tx, rx) = mpsc::channel();
        let receiver = thread::spawn(move || {
            accept_loop(listener, |state| {
                let done = state.status == Status::Stopped;
                tx.send(state).unwrap();
                if done {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        });

        let mut running = state(Status::Running);
        running
            .annotations
            .insert(ANNOTATION_ATTACH_SOCKET.to_owned(), "/a.sock".to_owned());
        let sent = [state(Status::Created), running, state(Status::Stopped)];
        for state in &sent {
            send_state(server.path(), state).unwrap();
        }

        receiver.join().unwrap();
        let received: Vec<State> = rx.iter().collect();
        assert_eq!(received, sent);
    }

    #[test]
    fn malformed_message_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::bind(dir.path().join(SYNC_SOCKET)).unwrap();
        let listener = server.listener().unwrap();

        let receiver = thread::spawn(move || {
            let mut seen = 0;
            accept_loop(listener, |_| {
                seen += 1;
                ControlFlow::Continue(())
            });
            seen
        });

        let mut stream = UnixStream::connect(server.path()).unwrap();
        stream.write_all(b"{not json").unwrap();
        drop(stream);

        assert_eq!(receiver.join().unwrap(), 0);
    }
}
