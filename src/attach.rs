//! Interactive sessions against a running container's I/O multiplexer.
//!
//! Bytes are relayed between the local standard streams and the attach
//! socket. When the container owns a pseudo-terminal, the local terminal is
//! put in raw mode and window size changes are pushed over the control
//! socket; otherwise every signal received by this process is forwarded to
//! the container.

use std::{
    io::{self, Read, Write},
    net::Shutdown,
    os::{
        fd::{AsFd, AsRawFd, OwnedFd},
        unix::net::UnixStream,
    },
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use log::{debug, error, warn};
use nix::{
    libc,
    sys::termios::{self, SetArg, Termios},
};
use serde::{Deserialize, Serialize};
use signal_hook::{consts::SIGWINCH, iterator::Signals};

use crate::{
    error::{Error, Result},
    signal::{self, Signaller},
};

nix::ioctl_read_bad!(get_window_size, libc::TIOCGWINSZ, libc::winsize);

/// Pseudo-terminal window size, the only payload of the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSize {
    pub height: u32,
    pub width: u32,
}

impl ConsoleSize {
    pub fn of<Fd: AsFd>(fd: Fd) -> Result<Self> {
        let mut size = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { get_window_size(fd.as_fd().as_raw_fd(), &mut size) }?;

        Ok(Self {
            height: size.ws_row.into(),
            width: size.ws_col.into(),
        })
    }

    /// One row and one column larger than `self`.
    pub fn oversized(self) -> Self {
        Self {
            height: self.height + 1,
            width: self.width + 1,
        }
    }
}

/// Sends one resize request over a fresh control connection.
pub fn send_resize(control_socket: &Path, size: ConsoleSize) -> Result<()> {
    let mut stream = UnixStream::connect(control_socket)?;
    serde_json::to_writer(&mut stream, &size)?;
    stream.write_all(b"\n")?;
    Ok(())
}

fn resize(control_socket: &Path, size: ConsoleSize) {
    if let Err(err) = send_resize(control_socket, size) {
        error!(socket:? = control_socket; "terminal resize failed: {err}");
    }
}

/// Pushes the initial window size. Terminal emulators drop a resize equal to
/// the size they already hold, so an oversized request goes first and the
/// true size second.
pub fn announce_size(control_socket: &Path, size: ConsoleSize) {
    resize(control_socket, size.oversized());
    resize(control_socket, size);
}

fn resize_from(terminal: &OwnedFd, control_socket: &Path) {
    match ConsoleSize::of(terminal) {
        Ok(size) => resize(control_socket, size),
        Err(err) => error!("terminal resize error: {err}"),
    }
}

/// Keeps a terminal in raw mode until dropped.
pub struct RawModeGuard {
    terminal: OwnedFd,
    original: Termios,
}

impl RawModeGuard {
    pub fn new(terminal: OwnedFd) -> Result<Self> {
        let original = termios::tcgetattr(&terminal)?;

        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&terminal, SetArg::TCSANOW, &raw)?;

        Ok(Self { terminal, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = termios::tcsetattr(&self.terminal, SetArg::TCSANOW, &self.original) {
            warn!("failed to restore terminal: {err}");
        }
    }
}

/// Local ends of an attach session.
pub struct Streams {
    pub input: Box<dyn Read + Send>,
    pub output: Box<dyn Write + Send>,
    /// Terminal put in raw mode and measured for resizes in terminal mode.
    pub terminal: Option<OwnedFd>,
}

impl Streams {
    pub fn stdio() -> Self {
        Self {
            input: Box::new(io::stdin()),
            output: Box::new(io::stdout()),
            terminal: io::stdin().as_fd().try_clone_to_owned().ok(),
        }
    }
}

pub enum Mode {
    Terminal { control_socket: PathBuf },
    Forward { pid: i32, signaller: Arc<dyn Signaller> },
}

pub struct AttachSession {
    attach_socket: PathBuf,
    mode: Mode,
}

impl AttachSession {
    pub fn new(attach_socket: impl Into<PathBuf>, mode: Mode) -> Self {
        Self {
            attach_socket: attach_socket.into(),
            mode,
        }
    }

    /// Relays until the container side of the attach socket closes.
    pub fn run(self, mut streams: Streams) -> Result<()> {
        let socket = UnixStream::connect(&self.attach_socket)?;
        debug!(socket:? = self.attach_socket; "attached");

        match self.mode {
            Mode::Terminal { control_socket } => {
                let raw_mode = match streams.terminal.take() {
                    Some(terminal) => {
                        let raw_mode = terminal
                            .try_clone()
                            .map_err(Error::from)
                            .and_then(RawModeGuard::new)
                            .inspect_err(|err| warn!("failed to set terminal raw mode: {err}"))
                            .ok();

                        // registered first so no change after the announce is missed
                        watch_window_size(terminal.try_clone()?, control_socket.clone())?;
                        match ConsoleSize::of(&terminal) {
                            Ok(size) => announce_size(&control_socket, size),
                            Err(err) => error!("terminal resize error: {err}"),
                        }

                        raw_mode
                    }
                    None => {
                        warn!("no local terminal, leaving input as is");
                        None
                    }
                };

                let mut output = relay(socket, streams)?;
                output.write_all(b"\r")?;
                output.flush()?;

                drop(raw_mode);
                Ok(())
            }
            Mode::Forward { pid, signaller } => {
                // never joined, it lives as long as the process
                let _forwarder = signal::forward_all(pid, signaller)?;

                relay(socket, streams)?;
                Ok(())
            }
        }
    }
}

fn watch_window_size(terminal: OwnedFd, control_socket: PathBuf) -> Result<()> {
    let mut signals = Signals::new([SIGWINCH])?;

    thread::Builder::new()
        .name("attach-resize".to_owned())
        .spawn(move || {
            for _ in signals.forever() {
                resize_from(&terminal, &control_socket);
            }
        })?;

    Ok(())
}

/// Copies socket to output and input to socket concurrently. Returns once the
/// socket reaches end of stream; the input direction is left running.
fn relay(socket: UnixStream, streams: Streams) -> Result<Box<dyn Write + Send>> {
    let Streams {
        mut input,
        mut output,
        ..
    } = streams;

    let mut to_socket = socket.try_clone()?;
    thread::Builder::new()
        .name("attach-input".to_owned())
        .spawn(move || {
            if let Err(err) = io::copy(&mut input, &mut to_socket) {
                debug!("attach input relay ended: {err}");
            }
            let _ = to_socket.shutdown(Shutdown::Write);
        })?;

    let mut from_socket = socket;
    let output_relay = thread::Builder::new()
        .name("attach-output".to_owned())
        .spawn(move || {
            let copied = copy_flushing(&mut from_socket, &mut output);
            (copied, output)
        })?;

    let (copied, output) = output_relay
        .join()
        .map_err(|_| Error::Io(io::Error::other("attach output relay panicked")))?;
    copied?;

    Ok(output)
}

/// Like `io::copy`, but flushes after every chunk so prompts without a
/// trailing newline reach a line-buffered stdout.
fn copy_flushing(reader: &mut impl Read, writer: &mut impl Write) -> io::Result<()> {
    let mut buf = [0u8; 8192];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return writer.flush(),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        writer.write_all(&buf[..n])?;
        writer.flush()?;
    }
}
