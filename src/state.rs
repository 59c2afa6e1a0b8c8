use std::{collections::HashMap, fmt};

use log::warn;
use serde::{Deserialize, Serialize};

/// Path of the socket carrying the container's stdin/stdout bytes.
pub const ANNOTATION_ATTACH_SOCKET: &str = "io.ocictl.attach-socket";
/// Path of the socket accepting out-of-band requests (terminal resize).
pub const ANNOTATION_CONTROL_SOCKET: &str = "io.ocictl.control-socket";
/// Exit code of the container process, published once it terminated.
pub const ANNOTATION_EXIT_CODE: &str = "io.ocictl.exit-code";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub oci_version: String,
    pub id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(rename = "bundle")]
    pub bundle_path: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Variants are declared in lifecycle order; a container only ever moves
/// towards `Stopped`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
}

impl Status {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    /// Staying in place counts as advancing: duplicated notifications are
    /// re-evaluated, not rejected.
    pub fn can_advance_to(&self, next: Status) -> bool {
        next >= *self
    }

    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created)
    }

    pub const fn can_kill(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }

    pub const fn can_delete(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl State {
    pub fn attach_socket(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_ATTACH_SOCKET).map(String::as_str)
    }

    pub fn control_socket(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_CONTROL_SOCKET).map(String::as_str)
    }

    /// Exit status the controller should terminate with once the container is
    /// gone: the published exit code, 0 when none was published, 1 when the
    /// published value is not a number.
    pub fn exit_code(&self) -> i32 {
        match self.annotations.get(ANNOTATION_EXIT_CODE) {
            None => 0,
            Some(code) => code.trim().parse().unwrap_or_else(|err| {
                warn!(code = code.as_str(); "malformed exit code annotation: {err}");
                1
            }),
        }
    }

    /// Folds a snapshot reported by the starter into this state. Returns false
    /// and leaves the state untouched when the snapshot would move it backwards.
    pub fn advance(&mut self, snapshot: &State) -> bool {
        if !self.status.can_advance_to(snapshot.status) {
            return false;
        }

        self.status = snapshot.status;
        if snapshot.pid.is_some() {
            self.pid = snapshot.pid;
        }
        self.annotations.extend(
            snapshot
                .annotations
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: Status) -> State {
        State {
            oci_version: "1.0.2".to_owned(),
            id: "test".to_owned(),
            status,
            pid: None,
            bundle_path: "/bundle".to_owned(),
            annotations: HashMap::new(),
        }
    }

    #[test]
    fn status_only_moves_forward() {
        let order = [
            Status::Creating,
            Status::Created,
            Status::Running,
            Status::Stopped,
        ];

        for (i, from) in order.iter().enumerate() {
            for (j, to) in order.iter().enumerate() {
                assert_eq!(from.can_advance_to(*to), j >= i, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn operation_preconditions() {
        assert!(Status::Created.can_start());
        assert!(!Status::Running.can_start());
        assert!(Status::Created.can_kill());
        assert!(Status::Running.can_kill());
        assert!(!Status::Creating.can_kill());
        assert!(!Status::Stopped.can_kill());
        assert!(Status::Stopped.can_delete());
        assert!(!Status::Running.can_delete());
    }

    #[test]
    fn advance_merges_snapshot() {
        let mut current = state(Status::Created);
        let mut snapshot = state(Status::Running);
        snapshot.pid = Some(42);
        snapshot
            .annotations
            .insert(ANNOTATION_ATTACH_SOCKET.to_owned(), "/run/a.sock".to_owned());

        assert!(current.advance(&snapshot));
        assert_eq!(current.status, Status::Running);
        assert_eq!(current.pid, Some(42));
        assert_eq!(current.attach_socket(), Some("/run/a.sock"));
    }

    #[test]
    fn advance_rejects_backward_snapshot() {
        let mut current = state(Status::Running);
        current.pid = Some(7);

        assert!(!current.advance(&state(Status::Created)));
        assert_eq!(current.status, Status::Running);
        assert_eq!(current.pid, Some(7));
    }

    #[test]
    fn exit_code_from_annotation() {
        let mut state = state(Status::Stopped);
        assert_eq!(state.exit_code(), 0);

        state
            .annotations
            .insert(ANNOTATION_EXIT_CODE.to_owned(), "42".to_owned());
        assert_eq!(state.exit_code(), 42);

        state
            .annotations
            .insert(ANNOTATION_EXIT_CODE.to_owned(), "forty-two".to_owned());
        assert_eq!(state.exit_code(), 1);
    }

    #[test]
    fn serializes_oci_field_names() {
        let mut state = state(Status::Created);
        state.pid = Some(1);

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["ociVersion"], "1.0.2");
        assert_eq!(value["status"], "created");
        assert_eq!(value["bundle"], "/bundle");
        assert_eq!(value["pid"], 1);
    }
}
