use oci_spec::runtime::Spec;
use serde::{Deserialize, Serialize};

use crate::state::State;

/// Engine name the starter dispatches on.
pub const OCI_ENGINE: &str = "oci";

/// The persisted record for one container, and the blob handed to the
/// starter on launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(rename = "ContainerID")]
    pub container_id: String,

    #[serde(flatten)]
    pub engine: EngineConfig,
}

/// Engine specific configuration, keyed by `EngineName`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "EngineName", content = "EngineConfig")]
pub enum EngineConfig {
    #[serde(rename = "oci")]
    Oci(Box<OciEngineConfig>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OciEngineConfig {
    pub state: State,
    pub oci_config: Spec,
    #[serde(default)]
    pub sync_socket: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub empty_process: bool,
    #[serde(default)]
    pub exec: bool,
}

impl CommonConfig {
    pub fn oci(container_id: &str, config: OciEngineConfig) -> Self {
        Self {
            container_id: container_id.to_owned(),
            engine: EngineConfig::Oci(Box::new(config)),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        match self.engine {
            EngineConfig::Oci(_) => OCI_ENGINE,
        }
    }

    pub fn oci_config(&self) -> &OciEngineConfig {
        match &self.engine {
            EngineConfig::Oci(config) => config,
        }
    }

    pub fn oci_config_mut(&mut self) -> &mut OciEngineConfig {
        match &mut self.engine {
            EngineConfig::Oci(config) => config,
        }
    }

    pub fn state(&self) -> &State {
        &self.oci_config().state
    }
}

impl OciEngineConfig {
    /// Whether the container process was configured with a pseudo-terminal.
    pub fn has_terminal(&self) -> bool {
        self.oci_config
            .process()
            .as_ref()
            .map(|process| process.terminal().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Replaces the process argument vector, marking the configuration as a
    /// secondary process launch inside an existing container.
    pub fn set_exec_args(&mut self, args: Vec<String>) {
        let mut process = self.oci_config.process().clone().unwrap_or_default();
        process.set_args(Some(args));
        self.oci_config.set_process(Some(process));
        self.exec = true;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::state::Status;

    fn record() -> CommonConfig {
        CommonConfig::oci(
            "web",
            OciEngineConfig {
                state: State {
                    oci_version: "1.0.2".to_owned(),
                    id: "web".to_owned(),
                    status: Status::Creating,
                    pid: None,
                    bundle_path: "/bundles/web".to_owned(),
                    annotations: HashMap::new(),
                },
                oci_config: Spec::default(),
                sync_socket: String::new(),
                log_path: "/var/log/web.log".to_owned(),
                empty_process: false,
                exec: false,
            },
        )
    }

    #[test]
    fn record_layout() {
        let value = serde_json::to_value(record()).unwrap();

        assert_eq!(value["ContainerID"], "web");
        assert_eq!(value["EngineName"], "oci");
        assert_eq!(value["EngineConfig"]["State"]["status"], "creating");
        assert_eq!(value["EngineConfig"]["LogPath"], "/var/log/web.log");
        assert_eq!(value["EngineConfig"]["EmptyProcess"], false);
        assert!(value["EngineConfig"]["OciConfig"].is_object());
    }

    #[test]
    fn record_reloads_engine_variant() {
        let json = serde_json::to_string(&record()).unwrap();
        let loaded: CommonConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded.container_id, "web");
        assert_eq!(loaded.engine_name(), OCI_ENGINE);
        assert_eq!(loaded.state().bundle_path, "/bundles/web");
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let mut value = serde_json::to_value(record()).unwrap();
        value["EngineName"] = "singularity".into();

        assert!(serde_json::from_value::<CommonConfig>(value).is_err());
    }

    #[test]
    fn exec_replaces_process_args() {
        let mut record = record();
        record
            .oci_config_mut()
            .set_exec_args(vec!["/bin/ls".to_owned(), "-l".to_owned()]);

        let config = record.oci_config();
        assert!(config.exec);
        assert_eq!(
            config.oci_config.process().as_ref().unwrap().args().as_deref(),
            Some(&["/bin/ls".to_owned(), "-l".to_owned()][..])
        );
    }
}
