use std::{
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
};

use log::debug;

use crate::{
    config::CommonConfig,
    error::{Error, Result},
};

const RECORD_FILE: &str = "instance.json";

/// Checks that `id` names a single directory entry made of
/// `[A-Za-z0-9._-]`, so it can never leave the store root.
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));

    if !valid {
        return Err(Error::InvalidId(id.to_owned()));
    }

    Ok(())
}

/// Persistent container records, one per container id.
pub trait InstanceStore: Send + Sync {
    fn load(&self, id: &str) -> Result<CommonConfig>;

    fn save(&self, id: &str, record: &CommonConfig) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Directory private to one container; sockets owned by its
    /// orchestration live here.
    fn instance_dir(&self, id: &str) -> Result<PathBuf>;

    fn exists(&self, id: &str) -> bool;
}

/// Stores each record as JSON under `<root>/<id>/instance.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn default_root() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(|| PathBuf::from("/run"))
            .join("ocictl")
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self.instance_dir(id)?.join(RECORD_FILE))
    }
}

impl InstanceStore for FileStore {
    fn load(&self, id: &str) -> Result<CommonConfig> {
        let file = match File::open(self.record_path(id)?) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.to_owned()))
            }
            Err(err) => return Err(err.into()),
        };

        Ok(serde_json::from_reader(file)?)
    }

    fn save(&self, id: &str, record: &CommonConfig) -> Result<()> {
        let dir = self.instance_dir(id)?;
        fs::create_dir_all(&dir)?;

        let tmp_path = dir.join(format!(".{RECORD_FILE}.tmp"));
        let mut tmp = File::create(&tmp_path)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, dir.join(RECORD_FILE))?;

        debug!(id = id, status = record.state().status.as_str(); "saved container record");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let dir = self.instance_dir(id)?;
        if !dir.exists() {
            return Err(Error::NotFound(id.to_owned()));
        }

        fs::remove_dir_all(&dir)?;
        debug!(id = id; "removed container record");
        Ok(())
    }

    fn instance_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_ok_and(|path| path.exists())
    }
}
