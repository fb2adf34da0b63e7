use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::*;

use crate::{Error, Result};

/// Contents of the pid file, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidRecord {
    Missing,
    Pid(u32),
    /// Present but not a positive decimal pid.
    Malformed(String),
}

/// Plain text file holding the backend's decimal pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<PidRecord> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PidRecord::Missing),
            Err(e) => return Err(self.error(format!("fail to read: {e}"))),
        };

        let trimmed = contents.trim();
        match trimmed.parse::<u32>() {
            Ok(pid) if pid > 0 && pid <= i32::MAX as u32 => Ok(PidRecord::Pid(pid)),
            _ => Ok(PidRecord::Malformed(trimmed.to_owned())),
        }
    }

    /// Not fsynced.
    pub fn write(&self, pid: u32) -> Result<()> {
        std::fs::write(&self.path, pid.to_string())
            .map_err(|e| self.error(format!("fail to write pid {pid}: {e}")))
    }

    /// Removing a pid file that does not exist succeeds.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(format!("fail to remove: {e}"))),
        }
    }

    fn error(&self, msg: String) -> Error {
        error!("Pid file {:?}: {msg}", self.path);
        Error::PidFile {
            path: self.path.clone(),
            msg,
        }
    }
}
