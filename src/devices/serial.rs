use std::fmt;
use std::path::{Path, PathBuf};

use log::*;

use super::{missing_option, unknown_option, DeviceOption, VirtioDevice, VIRTIO_SERIAL};
use crate::vm::ConfigBuilder;
use crate::Result;

/// Serial console whose output is appended to a log file on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConsoleDevice {
    log_file_path: PathBuf,
}

impl SerialConsoleDevice {
    pub fn new<P: AsRef<Path>>(log_file_path: P) -> Result<Self> {
        let dev = Self {
            log_file_path: log_file_path.as_ref().to_path_buf(),
        };
        dev.validate()?;
        Ok(dev)
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }
}

impl VirtioDevice for SerialConsoleDevice {
    const KIND: &'static str = VIRTIO_SERIAL;

    fn from_options(options: &[DeviceOption]) -> Result<Self> {
        let mut log_file_path = PathBuf::new();
        for option in options {
            match option.key.as_str() {
                "logFilePath" => log_file_path = PathBuf::from(&option.value),
                _ => return Err(unknown_option(Self::KIND, &option.key)),
            }
        }
        Self::new(log_file_path)
    }

    fn validate(&self) -> Result<()> {
        if self.log_file_path.as_os_str().is_empty() {
            return Err(missing_option(Self::KIND, "logFilePath"));
        }
        Ok(())
    }

    fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        info!("Adding virtio-serial device (logFile: {:?})", self.log_file_path);
        builder.add_serial_console(&self.log_file_path)
    }
}

impl fmt::Display for SerialConsoleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},logFilePath={}", Self::KIND, self.log_file_path.display())
    }
}
