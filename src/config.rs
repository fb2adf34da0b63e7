use std::path::{Path, PathBuf};
use std::time::Duration;

use log::*;
use serde::{Deserialize, Serialize};

use crate::devices::MacAddress;
use crate::image::ImageFormat;
use crate::network::DEFAULT_IP_POLICY;
use crate::retry::RetryPolicy;
use crate::supervisor::{SupervisorConfig, DEFAULT_STARTUP_TIMEOUT, DEFAULT_STOP_POLICY};
use crate::{Error, Result};

pub const DEFAULT_CPUS: u32 = 4;
pub const DEFAULT_MEMORY_MIB: u64 = 8192;
pub const DEFAULT_BACKEND: &str = "vfkit";
/// Fixed so the guest keeps its DHCP lease across restarts.
pub const DEFAULT_MAC: MacAddress = MacAddress::new([0x52, 0x54, 0x00, 0x70, 0x2b, 0x79]);
pub const VSOCK_PORT: u32 = 1024;
pub const PID_FILE_NAME: &str = "vfkit.pid";

/// Driver configuration, persisted by the orchestrator between calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Machine name, also the base name of its files in the store.
    pub machine_name: String,

    /// Directory holding the disk, logs and pid file of this machine.
    pub store_path: PathBuf,

    pub cpus: u32,

    /// Guest memory in MiB.
    pub memory: u64,

    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub kernel_cmdline: String,

    /// Disk image handed to `create`, converted to raw if needed.
    pub image_source_path: Option<PathBuf>,
    /// Guessed from the extension when unset.
    pub image_format: Option<ImageFormat>,

    /// Attach a NAT network device and resolve the guest address.
    pub vmnet: bool,
    pub mac_address: MacAddress,

    pub vsock_path: Option<PathBuf>,

    /// Backend binary; `vfkit` is looked up in `$PATH` when unset.
    pub backend_path: Option<PathBuf>,
    pub qemu_img_path: Option<PathBuf>,

    pub startup_timeout: Duration,
    pub stop_policy: RetryPolicy,
    pub ip_policy: RetryPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            machine_name: String::new(),
            store_path: PathBuf::new(),
            cpus: DEFAULT_CPUS,
            memory: DEFAULT_MEMORY_MIB,
            kernel: PathBuf::new(),
            initrd: PathBuf::new(),
            kernel_cmdline: String::new(),
            image_source_path: None,
            image_format: None,
            vmnet: true,
            mac_address: DEFAULT_MAC,
            vsock_path: None,
            backend_path: None,
            qemu_img_path: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_policy: DEFAULT_STOP_POLICY,
            ip_policy: DEFAULT_IP_POLICY,
        }
    }
}

impl DriverConfig {
    /// Configuration for a fresh machine with a generated name.
    pub fn new<P: AsRef<Path>>(store_path: P) -> Self {
        Self {
            machine_name: format!("vf-{}", uuid::Uuid::new_v4()),
            store_path: store_path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine_name.is_empty() {
            return Err(invalid("missing machine name"));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(invalid("missing store path"));
        }
        if self.cpus == 0 {
            return Err(invalid("cpus must be at least 1"));
        }
        if self.memory == 0 {
            return Err(invalid("memory must be non-zero"));
        }
        if self.kernel.as_os_str().is_empty() {
            return Err(invalid("missing kernel path"));
        }
        if self.initrd.as_os_str().is_empty() {
            return Err(invalid("missing initrd path"));
        }
        // these paths end up inside comma-separated device options
        for path in [self.log_path(), self.disk_path(), self.vsock_socket_path()] {
            if path.to_string_lossy().contains(',') {
                return Err(invalid(&format!(
                    "path {path:?} contains ',', which device options cannot carry"
                )));
            }
        }
        self.stop_policy.validate()?;
        self.ip_policy.validate()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    fn store_file(&self, suffix: &str) -> PathBuf {
        self.store_path
            .join(format!("{}{suffix}", self.machine_name))
    }

    /// Raw boot disk, `<store>/<name>.img`.
    pub fn disk_path(&self) -> PathBuf {
        self.store_file(".img")
    }

    /// Serial console log, `<store>/<name>.log`.
    pub fn log_path(&self) -> PathBuf {
        self.store_file(".log")
    }

    /// Backend stdout and stderr.
    pub fn backend_log_path(&self) -> PathBuf {
        self.store_file("-vfkit.log")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.store_path.join(PID_FILE_NAME)
    }

    pub fn vsock_socket_path(&self) -> PathBuf {
        self.vsock_path
            .clone()
            .unwrap_or_else(|| self.store_file(".sock"))
    }

    pub fn image_format(&self) -> Option<ImageFormat> {
        self.image_format
            .or_else(|| self.image_source_path.as_ref().map(ImageFormat::from_path))
    }

    pub fn supervisor_config<P: AsRef<Path>>(&self, backend_bin: P) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(&self.machine_name, backend_bin, self.pid_path());
        config.startup_timeout = self.startup_timeout;
        config.stop_policy = self.stop_policy;
        config.output_log = Some(self.backend_log_path());
        config
    }
}

fn invalid(msg: &str) -> Error {
    error!("Invalid driver configuration: {msg}");
    Error::InvalidConfiguration(msg.to_owned())
}
