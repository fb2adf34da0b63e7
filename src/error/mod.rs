use std::io;
use std::path::PathBuf;

/// Errors in machine-driver-vf
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown device type: {0}")]
    UnknownDeviceKind(String),
    #[error("unknown option for {kind} devices: {key}")]
    UnknownOption { kind: String, key: String },
    #[error("missing mandatory '{option}' option for {kind} device")]
    MissingRequiredOption { kind: String, option: String },
    #[error("invalid value '{value}' for {kind} '{key}' option: {reason}")]
    InvalidOptionValue {
        kind: String,
        key: String,
        value: String,
        reason: String,
    },
    #[error("Configure: {0}")]
    InvalidConfiguration(String),
    #[error("could not find the {0} executable in $PATH")]
    BackendNotFound(String),
    #[error("backend exited during startup: {0}")]
    BackendStartupFailed(String),
    #[error("an instance is already running with pid {0}")]
    AlreadyRunning(u32),
    #[error("VM failed to gracefully shutdown after {attempts} checks, try the kill command")]
    GracefulShutdownTimeout { attempts: u32 },
    #[error("IP address for {mac} never found in dhcp leases after {attempts} attempts")]
    IpResolutionTimeout { mac: String, attempts: u32 },
    #[error("no dhcp lease for {0}")]
    LeaseNotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("disk image conversion: {0}")]
    ImageConversion(String),
    #[error("Process: {0}")]
    Process(String),
    #[error("fail to signal pid {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },
    #[error("pid file {path:?}: {msg}")]
    PidFile { path: PathBuf, msg: String },
    #[error("Fail to encode or decode config: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Filesys I/O: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the caller may recover by escalating to a forced kill.
    pub fn is_shutdown_timeout(&self) -> bool {
        matches!(self, Error::GracefulShutdownTimeout { .. })
    }
}
