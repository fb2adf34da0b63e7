use std::path::{Path, PathBuf};

use log::*;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessStatus, System};

use crate::{Error, Result};

/// Linux truncates the process name (`comm`) to 15 bytes.
const COMM_LEN: usize = 15;

/// What the OS process table says about one pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Resolved executable, where procfs exposes it.
    pub exe: Option<PathBuf>,
    /// Exited but not yet reaped by its parent.
    pub zombie: bool,
}

impl ProcessInfo {
    /// Whether the executable base name is `expected`.
    pub fn matches(&self, expected: &str) -> bool {
        if self.name == expected {
            return true;
        }
        if self.name.len() == COMM_LEN && expected.starts_with(&self.name) {
            return true;
        }
        self.exe
            .as_deref()
            .and_then(Path::file_name)
            .map_or(false, |file_name| file_name == expected)
    }
}

/// Process lookup and signal delivery.
pub trait ProcessTable {
    /// `Ok(None)` when no process holds `pid`.
    fn lookup(&self, pid: u32) -> Result<Option<ProcessInfo>>;

    /// Ask the process to exit. A process that is already gone counts as
    /// signalled.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Kill the process outright, with the same tolerance for a gone process.
    fn kill(&self, pid: u32) -> Result<()>;
}

/// The live OS process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn lookup(&self, pid: u32) -> Result<Option<ProcessInfo>> {
        // signal 0 probes existence without delivering anything
        match signal::kill(to_pid(pid)?, None) {
            Ok(()) | Err(Errno::EPERM) => (),
            Err(Errno::ESRCH) => return Ok(None),
            Err(errno) => {
                let msg = format!("Fail to probe pid {pid}: {errno}");
                error!("{msg}");
                return Err(Error::Process(msg));
            }
        }

        let sys_pid = sysinfo::Pid::from_u32(pid);
        let mut sys = System::new();
        if !sys.refresh_process(sys_pid) {
            // exited between the probe and the refresh
            return Ok(None);
        }
        Ok(sys.process(sys_pid).map(|process| ProcessInfo {
            pid,
            name: process.name().to_owned(),
            exe: std::fs::read_link(format!("/proc/{pid}/exe")).ok(),
            zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        }))
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        send(pid, Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        send(pid, Signal::SIGKILL)
    }
}

fn send(pid: u32, sig: Signal) -> Result<()> {
    match signal::kill(to_pid(pid)?, sig) {
        Ok(()) => {
            debug!("Sent {sig} to pid {pid}");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!("Pid {pid} already gone, {sig} not delivered");
            Ok(())
        }
        Err(errno) => {
            error!("Fail to send {sig} to pid {pid}: {errno}");
            Err(Error::Signal { pid, errno })
        }
    }
}

/// Reject pids that `kill(2)` would interpret as process groups.
fn to_pid(pid: u32) -> Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => {
            let msg = format!("Invalid pid {pid}");
            error!("{msg}");
            Err(Error::Process(msg))
        }
    }
}
