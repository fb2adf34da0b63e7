//! Supervision of the backend hypervisor process.
//!
//! The backend is tracked across driver restarts through a pid file. The
//! pid file is only a hint: every state query cross-checks it against the
//! OS process table and the expected executable name, so a stale file or a
//! recycled pid reads as [`LifecycleState::Stopped`].
//!
//! A crash between spawning the backend and writing the pid file leaves an
//! untracked backend behind. Nothing here can find it again, and a later
//! `start` may launch a second instance.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use log::*;
use serde::{Deserialize, Serialize};

use crate::retry::{Attempt, CancelToken, Clock, RetryPolicy, SystemClock};
use crate::{Error, Result};

pub mod pidfile;
pub mod process;

pub use pidfile::{PidFile, PidRecord};
pub use process::{ProcessInfo, ProcessTable, SystemProcessTable};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_POLICY: RetryPolicy = RetryPolicy::new(120, Duration::from_secs(1));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Starting => "Starting",
            LifecycleState::Running => "Running",
            LifecycleState::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Instance name, prefixed to every log line.
    pub name: String,

    /// Path (or `$PATH`-relative name) of the backend binary.
    pub backend_bin: PathBuf,

    /// Base name the live process must carry to be recognised as ours.
    pub executable_name: String,

    pub pid_file: PathBuf,

    /// How long the backend must survive after spawn to count as started.
    pub startup_timeout: Duration,

    /// Polling after SIGTERM before giving up on a graceful stop.
    pub stop_policy: RetryPolicy,

    /// Backend stdout and stderr are appended here when set.
    pub output_log: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new<S: AsRef<str>, P: AsRef<Path>, Q: AsRef<Path>>(
        name: S,
        backend_bin: P,
        pid_file: Q,
    ) -> Self {
        let backend_bin = backend_bin.as_ref().to_path_buf();
        let executable_name = backend_bin
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: name.as_ref().to_owned(),
            backend_bin,
            executable_name,
            pid_file: pid_file.as_ref().to_path_buf(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_policy: DEFAULT_STOP_POLICY,
            output_log: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable_name.is_empty() {
            let msg = format!("No executable name for backend {:?}", self.backend_bin);
            error!("{msg}");
            return Err(Error::InvalidConfiguration(msg));
        }
        if self.pid_file.as_os_str().is_empty() {
            let msg = "Missing pid file path".to_string();
            error!("{msg}");
            return Err(Error::InvalidConfiguration(msg));
        }
        self.stop_policy.validate()
    }
}

/// What the pid file and the process table say together.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Probe {
    NoPidFile,
    /// Pid file present, but unreadable as a pid or pointing at nothing.
    Stale(String),
    /// Pid file points at a live process that is not the backend.
    Mismatch(ProcessInfo),
    Running(u32),
}

pub struct Supervisor<P = SystemProcessTable, C = SystemClock> {
    config: SupervisorConfig,
    pid_file: PidFile,
    processes: P,
    clock: C,
    token: CancelToken,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        Self::with_parts(config, SystemProcessTable, SystemClock)
    }
}

impl<P: ProcessTable, C: Clock> Supervisor<P, C> {
    pub fn with_parts(config: SupervisorConfig, processes: P, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pid_file: PidFile::new(&config.pid_file),
            config,
            processes,
            clock,
            token: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Share a cancellation flag with the caller.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    /// Cancelling this token abandons an in-progress graceful stop.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    fn probe(&self) -> Result<Probe> {
        let pid = match self.pid_file.read()? {
            PidRecord::Missing => return Ok(Probe::NoPidFile),
            PidRecord::Malformed(contents) => {
                return Ok(Probe::Stale(format!("malformed contents {contents:?}")))
            }
            PidRecord::Pid(pid) => pid,
        };

        match self.processes.lookup(pid)? {
            None => Ok(Probe::Stale(format!("no process with pid {pid}"))),
            Some(info) if info.zombie => Ok(Probe::Stale(format!("pid {pid} has exited"))),
            Some(info) if !info.matches(&self.config.executable_name) => {
                warn!(
                    "[{}] Pid {pid} belongs to {:?}, expected {:?}",
                    self.config.name, info.name, self.config.executable_name
                );
                Ok(Probe::Mismatch(info))
            }
            Some(_) => Ok(Probe::Running(pid)),
        }
    }

    /// Current state, derived from the pid file and the process table.
    pub fn state(&self) -> Result<LifecycleState> {
        Ok(match self.probe()? {
            Probe::Running(_) => LifecycleState::Running,
            Probe::NoPidFile | Probe::Stale(_) | Probe::Mismatch(_) => LifecycleState::Stopped,
        })
    }

    /// Like [`Supervisor::state`], reporting lookup failures as
    /// [`LifecycleState::Error`].
    pub fn status(&self) -> LifecycleState {
        self.state().unwrap_or_else(|e| {
            error!("[{}] Fail to determine state: {e}", self.config.name);
            LifecycleState::Error
        })
    }

    /// Pid of the running backend, if any.
    pub fn pid(&self) -> Result<Option<u32>> {
        Ok(match self.probe()? {
            Probe::Running(pid) => Some(pid),
            _ => None,
        })
    }

    /// Spawn the backend with `args` and wait out the startup window.
    ///
    /// Exiting inside the window is a startup failure and leaves no pid
    /// file behind. Returns the backend pid.
    pub fn start(&self, args: &[String]) -> Result<u32> {
        let name = &self.config.name;
        match self.probe()? {
            Probe::Running(pid) => {
                error!("[{name}] Backend already running with pid {pid}");
                return Err(Error::AlreadyRunning(pid));
            }
            Probe::Stale(reason) => {
                warn!("[{name}] Removing stale pid file before start: {reason}");
                self.pid_file.remove()?;
            }
            Probe::Mismatch(info) => {
                warn!(
                    "[{name}] Removing stale pid file before start: pid {} now belongs to {:?}",
                    info.pid, info.name
                );
                self.pid_file.remove()?;
            }
            Probe::NoPidFile => (),
        }
        info!(
            "[{name}] {} -> {}",
            LifecycleState::Stopped,
            LifecycleState::Starting
        );
        debug!(
            "[{name}] Launching {:?} {}",
            self.config.backend_bin,
            args.join(" ")
        );

        let mut cmd = Command::new(&self.config.backend_bin);
        cmd.args(args).stdin(Stdio::null());
        if let Some(path) = &self.config.output_log {
            let log = OpenOptions::new().create(true).append(true).open(path)?;
            cmd.stdout(log.try_clone()?).stderr(log);
        }
        let mut child = cmd.spawn().map_err(|e| {
            let msg = format!("Fail to spawn {:?}: {e}", self.config.backend_bin);
            error!("[{name}] {msg}");
            Error::Process(msg)
        })?;
        let pid = child.id();

        // The waiter reaps the child whenever it exits. Only an exit inside
        // the startup window is reported back.
        let (tx, rx) = mpsc::channel::<std::io::Result<ExitStatus>>();
        std::thread::Builder::new()
            .name(format!("{name}-waiter"))
            .spawn(move || {
                let _ = tx.send(child.wait());
            })
            .map_err(|e| {
                let msg = format!("Fail to spawn waiter for pid {pid}: {e}");
                error!("[{name}] {msg}");
                let _ = self.processes.kill(pid);
                Error::Process(msg)
            })?;

        match rx.recv_timeout(self.config.startup_timeout) {
            Err(RecvTimeoutError::Timeout) => (),
            Ok(status) => {
                let exit = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("fail to wait: {e}"),
                };
                error!("[{name}] Backend pid {pid} exited during startup: {exit}");
                return Err(Error::BackendStartupFailed(exit));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let msg = format!("lost track of pid {pid} during startup");
                error!("[{name}] {msg}");
                let _ = self.processes.kill(pid);
                return Err(Error::BackendStartupFailed(msg));
            }
        }

        if let Err(e) = self.pid_file.write(pid) {
            // an untracked backend could never be stopped
            let _ = self.processes.kill(pid);
            return Err(e);
        }
        info!(
            "[{name}] {} -> {} (pid {pid})",
            LifecycleState::Starting,
            LifecycleState::Running
        );
        Ok(pid)
    }

    /// Graceful stop: SIGTERM, then poll until the backend is gone.
    ///
    /// Blocks for up to the stop policy's budget and fails with
    /// [`Error::GracefulShutdownTimeout`] if the backend is still running;
    /// [`Supervisor::kill`] is the fallback.
    pub fn stop(&self) -> Result<()> {
        let name = &self.config.name;
        let pid = match self.probe()? {
            Probe::Running(pid) => pid,
            _ => {
                debug!("[{name}] Already stopped");
                return Ok(());
            }
        };

        let policy = self.config.stop_policy;
        info!(
            "[{name}] Requesting graceful shutdown of pid {pid}, waiting up to {:?}",
            policy.budget()
        );
        self.processes.terminate(pid)?;

        policy.run(&self.clock, &self.token, |attempt| match self.state() {
            Ok(LifecycleState::Stopped) => Ok(()),
            Ok(state) => {
                debug!("[{name}] VM state: {state} ({attempt}/{})", policy.max_attempts);
                Err(Attempt::Retry(Error::GracefulShutdownTimeout {
                    attempts: policy.max_attempts,
                }))
            }
            Err(e) => Err(Attempt::Abort(e)),
        })?;

        self.pid_file.remove()?;
        info!("[{name}] {}", LifecycleState::Stopped);
        Ok(())
    }

    /// SIGKILL the backend without waiting for it to exit.
    pub fn kill(&self) -> Result<()> {
        let name = &self.config.name;
        match self.probe()? {
            Probe::Running(pid) => {
                warn!("[{name}] Killing pid {pid}");
                self.processes.kill(pid)
            }
            Probe::Mismatch(info) => {
                warn!("[{name}] Not killing pid {}, it is {:?}", info.pid, info.name);
                Ok(())
            }
            Probe::NoPidFile | Probe::Stale(_) => {
                debug!("[{name}] Nothing to kill");
                Ok(())
            }
        }
    }

    /// Best-effort teardown. Kills a running backend and drops the pid
    /// file; failures are logged, never returned.
    pub fn remove(&self) {
        let name = &self.config.name;
        match self.probe() {
            Ok(Probe::Running(pid)) => match self.processes.kill(pid) {
                Ok(()) => self.remove_pid_file(),
                Err(e) => warn!("[{name}] Fail to kill pid {pid} on remove: {e}"),
            },
            Ok(_) => self.remove_pid_file(),
            Err(e) => warn!("[{name}] Fail to determine state on remove, keeping pid file: {e}"),
        }
    }

    fn remove_pid_file(&self) {
        if let Err(e) = self.pid_file.remove() {
            warn!("[{}] {e}", self.config.name);
        }
    }

    /// Clear what an unclean shutdown left behind, before `start`.
    ///
    /// Refuses with [`Error::AlreadyRunning`] while a matching backend is
    /// alive, and otherwise deletes a stale pid file.
    pub fn recover_from_unclean_shutdown(&self) -> Result<()> {
        let name = &self.config.name;
        match self.probe()? {
            Probe::NoPidFile => Ok(()),
            Probe::Running(pid) => {
                error!("[{name}] Backend already running with pid {pid}");
                Err(Error::AlreadyRunning(pid))
            }
            Probe::Stale(reason) => {
                warn!("[{name}] Removing stale pid file: {reason}");
                self.pid_file.remove()
            }
            Probe::Mismatch(info) => {
                warn!(
                    "[{name}] Removing stale pid file: pid {} now belongs to {:?}",
                    info.pid, info.name
                );
                self.pid_file.remove()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::retry::test::FakeClock;

    /// Process table answering from a map; `fail` turns every lookup into
    /// an error. Signals are recorded, and end the process unless it is
    /// `stubborn` about SIGTERM.
    #[derive(Default)]
    struct FakeProcessTable {
        processes: RefCell<HashMap<u32, ProcessInfo>>,
        signals: RefCell<Vec<(u32, &'static str)>>,
        fail: bool,
        stubborn: bool,
    }

    impl FakeProcessTable {
        fn with(pid: u32, name: &str) -> Self {
            let table = Self::default();
            table.processes.borrow_mut().insert(
                pid,
                ProcessInfo {
                    pid,
                    name: name.to_owned(),
                    exe: None,
                    zombie: false,
                },
            );
            table
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn lookup(&self, pid: u32) -> Result<Option<ProcessInfo>> {
            if self.fail {
                return Err(Error::Process("table unavailable".into()));
            }
            Ok(self.processes.borrow().get(&pid).cloned())
        }

        fn terminate(&self, pid: u32) -> Result<()> {
            self.signals.borrow_mut().push((pid, "TERM"));
            if !self.stubborn {
                self.processes.borrow_mut().remove(&pid);
            }
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<()> {
            self.signals.borrow_mut().push((pid, "KILL"));
            self.processes.borrow_mut().remove(&pid);
            Ok(())
        }
    }

    fn supervisor(
        dir: &tempfile::TempDir,
        table: FakeProcessTable,
    ) -> Supervisor<FakeProcessTable, FakeClock> {
        let mut config = SupervisorConfig::new("test", "/usr/local/bin/vfkit", dir.path().join("vfkit.pid"));
        config.stop_policy = RetryPolicy::new(3, Duration::from_secs(1));
        Supervisor::with_parts(config, table, FakeClock::default()).unwrap()
    }

    #[test]
    fn test_executable_name_from_backend_path() {
        let config = SupervisorConfig::new("vm", "/usr/local/bin/vfkit", "/tmp/vfkit.pid");
        assert_eq!(config.executable_name, "vfkit");
        assert_eq!(config.startup_timeout, DEFAULT_STARTUP_TIMEOUT);

        let config = SupervisorConfig::new("vm", "", "/tmp/vfkit.pid");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::default());
        assert_eq!(sup.state().unwrap(), LifecycleState::Stopped);
        assert_eq!(sup.pid().unwrap(), None);
    }

    #[test]
    fn test_state_follows_process_table() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::with(4242, "vfkit"));
        sup.pid_file().write(4242).unwrap();
        assert_eq!(sup.state().unwrap(), LifecycleState::Running);
        assert_eq!(sup.pid().unwrap(), Some(4242));

        sup.pid_file().write(4243).unwrap();
        assert_eq!(sup.state().unwrap(), LifecycleState::Stopped);
    }

    #[test]
    fn test_pid_reuse_reads_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::with(4242, "bash"));
        sup.pid_file().write(4242).unwrap();
        assert_eq!(sup.state().unwrap(), LifecycleState::Stopped);
        // never signal somebody else's process
        sup.kill().unwrap();
        sup.remove();
        assert!(sup.processes.signals.borrow().is_empty());
    }

    #[test]
    fn test_zombie_reads_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::with(4242, "vfkit");
        table.processes.borrow_mut().get_mut(&4242).unwrap().zombie = true;
        let sup = supervisor(&dir, table);
        sup.pid_file().write(4242).unwrap();
        assert_eq!(sup.state().unwrap(), LifecycleState::Stopped);
    }

    #[test]
    fn test_lookup_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable {
            fail: true,
            ..Default::default()
        };
        let sup = supervisor(&dir, table);
        sup.pid_file().write(4242).unwrap();
        assert!(matches!(sup.state(), Err(Error::Process(_))));
        assert_eq!(sup.status(), LifecycleState::Error);
        assert!(sup.recover_from_unclean_shutdown().is_err());
        assert!(sup.pid_file().path().exists());

        sup.remove();
        assert!(sup.pid_file().path().exists());
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::with(7, "launchd"));
        sup.stop().unwrap();

        // stale and reused pids are left alone too
        sup.pid_file().write(4242).unwrap();
        sup.stop().unwrap();
        sup.pid_file().write(7).unwrap();
        sup.stop().unwrap();

        assert!(sup.processes.signals.borrow().is_empty());
        assert!(sup.clock.slept.borrow().is_empty());
    }

    #[test]
    fn test_stop_terminates_and_clears_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::with(4242, "vfkit"));
        sup.pid_file().write(4242).unwrap();

        sup.stop().unwrap();
        assert_eq!(*sup.processes.signals.borrow(), vec![(4242, "TERM")]);
        assert!(!sup.pid_file().path().exists());
        assert!(sup.clock.slept.borrow().is_empty());
    }

    #[test]
    fn test_stop_timeout_then_kill() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable {
            stubborn: true,
            ..FakeProcessTable::with(4242, "vfkit")
        };
        let sup = supervisor(&dir, table);
        sup.pid_file().write(4242).unwrap();

        let err = sup.stop().unwrap_err();
        assert!(matches!(err, Error::GracefulShutdownTimeout { attempts: 3 }));
        assert_eq!(sup.clock.slept.borrow().len(), 2);
        assert!(sup.pid_file().path().exists());

        sup.kill().unwrap();
        assert_eq!(
            *sup.processes.signals.borrow(),
            vec![(4242, "TERM"), (4242, "KILL")]
        );
        assert_eq!(sup.state().unwrap(), LifecycleState::Stopped);
    }

    #[test]
    fn test_zero_stop_attempts_rejected() {
        let mut config = SupervisorConfig::new("vm", "vfkit", "/tmp/vfkit.pid");
        config.stop_policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration(_))));
        assert!(Supervisor::new(config).is_err());
    }

    #[test]
    fn test_recover_removes_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::with(7, "launchd"));

        sup.pid_file().write(4242).unwrap();
        sup.recover_from_unclean_shutdown().unwrap();
        assert!(!sup.pid_file().path().exists());

        std::fs::write(sup.pid_file().path(), "garbage").unwrap();
        sup.recover_from_unclean_shutdown().unwrap();
        assert!(!sup.pid_file().path().exists());

        sup.pid_file().write(7).unwrap();
        sup.recover_from_unclean_shutdown().unwrap();
        assert!(!sup.pid_file().path().exists());

        sup.recover_from_unclean_shutdown().unwrap();
    }

    #[test]
    fn test_recover_refuses_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::with(4242, "vfkit"));
        sup.pid_file().write(4242).unwrap();
        assert!(matches!(
            sup.recover_from_unclean_shutdown(),
            Err(Error::AlreadyRunning(4242))
        ));
        assert!(sup.pid_file().path().exists());
        assert!(matches!(sup.start(&[]), Err(Error::AlreadyRunning(4242))));
    }

    #[test]
    fn test_remove_stale_drops_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, FakeProcessTable::default());
        sup.pid_file().write(4242).unwrap();
        sup.remove();
        assert!(!sup.pid_file().path().exists());
    }
}
