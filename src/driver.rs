//! The machine lifecycle contract exposed to the orchestrator.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use log::*;

use crate::config::{DriverConfig, DEFAULT_BACKEND, VSOCK_PORT};
use crate::devices::{self, VIRTIO_BLK, VIRTIO_NET, VIRTIO_RNG, VIRTIO_SERIAL, VIRTIO_VSOCK};
use crate::image::{self, ImageFormat};
use crate::network::{self, DhcpdLeasesFile, LeaseSource};
use crate::retry::{CancelToken, SystemClock};
use crate::supervisor::{LifecycleState, Supervisor};
use crate::vm::{Bootloader, VirtualMachine};
use crate::{Error, Result};

pub const DRIVER_NAME: &str = "vf";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub trait MachineDriver {
    fn driver_name(&self) -> &'static str;

    fn driver_version(&self) -> &'static str;

    fn pre_create_check(&self) -> Result<()>;

    /// Prepare the machine's store: the raw boot disk.
    fn create(&mut self) -> Result<()>;

    /// Launch the backend and, with networking, wait for the guest address.
    fn start(&mut self) -> Result<()>;

    /// Graceful shutdown; [`MachineDriver::kill`] is the fallback.
    fn stop(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;

    /// Tear down whatever is left. Never fails on a half-gone machine.
    fn remove(&mut self) -> Result<()>;

    fn get_state(&self) -> Result<LifecycleState>;

    fn get_ip(&mut self) -> Result<Ipv4Addr>;
}

/// Driver for the vfkit hypervisor.
pub struct VfDriver<L = DhcpdLeasesFile> {
    config: DriverConfig,
    leases: L,
    ip: Option<Ipv4Addr>,
    token: CancelToken,
}

impl VfDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self::with_lease_source(config, DhcpdLeasesFile::default())
    }
}

impl<L: LeaseSource> VfDriver<L> {
    pub fn with_lease_source(config: DriverConfig, leases: L) -> Self {
        Self {
            config,
            leases,
            ip: None,
            token: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Cancels a pending graceful stop or IP resolution.
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Explicit override, else `vfkit` from `$PATH`.
    pub fn resolve_backend(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.backend_path {
            return Ok(path.clone());
        }
        image::lookup_path(DEFAULT_BACKEND).ok_or_else(|| {
            let e = Error::BackendNotFound(DEFAULT_BACKEND.to_string());
            error!("[{}] {e}", self.config.machine_name);
            e
        })
    }

    /// Supervisor for queries and signals, which only need the executable
    /// name and not a resolved binary.
    fn supervisor(&self) -> Result<Supervisor> {
        let backend = self
            .config
            .backend_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKEND));
        self.supervisor_for(backend)
    }

    fn supervisor_for(&self, backend: PathBuf) -> Result<Supervisor> {
        Ok(Supervisor::new(self.config.supervisor_config(backend))?
            .with_cancel_token(self.token.clone()))
    }

    /// Device specifications of this machine, in attachment order.
    pub fn device_specs(&self) -> Vec<String> {
        let config = &self.config;
        let mut specs = vec![format!(
            "{VIRTIO_SERIAL},logFilePath={}",
            config.log_path().display()
        )];
        if config.vmnet {
            specs.push(format!("{VIRTIO_NET},nat,mac={}", config.mac_address));
        }
        specs.push(VIRTIO_RNG.to_string());
        specs.push(format!("{VIRTIO_BLK},path={}", config.disk_path().display()));
        specs.push(format!(
            "{VIRTIO_VSOCK},port={VSOCK_PORT},socketURL={}",
            config.vsock_socket_path().display()
        ));
        specs
    }

    /// Assemble the backend configuration and flatten it to arguments.
    pub fn backend_args(&self) -> Result<Vec<String>> {
        let config = &self.config;
        let devices = devices::devices_from_cmdline(&self.device_specs())?;
        let mut vm = VirtualMachine::new(
            config.cpus,
            config.memory,
            Bootloader::new(&config.kernel, &config.kernel_cmdline, &config.initrd),
        );
        devices::apply(&devices, &mut vm)?;
        vm.to_cmdline()
    }

    fn resolve_ip(&self) -> Result<Ipv4Addr> {
        let config = &self.config;
        if !config.vmnet {
            let msg = "networking is disabled for this machine".to_string();
            error!("[{}] {msg}", config.machine_name);
            return Err(Error::InvalidConfiguration(msg));
        }
        network::resolve_ip(
            &config.mac_address,
            &config.ip_policy,
            &self.leases,
            &SystemClock,
            &self.token,
        )
    }
}

impl<L: LeaseSource> MachineDriver for VfDriver<L> {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn driver_version(&self) -> &'static str {
        DRIVER_VERSION
    }

    fn pre_create_check(&self) -> Result<()> {
        self.config.validate()
    }

    fn create(&mut self) -> Result<()> {
        self.pre_create_check()?;
        let config = &self.config;
        info!("[{}] Creating machine in {:?}", config.machine_name, config.store_path);
        std::fs::create_dir_all(&config.store_path)?;

        match &config.image_source_path {
            Some(source) => image::prepare_disk(
                source,
                config.image_format().unwrap_or(ImageFormat::Raw),
                &config.disk_path(),
                config.qemu_img_path.as_deref(),
            ),
            None if config.disk_path().is_file() => Ok(()),
            None => {
                let msg = format!("no disk image for {:?}", config.disk_path());
                error!("[{}] {msg}", config.machine_name);
                Err(Error::InvalidConfiguration(msg))
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        self.config.validate()?;
        let backend = self.resolve_backend()?;
        let args = self.backend_args()?;

        let supervisor = self.supervisor_for(backend)?;
        supervisor.recover_from_unclean_shutdown()?;
        supervisor.start(&args)?;

        self.ip = None;
        if self.config.vmnet {
            self.ip = Some(self.resolve_ip()?);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.supervisor()?.stop()?;
        self.ip = None;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.supervisor()?.kill()?;
        self.ip = None;
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        self.supervisor()?.remove();
        self.ip = None;
        Ok(())
    }

    fn get_state(&self) -> Result<LifecycleState> {
        self.supervisor()?.state()
    }

    fn get_ip(&mut self) -> Result<Ipv4Addr> {
        if let Some(ip) = self.ip {
            return Ok(ip);
        }
        let ip = self.resolve_ip()?;
        self.ip = Some(ip);
        Ok(ip)
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::devices::MacAddress;

    struct StaticLeases {
        ip: Ipv4Addr,
        calls: Cell<u32>,
    }

    impl LeaseSource for StaticLeases {
        fn lookup(&self, _mac: &MacAddress) -> Result<Ipv4Addr> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.ip)
        }
    }

    fn config(store: &std::path::Path) -> DriverConfig {
        DriverConfig {
            machine_name: "fedora".into(),
            store_path: store.to_path_buf(),
            kernel: store.join("vmlinuz"),
            initrd: store.join("initrd"),
            kernel_cmdline: "console=hvc0".into(),
            cpus: 2,
            memory: 2048,
            ..Default::default()
        }
    }

    fn driver(store: &std::path::Path) -> VfDriver<StaticLeases> {
        VfDriver::with_lease_source(
            config(store),
            StaticLeases {
                ip: Ipv4Addr::new(192, 168, 64, 9),
                calls: Cell::new(0),
            },
        )
    }

    #[test]
    fn test_name_and_version() {
        let driver = VfDriver::new(DriverConfig::new("/store"));
        assert_eq!(driver.driver_name(), "vf");
        assert_eq!(driver.driver_version(), env!("CARGO_PKG_VERSION"));
        assert!(driver.pre_create_check().is_err());
    }

    #[test]
    fn test_device_specs() {
        let mut driver = driver(std::path::Path::new("/store"));
        assert_eq!(
            driver.device_specs(),
            vec![
                "virtio-serial,logFilePath=/store/fedora.log",
                "virtio-net,nat,mac=52:54:00:70:2b:79",
                "virtio-rng",
                "virtio-blk,path=/store/fedora.img",
                "virtio-vsock,port=1024,socketURL=/store/fedora.sock",
            ]
        );

        driver.config.vmnet = false;
        assert!(!driver.device_specs().iter().any(|spec| spec.starts_with("virtio-net")));
    }

    #[test]
    fn test_backend_args() {
        let driver = driver(std::path::Path::new("/store"));
        let args = driver.backend_args().unwrap();
        assert_eq!(&args[..4], &["--cpus", "2", "--memory", "2048"]);
        assert_eq!(args.iter().filter(|arg| *arg == "--device").count(), 5);
        assert!(args.contains(&"virtio-blk,path=/store/fedora.img".to_string()));
    }

    #[test]
    fn test_fresh_store_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        assert_eq!(driver.get_state().unwrap(), LifecycleState::Stopped);
        driver.stop().unwrap();
        driver.kill().unwrap();
        driver.remove().unwrap();
    }

    #[test]
    fn test_get_ip_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        assert_eq!(driver.get_ip().unwrap(), Ipv4Addr::new(192, 168, 64, 9));
        assert_eq!(driver.get_ip().unwrap(), Ipv4Addr::new(192, 168, 64, 9));
        assert_eq!(driver.leases.calls.get(), 1);

        driver.stop().unwrap();
        driver.get_ip().unwrap();
        assert_eq!(driver.leases.calls.get(), 2);

        driver.config.vmnet = false;
        driver.stop().unwrap();
        assert!(matches!(driver.get_ip(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_create_prepares_disk() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.raw");
        std::fs::write(&source, b"disk").unwrap();

        let store = dir.path().join("store");
        let mut driver = driver(&store);
        assert!(driver.create().is_err());

        driver.config.image_source_path = Some(source);
        driver.create().unwrap();
        assert_eq!(std::fs::read(store.join("fedora.img")).unwrap(), b"disk");
    }

    #[test]
    fn test_missing_backend_override() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = driver(dir.path());
        driver.config.backend_path = Some(dir.path().join("vfkit"));
        // spawn fails, nothing is left behind
        assert!(matches!(driver.start(), Err(Error::Process(_))));
        assert!(!dir.path().join("vfkit.pid").exists());
    }
}
