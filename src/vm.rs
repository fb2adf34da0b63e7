//! Backend configuration for the vfkit hypervisor.
//!
//! [`ConfigBuilder`] is the narrow surface device descriptors attach
//! themselves to. [`VirtualMachine`] implements it and flattens the result
//! into the vfkit command line.

use std::path::{Path, PathBuf};

use log::*;

use crate::devices::{
    BlockDevice, DeviceDescriptor, EntropyDevice, MacAddress, NetworkDevice,
    SerialConsoleDevice, VsockDevice,
};
use crate::{Error, Result};

/// Index of a network attachment inside a configuration.
pub type NetworkAttachment = usize;

pub trait ConfigBuilder {
    fn add_storage_device(&mut self, image_path: &Path) -> Result<()>;

    fn add_nat_network_device(&mut self) -> Result<NetworkAttachment>;

    fn set_mac_address(&mut self, attachment: NetworkAttachment, mac: MacAddress) -> Result<()>;

    fn add_entropy_device(&mut self) -> Result<()>;

    fn add_serial_console(&mut self, log_file_path: &Path) -> Result<()>;

    fn add_vsock_device(&mut self, port: Option<u32>, socket_url: Option<&str>) -> Result<()>;

    /// Cross-device consistency checks, run once every device is attached.
    fn validate(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootloader {
    pub vmlinuz_path: PathBuf,
    pub kernel_cmdline: String,
    pub initrd_path: PathBuf,
}

impl Bootloader {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        vmlinuz_path: P,
        kernel_cmdline: &str,
        initrd_path: Q,
    ) -> Self {
        Self {
            vmlinuz_path: vmlinuz_path.as_ref().to_path_buf(),
            kernel_cmdline: kernel_cmdline.to_owned(),
            initrd_path: initrd_path.as_ref().to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attachment {
    Storage(PathBuf),
    Network(Option<MacAddress>),
    Entropy,
    SerialConsole(PathBuf),
    Vsock {
        port: Option<u32>,
        socket_url: Option<String>,
    },
}

/// vfkit virtual machine description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachine {
    vcpus: u32,
    memory_mib: u64,
    bootloader: Bootloader,
    devices: Vec<Attachment>,
}

impl VirtualMachine {
    pub fn new(vcpus: u32, memory_mib: u64, bootloader: Bootloader) -> Self {
        Self {
            vcpus,
            memory_mib,
            bootloader,
            devices: Vec::new(),
        }
    }

    pub fn vcpus(&self) -> u32 {
        self.vcpus
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_mib
    }

    pub fn bootloader(&self) -> &Bootloader {
        &self.bootloader
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Device specifications in attachment order, as passed to `--device`.
    pub fn device_specs(&self) -> Result<Vec<String>> {
        self.devices.iter().map(render).collect()
    }

    /// Flattened vfkit argument list. Fails if the configuration is invalid.
    pub fn to_cmdline(&self) -> Result<Vec<String>> {
        self.validate()?;

        let mut args = vec![
            "--cpus".to_string(),
            self.vcpus.to_string(),
            "--memory".to_string(),
            self.memory_mib.to_string(),
            "--kernel".to_string(),
            self.bootloader.vmlinuz_path.display().to_string(),
            "--initrd".to_string(),
            self.bootloader.initrd_path.display().to_string(),
            "--kernel-cmdline".to_string(),
            self.bootloader.kernel_cmdline.clone(),
        ];
        for spec in self.device_specs()? {
            args.push("--device".to_string());
            args.push(spec);
        }
        Ok(args)
    }
}

fn render(attachment: &Attachment) -> Result<String> {
    let descriptor: DeviceDescriptor = match attachment {
        Attachment::Storage(path) => BlockDevice::new(path)?.into(),
        Attachment::Network(mac) => {
            let mac = mac.ok_or_else(|| invalid("network attachment without a MAC address"))?;
            NetworkDevice::nat(Some(mac)).into()
        }
        Attachment::Entropy => EntropyDevice.into(),
        Attachment::SerialConsole(path) => SerialConsoleDevice::new(path)?.into(),
        Attachment::Vsock { port, socket_url } => {
            VsockDevice::new(*port, socket_url.clone()).into()
        }
    };
    Ok(descriptor.to_string())
}

fn invalid(msg: &str) -> Error {
    error!("Invalid virtual machine configuration: {msg}");
    Error::InvalidConfiguration(msg.to_owned())
}

impl ConfigBuilder for VirtualMachine {
    fn add_storage_device(&mut self, image_path: &Path) -> Result<()> {
        self.devices.push(Attachment::Storage(image_path.to_path_buf()));
        Ok(())
    }

    fn add_nat_network_device(&mut self) -> Result<NetworkAttachment> {
        self.devices.push(Attachment::Network(None));
        Ok(self.devices.len() - 1)
    }

    fn set_mac_address(&mut self, attachment: NetworkAttachment, mac: MacAddress) -> Result<()> {
        match self.devices.get_mut(attachment) {
            Some(Attachment::Network(slot)) => {
                *slot = Some(mac);
                Ok(())
            }
            _ => Err(invalid(&format!("no network attachment at index {attachment}"))),
        }
    }

    fn add_entropy_device(&mut self) -> Result<()> {
        self.devices.push(Attachment::Entropy);
        Ok(())
    }

    fn add_serial_console(&mut self, log_file_path: &Path) -> Result<()> {
        self.devices
            .push(Attachment::SerialConsole(log_file_path.to_path_buf()));
        Ok(())
    }

    fn add_vsock_device(&mut self, port: Option<u32>, socket_url: Option<&str>) -> Result<()> {
        self.devices.push(Attachment::Vsock {
            port,
            socket_url: socket_url.map(str::to_owned),
        });
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.vcpus == 0 {
            return Err(invalid("at least one vCPU is required"));
        }
        if self.memory_mib == 0 {
            return Err(invalid("memory size must be non-zero"));
        }
        if self.bootloader.vmlinuz_path.as_os_str().is_empty() {
            return Err(invalid("missing kernel path"));
        }
        if self.bootloader.initrd_path.as_os_str().is_empty() {
            return Err(invalid("missing initrd path"));
        }

        let mut storage = 0;
        let mut consoles = 0;
        for device in &self.devices {
            match device {
                Attachment::Storage(_) => storage += 1,
                Attachment::SerialConsole(_) => consoles += 1,
                Attachment::Network(None) => {
                    return Err(invalid("network attachment without a MAC address"))
                }
                Attachment::Network(Some(_)) | Attachment::Entropy | Attachment::Vsock { .. } => {}
            }
        }
        if storage == 0 {
            return Err(invalid("no boot disk, at least one virtio-blk device is required"));
        }
        if consoles > 1 {
            return Err(invalid("only one virtio-serial console is supported"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::{Bootloader, ConfigBuilder, VirtualMachine};
    use crate::devices::{apply, devices_from_cmdline, MacAddress};
    use crate::Error;

    fn machine() -> VirtualMachine {
        VirtualMachine::new(
            2,
            2048,
            Bootloader::new("/vm/vmlinuz", "console=hvc0 root=/dev/vda4", "/vm/initrd"),
        )
    }

    #[test]
    fn test_cmdline_keeps_device_order() {
        let specs = [
            "virtio-serial,logFilePath=/vm/vm.log",
            "virtio-net,nat,mac=52:54:00:70:2b:79",
            "virtio-rng",
            "virtio-blk,path=/vm/disk.img",
            "virtio-vsock,port=1024,socketURL=/vm/vsock.sock",
        ];
        let devices = devices_from_cmdline(&specs).unwrap();
        let mut vm = machine();
        apply(&devices, &mut vm).unwrap();
        assert_eq!(vm.vcpus(), 2);
        assert_eq!(vm.memory_mib(), 2048);
        assert_eq!(vm.bootloader().vmlinuz_path, Path::new("/vm/vmlinuz"));
        assert_eq!(vm.device_count(), specs.len());

        let args = vm.to_cmdline().unwrap();
        assert_eq!(
            &args[..10],
            &[
                "--cpus",
                "2",
                "--memory",
                "2048",
                "--kernel",
                "/vm/vmlinuz",
                "--initrd",
                "/vm/initrd",
                "--kernel-cmdline",
                "console=hvc0 root=/dev/vda4"
            ]
        );
        let rendered: Vec<&str> = args[10..]
            .chunks(2)
            .map(|pair| {
                assert_eq!(pair[0], "--device");
                pair[1].as_str()
            })
            .collect();
        assert_eq!(rendered, specs);
    }

    #[test]
    fn test_validate_requires_boot_disk() {
        let devices = devices_from_cmdline(&["virtio-rng"]).unwrap();
        let mut vm = machine();
        apply(&devices, &mut vm).unwrap();
        assert!(matches!(vm.validate(), Err(Error::InvalidConfiguration(_))));
        assert!(vm.to_cmdline().is_err());
    }

    #[test]
    fn test_validate_single_console() {
        let devices = devices_from_cmdline(&[
            "virtio-blk,path=/vm/disk.img",
            "virtio-serial,logFilePath=/vm/a.log",
            "virtio-serial,logFilePath=/vm/b.log",
        ])
        .unwrap();
        let mut vm = machine();
        apply(&devices, &mut vm).unwrap();
        assert!(vm.validate().is_err());
    }

    #[test]
    fn test_network_needs_mac() {
        let mut vm = machine();
        vm.add_storage_device(Path::new("/vm/disk.img")).unwrap();
        let attachment = vm.add_nat_network_device().unwrap();
        assert!(vm.validate().is_err());

        let mac: MacAddress = "52:54:00:70:2b:79".parse().unwrap();
        vm.set_mac_address(attachment, mac).unwrap();
        vm.validate().unwrap();

        // index 0 is the disk, not a network attachment
        assert!(vm.set_mac_address(0, mac).is_err());
    }

    #[test]
    fn test_bootloader_required() {
        let mut vm = VirtualMachine::new(1, 512, Bootloader::new("", "", "/vm/initrd"));
        vm.add_storage_device(Path::new("/vm/disk.img")).unwrap();
        assert!(vm.validate().is_err());
    }
}
