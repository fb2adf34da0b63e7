//! virtio device specifications.
//!
//! A device is requested on the command line as `<kind>[,<key>=<value>]*`,
//! e.g. `virtio-blk,path=/x.img` or `virtio-net,nat,mac=52:54:00:70:2b:79`.
//! [`parse`] turns one such string into a fully validated
//! [`DeviceDescriptor`] and [`apply`] attaches a list of descriptors to a
//! backend [`ConfigBuilder`] in order.

use std::fmt;
use std::str::FromStr;

use log::*;

use crate::vm::ConfigBuilder;
use crate::{Error, Result};

pub mod block;
pub mod mac;
pub mod net;
pub mod rng;
pub mod serial;
pub mod vsock;

pub use block::BlockDevice;
pub use mac::MacAddress;
pub use net::NetworkDevice;
pub use rng::EntropyDevice;
pub use serial::SerialConsoleDevice;
pub use vsock::VsockDevice;

pub const VIRTIO_BLK: &str = "virtio-blk";
pub const VIRTIO_NET: &str = "virtio-net";
pub const VIRTIO_RNG: &str = "virtio-rng";
pub const VIRTIO_SERIAL: &str = "virtio-serial";
pub const VIRTIO_VSOCK: &str = "virtio-vsock";

/// One `key[=value]` token of a device specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOption {
    pub key: String,
    /// Empty when the token carries no `=`.
    pub value: String,
}

impl From<&str> for DeviceOption {
    fn from(token: &str) -> Self {
        match token.split_once('=') {
            Some((key, value)) => Self {
                key: key.to_owned(),
                value: value.to_owned(),
            },
            None => Self {
                key: token.to_owned(),
                value: String::new(),
            },
        }
    }
}

/// Capability shared by every device variant.
pub trait VirtioDevice: Sized {
    const KIND: &'static str;

    /// Build and validate the device from its options.
    fn from_options(options: &[DeviceOption]) -> Result<Self>;

    fn validate(&self) -> Result<()>;

    /// Emit the builder calls that add this device to a configuration.
    fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()>;
}

/// A validated device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescriptor {
    Block(BlockDevice),
    Network(NetworkDevice),
    Entropy(EntropyDevice),
    SerialConsole(SerialConsoleDevice),
    Vsock(VsockDevice),
}

impl DeviceDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceDescriptor::Block(_) => BlockDevice::KIND,
            DeviceDescriptor::Network(_) => NetworkDevice::KIND,
            DeviceDescriptor::Entropy(_) => EntropyDevice::KIND,
            DeviceDescriptor::SerialConsole(_) => SerialConsoleDevice::KIND,
            DeviceDescriptor::Vsock(_) => VsockDevice::KIND,
        }
    }

    pub fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        match self {
            DeviceDescriptor::Block(dev) => dev.attach_to(builder),
            DeviceDescriptor::Network(dev) => dev.attach_to(builder),
            DeviceDescriptor::Entropy(dev) => dev.attach_to(builder),
            DeviceDescriptor::SerialConsole(dev) => dev.attach_to(builder),
            DeviceDescriptor::Vsock(dev) => dev.attach_to(builder),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDescriptor::Block(dev) => write!(f, "{dev}"),
            DeviceDescriptor::Network(dev) => write!(f, "{dev}"),
            DeviceDescriptor::Entropy(dev) => write!(f, "{dev}"),
            DeviceDescriptor::SerialConsole(dev) => write!(f, "{dev}"),
            DeviceDescriptor::Vsock(dev) => write!(f, "{dev}"),
        }
    }
}

impl FromStr for DeviceDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

impl From<BlockDevice> for DeviceDescriptor {
    fn from(dev: BlockDevice) -> Self {
        DeviceDescriptor::Block(dev)
    }
}

impl From<NetworkDevice> for DeviceDescriptor {
    fn from(dev: NetworkDevice) -> Self {
        DeviceDescriptor::Network(dev)
    }
}

impl From<EntropyDevice> for DeviceDescriptor {
    fn from(dev: EntropyDevice) -> Self {
        DeviceDescriptor::Entropy(dev)
    }
}

impl From<SerialConsoleDevice> for DeviceDescriptor {
    fn from(dev: SerialConsoleDevice) -> Self {
        DeviceDescriptor::SerialConsole(dev)
    }
}

impl From<VsockDevice> for DeviceDescriptor {
    fn from(dev: VsockDevice) -> Self {
        DeviceDescriptor::Vsock(dev)
    }
}

/// Parse one device specification.
pub fn parse(spec: &str) -> Result<DeviceDescriptor> {
    let mut fields = spec.split(',');
    // split always yields at least one field
    let kind = fields.next().unwrap_or_default();
    let options: Vec<DeviceOption> = fields
        .filter(|field| !field.is_empty())
        .map(DeviceOption::from)
        .collect();

    let descriptor = match kind {
        VIRTIO_BLK => BlockDevice::from_options(&options)?.into(),
        VIRTIO_NET => NetworkDevice::from_options(&options)?.into(),
        VIRTIO_RNG => EntropyDevice::from_options(&options)?.into(),
        VIRTIO_SERIAL => SerialConsoleDevice::from_options(&options)?.into(),
        VIRTIO_VSOCK => VsockDevice::from_options(&options)?.into(),
        _ => {
            let msg = format!("Unknown device type in {spec:?}");
            error!("{msg}");
            return Err(Error::UnknownDeviceKind(kind.to_owned()));
        }
    };
    debug!("Parsed device {spec:?} as {descriptor}");
    Ok(descriptor)
}

/// Parse every device specification, failing on the first invalid one.
pub fn devices_from_cmdline<S: AsRef<str>>(specs: &[S]) -> Result<Vec<DeviceDescriptor>> {
    specs.iter().map(|spec| parse(spec.as_ref())).collect()
}

/// Attach `descriptors` to `builder` in input order, stopping at the first
/// failure. The builder's own `validate` is left to the caller.
pub fn apply<B: ConfigBuilder + ?Sized>(
    descriptors: &[DeviceDescriptor],
    builder: &mut B,
) -> Result<()> {
    for descriptor in descriptors {
        descriptor.attach_to(builder)?;
    }
    Ok(())
}

pub(crate) fn unknown_option(kind: &str, key: &str) -> Error {
    let e = Error::UnknownOption {
        kind: kind.to_owned(),
        key: key.to_owned(),
    };
    error!("{e}");
    e
}

pub(crate) fn missing_option(kind: &str, option: &str) -> Error {
    let e = Error::MissingRequiredOption {
        kind: kind.to_owned(),
        option: option.to_owned(),
    };
    error!("{e}");
    e
}

pub(crate) fn invalid_value(kind: &str, option: &DeviceOption, reason: &str) -> Error {
    let e = Error::InvalidOptionValue {
        kind: kind.to_owned(),
        key: option.key.clone(),
        value: option.value.clone(),
        reason: reason.to_owned(),
    };
    error!("{e}");
    e
}
