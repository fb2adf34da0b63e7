use std::fmt;

use log::*;

use super::{invalid_value, unknown_option, DeviceOption, VirtioDevice, VIRTIO_VSOCK};
use crate::vm::ConfigBuilder;
use crate::Result;

/// virtio-vsock device, optionally exposing a guest port on a host socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VsockDevice {
    port: Option<u32>,
    socket_url: Option<String>,
}

impl VsockDevice {
    pub fn new(port: Option<u32>, socket_url: Option<String>) -> Self {
        Self { port, socket_url }
    }

    pub fn port(&self) -> Option<u32> {
        self.port
    }

    pub fn socket_url(&self) -> Option<&str> {
        self.socket_url.as_deref()
    }
}

impl VirtioDevice for VsockDevice {
    const KIND: &'static str = VIRTIO_VSOCK;

    fn from_options(options: &[DeviceOption]) -> Result<Self> {
        let mut dev = Self::default();
        for option in options {
            match option.key.as_str() {
                "socketURL" => dev.socket_url = Some(option.value.clone()),
                "port" => {
                    let port = option
                        .value
                        .parse::<u32>()
                        .map_err(|e| invalid_value(Self::KIND, option, &e.to_string()))?;
                    dev.port = Some(port);
                }
                _ => return Err(unknown_option(Self::KIND, &option.key)),
            }
        }
        dev.validate()?;
        Ok(dev)
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        info!(
            "Adding virtio-vsock device (port: {:?} socketURL: {:?})",
            self.port, self.socket_url
        );
        builder.add_vsock_device(self.port, self.socket_url.as_deref())
    }
}

impl fmt::Display for VsockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::KIND)?;
        if let Some(port) = self.port {
            write!(f, ",port={port}")?;
        }
        if let Some(socket_url) = &self.socket_url {
            write!(f, ",socketURL={socket_url}")?;
        }
        Ok(())
    }
}
