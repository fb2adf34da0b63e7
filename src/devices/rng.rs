use std::fmt;

use log::*;

use super::{unknown_option, DeviceOption, VirtioDevice, VIRTIO_RNG};
use crate::vm::ConfigBuilder;
use crate::Result;

/// Entropy device. Takes no options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntropyDevice;

impl VirtioDevice for EntropyDevice {
    const KIND: &'static str = VIRTIO_RNG;

    fn from_options(options: &[DeviceOption]) -> Result<Self> {
        if let Some(option) = options.first() {
            return Err(unknown_option(Self::KIND, &option.key));
        }
        Ok(Self)
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        info!("Adding virtio-rng device");
        builder.add_entropy_device()
    }
}

impl fmt::Display for EntropyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::KIND)
    }
}
