use std::fmt;
use std::path::{Path, PathBuf};

use log::*;

use super::{missing_option, unknown_option, DeviceOption, VirtioDevice, VIRTIO_BLK};
use crate::vm::ConfigBuilder;
use crate::Result;

/// Disk image exposed to the guest as a virtio block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    image_path: PathBuf,
}

impl BlockDevice {
    pub fn new<P: AsRef<Path>>(image_path: P) -> Result<Self> {
        let dev = Self {
            image_path: image_path.as_ref().to_path_buf(),
        };
        dev.validate()?;
        Ok(dev)
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }
}

impl VirtioDevice for BlockDevice {
    const KIND: &'static str = VIRTIO_BLK;

    fn from_options(options: &[DeviceOption]) -> Result<Self> {
        let mut image_path = PathBuf::new();
        for option in options {
            match option.key.as_str() {
                "path" => image_path = PathBuf::from(&option.value),
                _ => return Err(unknown_option(Self::KIND, &option.key)),
            }
        }
        Self::new(image_path)
    }

    fn validate(&self) -> Result<()> {
        if self.image_path.as_os_str().is_empty() {
            return Err(missing_option(Self::KIND, "path"));
        }
        Ok(())
    }

    fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        info!("Adding virtio-blk device (imagePath: {:?})", self.image_path);
        builder.add_storage_device(&self.image_path)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},path={}", Self::KIND, self.image_path.display())
    }
}
