//! Boot disk preparation.
//!
//! vfkit only boots raw disks, so anything else is converted with
//! `qemu-img` into the machine's store directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use log::*;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const QEMU_IMG: &str = "qemu-img";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Raw,
    Qcow2,
    Vmdk,
    Vhdx,
}

impl ImageFormat {
    /// Name as `qemu-img -f` expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhdx => "vhdx",
        }
    }

    /// Guess from the file extension, defaulting to raw.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "img" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vmdk" => Ok(ImageFormat::Vmdk),
            "vhdx" => Ok(ImageFormat::Vhdx),
            _ => {
                let msg = format!("unsupported image format {s:?}");
                error!("{msg}");
                Err(Error::ImageConversion(msg))
            }
        }
    }
}

/// First executable called `bin` in `$PATH`.
pub fn lookup_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

/// Put a raw copy of `source` at `dest`.
///
/// `qemu_img` is only needed for non-raw sources; `None` means look it up
/// in `$PATH`.
pub fn prepare_disk(
    source: &Path,
    format: ImageFormat,
    dest: &Path,
    qemu_img: Option<&Path>,
) -> Result<()> {
    if !source.is_file() {
        let msg = format!("disk image {source:?} does not exist");
        error!("{msg}");
        return Err(Error::ImageConversion(msg));
    }

    match format {
        ImageFormat::Raw if same_file(source, dest) => {
            debug!("Disk image {dest:?} already in place");
            Ok(())
        }
        ImageFormat::Raw => {
            info!("Copying {source:?} to {dest:?}");
            std::fs::copy(source, dest)?;
            Ok(())
        }
        _ => {
            let qemu_img = match qemu_img {
                Some(bin) => bin.to_path_buf(),
                None => lookup_path(QEMU_IMG).ok_or_else(|| {
                    let msg = format!("{QEMU_IMG} not found in $PATH");
                    error!("{msg}");
                    Error::ImageConversion(msg)
                })?,
            };
            convert_to_raw(&qemu_img, source, format, dest)
        }
    }
}

/// `qemu-img convert -f <format> -O raw <source> <dest>`
pub fn convert_to_raw(qemu_img: &Path, source: &Path, format: ImageFormat, dest: &Path) -> Result<()> {
    info!("Converting {source:?} ({format}) to raw {dest:?}");
    let output = Command::new(qemu_img)
        .arg("convert")
        .args(["-f", format.as_str(), "-O", "raw"])
        .arg(source)
        .arg(dest)
        .output()
        .map_err(|e| {
            let msg = format!("fail to run {qemu_img:?}: {e}");
            error!("{msg}");
            Error::ImageConversion(msg)
        })?;

    if !output.status.success() {
        let msg = format!(
            "{qemu_img:?} {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        error!("{msg}");
        return Err(Error::ImageConversion(msg));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
