//! Driver running a single virtual machine under the vfkit hypervisor.
//!
//! [`devices`] turns `--device` specifications into typed descriptors,
//! [`vm`] assembles them into a backend configuration, [`supervisor`] runs
//! and tracks the backend process and [`network`] finds the guest address.
//! [`driver::VfDriver`] ties them into the machine lifecycle.

pub mod config;
pub mod devices;
pub mod driver;
mod error;
pub mod image;
pub mod logging;
pub mod network;
pub mod retry;
pub mod supervisor;
pub mod vm;

pub use crate::config::DriverConfig;
pub use crate::driver::{MachineDriver, VfDriver};
pub use crate::error::{Error, Result};
pub use crate::supervisor::{LifecycleState, Supervisor, SupervisorConfig};
