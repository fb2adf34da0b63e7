use std::fmt;

use log::*;

use super::{
    invalid_value, missing_option, unknown_option, DeviceOption, MacAddress, VirtioDevice,
    VIRTIO_NET,
};
use crate::vm::ConfigBuilder;
use crate::Result;

/// virtio-net device. NAT is the only supported networking mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    nat: bool,
    mac_address: MacAddress,
}

impl NetworkDevice {
    /// NAT attachment with the given MAC, or a random locally administered one.
    pub fn nat(mac_address: Option<MacAddress>) -> Self {
        Self {
            nat: true,
            mac_address: mac_address.unwrap_or_else(MacAddress::random_locally_administered),
        }
    }

    pub fn nat_enabled(&self) -> bool {
        self.nat
    }

    pub fn mac_address(&self) -> &MacAddress {
        &self.mac_address
    }
}

impl VirtioDevice for NetworkDevice {
    const KIND: &'static str = VIRTIO_NET;

    fn from_options(options: &[DeviceOption]) -> Result<Self> {
        let mut nat = false;
        let mut mac_address = None;
        for option in options {
            match option.key.as_str() {
                "nat" => {
                    if !option.value.is_empty() {
                        return Err(invalid_value(
                            Self::KIND,
                            option,
                            "'nat' is a flag and takes no value",
                        ));
                    }
                    nat = true;
                }
                "mac" => {
                    let mac = option
                        .value
                        .parse::<MacAddress>()
                        .map_err(|e| invalid_value(Self::KIND, option, &e.to_string()))?;
                    mac_address = Some(mac);
                }
                _ => return Err(unknown_option(Self::KIND, &option.key)),
            }
        }

        let dev = Self {
            nat,
            mac_address: mac_address.unwrap_or_else(MacAddress::random_locally_administered),
        };
        dev.validate()?;
        Ok(dev)
    }

    fn validate(&self) -> Result<()> {
        if !self.nat {
            return Err(missing_option(Self::KIND, "nat"));
        }
        Ok(())
    }

    fn attach_to<B: ConfigBuilder + ?Sized>(&self, builder: &mut B) -> Result<()> {
        info!(
            "Adding virtio-net device (nat: {} macAddress: [{}])",
            self.nat, self.mac_address
        );
        let attachment = builder.add_nat_network_device()?;
        builder.set_mac_address(attachment, self.mac_address)
    }
}

impl fmt::Display for NetworkDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},nat,mac={}", Self::KIND, self.mac_address)
    }
}
