//! Guest IP discovery from the host DHCP server's lease database.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use log::*;

use crate::devices::MacAddress;
use crate::retry::{Attempt, CancelToken, Clock, RetryPolicy};
use crate::{Error, Result};

/// Lease database of the macOS bootpd server.
pub const DHCPD_LEASES_PATH: &str = "/var/db/dhcpd_leases";

pub const DEFAULT_IP_POLICY: RetryPolicy =
    RetryPolicy::new(60, std::time::Duration::from_secs(2));

pub trait LeaseSource {
    /// [`Error::LeaseNotFound`] while no lease exists for `mac` yet.
    fn lookup(&self, mac: &MacAddress) -> Result<Ipv4Addr>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Lease {
    pub name: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    /// Hardware address without the `1,` type prefix, as bootpd writes it.
    pub hw_address: Option<String>,
}

/// The `dhcpd_leases` file: a sequence of `{ key=value ... }` blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpdLeasesFile {
    path: PathBuf,
}

impl Default for DhcpdLeasesFile {
    fn default() -> Self {
        Self::new(DHCPD_LEASES_PATH)
    }
}

impl DhcpdLeasesFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LeaseSource for DhcpdLeasesFile {
    fn lookup(&self, mac: &MacAddress) -> Result<Ipv4Addr> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            // bootpd creates the file on the first lease
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::LeaseNotFound(mac.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        find_lease(&parse_leases(&contents), mac)
            .ok_or_else(|| Error::LeaseNotFound(mac.to_string()))
    }
}

pub fn parse_leases(contents: &str) -> Vec<Lease> {
    let mut leases = Vec::new();
    let mut current: Option<Lease> = None;
    for line in contents.lines().map(str::trim) {
        match line {
            "{" => current = Some(Lease::default()),
            "}" => leases.extend(current.take()),
            _ => {
                let (Some(lease), Some((key, value))) = (current.as_mut(), line.split_once('='))
                else {
                    continue;
                };
                match key {
                    "name" => lease.name = Some(value.to_owned()),
                    "ip_address" => lease.ip_address = value.parse().ok(),
                    "hw_address" => {
                        let hw = value.split_once(',').map_or(value, |(_, hw)| hw);
                        lease.hw_address = Some(hw.to_owned());
                    }
                    _ => (),
                }
            }
        }
    }
    leases
}

/// Newest matching lease wins; bootpd lists the most recent first.
pub fn find_lease(leases: &[Lease], mac: &MacAddress) -> Option<Ipv4Addr> {
    let wanted = mac.to_lease_form();
    leases
        .iter()
        .filter(|lease| {
            lease
                .hw_address
                .as_deref()
                .map_or(false, |hw| hw.eq_ignore_ascii_case(&wanted))
        })
        .find_map(|lease| lease.ip_address)
}

/// Poll `source` for the address leased to `mac`.
///
/// Only [`Error::LeaseNotFound`] is retried; anything else aborts at once.
pub fn resolve_ip<S, C>(
    mac: &MacAddress,
    policy: &RetryPolicy,
    source: &S,
    clock: &C,
    token: &CancelToken,
) -> Result<Ipv4Addr>
where
    S: LeaseSource + ?Sized,
    C: Clock + ?Sized,
{
    let result = policy.run(clock, token, |attempt| match source.lookup(mac) {
        Ok(ip) => Ok(ip),
        Err(e @ Error::LeaseNotFound(_)) => {
            debug!("No lease for {mac} yet ({attempt}/{})", policy.max_attempts);
            Err(Attempt::Retry(e))
        }
        Err(e) => Err(Attempt::Abort(e)),
    });
    match result {
        Ok(ip) => {
            info!("Found IP {ip} for {mac}");
            Ok(ip)
        }
        Err(Error::LeaseNotFound(_)) => {
            let e = Error::IpResolutionTimeout {
                mac: mac.to_string(),
                attempts: policy.max_attempts,
            };
            error!("{e}");
            Err(e)
        }
        Err(e) => Err(e),
    }
}
