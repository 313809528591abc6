//! Pinning the default network of a docker-compose application to a fixed subnet.

use anyhow::{Context, Error};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

/// The network every service is attached to.
pub const DEFAULT_NETWORK: &str = "default";

/// The subnet used when none is given.
pub const DEFAULT_SUBNET: &str = "172.22.0.0/16";

/// An IPv4 subnet in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::new(172, 22, 0, 0),
            prefix: 16,
        }
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::msg(format!("subnet {s} has no prefix length")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|err| Error::msg(format!("invalid address in subnet {s}: {err}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|err| Error::msg(format!("invalid prefix length in subnet {s}: {err}")))?;
        if prefix > 32 {
            return Err(Error::msg(format!(
                "prefix length {prefix} in subnet {s} is longer than 32"
            )));
        }
        if u32::from(addr) & !Self::mask(prefix) != 0 {
            return Err(Error::msg(format!("subnet {s} has host bits set")));
        }
        Ok(Self { addr, prefix })
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Serialize)]
struct Ipam {
    driver: &'static str,
    config: Vec<IpamConfig>,
}

#[derive(Serialize)]
struct IpamConfig {
    subnet: String,
}

/// Pin the default network of `compose` to `subnet` and attach every service to it.
///
/// Other top-level networks are left alone.
///
/// # Returns
///
/// The number of services which were newly attached to the default network.
pub fn pin_subnet(compose: &mut Value, subnet: Subnet) -> Result<usize, Error> {
    let root = compose
        .as_mapping_mut()
        .ok_or_else(|| Error::msg("compose file is not a mapping"))?;

    let ipam = serde_yaml::to_value(Ipam {
        driver: "default",
        config: vec![IpamConfig {
            subnet: subnet.to_string(),
        }],
    })?;
    let mut network = Mapping::new();
    network.insert("ipam".into(), ipam);
    let networks = root
        .entry("networks".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if networks.is_null() {
        *networks = Value::Mapping(Mapping::new());
    }
    networks
        .as_mapping_mut()
        .ok_or_else(|| Error::msg("top-level networks is not a mapping"))?
        .insert(DEFAULT_NETWORK.into(), Value::Mapping(network));

    let services = root
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| Error::msg("compose file has no services"))?;
    let mut attached = 0;
    for (name, service) in services.iter_mut() {
        let name = name.as_str().unwrap_or("<unnamed>");
        let service = service
            .as_mapping_mut()
            .ok_or_else(|| Error::msg(format!("service {name} is not a mapping")))?;
        let networks = service.entry("networks".into()).or_insert(Value::Null);
        if networks.is_null() {
            *networks = Value::Sequence(vec![]);
        }
        let added = match networks {
            Value::Sequence(seq) => {
                if seq.iter().any(|net| net.as_str() == Some(DEFAULT_NETWORK)) {
                    false
                } else {
                    seq.push(DEFAULT_NETWORK.into());
                    true
                }
            }
            Value::Mapping(map) => map.insert(DEFAULT_NETWORK.into(), Value::Null).is_none(),
            _ => {
                return Err(Error::msg(format!(
                    "networks of service {name} is neither a list nor a mapping"
                )))
            }
        };
        if added {
            tracing::debug!("attached service {name} to network {DEFAULT_NETWORK}");
            attached += 1;
        }
    }
    Ok(attached)
}

/// Pin the default network of the compose file at `path` to `subnet`, rewriting it in place.
pub fn update_file(path: impl AsRef<Path>, subnet: Subnet) -> Result<usize, Error> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    let mut compose: Value = serde_yaml::from_str(&text)
        .with_context(|| format!("{} is not valid YAML", path.display()))?;
    let attached = pin_subnet(&mut compose, subnet)?;
    fs::write(path, serde_yaml::to_string(&compose)?)
        .with_context(|| format!("unable to write {}", path.display()))?;
    tracing::info!(
        "{} updated; {attached} services attached to {subnet}",
        path.display()
    );
    Ok(attached)
}
