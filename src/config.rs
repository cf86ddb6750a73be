//! Validation of the resource spec into typed configuration
//!
//! [`UpfConfig::from_spec`] is the configuration provider of every pass. It
//! reports every invalid field at once so the user can fix them in one edit.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::crd::UserPlaneFunctionSpec;
use crate::{Error, Result};

/// Smallest accepted interface MTU
pub const MIN_MTU: u32 = 1200;

/// Largest accepted interface MTU
pub const MAX_MTU: u32 = 65535;

/// CNI plugin backing the secondary networks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CniType {
    /// Linux bridge (`access-br` / `core-br` unless a host interface is set)
    Bridge,
    /// macvlan on a host interface
    Macvlan,
    /// Move a host interface into the pod
    HostDevice,
    /// SR-IOV VF plumbing used in DPDK mode
    Vfioveth,
}

impl CniType {
    /// CNI `type` value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Macvlan => "macvlan",
            Self::HostDevice => "host-device",
            Self::Vfioveth => "vfioveth",
        }
    }
}

impl FromStr for CniType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(Self::Bridge),
            "macvlan" => Ok(Self::Macvlan),
            "host-device" => Ok(Self::HostDevice),
            "vfioveth" => Ok(Self::Vfioveth),
            other => Err(format!("unknown CNI type: {}", other)),
        }
    }
}

impl fmt::Display for CniType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet I/O mode of the forwarder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpfMode {
    /// Kernel AF_PACKET sockets
    AfPacket,
    /// DPDK with SR-IOV VFs and 1Gi HugePages
    Dpdk,
}

impl UpfMode {
    /// Value written to the `mode` field of the configuration document
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AfPacket => "af_packet",
            Self::Dpdk => "dpdk",
        }
    }
}

impl FromStr for UpfMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "af_packet" => Ok(Self::AfPacket),
            "dpdk" => Ok(Self::Dpdk),
            other => Err(format!("unknown UPF mode: {}", other)),
        }
    }
}

impl fmt::Display for UpfMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address with a prefix length, host bits preserved
///
/// `192.168.252.3/24` stays `192.168.252.3/24`: the same type carries both
/// interface addresses and subnets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpCidr {
    address: IpAddr,
    prefix: u8,
}

impl IpCidr {
    /// The address part
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// The prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The same prefix with host bits cleared, as the kernel prints routes
    pub fn network(&self) -> IpCidr {
        let address = match self.address {
            IpAddr::V4(v4) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                IpAddr::V4((u32::from(v4) & mask).into())
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                IpAddr::V6((u128::from(v6) & mask).into())
            }
        };
        IpCidr {
            address,
            prefix: self.prefix,
        }
    }
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let address: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid IP address: {}", addr))?;
        let max = if address.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid prefix length: {}", p))?,
            None => max,
        };
        Ok(Self { address, prefix })
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// A colon-separated 48-bit MAC address, normalized to lower case
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacAddress(String);

impl MacAddress {
    /// The normalized textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let octets: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(format!("invalid MAC address: {}", s));
        }
        Ok(Self(octets.join(":").to_ascii_lowercase()))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Settings of one secondary network, access or core
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Host interface backing the network, if any
    pub host_interface: Option<String>,
    /// Address assigned inside the pod
    pub ip: IpCidr,
    /// Gateway on this network
    pub gateway: IpAddr,
    /// Optional MTU
    pub mtu: Option<u32>,
    /// MAC address, always present in DPDK mode
    pub mac: Option<MacAddress>,
}

/// Validated configuration of one user-plane instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpfConfig {
    /// CNI plugin for both networks
    pub cni_type: CniType,
    /// Forwarder I/O mode
    pub upf_mode: UpfMode,
    /// Data network name
    pub dnn: String,
    /// gNodeB subnet
    pub gnb_subnet: IpCidr,
    /// Access (N3) network
    pub access: InterfaceConfig,
    /// Core (N6) network
    pub core: InterfaceConfig,
    /// Externally advertised N4 hostname
    pub external_upf_hostname: Option<String>,
    /// Hardware checksum offload
    pub enable_hw_checksum: bool,
}

/// Collects `(field, parse result)` pairs and remembers which fields failed
#[derive(Default)]
struct FieldErrors(Vec<&'static str>);

impl FieldErrors {
    fn check<T, E>(&mut self, field: &'static str, result: std::result::Result<T, E>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(_) => {
                self.0.push(field);
                None
            }
        }
    }

    fn parse<T: FromStr>(&mut self, field: &'static str, raw: &str) -> Option<T> {
        self.check(field, raw.trim().parse::<T>())
    }

    fn parse_opt<T: FromStr>(&mut self, field: &'static str, raw: Option<&str>) -> Option<Option<T>> {
        match non_empty(raw) {
            None => Some(None),
            Some(v) => self.parse(field, v).map(Some),
        }
    }

    fn mtu(&mut self, field: &'static str, raw: Option<u32>) -> Option<Option<u32>> {
        match raw {
            Some(m) if !(MIN_MTU..=MAX_MTU).contains(&m) => {
                self.0.push(field);
                None
            }
            other => Some(other),
        }
    }
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

impl UpfConfig {
    /// Validate a spec into typed configuration.
    ///
    /// Returns [`Error::ConfigInvalid`] naming every offending field.
    pub fn from_spec(spec: &UserPlaneFunctionSpec) -> Result<Self> {
        let mut errs = FieldErrors::default();

        let cni_type = errs.parse::<CniType>("cniType", &spec.cni_type);
        let upf_mode = errs.parse::<UpfMode>("upfMode", &spec.upf_mode);
        let dnn = if spec.dnn.trim().is_empty() {
            errs.0.push("dnn");
            None
        } else {
            Some(spec.dnn.trim().to_string())
        };
        let gnb_subnet = errs.parse::<IpCidr>("gnbSubnet", &spec.gnb_subnet);

        let access_ip = errs.parse::<IpCidr>("accessIp", &spec.access_ip);
        let access_gateway = errs.parse::<IpAddr>("accessGatewayIp", &spec.access_gateway_ip);
        let access_mtu = errs.mtu("accessInterfaceMtuSize", spec.access_interface_mtu_size);
        let access_mac = errs.parse_opt::<MacAddress>(
            "accessInterfaceMacAddress",
            spec.access_interface_mac_address.as_deref(),
        );

        let core_ip = errs.parse::<IpCidr>("coreIp", &spec.core_ip);
        let core_gateway = errs.parse::<IpAddr>("coreGatewayIp", &spec.core_gateway_ip);
        let core_mtu = errs.mtu("coreInterfaceMtuSize", spec.core_interface_mtu_size);
        let core_mac = errs.parse_opt::<MacAddress>(
            "coreInterfaceMacAddress",
            spec.core_interface_mac_address.as_deref(),
        );

        if upf_mode == Some(UpfMode::Dpdk) {
            if matches!(access_mac, Some(None)) {
                errs.0.push("accessInterfaceMacAddress");
            }
            if matches!(core_mac, Some(None)) {
                errs.0.push("coreInterfaceMacAddress");
            }
        }

        match (
            cni_type,
            upf_mode,
            dnn,
            gnb_subnet,
            access_ip,
            access_gateway,
            access_mtu,
            access_mac,
            core_ip,
            core_gateway,
            core_mtu,
            core_mac,
        ) {
            (
                Some(cni_type),
                Some(upf_mode),
                Some(dnn),
                Some(gnb_subnet),
                Some(access_ip),
                Some(access_gateway),
                Some(access_mtu),
                Some(access_mac),
                Some(core_ip),
                Some(core_gateway),
                Some(core_mtu),
                Some(core_mac),
            ) if errs.0.is_empty() => Ok(Self {
                cni_type,
                upf_mode,
                dnn,
                gnb_subnet,
                access: InterfaceConfig {
                    host_interface: non_empty(Some(spec.access_interface.as_str())).map(str::to_string),
                    ip: access_ip,
                    gateway: access_gateway,
                    mtu: access_mtu,
                    mac: access_mac,
                },
                core: InterfaceConfig {
                    host_interface: non_empty(Some(spec.core_interface.as_str())).map(str::to_string),
                    ip: core_ip,
                    gateway: core_gateway,
                    mtu: core_mtu,
                    mac: core_mac,
                },
                external_upf_hostname: non_empty(spec.external_upf_hostname.as_deref())
                    .map(str::to_string),
                enable_hw_checksum: spec.enable_hw_checksum,
            }),
            _ => Err(Error::config_invalid(errs.0)),
        }
    }

    /// Whether the forwarder runs on 1Gi HugePages
    pub fn hugepages_enabled(&self) -> bool {
        self.upf_mode == UpfMode::Dpdk
    }

    /// The N3 address advertised to the control plane
    pub fn n3_address(&self) -> IpAddr {
        self.access.ip.address()
    }
}
