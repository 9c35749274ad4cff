// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use common::Ipv4Cidr;
use protocol::MacAddr;

use crate::errors;
use crate::errors::LinkaddrdError;

pub type LinkaddrdResult<T> = Result<T, errors::LinkaddrdError>;

pub const MTU_MIN: u32 = 1500;
pub const MTU_MAX: u32 = 9000;

/// Prefix length of the point-to-point subnet shared with the switch port.
pub const P2P_PREFIX_LEN: u8 = 30;
/// Prefix length of the summary route covering the routed scale-out network.
pub const ROUTED_PREFIX_LEN: u8 = 16;

/// Force a requested MTU into the range the scale-out NICs accept.
pub fn clamp_mtu(mtu: u32) -> u32 {
    mtu.clamp(MTU_MIN, MTU_MAX)
}

/// Whether links are only brought up (L2) or also addressed from LLDP (L3).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Mode {
    L2,
    #[default]
    L3,
}

impl FromStr for Mode {
    type Err = LinkaddrdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(Mode::L2),
            "L3" => Ok(Mode::L3),
            _ => Err(LinkaddrdError::Invalid(format!("unknown mode: {s}"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::L2 => write!(f, "L2"),
            Mode::L3 => write!(f, "L3"),
        }
    }
}

/// A point-in-time view of an OS network link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
    /// Administratively up (IFF_UP)
    pub up: bool,
    pub mtu: u32,
}

/// Everything tracked about one managed interface over a single run.
#[derive(Clone, Debug)]
pub struct InterfaceRecord {
    pub link: Link,
    /// Admin state before we touched the link
    pub orig_up: bool,
    /// Set while waiting for the kernel to confirm an up/down request
    pub expect_ack: bool,
    /// Addresses from before the run could not all be removed
    pub stale_addrs: bool,
    pub port_description: String,
    pub peer_addr: Option<Ipv4Addr>,
    pub local_addr: Option<Ipv4Addr>,
    pub peer_mac: Option<MacAddr>,
    pub local_mac: Option<MacAddr>,
}

impl InterfaceRecord {
    pub fn new(link: Link) -> Self {
        InterfaceRecord {
            orig_up: link.up,
            local_mac: link.mac,
            link,
            expect_ack: false,
            stale_addrs: false,
            port_description: String::new(),
            peer_addr: None,
            local_addr: None,
            peer_mac: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// The local /30 address, if discovery produced one.
    pub fn local_cidr(&self) -> Option<Ipv4Cidr> {
        self.local_addr.map(|prefix| Ipv4Cidr {
            prefix,
            prefix_len: P2P_PREFIX_LEN,
        })
    }
}

/// What the discovery client learned from the first LLDPDU seen on a link.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryResult {
    pub name: String,
    pub error: Option<String>,
    pub system_name: Option<String>,
    pub system_description: Option<String>,
    pub port_description: String,
    pub peer_mac: Option<MacAddr>,
    pub received: Option<DateTime<Utc>>,
}

/// An IPv4 route to be installed through the link state adapter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Route {
    pub link_index: u32,
    pub destination: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub pref_source: Option<Ipv4Addr>,
    pub scope: u8,
    pub protocol: u8,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if let Some(src) = self.pref_source {
            write!(f, " src {src}")?;
        }
        write!(f, " proto {} scope {}", self.protocol, self.scope)
    }
}

#[test]
fn test_clamp_mtu() {
    assert_eq!(clamp_mtu(1200), 1500);
    assert_eq!(clamp_mtu(12000), 9000);
    assert_eq!(clamp_mtu(4000), 4000);
    assert_eq!(clamp_mtu(1500), 1500);
    assert_eq!(clamp_mtu(9000), 9000);
}

#[test]
fn test_mode_parse() {
    assert_eq!("L2".parse::<Mode>().unwrap(), Mode::L2);
    assert_eq!("l3".parse::<Mode>().unwrap(), Mode::L3);
    assert!("L4".parse::<Mode>().is_err());
    assert_eq!(Mode::default(), Mode::L3);
}
