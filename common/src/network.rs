// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidrError {
    /// Doesn't parse as an IPv4 CIDR
    #[error("Invalid IPv4 CIDR: {}", .0)]
    InvalidIpv4Cidr(String),
}

/// An IPv4 address together with a prefix length.
///
/// The address is kept exactly as written, host bits included, so that
/// `10.210.8.122/30` names both the host `10.210.8.122` and the network it
/// lives on.  Use [`Ipv4Cidr::network`] to get the masked form.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Ipv4Cidr {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(prefix: Ipv4Addr, prefix_len: u8) -> Result<Self, CidrError> {
        if prefix_len > 32 {
            Err(CidrError::InvalidIpv4Cidr(format!(
                "bad prefix len: {prefix_len}"
            )))
        } else {
            Ok(Ipv4Cidr { prefix, prefix_len })
        }
    }

    fn mask_bits(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n)),
        }
    }

    /// The netmask in dotted-quad form, e.g. `255.255.255.252` for a /30.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// The same prefix length with all host bits cleared.
    pub fn network(&self) -> Ipv4Cidr {
        let addr: u32 = self.prefix.into();
        Ipv4Cidr {
            prefix: Ipv4Addr::from(addr & self.mask_bits()),
            prefix_len: self.prefix_len,
        }
    }

    /// Return `true` if the IP address is within the network.
    pub fn contains(&self, ipv4: Ipv4Addr) -> bool {
        let prefix: u32 = self.prefix.into();
        let addr: u32 = ipv4.into();
        let mask = self.mask_bits();

        (addr & mask) == (prefix & mask)
    }
}

impl Ord for Ipv4Cidr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.prefix.cmp(&other.prefix) {
            std::cmp::Ordering::Equal => self.prefix_len.cmp(&other.prefix_len),
            o => o,
        }
    }
}

impl PartialOrd for Ipv4Cidr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, CidrError> {
        let Some((maybe_prefix, maybe_prefix_len)) = s.split_once('/') else {
            return Err(CidrError::InvalidIpv4Cidr(s.to_string()));
        };
        let prefix = maybe_prefix.parse().map_err(|_| {
            CidrError::InvalidIpv4Cidr(format!("bad prefix: {maybe_prefix}"))
        })?;
        let prefix_len = maybe_prefix_len.parse().map_err(|_| {
            CidrError::InvalidIpv4Cidr(format!(
                "bad prefix len: {maybe_prefix_len}"
            ))
        })?;
        Ipv4Cidr::new(prefix, prefix_len)
    }
}
