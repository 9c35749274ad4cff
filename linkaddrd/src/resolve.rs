// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Turn a switch port description into a pair of point-to-point addresses.
//!
//! The switch advertises its own address on the link in the LLDP Port
//! Description TLV, as the second whitespace separated token, e.g.
//! `"no-alert 10.210.8.122/30"`.  The host takes the other usable address of
//! that /30, found by flipping the two low bits of the last octet.

use std::net::Ipv4Addr;

use common::Ipv4Cidr;

use crate::errors::LinkaddrdError;
use crate::types::LinkaddrdResult;
use crate::types::P2P_PREFIX_LEN;

/// Returns `(peer, local)`.
pub fn resolve(port_description: &str) -> LinkaddrdResult<(Ipv4Addr, Ipv4Addr)> {
    let tokens: Vec<&str> = port_description.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err(LinkaddrdError::Resolve(format!(
            "port description \"{port_description}\" has no address field"
        )));
    }

    let cidr: Ipv4Cidr = tokens[1].parse().map_err(|e| {
        LinkaddrdError::Resolve(format!(
            "failed to parse \"{}\" as an IPv4 CIDR: {e}",
            tokens[1]
        ))
    })?;
    if cidr.prefix_len != P2P_PREFIX_LEN {
        return Err(LinkaddrdError::Resolve(format!(
            "expected a /{P2P_PREFIX_LEN} network, found /{}",
            cidr.prefix_len
        )));
    }

    let peer = cidr.prefix;
    let mut octets = peer.octets();
    octets[3] ^= 0x03;
    Ok((peer, Ipv4Addr::from(octets)))
}
