// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fmt;
use std::net::IpAddr;

use anyhow::anyhow;

use crate::macaddr::MacAddr;
use crate::packet::LldpTlv;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// The fields of a received LLDPDU that a host cares about when learning
/// about the switch port on the other end of a cable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lldpdu {
    pub chassis_id: ChassisId,
    pub port_id: PortId,
    pub ttl: u16,
    pub port_description: Option<String>,
    pub system_name: Option<String>,
    pub system_description: Option<String>,
}

impl Lldpdu {
    /// The neighbor's hardware address, if it advertised one.  A Port ID
    /// carrying a MAC address is more specific than the chassis MAC, so it
    /// wins when both are present.
    pub fn peer_mac(&self) -> Option<MacAddr> {
        match (&self.chassis_id, &self.port_id) {
            (_, PortId::MacAddress(mac)) => Some(*mac),
            (ChassisId::MacAddress(mac), _) => Some(*mac),
            _ => None,
        }
    }
}

impl fmt::Display for Lldpdu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Chassis ID: {}", self.chassis_id)?;
        writeln!(f, "Port ID: {}", self.port_id)?;
        writeln!(f, "Time To Live: {} seconds", self.ttl)?;
        if let Some(pd) = &self.port_description {
            writeln!(f, "Port description: {pd}")?;
        }
        if let Some(sn) = &self.system_name {
            writeln!(f, "System name: {sn}")?;
        }
        if let Some(sd) = &self.system_description {
            writeln!(f, "System description: {sd}")?;
        }
        Ok(())
    }
}

impl TryFrom<&Lldpdu> for Vec<LldpTlv> {
    type Error = Error;

    fn try_from(lldpdu: &Lldpdu) -> Result<Self> {
        let mut lldp_data: Vec<LldpTlv> = Vec::new();
        lldp_data.push((&lldpdu.chassis_id).try_into()?);
        lldp_data.push((&lldpdu.port_id).try_into()?);
        lldp_data.push(ttl_to_tlv(lldpdu.ttl));
        if let Some(pd) = &lldpdu.port_description {
            lldp_data.push(string_to_tlv(TlvType::PortDescription, pd)?);
        }
        if let Some(sn) = &lldpdu.system_name {
            lldp_data.push(string_to_tlv(TlvType::SystemName, sn)?);
        }
        if let Some(sd) = &lldpdu.system_description {
            lldp_data.push(string_to_tlv(TlvType::SystemDescription, sd)?);
        }
        lldp_data.push(LldpTlv::new(TlvType::EndOfLLDPDU as u8, &[0u8; 0])?);

        Ok(lldp_data)
    }
}

impl TryFrom<&Vec<LldpTlv>> for Lldpdu {
    type Error = Error;

    fn try_from(data: &Vec<LldpTlv>) -> Result<Self> {
        let cnt = data.len();

        let chassis_id: ChassisId = if cnt >= 1 {
            (&data[0]).try_into()
        } else {
            Err(anyhow!("LLDP packet has no ChassisId"))
        }?;

        let port_id: PortId = if cnt >= 2 {
            (&data[1]).try_into()
        } else {
            Err(anyhow!("LLDP packet has no PortId"))
        }?;

        let ttl = if cnt >= 3 {
            ttl_from_tlv(&data[2])
        } else {
            Err(anyhow!("LLDP packet has no TTL"))
        }?;

        let mut port_description = None;
        let mut system_name = None;
        let mut system_description = None;

        // Capabilities, management addresses and organizationally specific
        // TLVs are well-formed but of no interest here, so they are skipped
        // along with anything unrecognized.
        for tlv in data.iter().skip(3) {
            let Ok(tlv_type) = TlvType::try_from(tlv.lldp_tlv_type) else {
                continue;
            };
            tlv_sanity_check(tlv, tlv_type)?;

            match tlv_type {
                TlvType::EndOfLLDPDU => break,
                TlvType::ChassisId => {
                    return Err(anyhow!("LLDP packet has multiple ChassisId TLVs"))
                }
                TlvType::PortId => {
                    return Err(anyhow!("LLDP packet has multiple PortId TLVs"))
                }
                TlvType::Ttl => {
                    return Err(anyhow!("LLDP packet has multiple TTL TLVs"))
                }
                TlvType::PortDescription => {
                    port_description = optional_string(tlv)
                }
                TlvType::SystemName => system_name = optional_string(tlv),
                TlvType::SystemDescription => {
                    system_description = optional_string(tlv)
                }
                TlvType::SystemCapabilities
                | TlvType::ManagementAddress
                | TlvType::OrganizationallySpecific => {}
            }
        }
        Ok(Lldpdu {
            chassis_id,
            port_id,
            ttl,
            port_description,
            system_name,
            system_description,
        })
    }
}

/// Decode the TLVs following the ethertype of an LLDP frame.
impl TryFrom<&[u8]> for Lldpdu {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        let (hdr, _size) = crate::packet::LldpHdr::parse(data)?;
        Lldpdu::try_from(&hdr.lldp_data)
    }
}

fn tlv_sanity_check(tlv: &LldpTlv, expected_type: TlvType) -> Result<()> {
    let l = tlv.lldp_tlv_octets.len() as u16;

    if tlv.lldp_tlv_type != expected_type as u8 {
        Err(anyhow!("TLV does not have the expected type"))
    } else if tlv.lldp_tlv_size < l {
        Err(anyhow!("TLV payload is larger than expected"))
    } else if tlv.lldp_tlv_size > l {
        Err(anyhow!("TLV payload is smaller than expected"))
    } else {
        Ok(())
    }
}

// IANA Address Family Numbers for the address types we currently support as
// seen in:
// https://www.iana.org/assignments/address-family-numbers/address-family-numbers.xhtml
const IANA_IPV4: u8 = 1;
const IANA_IPV6: u8 = 2;
const IANA_802: u8 = 6;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkAddress {
    IpAddr(IpAddr),
    IEEE802(Vec<u8>),
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkAddress::IpAddr(ip) => write!(f, "{ip}"),
            NetworkAddress::IEEE802(a) => write!(
                f,
                "{}",
                a.iter()
                    .map(|o| format!("{o:02x}"))
                    .collect::<Vec<String>>()
                    .join(":")
            ),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChassisId {
    ChassisComponent(String), // RFC 6993
    InterfaceAlias(String),   // RFC 2863
    PortComponent(String),    // RFC 6993
    MacAddress(MacAddr),
    NetworkAddress(NetworkAddress),
    InterfaceName(String), // RFC 2863
    LocallyAssigned(String),
}

impl fmt::Display for ChassisId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChassisId::ChassisComponent(s) => {
                write!(f, "Chassis Component - {s}")
            }
            ChassisId::InterfaceAlias(s) => write!(f, "Interface Alias- {s}"),
            ChassisId::PortComponent(s) => write!(f, "Port Component - {s}"),
            ChassisId::MacAddress(mac) => write!(f, "Mac Address - {mac}"),
            ChassisId::NetworkAddress(ip) => {
                write!(f, "Network Address - {ip}")
            }
            ChassisId::InterfaceName(s) => write!(f, "Interface Name - {s}"),
            ChassisId::LocallyAssigned(s) => {
                write!(f, "Locally assigned - {s}")
            }
        }
    }
}

// An address is represented as a string of octets, where the first contains
// the IANA registered number for the address type, and the remaining octets
// contain the address itself.
fn addr_to_octets(addr: &NetworkAddress) -> Vec<u8> {
    let mut v = vec![];
    match addr {
        NetworkAddress::IpAddr(IpAddr::V4(ip)) => {
            v.push(IANA_IPV4);
            v.extend(ip.octets())
        }
        NetworkAddress::IpAddr(IpAddr::V6(ip)) => {
            v.push(IANA_IPV6);
            v.extend(ip.octets())
        }
        NetworkAddress::IEEE802(addr) => {
            v.push(IANA_802);
            v.extend(addr)
        }
    }
    v
}

fn addr_from_octets(data: &[u8]) -> Result<NetworkAddress> {
    let Some((family, addr)) = data.split_first() else {
        return Err(anyhow!("address TLV has no payload"));
    };
    match *family {
        IANA_IPV4 => <[u8; 4]>::try_from(addr)
            .map(|a| NetworkAddress::IpAddr(IpAddr::from(a)))
            .map_err(|_| anyhow!("invalid sized IPv4 address in TLV")),
        IANA_IPV6 => <[u8; 16]>::try_from(addr)
            .map(|a| NetworkAddress::IpAddr(IpAddr::from(a)))
            .map_err(|_| anyhow!("invalid sized IPv6 address in TLV")),
        IANA_802 => Ok(NetworkAddress::IEEE802(addr.to_vec())),
        x => Err(anyhow!(
            "unsupported address type {x} in TLV - len {}",
            data.len()
        )),
    }
}

fn mac_from_octets(label: &str, data: &[u8]) -> Result<MacAddr> {
    MacAddr::try_from(data)
        .map_err(|e| anyhow!("invalid mac address in {label}: {e}"))
}

fn id_to_tlv(tlv_type: TlvType, subtype: u8, octets: Vec<u8>) -> Result<LldpTlv> {
    let tlv_size = octets.len() as u16;
    if tlv_size < 1 {
        Err(anyhow!("0-length {tlv_type:?}"))
    } else if tlv_size > 255 {
        Err(anyhow!("{tlv_type:?} exceeds 255 octets"))
    } else {
        let mut lldp_tlv_octets = vec![subtype];
        lldp_tlv_octets.extend(octets);
        Ok(LldpTlv {
            lldp_tlv_type: tlv_type.into(),
            lldp_tlv_size: tlv_size + 1,
            lldp_tlv_octets,
        })
    }
}

impl TryFrom<&ChassisId> for LldpTlv {
    type Error = Error;

    fn try_from(id: &ChassisId) -> Result<Self> {
        let (tlv_subtype, tlv_octets) = match id {
            ChassisId::ChassisComponent(tlvdata) => (
                ChassisIdSubtype::ChassisComponent,
                tlvdata.as_bytes().to_vec(),
            ),
            ChassisId::InterfaceAlias(tlvdata) => (
                ChassisIdSubtype::InterfaceAlias,
                tlvdata.as_bytes().to_vec(),
            ),
            ChassisId::PortComponent(tlvdata) => {
                (ChassisIdSubtype::PortComponent, tlvdata.as_bytes().to_vec())
            }
            ChassisId::MacAddress(mac) => {
                (ChassisIdSubtype::MacAddress, mac.to_vec())
            }
            ChassisId::NetworkAddress(addr) => {
                (ChassisIdSubtype::NetworkAddress, addr_to_octets(addr))
            }
            ChassisId::InterfaceName(tlvdata) => {
                (ChassisIdSubtype::InterfaceName, tlvdata.as_bytes().to_vec())
            }
            ChassisId::LocallyAssigned(tlvdata) => (
                ChassisIdSubtype::LocallyAssigned,
                tlvdata.as_bytes().to_vec(),
            ),
        };
        id_to_tlv(TlvType::ChassisId, tlv_subtype.into(), tlv_octets)
    }
}

impl TryFrom<&LldpTlv> for ChassisId {
    type Error = Error;

    fn try_from(tlv: &LldpTlv) -> Result<Self> {
        tlv_sanity_check(tlv, TlvType::ChassisId)?;
        if tlv.lldp_tlv_size < 2 {
            return Err(anyhow!("ChassisId TLV has no payload"));
        }

        let subtype = ChassisIdSubtype::try_from(tlv.lldp_tlv_octets[0])?;
        let data = &tlv.lldp_tlv_octets[1..];
        match subtype {
            ChassisIdSubtype::Reserved => {
                Err(anyhow!("found ChassisId with Reserved subtype"))
            }
            ChassisIdSubtype::ChassisComponent => {
                Ok(ChassisId::ChassisComponent(string_from_octets(
                    "ChassisId",
                    data,
                )?))
            }
            ChassisIdSubtype::InterfaceAlias => Ok(ChassisId::InterfaceAlias(
                string_from_octets("ChassisId", data)?,
            )),
            ChassisIdSubtype::PortComponent => Ok(ChassisId::PortComponent(
                string_from_octets("ChassisId", data)?,
            )),
            ChassisIdSubtype::MacAddress => {
                Ok(ChassisId::MacAddress(mac_from_octets("ChassisId", data)?))
            }
            ChassisIdSubtype::NetworkAddress => {
                Ok(ChassisId::NetworkAddress(addr_from_octets(data)?))
            }
            ChassisIdSubtype::InterfaceName => Ok(ChassisId::InterfaceName(
                string_from_octets("ChassisId", data)?,
            )),
            ChassisIdSubtype::LocallyAssigned => {
                Ok(ChassisId::LocallyAssigned(string_from_octets(
                    "ChassisId",
                    data,
                )?))
            }
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortId {
    InterfaceAlias(String), // RFC 2863
    PortComponent(String),  //  RFC 6933
    MacAddress(MacAddr),
    NetworkAddress(NetworkAddress),
    InterfaceName(String),  // RFC 2863
    AgentCircuitId(String), // RFC 3046
    LocallyAssigned(String),
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PortId::InterfaceAlias(s) => write!(f, "Interface Alias- {s}"),
            PortId::PortComponent(s) => write!(f, "Port Component - {s}"),
            PortId::MacAddress(mac) => write!(f, "Mac Address - {mac}"),
            PortId::NetworkAddress(ip) => {
                write!(f, "Network Address - {ip}")
            }
            PortId::InterfaceName(s) => write!(f, "Interface Name - {s}"),
            PortId::AgentCircuitId(s) => write!(f, "Agent Circuit ID - {s}"),
            PortId::LocallyAssigned(s) => {
                write!(f, "Locally assigned - {s}")
            }
        }
    }
}

impl TryFrom<&PortId> for LldpTlv {
    type Error = Error;

    fn try_from(id: &PortId) -> Result<Self> {
        let (tlv_subtype, tlv_octets) = match id {
            PortId::InterfaceAlias(tlvdata) => {
                (PortIdSubtype::InterfaceAlias, tlvdata.as_bytes().to_vec())
            }
            PortId::PortComponent(tlvdata) => {
                (PortIdSubtype::PortComponent, tlvdata.as_bytes().to_vec())
            }
            PortId::MacAddress(mac) => {
                (PortIdSubtype::MacAddress, mac.to_vec())
            }
            PortId::NetworkAddress(addr) => {
                (PortIdSubtype::NetworkAddress, addr_to_octets(addr))
            }
            PortId::InterfaceName(tlvdata) => {
                (PortIdSubtype::InterfaceName, tlvdata.as_bytes().to_vec())
            }
            PortId::AgentCircuitId(tlvdata) => {
                (PortIdSubtype::AgentCircuitId, tlvdata.as_bytes().to_vec())
            }
            PortId::LocallyAssigned(tlvdata) => {
                (PortIdSubtype::LocallyAssigned, tlvdata.as_bytes().to_vec())
            }
        };
        id_to_tlv(TlvType::PortId, tlv_subtype.into(), tlv_octets)
    }
}

impl TryFrom<&LldpTlv> for PortId {
    type Error = Error;

    fn try_from(tlv: &LldpTlv) -> Result<Self> {
        tlv_sanity_check(tlv, TlvType::PortId)?;
        if tlv.lldp_tlv_size < 2 {
            return Err(anyhow!("PortId TLV has no payload"));
        }

        let subtype = PortIdSubtype::try_from(tlv.lldp_tlv_octets[0])?;
        let data = &tlv.lldp_tlv_octets[1..];
        match subtype {
            PortIdSubtype::Reserved => {
                Err(anyhow!("found PortId with Reserved subtype"))
            }
            PortIdSubtype::InterfaceAlias => {
                Ok(PortId::InterfaceAlias(string_from_octets("PortId", data)?))
            }
            PortIdSubtype::PortComponent => {
                Ok(PortId::PortComponent(string_from_octets("PortId", data)?))
            }
            PortIdSubtype::MacAddress => {
                Ok(PortId::MacAddress(mac_from_octets("PortId", data)?))
            }
            PortIdSubtype::NetworkAddress => {
                Ok(PortId::NetworkAddress(addr_from_octets(data)?))
            }
            PortIdSubtype::InterfaceName => {
                Ok(PortId::InterfaceName(string_from_octets("PortId", data)?))
            }
            PortIdSubtype::AgentCircuitId => {
                Ok(PortId::AgentCircuitId(string_from_octets("PortId", data)?))
            }
            PortIdSubtype::LocallyAssigned => {
                Ok(PortId::LocallyAssigned(string_from_octets("PortId", data)?))
            }
        }
    }
}

pub fn ttl_to_tlv(ttl: u16) -> LldpTlv {
    LldpTlv {
        lldp_tlv_type: TlvType::Ttl.into(),
        lldp_tlv_size: 2,
        lldp_tlv_octets: vec![(ttl >> 8) as u8, (ttl & 0xff) as u8],
    }
}

pub fn ttl_from_tlv(tlv: &LldpTlv) -> Result<u16> {
    let d = &tlv.lldp_tlv_octets;

    if tlv.lldp_tlv_type != TlvType::Ttl as u8 {
        Err(anyhow!("Not a TTL TLV"))
    } else if tlv.lldp_tlv_size != 2 || d.len() != 2 {
        Err(anyhow!("Invalid size for a TTL TLV"))
    } else {
        Ok((d[0] as u16) << 8 | d[1] as u16)
    }
}

pub fn string_to_tlv(tlv_type: TlvType, data: &str) -> Result<LldpTlv> {
    let lldp_tlv_type = match tlv_type {
        TlvType::PortDescription
        | TlvType::SystemName
        | TlvType::SystemDescription => Ok(tlv_type as u8),
        _ => Err(anyhow!("TLV type doesn't contain string data")),
    }?;

    let lldp_tlv_octets = data.as_bytes().to_vec();
    let lldp_tlv_size = lldp_tlv_octets.len() as u16;
    if lldp_tlv_size < 1 {
        Err(anyhow!("0-length string"))
    } else if lldp_tlv_size > 255 {
        Err(anyhow!("string exceeds 255 octets"))
    } else {
        Ok(LldpTlv {
            lldp_tlv_type,
            lldp_tlv_size,
            lldp_tlv_octets,
        })
    }
}

fn string_from_octets(label: &str, data: &[u8]) -> Result<String> {
    let s = String::from_utf8(data.to_vec())
        .map_err(|_| anyhow!("invalid bytes in {label}"))?;
    if s.is_empty() {
        Err(anyhow!("found empty payload for {label}"))
    } else if s.len() > 255 {
        Err(anyhow!("payload for {label} exceeded 255 characters"))
    } else {
        Ok(s)
    }
}

// An empty or garbled descriptive TLV leaves the field unset rather than
// discarding the whole LLDPDU.
fn optional_string(tlv: &LldpTlv) -> Option<String> {
    string_from_octets("string TLV", &tlv.lldp_tlv_octets).ok()
}

/// TLV Type values as defined in table 8-1
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TlvType {
    EndOfLLDPDU = 0,
    ChassisId,
    PortId,
    Ttl,
    PortDescription,
    SystemName,
    SystemDescription,
    SystemCapabilities,
    ManagementAddress,
    OrganizationallySpecific = 127,
}

impl TryFrom<u8> for TlvType {
    type Error = Error;

    fn try_from(t: u8) -> Result<Self> {
        match t {
            0 => Ok(TlvType::EndOfLLDPDU),
            1 => Ok(TlvType::ChassisId),
            2 => Ok(TlvType::PortId),
            3 => Ok(TlvType::Ttl),
            4 => Ok(TlvType::PortDescription),
            5 => Ok(TlvType::SystemName),
            6 => Ok(TlvType::SystemDescription),
            7 => Ok(TlvType::SystemCapabilities),
            8 => Ok(TlvType::ManagementAddress),
            127 => Ok(TlvType::OrganizationallySpecific),
            x => Err(anyhow!("invalid TLV type {x}")),
        }
    }
}

impl From<TlvType> for u8 {
    fn from(x: TlvType) -> u8 {
        x as u8
    }
}

/// Chassis ID Subtype values as defined in table 8-2.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ChassisIdSubtype {
    Reserved = 0,
    ChassisComponent,
    InterfaceAlias,
    PortComponent,
    MacAddress,
    NetworkAddress,
    InterfaceName,
    LocallyAssigned,
}

impl TryFrom<u8> for ChassisIdSubtype {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(ChassisIdSubtype::Reserved),
            1 => Ok(ChassisIdSubtype::ChassisComponent),
            2 => Ok(ChassisIdSubtype::InterfaceAlias),
            3 => Ok(ChassisIdSubtype::PortComponent),
            4 => Ok(ChassisIdSubtype::MacAddress),
            5 => Ok(ChassisIdSubtype::NetworkAddress),
            6 => Ok(ChassisIdSubtype::InterfaceName),
            7 => Ok(ChassisIdSubtype::LocallyAssigned),
            _ => Err(anyhow!("invalid ChassisId subtype")),
        }
    }
}

impl From<ChassisIdSubtype> for u8 {
    fn from(x: ChassisIdSubtype) -> u8 {
        x as u8
    }
}

/// Port ID Subtype values as defined by table 8-3.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PortIdSubtype {
    Reserved = 0,
    InterfaceAlias,
    PortComponent,
    MacAddress,
    NetworkAddress,
    InterfaceName,
    AgentCircuitId,
    LocallyAssigned,
}

impl TryFrom<u8> for PortIdSubtype {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0 => Ok(PortIdSubtype::Reserved),
            1 => Ok(PortIdSubtype::InterfaceAlias),
            2 => Ok(PortIdSubtype::PortComponent),
            3 => Ok(PortIdSubtype::MacAddress),
            4 => Ok(PortIdSubtype::NetworkAddress),
            5 => Ok(PortIdSubtype::InterfaceName),
            6 => Ok(PortIdSubtype::AgentCircuitId),
            7 => Ok(PortIdSubtype::LocallyAssigned),
            _ => Err(anyhow!("invalid PortId subtype")),
        }
    }
}

impl From<PortIdSubtype> for u8 {
    fn from(x: PortIdSubtype) -> u8 {
        x as u8
    }
}
