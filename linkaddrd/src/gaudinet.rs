// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! The `gaudinet.json` file read by the accelerator's collective
//! communication library to find each NIC's address and next hop.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use camino::Utf8Path;
use serde::Serialize;
use slog::info;
use slog::warn;

use crate::errors::LinkaddrdError;
use crate::types::InterfaceRecord;
use crate::types::LinkaddrdResult;

const P2P_MASK: &str = "255.255.255.252";

#[derive(Debug, Serialize)]
pub struct GaudiNet {
    #[serde(rename = "NIC_NET_CONFIG")]
    pub config: Vec<GaudiNetEntry>,
}

// Key names and their order are consumed verbatim by external tooling.
#[derive(Debug, Serialize)]
pub struct GaudiNetEntry {
    #[serde(rename = "NIC_MAC")]
    pub mac: String,
    #[serde(rename = "NIC_IP")]
    pub ip: String,
    #[serde(rename = "SUBNET_MASK")]
    pub mask: String,
    #[serde(rename = "GATEWAY_MAC")]
    pub gateway_mac: String,
}

pub fn generate(
    log: &slog::Logger,
    records: &BTreeMap<String, InterfaceRecord>,
) -> LinkaddrdResult<Vec<u8>> {
    let mut gaudinet = GaudiNet { config: Vec::new() };

    for (name, rec) in records {
        let Some(local) = rec.local_addr else {
            warn!(log, "no LLDP address for gaudinet entry, skipping";
                "iface" => name);
            continue;
        };
        let Some(peer_mac) = rec.peer_mac else {
            warn!(log, "no peer MAC address for gaudinet entry, skipping";
                "iface" => name);
            continue;
        };
        gaudinet.config.push(GaudiNetEntry {
            mac: rec.local_mac.map(|m| m.to_string()).unwrap_or_default(),
            ip: local.to_string(),
            mask: P2P_MASK.to_string(),
            gateway_mac: peer_mac.to_string(),
        });
    }

    serde_json::to_vec(&gaudinet).map_err(|e| {
        LinkaddrdError::Export(format!("could not serialize gaudinet: {e}"))
    })
}

pub fn write(
    log: &slog::Logger,
    path: &Utf8Path,
    records: &BTreeMap<String, InterfaceRecord>,
) -> LinkaddrdResult<()> {
    if path.as_str().is_empty() {
        return Err(LinkaddrdError::Export(
            "no file name when saving gaudinet.json".to_string(),
        ));
    }
    let contents = generate(log, records)?;

    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o660)
        .open(path)
        .map_err(|e| LinkaddrdError::Export(format!("{path}: {e}")))?;
    f.write_all(&contents)
        .map_err(|e| LinkaddrdError::Export(format!("{path}: {e}")))?;
    info!(log, "wrote gaudinet file"; "path" => path.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InterfaceRecord;
    use crate::types::Link;
    use protocol::MacAddr;
    use std::net::Ipv4Addr;

    fn record(
        name: &str,
        local: Option<Ipv4Addr>,
        peer_mac: Option<MacAddr>,
    ) -> InterfaceRecord {
        let mut rec = InterfaceRecord::new(Link {
            index: 3,
            name: name.to_string(),
            mac: Some(MacAddr::new(0xb0, 0xfd, 0x0b, 0x00, 0x00, 0x01)),
            up: true,
            mtu: 8000,
        });
        rec.local_addr = local;
        rec.peer_mac = peer_mac;
        rec
    }

    #[test]
    fn test_exact_output() {
        let mut records = BTreeMap::new();
        records.insert(
            "eth2".to_string(),
            record(
                "eth2",
                Some(Ipv4Addr::new(10, 210, 8, 121)),
                Some(MacAddr::new(0xb0, 0x8b, 0xd0, 0x01, 0x02, 0x03)),
            ),
        );
        let out = generate(&common::logging::test_logger(), &records).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"NIC_NET_CONFIG":[{"NIC_MAC":"b0:fd:0b:00:00:01","NIC_IP":"10.210.8.121","SUBNET_MASK":"255.255.255.252","GATEWAY_MAC":"b0:8b:d0:01:02:03"}]}"#
        );
    }

    #[test]
    fn test_skips_incomplete() {
        let peer = MacAddr::new(0xb0, 0x8b, 0xd0, 0x01, 0x02, 0x03);
        let mut records = BTreeMap::new();
        records.insert(
            "eth2".to_string(),
            record("eth2", None, Some(peer)),
        );
        records.insert(
            "eth3".to_string(),
            record("eth3", Some(Ipv4Addr::new(10, 0, 0, 2)), None),
        );
        let out = generate(&common::logging::test_logger(), &records).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"NIC_NET_CONFIG":[]}"#);
    }

    #[test]
    fn test_write() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("gaudinet.json"))
            .unwrap();
        let records = BTreeMap::new();
        let log = common::logging::test_logger();
        write(&log, &path, &records).unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"NIC_NET_CONFIG":[]}"#
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o002, 0);

        assert!(write(&log, Utf8Path::new(""), &records).is_err());
    }
}
