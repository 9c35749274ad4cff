// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Per-interface systemd-networkd units, so that the addressing survives
//! a restart of the network stack.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use common::Ipv4Cidr;
use slog::debug;
use slog::info;
use slog::warn;

use crate::errors::LinkaddrdError;
use crate::types::InterfaceRecord;
use crate::types::LinkaddrdResult;
use crate::types::P2P_PREFIX_LEN;
use crate::types::ROUTED_PREFIX_LEN;

fn unit_path(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    dir.join(format!("{name}.network"))
}

fn check(name: &str, rec: &InterfaceRecord) -> LinkaddrdResult<()> {
    if rec.local_addr.is_none() {
        return Err(LinkaddrdError::Export(format!(
            "no local address for {name}"
        )));
    }
    if rec.local_mac.is_none() {
        return Err(LinkaddrdError::Export(format!(
            "no local hw address for {name}"
        )));
    }
    Ok(())
}

/// Render the unit for one interface.  The record must already have passed
/// `check()`.
fn unit(name: &str, rec: &InterfaceRecord) -> LinkaddrdResult<String> {
    let (Some(local), Some(mac)) = (rec.local_addr, rec.local_mac) else {
        return Err(LinkaddrdError::Export(format!(
            "incomplete record for {name}"
        )));
    };
    let routed = Ipv4Cidr::new(local, ROUTED_PREFIX_LEN)?.network();

    Ok(format!(
        "[Match]\n\
         MACAddress={mac}\n\
         \n\
         [Network]\n\
         Description=Networkd configuration for {name} created by network-operator\n\
         Address={local}/{P2P_PREFIX_LEN}\n\
         \n\
         [Route]\n\
         Destination={routed}\n"
    ))
}

fn write_unit(
    dir: &Utf8Path,
    name: &str,
    rec: &InterfaceRecord,
) -> LinkaddrdResult<()> {
    let path = unit_path(dir, name);
    let contents = unit(name, rec)?;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&path)
        .and_then(|mut f| f.write_all(contents.as_bytes()))
        .map_err(|e| {
            LinkaddrdError::Export(format!(
                "could not write networkd config file {path}: {e}"
            ))
        })
}

/// Write one `.network` unit per record into `dir`.  Every record is checked
/// before anything is written, and if any write fails the units already
/// written by this call are removed again.  Returns the names of the
/// interfaces that now have a unit.
pub fn write(
    log: &slog::Logger,
    dir: &Utf8Path,
    records: &BTreeMap<String, InterfaceRecord>,
) -> LinkaddrdResult<Vec<String>> {
    for (name, rec) in records {
        check(name, rec)?;
    }

    let mut written = Vec::new();
    for (name, rec) in records {
        if let Err(e) = write_unit(dir, name, rec) {
            warn!(log, "networkd export failed, rolling back";
                "iface" => name, "error" => e.to_string());
            delete(log, dir, &written);
            return Err(e);
        }
        debug!(log, "wrote networkd unit"; "iface" => name);
        written.push(name.clone());
    }
    info!(log, "wrote networkd units"; "dir" => dir.as_str(),
        "count" => written.len());
    Ok(written)
}

/// Remove the units for `names`.  Units that are already gone are ignored.
pub fn delete(log: &slog::Logger, dir: &Utf8Path, names: &[String]) {
    for name in names {
        let path = unit_path(dir, name);
        if std::fs::remove_file(&path).is_ok() {
            debug!(log, "removed networkd unit"; "path" => path.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Link;
    use protocol::MacAddr;
    use std::net::Ipv4Addr;

    fn record(name: &str, local: Option<Ipv4Addr>) -> InterfaceRecord {
        let mut rec = InterfaceRecord::new(Link {
            index: 4,
            name: name.to_string(),
            mac: Some(MacAddr::new(0xb0, 0xfd, 0x0b, 0x00, 0x00, 0x01)),
            up: true,
            mtu: 1500,
        });
        rec.local_addr = local;
        rec
    }

    fn tmpdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_unit_format() {
        let (_tmp, dir) = tmpdir();
        let mut records = BTreeMap::new();
        records.insert(
            "eth2".to_string(),
            record("eth2", Some(Ipv4Addr::new(10, 210, 8, 121))),
        );
        let log = common::logging::test_logger();
        let written = write(&log, &dir, &records).unwrap();
        assert_eq!(written, vec!["eth2".to_string()]);

        let contents = std::fs::read_to_string(dir.join("eth2.network")).unwrap();
        assert_eq!(
            contents,
            "[Match]\n\
             MACAddress=b0:fd:0b:00:00:01\n\
             \n\
             [Network]\n\
             Description=Networkd configuration for eth2 created by network-operator\n\
             Address=10.210.8.121/30\n\
             \n\
             [Route]\n\
             Destination=10.210.0.0/16\n"
        );
    }

    #[test]
    fn test_refuses_incomplete_batch() {
        let (_tmp, dir) = tmpdir();
        let mut records = BTreeMap::new();
        records.insert(
            "eth2".to_string(),
            record("eth2", Some(Ipv4Addr::new(10, 210, 8, 121))),
        );
        records.insert("eth3".to_string(), record("eth3", None));

        let mut no_mac = record("eth4", Some(Ipv4Addr::new(10, 210, 8, 125)));
        no_mac.local_mac = None;
        records.insert("eth4".to_string(), no_mac);

        let log = common::logging::test_logger();
        assert!(write(&log, &dir, &records).is_err());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_rollback_on_write_failure() {
        let (_tmp, dir) = tmpdir();
        // a directory where eth3's unit should go makes that write fail
        std::fs::create_dir(dir.join("eth3.network")).unwrap();

        let mut records = BTreeMap::new();
        records.insert(
            "eth2".to_string(),
            record("eth2", Some(Ipv4Addr::new(10, 210, 8, 121))),
        );
        records.insert(
            "eth3".to_string(),
            record("eth3", Some(Ipv4Addr::new(10, 210, 8, 125))),
        );

        let log = common::logging::test_logger();
        match write(&log, &dir, &records) {
            Err(LinkaddrdError::Export(msg)) => {
                assert!(msg.contains("eth3.network"), "{msg}")
            }
            x => panic!("expected an export error, got {x:?}"),
        }
        assert!(!dir.join("eth2.network").exists());
    }

    #[test]
    fn test_delete() {
        let (_tmp, dir) = tmpdir();
        let mut records = BTreeMap::new();
        records.insert(
            "eth2".to_string(),
            record("eth2", Some(Ipv4Addr::new(10, 210, 8, 121))),
        );
        let log = common::logging::test_logger();
        let written = write(&log, &dir, &records).unwrap();

        let mut names = written.clone();
        names.push("eth9".to_string());
        delete(&log, &dir, &names);
        assert!(!dir.join("eth2.network").exists());
    }
}
