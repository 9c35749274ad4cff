// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use camino::Utf8Path;
use camino::Utf8PathBuf;
use slog::debug;
use slog::warn;

const DRIVER_PATH: &str = "bus/pci/drivers/habanalabs";
const PCI_DEVICE_PATTERN: &str = "????:??:??.?";
const NET_DEVICE_PATTERN: &str = "net/*";

/// Finds the network interfaces backed by devices bound to the accelerator's
/// PCI driver.
pub struct Enumerator {
    log: slog::Logger,
    root: Utf8PathBuf,
}

impl Enumerator {
    pub fn new(log: &slog::Logger, root: impl AsRef<Utf8Path>) -> Self {
        Enumerator {
            log: log.new(slog::o!("unit" => "enumerate")),
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn driver_path(&self) -> Utf8PathBuf {
        self.root.join(DRIVER_PATH)
    }

    /// Walk the driver's binding directory.  Nothing here is fatal: a host
    /// without the driver loaded simply has no interfaces to offer.
    pub fn interfaces(&self) -> Vec<String> {
        let mut found = Vec::new();

        let pattern = self.driver_path().join(PCI_DEVICE_PATTERN);
        let paths = match glob::glob(pattern.as_str()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(self.log, "no PCI devices found: {e}");
                return found;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(self.log, "unreadable PCI device entry: {e}");
                    continue;
                }
            };
            let device = match std::fs::canonicalize(&path) {
                Ok(device) => device,
                Err(e) => {
                    warn!(self.log, "expected {} to be a symlink: {e}",
                        path.display());
                    continue;
                }
            };

            let net_pattern = device.join(NET_DEVICE_PATTERN);
            let Some(net_pattern) = net_pattern.to_str() else {
                warn!(self.log, "non-utf8 device path {}", device.display());
                continue;
            };
            let netdevs = match glob::glob(net_pattern) {
                Ok(netdevs) => netdevs,
                Err(e) => {
                    warn!(self.log, "could not find network devices: {e}");
                    continue;
                }
            };
            for netdev in netdevs.flatten() {
                if let Some(name) = netdev.file_name().and_then(|n| n.to_str())
                {
                    debug!(self.log, "found interface";
                        "iface" => name, "device" => device.display().to_string());
                    found.push(name.to_string());
                }
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn root_of(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    fn add_device(root: &Utf8Path, pci: &str, netdevs: &[&str]) {
        let device = root.join("bus/pci/devices").join(pci);
        for n in netdevs {
            fs::create_dir_all(device.join("net").join(n)).unwrap();
        }
        fs::create_dir_all(device.join("driver")).unwrap();
        let drivers = root.join(DRIVER_PATH);
        fs::create_dir_all(&drivers).unwrap();
        symlink(&device, drivers.join(pci)).unwrap();
    }

    #[test]
    fn test_empty_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let e = Enumerator::new(&common::logging::test_logger(), root_of(&dir));
        assert!(e.interfaces().is_empty());
    }

    #[test]
    fn test_missing_root() {
        let e = Enumerator::new(
            &common::logging::test_logger(),
            "/nonexistent/sysfs/root",
        );
        assert!(e.interfaces().is_empty());
    }

    #[test]
    fn test_populated_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_of(&dir);
        add_device(&root, "0000:33:00.0", &["eth2"]);
        add_device(&root, "0000:34:00.0", &["eth3", "eth4"]);

        // entries in the driver directory that are not devices
        let drivers = root.join(DRIVER_PATH);
        fs::write(drivers.join("bind"), "").unwrap();
        fs::create_dir_all(drivers.join("module")).unwrap();

        let e = Enumerator::new(&common::logging::test_logger(), &root);
        let mut found = e.interfaces();
        found.sort();
        assert_eq!(found, vec!["eth2", "eth3", "eth4"]);
    }

    #[test]
    fn test_device_without_net() {
        let dir = tempfile::tempdir().unwrap();
        let root = root_of(&dir);
        add_device(&root, "0000:33:00.0", &[]);

        let e = Enumerator::new(&common::logging::test_logger(), &root);
        assert!(e.interfaces().is_empty());
    }
}
