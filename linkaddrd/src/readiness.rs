// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Node feature label advertising that the scale-out links are configured.

use std::io::ErrorKind;

use camino::Utf8Path;

use crate::types::LinkaddrdResult;

pub const LABEL: &str = "intel.feature.node.kubernetes.io/gaudi-scale-out=true";

pub fn write(path: &Utf8Path) -> LinkaddrdResult<()> {
    std::fs::write(path, format!("{LABEL}\n"))?;
    Ok(())
}

/// Remove the label.  A label that was never written is not an error.
pub fn remove(path: &Utf8Path) -> LinkaddrdResult<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[test]
fn test_label_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path =
        camino::Utf8PathBuf::try_from(dir.path().join("scale-out.features"))
            .unwrap();

    write(&path).unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "intel.feature.node.kubernetes.io/gaudi-scale-out=true\n"
    );
    remove(&path).unwrap();
    assert!(!path.exists());
    remove(&path).unwrap();
}
