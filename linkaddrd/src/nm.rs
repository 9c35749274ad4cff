// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Keep NetworkManager's hands off the scale-out links.

use std::io::ErrorKind;
use std::process::Output;

use slog::debug;
use slog::info;

use crate::errors::LinkaddrdError;
use crate::types::LinkaddrdResult;

const NMCLI: &str = "nmcli";

pub struct NetworkManager {
    log: slog::Logger,
    program: String,
    base_args: Vec<String>,
}

impl NetworkManager {
    pub fn new(log: &slog::Logger) -> Self {
        Self::with_command(log, NMCLI, &[])
    }

    /// Drive NetworkManager through `program`, with `base_args` ahead of the
    /// usual nmcli arguments.
    pub fn with_command(
        log: &slog::Logger,
        program: &str,
        base_args: &[&str],
    ) -> Self {
        NetworkManager {
            log: log.new(slog::o!("unit" => "network-manager")),
            program: program.to_string(),
            base_args: base_args.iter().map(|a| a.to_string()).collect(),
        }
    }

    async fn nmcli(&self, args: &[&str]) -> std::io::Result<Output> {
        debug!(self.log, "running nmcli"; "args" => args.join(" "));
        tokio::process::Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .output()
            .await
    }

    async fn running(&self) -> LinkaddrdResult<bool> {
        match self.nmcli(&["-t", "-g", "RUNNING", "general"]).await {
            Ok(out) => Ok(out.status.success()
                && String::from_utf8_lossy(&out.stdout).trim() == "running"),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LinkaddrdError::Other(format!(
                "failed to query NetworkManager: {e}"
            ))),
        }
    }

    async fn devices(&self) -> LinkaddrdResult<Vec<String>> {
        let out = self.nmcli(&["-t", "-g", "DEVICE", "device", "status"]).await?;
        if !out.status.success() {
            return Err(LinkaddrdError::Other(format!(
                "failed to list NetworkManager devices: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Mark every device named in `interfaces` as unmanaged.  A missing or
    /// stopped NetworkManager is not an error.
    pub async fn unmanage(&self, interfaces: &[String]) -> LinkaddrdResult<()> {
        if !self.running().await? {
            info!(self.log,
                "couldn't read NetworkManager state, it's probably not running");
            return Ok(());
        }

        for dev in self.devices().await? {
            if !interfaces.contains(&dev) {
                continue;
            }
            let out = self.nmcli(&["device", "set", &dev, "managed", "no"]).await?;
            if !out.status.success() {
                return Err(LinkaddrdError::Other(format!(
                    "failed to unmanage {dev}: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }
            info!(self.log, "disabled NetworkManager for interface";
                "iface" => &dev);
        }
        Ok(())
    }
}
