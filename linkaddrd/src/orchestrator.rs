// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Drives one pass over the scale-out interfaces: bring the links up, listen
//! for each switch port's LLDP advertisement, derive and apply the
//! point-to-point addressing, and export it for the other consumers on the
//! host.
//!
//! All kernel mutations happen sequentially from this module's control flow.
//! The only concurrency is the discovery fan-out, whose results are not
//! looked at until every worker has returned.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use common::Ipv4Cidr;
use netlink_packet_route::RTPROT_BOOT;
use netlink_packet_route::RTPROT_KERNEL;
use netlink_packet_route::RT_SCOPE_LINK;
use netlink_packet_route::RT_SCOPE_UNIVERSE;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use tokio_util::sync::CancellationToken;

use crate::discovery;
use crate::discovery::CaptureOpener;
use crate::enumerate::Enumerator;
use crate::errors::LinkaddrdError;
use crate::gaudinet;
use crate::netlink::LinkEvents;
use crate::netlink::LinkOps;
use crate::networkd;
use crate::nm::NetworkManager;
use crate::plat_linux;
use crate::readiness;
use crate::resolve;
use crate::types::clamp_mtu;
use crate::types::DiscoveryResult;
use crate::types::InterfaceRecord;
use crate::types::LinkaddrdResult;
use crate::types::Mode;
use crate::types::Route;
use crate::types::ROUTED_PREFIX_LEN;

/// How long to wait for each link state notification from the kernel.
const ACK_TIMEOUT: Duration = Duration::from_secs(3);

const NO_ADDRESS: &str = "none";

#[derive(Clone, Debug)]
pub struct Config {
    pub sysfs_root: Utf8PathBuf,
    /// Interfaces to manage in addition to the ones found through sysfs
    pub interfaces: Vec<String>,
    pub mode: Mode,
    /// Apply the discovered addressing rather than only reporting it
    pub configure: bool,
    pub mtu: Option<u32>,
    pub disable_network_manager: bool,
    pub gaudinet: Option<Utf8PathBuf>,
    pub networkd: Option<Utf8PathBuf>,
    /// Deadline shared by every discovery worker
    pub wait: Duration,
    pub keep_running: bool,
    pub node_label: Option<Utf8PathBuf>,
}

/// The outcome of a pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Summary {
    /// At least one interface resolved a peer address
    pub found_peers: bool,
    pub configured: usize,
    pub total: usize,
    /// Addresses were to be applied, so every interface had to succeed
    pub applied: bool,
}

impl Summary {
    /// A pass that was asked to configure the links only succeeds if every
    /// one of them was configured.
    pub fn ensure_complete(&self) -> LinkaddrdResult<()> {
        if self.applied && self.configured != self.total {
            return Err(LinkaddrdError::Other(format!(
                "configured {} of {} interfaces",
                self.configured, self.total
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum RouteKind {
    /// The connected /30 shared with the switch port
    PointToPoint,
    /// The summary route for the routed scale-out network, via the switch
    RoutedNetwork,
}

pub struct Orchestrator {
    log: slog::Logger,
    cfg: Config,
    ops: Arc<dyn LinkOps>,
    opener: Arc<dyn CaptureOpener>,
    nm: NetworkManager,
    records: BTreeMap<String, InterfaceRecord>,
    /// Interfaces whose networkd units were written by this pass
    networkd_units: Vec<String>,
}

fn or_none<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string())
        .unwrap_or_else(|| NO_ADDRESS.to_string())
}

impl Orchestrator {
    pub fn new(
        log: &slog::Logger,
        cfg: Config,
        ops: Arc<dyn LinkOps>,
        opener: Arc<dyn CaptureOpener>,
    ) -> Self {
        Orchestrator {
            log: log.new(slog::o!("unit" => "orchestrator")),
            nm: NetworkManager::new(log),
            cfg,
            ops,
            opener,
            records: BTreeMap::new(),
            networkd_units: Vec::new(),
        }
    }

    /// Run a full discovery and configuration pass.
    pub async fn run(&mut self) -> LinkaddrdResult<Summary> {
        self.build_records().await?;
        let names: Vec<String> = self.records.keys().cloned().collect();

        if self.cfg.disable_network_manager {
            self.nm.unmanage(&names).await?;
        }

        self.interfaces_up().await;
        if let Some(mtu) = self.cfg.mtu {
            self.set_mtu(clamp_mtu(mtu)).await;
        }
        self.remove_existing_ips().await;

        let mut summary = Summary {
            found_peers: false,
            configured: 0,
            total: self.records.len(),
            applied: self.cfg.configure && self.cfg.mode == Mode::L3,
        };

        if self.cfg.mode == Mode::L3 {
            let results = self.discover_all().await;
            self.merge(results);
            summary.found_peers = self.resolve_all();
            self.log_results().await;

            if self.cfg.configure && summary.found_peers {
                summary.configured = self.configure_interfaces().await;
                info!(self.log, "configured {} of {} interfaces",
                    summary.configured, summary.total);
            }
        } else {
            self.log_results().await;
        }

        self.export();

        // L2 links stay up whenever configuring; L3 links only once a peer
        // was actually found
        let keep_up = match self.cfg.mode {
            Mode::L2 => self.cfg.configure,
            Mode::L3 => self.cfg.configure && summary.found_peers,
        };
        if !keep_up {
            self.restore_down().await;
        }
        Ok(summary)
    }

    /// Mark the node ready, wait for `shutdown`, then undo what the pass
    /// did to the host.
    pub async fn run_daemon(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> LinkaddrdResult<()> {
        if let Some(label) = &self.cfg.node_label {
            readiness::write(label)?;
            info!(self.log, "node marked ready"; "label" => label.as_str());
        }

        shutdown.await;
        info!(self.log, "shutting down, removing configuration");
        self.cleanup().await
    }

    async fn build_records(&mut self) -> LinkaddrdResult<()> {
        let enumerator = Enumerator::new(&self.log, &self.cfg.sysfs_root);
        let mut names = enumerator.interfaces();
        names.extend(self.cfg.interfaces.iter().cloned());
        names.sort();
        names.dedup();

        if names.is_empty() {
            error!(self.log, "no devices found");
            return Err(LinkaddrdError::Missing(
                "no scale-out interfaces found".to_string(),
            ));
        }

        for name in names {
            let mut link = match self.ops.link_by_name(&name).await {
                Ok(link) => link,
                Err(e) => {
                    error!(self.log, "link not found"; "iface" => &name,
                        "error" => e.to_string());
                    return Err(e);
                }
            };
            if link.mac.is_none() {
                link.mac = plat_linux::read_mac(&self.cfg.sysfs_root, &name).ok();
            }
            debug!(self.log, "managing link"; "iface" => &name,
                "index" => link.index, "up" => link.up);
            self.records.insert(name, InterfaceRecord::new(link));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Option<LinkEvents> {
        match self.ops.subscribe().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!(self.log, "cannot watch link state changes: {e}");
                None
            }
        }
    }

    fn awaiting_ack(&self) -> bool {
        self.records.values().any(|r| r.expect_ack)
    }

    // Consume link notifications until every requested state change has
    // been confirmed.  Links that stay silent are re-read directly.
    async fn wait_link_response(&mut self, mut events: Option<LinkEvents>) {
        while self.awaiting_ack() {
            let Some(ev) = events.as_mut() else {
                break;
            };
            match tokio::time::timeout(ACK_TIMEOUT, ev.recv()).await {
                Ok(Some(link)) => {
                    if let Some(rec) = self.records.get_mut(&link.name) {
                        rec.link.up = link.up;
                        rec.link.mtu = link.mtu;
                        rec.expect_ack = false;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(self.log, "timeout waiting for netlink reply");
                    break;
                }
            }
        }

        let silent: Vec<String> = self
            .records
            .values()
            .filter(|r| r.expect_ack)
            .map(|r| r.name().to_string())
            .collect();
        for name in silent {
            match self.ops.link_by_name(&name).await {
                Ok(link) => {
                    if let Some(rec) = self.records.get_mut(&name) {
                        rec.link.up = link.up;
                        rec.expect_ack = false;
                    }
                }
                Err(e) => warn!(self.log, "cannot refresh link: {e}";
                    "iface" => &name),
            }
        }
    }

    async fn interfaces_up(&mut self) {
        let events = self.subscribe().await;

        for rec in self.records.values_mut() {
            rec.expect_ack = false;
            if rec.link.up {
                continue;
            }
            match self.ops.link_up(&rec.link).await {
                Ok(()) => rec.expect_ack = true,
                Err(e) => warn!(self.log, "cannot set link up: {e}";
                    "iface" => &rec.link.name),
            }
        }

        self.wait_link_response(events).await;
    }

    async fn restore_down(&mut self) {
        let events = self.subscribe().await;

        for rec in self.records.values_mut() {
            if rec.orig_up || !rec.link.up {
                continue;
            }
            match self.ops.link_down(&rec.link).await {
                Ok(()) => {
                    info!(self.log, "setting link back down";
                        "iface" => &rec.link.name);
                    rec.expect_ack = true;
                }
                Err(e) => warn!(self.log, "cannot set link back down: {e}";
                    "iface" => &rec.link.name),
            }
        }

        self.wait_link_response(events).await;
    }

    async fn set_mtu(&mut self, mtu: u32) {
        for rec in self.records.values_mut() {
            match self.ops.set_mtu(&rec.link, mtu).await {
                Ok(()) => rec.link.mtu = mtu,
                Err(e) => warn!(self.log, "could not set MTU {mtu}: {e}";
                    "iface" => &rec.link.name),
            }
        }
    }

    // Every pass starts from an empty IPv4 slate on the managed links.  A
    // link that can't be cleared is left out of configuration.
    async fn remove_existing_ips(&mut self) {
        for rec in self.records.values_mut() {
            let addrs = match self.ops.addresses(&rec.link).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(self.log, "could not get addresses: {e}";
                        "iface" => &rec.link.name);
                    rec.stale_addrs = true;
                    continue;
                }
            };
            for addr in addrs {
                debug!(self.log, "removing stale address";
                    "iface" => &rec.link.name, "addr" => addr.to_string());
                if let Err(e) = self.ops.address_del(&rec.link, addr).await {
                    warn!(self.log, "could not remove address {addr}: {e}";
                        "iface" => &rec.link.name);
                    rec.stale_addrs = true;
                }
            }
        }
    }

    /// Listen on every link that is up, all sharing one deadline.  There is
    /// exactly one result per worker, and none is returned until every
    /// worker has finished.
    async fn discover_all(&self) -> Vec<DiscoveryResult> {
        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            let wait = self.cfg.wait;
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                cancel.cancel();
            })
        };

        let mut names = Vec::new();
        let mut workers = Vec::new();
        for rec in self.records.values().filter(|r| r.link.up) {
            let name = rec.name().to_string();
            let log = self.log.clone();
            let opener = self.opener.clone();
            let cancel = cancel.clone();
            let iface = name.clone();
            workers.push(tokio::spawn(async move {
                let r =
                    discovery::discover(&log, &*opener, &iface, &cancel)
                        .await;
                match r {
                    Ok(Some(result)) => result,
                    Ok(None) => DiscoveryResult {
                        name: iface,
                        ..Default::default()
                    },
                    Err(e) => DiscoveryResult {
                        name: iface,
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                }
            }));
            names.push(name);
        }
        info!(self.log, "started LLDP discovery";
            "interfaces" => names.join(","),
            "wait" => humantime::format_duration(self.cfg.wait).to_string());

        let joined = futures::future::join_all(workers).await;
        deadline.abort();

        names
            .into_iter()
            .zip(joined)
            .map(|(name, r)| {
                r.unwrap_or_else(|e| DiscoveryResult {
                    name,
                    error: Some(format!("discovery task failed: {e}")),
                    ..Default::default()
                })
            })
            .collect()
    }

    fn merge(&mut self, results: Vec<DiscoveryResult>) {
        for result in results {
            let Some(rec) = self.records.get_mut(&result.name) else {
                continue;
            };
            if let Some(e) = &result.error {
                warn!(self.log, "replied with error: {e}";
                    "iface" => &result.name);
                continue;
            }
            if result.received.is_none() {
                warn!(self.log, "no LLDP peer heard"; "iface" => &result.name);
                continue;
            }
            debug!(self.log, "merging discovery result";
                "iface" => &result.name,
                "system_name" => &result.system_name);
            rec.port_description = result.port_description;
            rec.peer_mac = result.peer_mac;
        }
    }

    fn resolve_all(&mut self) -> bool {
        let mut found_peers = false;
        for (name, rec) in self.records.iter_mut() {
            match resolve::resolve(&rec.port_description) {
                Ok((peer, local)) => {
                    rec.peer_addr = Some(peer);
                    rec.local_addr = Some(local);
                    found_peers = true;
                }
                Err(e) => {
                    warn!(self.log, "{e}"; "iface" => name);
                }
            }
        }
        found_peers
    }

    async fn log_results(&self) {
        for (name, rec) in &self.records {
            let addrs = match self.ops.addresses(&rec.link).await {
                Ok(addrs) if !addrs.is_empty() => addrs
                    .iter()
                    .map(|a| {
                        if Some(a.prefix) == rec.local_addr {
                            format!("{a}(matches lldp)")
                        } else {
                            a.to_string()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                _ => "no addresses".to_string(),
            };
            let state = if rec.link.up { "up" } else { "down" };

            match self.cfg.mode {
                Mode::L2 => info!(self.log, "interface";
                    "iface" => name,
                    "state" => state,
                    "addresses" => addrs),
                Mode::L3 => info!(self.log, "interface";
                    "iface" => name,
                    "state" => state,
                    "addresses" => addrs,
                    "peer_mac" => or_none(rec.peer_mac),
                    "peer_lldp_address" => or_none(rec.peer_addr),
                    "local_p2p_address" => or_none(rec.local_addr)),
            }
        }
    }

    fn route_for(
        rec: &InterfaceRecord,
        kind: RouteKind,
    ) -> LinkaddrdResult<Route> {
        let (Some(local), Some(p2p)) = (rec.local_addr, rec.local_cidr())
        else {
            return Err(LinkaddrdError::Missing(format!(
                "interface {} has no local address",
                rec.name()
            )));
        };

        match kind {
            // matches what the kernel installs along with the address
            RouteKind::PointToPoint => Ok(Route {
                link_index: rec.link.index,
                destination: p2p.network(),
                gateway: None,
                pref_source: Some(local),
                scope: RT_SCOPE_LINK,
                protocol: RTPROT_KERNEL,
            }),
            RouteKind::RoutedNetwork => {
                let gateway: Ipv4Addr = rec.peer_addr.ok_or_else(|| {
                    LinkaddrdError::Missing(format!(
                        "interface {} has no peer address",
                        rec.name()
                    ))
                })?;
                Ok(Route {
                    link_index: rec.link.index,
                    destination: Ipv4Cidr::new(local, ROUTED_PREFIX_LEN)?
                        .network(),
                    gateway: Some(gateway),
                    pref_source: None,
                    scope: RT_SCOPE_UNIVERSE,
                    protocol: RTPROT_BOOT,
                })
            }
        }
    }

    async fn add_route(
        &self,
        rec: &InterfaceRecord,
        kind: RouteKind,
    ) -> LinkaddrdResult<()> {
        let route = Self::route_for(rec, kind)?;
        match self.ops.route_add(&route).await {
            Ok(()) => {
                info!(self.log, "configured route {route}"; "iface" => rec.name());
                Ok(())
            }
            Err(LinkaddrdError::Exists(_)) => {
                info!(self.log, "route {route} already exists";
                    "iface" => rec.name());
                Ok(())
            }
            Err(e) => {
                warn!(self.log, "could not add route {route}: {e}";
                    "iface" => rec.name());
                Err(e)
            }
        }
    }

    // Apply the resolved address and both routes to each link, returning how
    // many links ended up fully configured.  Safe to repeat.
    async fn configure_interfaces(&self) -> usize {
        info!(self.log, "configuring interfaces");
        let mut configured = 0;

        for (name, rec) in &self.records {
            let Some(local) = rec.local_cidr() else {
                continue;
            };
            if rec.stale_addrs {
                warn!(self.log, "not configuring, old addresses remain";
                    "iface" => name);
                continue;
            }

            let existing = match self.ops.addresses(&rec.link).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(self.log, "could not get addresses: {e}";
                        "iface" => name);
                    continue;
                }
            };

            if existing.iter().any(|a| a.prefix == local.prefix) {
                info!(self.log, "already configured with address {local}";
                    "iface" => name);
                // the address survived from an earlier pass, but its
                // connected route may not have
                if self.add_route(rec, RouteKind::PointToPoint).await.is_err() {
                    continue;
                }
            } else {
                // the kernel adds the connected /30 route with the address
                if let Err(e) = self.ops.address_add(&rec.link, local).await {
                    warn!(self.log, "could not configure address {local}: {e}";
                        "iface" => name);
                    continue;
                }
                info!(self.log, "configured address and route {local}";
                    "iface" => name);
            }

            if self.add_route(rec, RouteKind::RoutedNetwork).await.is_err() {
                continue;
            }
            configured += 1;
        }
        configured
    }

    // Export failures are reported but never fail the pass.
    fn export(&mut self) {
        if let Some(path) = &self.cfg.gaudinet {
            if let Err(e) = gaudinet::write(&self.log, path, &self.records) {
                error!(self.log, "gaudinet export failed: {e}");
            }
        }

        if let Some(dir) = &self.cfg.networkd {
            let resolved: BTreeMap<String, InterfaceRecord> = self
                .records
                .iter()
                .filter(|(_, r)| r.local_addr.is_some())
                .map(|(n, r)| (n.clone(), r.clone()))
                .collect();
            match networkd::write(&self.log, dir, &resolved) {
                Ok(written) => self.networkd_units = written,
                Err(e) => error!(self.log, "networkd export failed: {e}"),
            }
        }
    }

    async fn cleanup(&mut self) -> LinkaddrdResult<()> {
        for rec in self.records.values() {
            let Some(local) = rec.local_cidr() else {
                continue;
            };
            match self.ops.address_del(&rec.link, local).await {
                Ok(()) => info!(self.log, "removed address {local}";
                    "iface" => rec.name()),
                Err(LinkaddrdError::Missing(_)) => {}
                Err(e) => warn!(self.log, "could not remove address {local}: {e}";
                    "iface" => rec.name()),
            }
        }

        self.restore_down().await;

        if let Some(dir) = &self.cfg.networkd {
            networkd::delete(&self.log, dir, &self.networkd_units);
            self.networkd_units.clear();
        }
        if let Some(label) = &self.cfg.node_label {
            readiness::remove(label)?;
        }
        Ok(())
    }
}
