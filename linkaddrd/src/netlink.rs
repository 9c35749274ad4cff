// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Link, address and route manipulation.
//!
//! Everything the orchestrator does to the kernel's network state goes
//! through [`LinkOps`], so that the whole configuration sequence can be
//! driven against an in-memory double in tests.

use std::net::IpAddr;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use common::Ipv4Cidr;
use futures::StreamExt;
use futures::TryStreamExt;
use netlink_packet_core::NetlinkMessage;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_core::NLM_F_ACK;
use netlink_packet_core::NLM_F_APPEND;
use netlink_packet_core::NLM_F_CREATE;
use netlink_packet_core::NLM_F_REQUEST;
use netlink_packet_route::nlas::address::Nla as AddressNla;
use netlink_packet_route::nlas::link::Nla as LinkNla;
use netlink_packet_route::AddressMessage;
use netlink_packet_route::LinkMessage;
use netlink_packet_route::RtnlMessage;
use netlink_packet_route::AF_INET;
use netlink_packet_route::IFF_UP;
use netlink_sys::AsyncSocket;
use protocol::MacAddr;
use slog::debug;
use slog::trace;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::LinkaddrdError;
use crate::types::LinkaddrdResult;
use crate::types::Link;
use crate::types::Route;

/// Stream of link snapshots delivered whenever the kernel reports a change.
/// Dropping it tears down the underlying subscription.
pub struct LinkEvents {
    rx: mpsc::Receiver<Link>,
    tasks: Vec<JoinHandle<()>>,
}

impl LinkEvents {
    pub fn new(rx: mpsc::Receiver<Link>, tasks: Vec<JoinHandle<()>>) -> Self {
        LinkEvents { rx, tasks }
    }

    pub async fn recv(&mut self) -> Option<Link> {
        self.rx.recv().await
    }
}

impl Drop for LinkEvents {
    fn drop(&mut self) {
        self.tasks.iter().for_each(|t| t.abort());
    }
}

#[async_trait]
pub trait LinkOps: Send + Sync {
    async fn link_by_name(&self, name: &str) -> LinkaddrdResult<Link>;
    /// IPv4 addresses currently assigned to the link
    async fn addresses(&self, link: &Link) -> LinkaddrdResult<Vec<Ipv4Cidr>>;
    async fn address_add(
        &self,
        link: &Link,
        addr: Ipv4Cidr,
    ) -> LinkaddrdResult<()>;
    async fn address_del(
        &self,
        link: &Link,
        addr: Ipv4Cidr,
    ) -> LinkaddrdResult<()>;
    async fn link_up(&self, link: &Link) -> LinkaddrdResult<()>;
    async fn link_down(&self, link: &Link) -> LinkaddrdResult<()>;
    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkaddrdResult<()>;
    /// Appends to any routes already present for the destination.  Fails
    /// with `LinkaddrdError::Exists` if this exact route is already installed.
    async fn route_add(&self, route: &Route) -> LinkaddrdResult<()>;
    async fn subscribe(&self) -> LinkaddrdResult<LinkEvents>;
}

fn link_from_message(msg: &LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        mac: None,
        up: msg.header.flags & IFF_UP != 0,
        mtu: 0,
    };
    for nla in &msg.nlas {
        match nla {
            LinkNla::IfName(name) => link.name = name.clone(),
            LinkNla::Address(a) => link.mac = MacAddr::try_from(&a[..]).ok(),
            LinkNla::Mtu(mtu) => link.mtu = *mtu,
            _ => {}
        }
    }
    link
}

fn cidr_from_message(msg: &AddressMessage) -> Option<Ipv4Cidr> {
    if msg.header.family != AF_INET as u8 {
        return None;
    }
    let local = msg.nlas.iter().find_map(|nla| match nla {
        AddressNla::Local(a) => Some(a),
        _ => None,
    });
    let address = msg.nlas.iter().find_map(|nla| match nla {
        AddressNla::Address(a) => Some(a),
        _ => None,
    });
    let octets: [u8; 4] = local.or(address)?.as_slice().try_into().ok()?;
    Some(Ipv4Cidr {
        prefix: Ipv4Addr::from(octets),
        prefix_len: msg.header.prefix_len,
    })
}

fn is_errno(err: &rtnetlink::Error, errno: i32) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg)
        if msg.code.map(|c| c.get()) == Some(-errno))
}

/// The production adapter, speaking rtnetlink to the running kernel.
pub struct Netlink {
    log: slog::Logger,
    handle: rtnetlink::Handle,
    conn: JoinHandle<()>,
}

impl Netlink {
    pub fn new(log: &slog::Logger) -> LinkaddrdResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        Ok(Netlink {
            log: log.new(slog::o!("unit" => "netlink")),
            handle,
            conn: tokio::spawn(conn),
        })
    }

    async fn address_messages(
        &self,
        link: &Link,
    ) -> LinkaddrdResult<Vec<AddressMessage>> {
        Ok(self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute()
            .try_collect()
            .await?)
    }
}

impl Drop for Netlink {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

#[async_trait]
impl LinkOps for Netlink {
    async fn link_by_name(&self, name: &str) -> LinkaddrdResult<Link> {
        let mut links =
            self.handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(link_from_message(&msg)),
            Ok(None) => Err(LinkaddrdError::Missing(name.to_string())),
            Err(e) if is_errno(&e, nix::libc::ENODEV) => {
                Err(LinkaddrdError::Missing(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn addresses(&self, link: &Link) -> LinkaddrdResult<Vec<Ipv4Cidr>> {
        Ok(self
            .address_messages(link)
            .await?
            .iter()
            .filter(|msg| msg.header.index == link.index)
            .filter_map(cidr_from_message)
            .collect())
    }

    async fn address_add(
        &self,
        link: &Link,
        addr: Ipv4Cidr,
    ) -> LinkaddrdResult<()> {
        debug!(self.log, "adding address"; "iface" => &link.name,
            "addr" => addr.to_string());
        self.handle
            .address()
            .add(link.index, IpAddr::V4(addr.prefix), addr.prefix_len)
            .execute()
            .await
            .map_err(|e| e.into())
    }

    async fn address_del(
        &self,
        link: &Link,
        addr: Ipv4Cidr,
    ) -> LinkaddrdResult<()> {
        debug!(self.log, "removing address"; "iface" => &link.name,
            "addr" => addr.to_string());
        let msg = self
            .address_messages(link)
            .await?
            .into_iter()
            .find(|msg| cidr_from_message(msg) == Some(addr))
            .ok_or_else(|| {
                LinkaddrdError::Missing(format!("{addr} on {}", link.name))
            })?;
        self.handle
            .address()
            .del(msg)
            .execute()
            .await
            .map_err(|e| e.into())
    }

    async fn link_up(&self, link: &Link) -> LinkaddrdResult<()> {
        debug!(self.log, "setting link up"; "iface" => &link.name);
        self.handle
            .link()
            .set(link.index)
            .up()
            .execute()
            .await
            .map_err(|e| e.into())
    }

    async fn link_down(&self, link: &Link) -> LinkaddrdResult<()> {
        debug!(self.log, "setting link down"; "iface" => &link.name);
        self.handle
            .link()
            .set(link.index)
            .down()
            .execute()
            .await
            .map_err(|e| e.into())
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkaddrdResult<()> {
        debug!(self.log, "setting mtu"; "iface" => &link.name, "mtu" => mtu);
        self.handle
            .link()
            .set(link.index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| e.into())
    }

    async fn route_add(&self, route: &Route) -> LinkaddrdResult<()> {
        debug!(self.log, "adding route {route}");
        let dst = route.destination.network();
        let mut req = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst.prefix, dst.prefix_len)
            .output_interface(route.link_index)
            .scope(route.scope)
            .protocol(route.protocol);
        if let Some(gw) = route.gateway {
            req = req.gateway(gw);
        }
        if let Some(src) = route.pref_source {
            req = req.pref_source(src);
        }

        // Append rather than exclusively create: every scale-out port carries
        // a route to the same routed network through its own peer.
        let route_msg = req.message_mut().clone();
        let mut msg = NetlinkMessage::from(RtnlMessage::NewRoute(route_msg));
        msg.header.flags =
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_APPEND;

        let mut handle = self.handle.clone();
        let mut response = handle.request(msg)?;
        while let Some(msg) = response.next().await {
            if let NetlinkPayload::Error(err) = msg.payload {
                if err.code.is_some() {
                    return Err(rtnetlink::Error::NetlinkError(err).into());
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self) -> LinkaddrdResult<LinkEvents> {
        let (mut conn, handle, mut messages) = rtnetlink::new_connection()?;
        let groups = netlink_sys::SocketAddr::new(
            0,
            rtnetlink::constants::RTMGRP_LINK,
        );
        conn.socket_mut().socket_mut().bind(&groups)?;
        let conn = tokio::spawn(conn);

        let log = self.log.clone();
        let (tx, rx) = mpsc::channel(64);
        let forward = tokio::spawn(async move {
            // the connection shuts down once every handle is gone
            let _handle = handle;
            while let Some((msg, _)) = messages.next().await {
                if let NetlinkPayload::InnerMessage(RtnlMessage::NewLink(m)) =
                    msg.payload
                {
                    let link = link_from_message(&m);
                    trace!(log, "link event"; "iface" => &link.name,
                        "up" => link.up);
                    if tx.send(link).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(LinkEvents::new(rx, vec![forward, conn]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::AddressHeader;
    use netlink_packet_route::LinkHeader;

    #[test]
    fn test_link_from_message() {
        let mut msg = LinkMessage::default();
        msg.header = LinkHeader {
            index: 7,
            flags: IFF_UP,
            ..Default::default()
        };
        msg.nlas = vec![
            LinkNla::IfName("eth2".to_string()),
            LinkNla::Address(vec![0xb0, 0xfd, 0x0b, 0x00, 0x00, 0x01]),
            LinkNla::Mtu(8000),
        ];
        let link = link_from_message(&msg);
        assert_eq!(link.index, 7);
        assert_eq!(link.name, "eth2");
        assert!(link.up);
        assert_eq!(link.mtu, 8000);
        assert_eq!(
            link.mac,
            Some(MacAddr::new(0xb0, 0xfd, 0x0b, 0x00, 0x00, 0x01))
        );
    }

    #[test]
    fn test_cidr_from_message() {
        let mut msg = AddressMessage::default();
        msg.header = AddressHeader {
            family: AF_INET as u8,
            prefix_len: 30,
            index: 7,
            ..Default::default()
        };
        msg.nlas = vec![AddressNla::Address(vec![10, 210, 8, 121])];
        assert_eq!(
            cidr_from_message(&msg).unwrap().to_string(),
            "10.210.8.121/30"
        );

        msg.header.family = netlink_packet_route::AF_INET6 as u8;
        assert_eq!(cidr_from_message(&msg), None);
    }
}
