// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! In-memory stand-ins for the kernel, the capture and the log drain.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use common::Ipv4Cidr;
use netlink_packet_route::RTPROT_KERNEL;
use netlink_packet_route::RT_SCOPE_LINK;
use protocol::packet::LldpTlv;
use protocol::packet::Packet;
use protocol::types::ChassisId;
use protocol::types::Lldpdu;
use protocol::types::PortId;
use protocol::MacAddr;
use tokio::sync::mpsc;

use crate::discovery::CaptureHandle;
use crate::discovery::CaptureOpener;
use crate::errors::LinkaddrdError;
use crate::netlink::LinkEvents;
use crate::netlink::LinkOps;
use crate::types::LinkaddrdResult;
use crate::types::Link;
use crate::types::Route;

#[derive(Default)]
struct NetState {
    links: BTreeMap<String, Link>,
    addrs: BTreeMap<u32, Vec<Ipv4Cidr>>,
    routes: Vec<Route>,
    fail_address_add: BTreeSet<String>,
    fail_address_del: BTreeSet<String>,
    events: Option<mpsc::Sender<Link>>,
    calls: Vec<String>,
}

/// A kernel that keeps its links, addresses and routes in a few maps.
#[derive(Default)]
pub struct FakeNet {
    state: Mutex<NetState>,
}

impl FakeNet {
    pub fn new() -> Self {
        FakeNet::default()
    }

    pub fn add_link(&self, name: &str, mac: MacAddr, up: bool) -> Link {
        let mut state = self.state.lock().unwrap();
        let link = Link {
            index: state.links.len() as u32 + 2,
            name: name.to_string(),
            mac: Some(mac),
            up,
            mtu: 1500,
        };
        state.links.insert(name.to_string(), link.clone());
        link
    }

    pub fn link(&self, name: &str) -> Link {
        self.state.lock().unwrap().links[name].clone()
    }

    pub fn addresses_of(&self, name: &str) -> Vec<Ipv4Cidr> {
        let state = self.state.lock().unwrap();
        let index = state.links[name].index;
        state.addrs.get(&index).cloned().unwrap_or_default()
    }

    pub fn seed_address(&self, name: &str, addr: Ipv4Cidr) {
        let mut state = self.state.lock().unwrap();
        let index = state.links[name].index;
        state.addrs.entry(index).or_default().push(addr);
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_address_add(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_address_add
            .insert(name.to_string());
    }

    pub fn fail_address_del(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_address_del
            .insert(name.to_string());
    }

    fn set_up(&self, link: &Link, up: bool) -> LinkaddrdResult<()> {
        let mut state = self.state.lock().unwrap();
        let l = state
            .links
            .get_mut(&link.name)
            .ok_or_else(|| LinkaddrdError::Missing(link.name.clone()))?;
        l.up = up;
        let updated = l.clone();
        state.calls.push(format!(
            "{} {}",
            if up { "up" } else { "down" },
            link.name
        ));
        if let Some(tx) = &state.events {
            let _ = tx.try_send(updated);
        }
        Ok(())
    }
}

#[async_trait]
impl LinkOps for FakeNet {
    async fn link_by_name(&self, name: &str) -> LinkaddrdResult<Link> {
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .cloned()
            .ok_or_else(|| LinkaddrdError::Missing(name.to_string()))
    }

    async fn addresses(&self, link: &Link) -> LinkaddrdResult<Vec<Ipv4Cidr>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .addrs
            .get(&link.index)
            .cloned()
            .unwrap_or_default())
    }

    async fn address_add(
        &self,
        link: &Link,
        addr: Ipv4Cidr,
    ) -> LinkaddrdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("addr add {addr} {}", link.name));
        if state.fail_address_add.contains(&link.name) {
            return Err(LinkaddrdError::Netlink("injected failure".into()));
        }
        let addrs = state.addrs.entry(link.index).or_default();
        if addrs.contains(&addr) {
            return Err(LinkaddrdError::Exists(addr.to_string()));
        }
        addrs.push(addr);
        // the kernel installs the connected route along with the address
        state.routes.push(Route {
            link_index: link.index,
            destination: addr.network(),
            gateway: None,
            pref_source: Some(addr.prefix),
            scope: RT_SCOPE_LINK,
            protocol: RTPROT_KERNEL,
        });
        Ok(())
    }

    async fn address_del(
        &self,
        link: &Link,
        addr: Ipv4Cidr,
    ) -> LinkaddrdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("addr del {addr} {}", link.name));
        if state.fail_address_del.contains(&link.name) {
            return Err(LinkaddrdError::Netlink("EPERM".into()));
        }
        let addrs = state.addrs.entry(link.index).or_default();
        let before = addrs.len();
        addrs.retain(|a| *a != addr);
        if addrs.len() == before {
            return Err(LinkaddrdError::Missing(addr.to_string()));
        }
        state.routes.retain(|r| {
            !(r.link_index == link.index && r.pref_source == Some(addr.prefix))
        });
        Ok(())
    }

    async fn link_up(&self, link: &Link) -> LinkaddrdResult<()> {
        self.set_up(link, true)
    }

    async fn link_down(&self, link: &Link) -> LinkaddrdResult<()> {
        self.set_up(link, false)
    }

    async fn set_mtu(&self, link: &Link, mtu: u32) -> LinkaddrdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("mtu {mtu} {}", link.name));
        if let Some(l) = state.links.get_mut(&link.name) {
            l.mtu = mtu;
        }
        Ok(())
    }

    async fn route_add(&self, route: &Route) -> LinkaddrdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("route add {route}"));
        let exists = state.routes.iter().any(|r| {
            r.link_index == route.link_index
                && r.destination.network() == route.destination.network()
        });
        if exists {
            return Err(LinkaddrdError::Exists(route.to_string()));
        }
        state.routes.push(route.clone());
        Ok(())
    }

    async fn subscribe(&self) -> LinkaddrdResult<LinkEvents> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().events = Some(tx);
        Ok(LinkEvents::new(rx, Vec::new()))
    }
}

/// One thing a scripted capture handle does when asked for a frame.
#[derive(Clone, Debug)]
pub enum Step {
    Frame(Vec<u8>),
    /// The handle reports end-of-capture
    Closed,
    Fail,
}

/// Hands out capture handles that replay canned steps.  Each `open` of an
/// interface consumes the next script queued for it; once a script runs dry
/// the handle blocks forever.
#[derive(Default)]
pub struct ScriptedOpener {
    scripts: Mutex<BTreeMap<String, VecDeque<Vec<Step>>>>,
    opens: AtomicUsize,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        ScriptedOpener::default()
    }

    pub fn script(&self, iface: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(iface.to_string())
            .or_default()
            .push_back(steps);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl CaptureOpener for ScriptedOpener {
    fn open(&self, iface: &str) -> LinkaddrdResult<Box<dyn CaptureHandle>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(iface)
            .and_then(|q| q.pop_front())
            .unwrap_or_default();
        Ok(Box::new(ScriptedHandle {
            steps: steps.into(),
        }))
    }
}

struct ScriptedHandle {
    steps: VecDeque<Step>,
}

#[async_trait]
impl CaptureHandle for ScriptedHandle {
    async fn recv(&mut self, buf: &mut [u8]) -> LinkaddrdResult<Option<usize>> {
        match self.steps.pop_front() {
            Some(Step::Frame(f)) => {
                buf[..f.len()].copy_from_slice(&f);
                Ok(Some(f.len()))
            }
            Some(Step::Closed) => Ok(None),
            Some(Step::Fail) => {
                Err(LinkaddrdError::Capture("injected failure".into()))
            }
            None => std::future::pending().await,
        }
    }
}

/// Build an LLDP frame like a leaf switch would send on a scale-out port.
pub fn lldp_frame(
    chassis_mac: Option<MacAddr>,
    port_mac: Option<MacAddr>,
    port_description: Option<&str>,
) -> Vec<u8> {
    let lldpdu = Lldpdu {
        chassis_id: match chassis_mac {
            Some(mac) => ChassisId::MacAddress(mac),
            None => ChassisId::LocallyAssigned("leaf-07".to_string()),
        },
        port_id: match port_mac {
            Some(mac) => PortId::MacAddress(mac),
            None => PortId::InterfaceName("Ethernet12".to_string()),
        },
        ttl: 120,
        port_description: port_description.map(|s| s.to_string()),
        system_name: Some("leaf-07".to_string()),
        system_description: Some("switch os 4.2".to_string()),
    };
    let tlvs: Vec<LldpTlv> = (&lldpdu).try_into().unwrap();
    let mut packet = Packet::new(
        MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e),
        MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01),
    );
    tlvs.iter().for_each(|t| packet.add_tlv(t));
    packet.deparse()
}

/// An LLDP frame with a Chassis ID and nothing else, which is not a valid
/// LLDPDU.
pub fn chassis_only_frame() -> Vec<u8> {
    let chassis = ChassisId::MacAddress(MacAddr::new(
        0xb0, 0x8b, 0xd0, 0x01, 0x02, 0x03,
    ));
    let tlv: LldpTlv = (&chassis).try_into().unwrap();
    let mut packet = Packet::new(
        MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x0e),
        MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01),
    );
    packet.add_tlv(&tlv);
    packet.deparse()
}

pub fn non_lldp_frame() -> Vec<u8> {
    let mut frame = lldp_frame(None, None, None);
    frame[12] = 0x08;
    frame[13] = 0x00;
    frame
}

/// A drain that keeps every record as `LEVEL message key=value ...`.
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<String>>>,
}

struct KvLine<'a>(&'a mut String);

impl slog::Serializer for KvLine<'_> {
    fn emit_arguments(
        &mut self,
        key: slog::Key,
        val: &std::fmt::Arguments,
    ) -> slog::Result {
        self.0.push_str(&format!(" {key}={val}"));
        Ok(())
    }
}

impl slog::Drain for LogCapture {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> Result<(), slog::Never> {
        use slog::KV;

        let mut line =
            format!("{} {}", record.level().as_short_str(), record.msg());
        let mut ser = KvLine(&mut line);
        let _ = record.kv().serialize(record, &mut ser);
        let _ = values.serialize(record, &mut ser);
        self.lines.lock().unwrap().push(line);
        Ok(())
    }
}

impl LogCapture {
    pub fn logger(&self) -> slog::Logger {
        slog::Logger::root(self.clone(), slog::o!())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}
