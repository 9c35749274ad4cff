// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::os::fd::AsRawFd;
use std::os::fd::RawFd;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use crate::discovery::CaptureHandle;
use crate::discovery::CaptureOpener;
use crate::discovery::SNAPLEN;
use crate::errors::LinkaddrdError;
use crate::types::LinkaddrdResult;

/// Only LLDP frames make it past the kernel.
const LLDP_FILTER: &str = "ether proto 0x88cc";
/// pcap read timeout, in milliseconds
const READ_TIMEOUT: i32 = 5000;

/// A promiscuous pcap capture that only sees LLDP frames arriving on one
/// interface.
pub struct Transport {
    // dropped ahead of the capture that owns the descriptor
    fd: AsyncFd<RawFd>,
    pcap: pcap::Capture<pcap::Active>,
}

fn pcap_error(iface: &str, what: &str, e: pcap::Error) -> LinkaddrdError {
    LinkaddrdError::Capture(format!("{iface}: failed to {what}: {e}"))
}

fn pcap_open(iface: &str) -> LinkaddrdResult<pcap::Capture<pcap::Active>> {
    let pcap = pcap::Capture::from_device(iface)
        .map_err(|e| pcap_error(iface, "open pcap", e))?
        .promisc(true)
        .snaplen(SNAPLEN as i32)
        .timeout(READ_TIMEOUT)
        .immediate_mode(true)
        .open()
        .map_err(|e| pcap_error(iface, "activate pcap", e))?;
    let mut pcap = pcap
        .setnonblock()
        .map_err(|e| pcap_error(iface, "make pcap non-blocking", e))?;
    pcap.filter(LLDP_FILTER, true)
        .map_err(|e| pcap_error(iface, "set capture filter", e))?;
    Ok(pcap)
}

// libpcap reports a link that went away as an ordinary error, so tell those
// apart by the message.
fn capture_ended(e: &pcap::Error) -> bool {
    match e {
        pcap::Error::NoMorePackets => true,
        pcap::Error::PcapError(msg) => {
            msg.contains("went down") || msg.contains("disappeared")
        }
        _ => false,
    }
}

impl Transport {
    pub fn new(iface: &str) -> LinkaddrdResult<Transport> {
        let pcap = pcap_open(iface)?;
        let fd = AsyncFd::new(pcap.as_raw_fd()).map_err(|e| {
            LinkaddrdError::Other(format!(
                "failed to wrap transport fd for tokio: {e:?}"
            ))
        })?;
        Ok(Transport { fd, pcap })
    }
}

#[async_trait]
impl CaptureHandle for Transport {
    async fn recv(&mut self, buf: &mut [u8]) -> LinkaddrdResult<Option<usize>> {
        loop {
            let mut guard = self.fd.readable().await?;
            match self.pcap.next_packet() {
                Ok(packet) => {
                    let n = packet.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet.data[..n]);
                    return Ok(Some(n));
                }
                Err(pcap::Error::TimeoutExpired) => guard.clear_ready(),
                Err(e) if capture_ended(&e) => return Ok(None),
                Err(e) => return Err(LinkaddrdError::Capture(e.to_string())),
            }
        }
    }
}

/// Opens a fresh [`Transport`] for each discovery attempt.
pub struct PcapOpener;

impl CaptureOpener for PcapOpener {
    fn open(&self, iface: &str) -> LinkaddrdResult<Box<dyn CaptureHandle>> {
        Ok(Box::new(Transport::new(iface)?))
    }
}

/// The interface's own hardware address as the kernel reports it in sysfs.
pub fn read_mac(
    sysfs_root: &camino::Utf8Path,
    name: &str,
) -> LinkaddrdResult<protocol::MacAddr> {
    let addr_file = sysfs_root.join("class/net").join(name).join("address");
    let mac = std::fs::read_to_string(addr_file)?;
    mac.trim().parse().map_err(|e| {
        LinkaddrdError::Other(format!(
            "failed to parse mac address {mac}: {e:?}"
        ))
    })
}
