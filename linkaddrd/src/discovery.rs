// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use protocol::packet::Packet;
use protocol::types::Lldpdu;
use slog::debug;
use slog::error;
use slog::info;
use slog::trace;
use slog::warn;
use tokio_util::sync::CancellationToken;

use crate::errors::LinkaddrdError;
use crate::types::DiscoveryResult;
use crate::types::LinkaddrdResult;

/// How long a single read waits before checking back in.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Pause before reopening a capture that reported end-of-capture.
const REOPEN_DELAY: Duration = Duration::from_secs(1);
/// Largest frame we are prepared to capture.
pub const SNAPLEN: usize = 65536;

/// A live capture of LLDP frames on one interface.
#[async_trait]
pub trait CaptureHandle: Send {
    /// Wait for the next frame and copy it into `buf`.  `Ok(None)` means the
    /// capture has ended and should be reopened.
    async fn recv(&mut self, buf: &mut [u8]) -> LinkaddrdResult<Option<usize>>;
}

pub trait CaptureOpener: Send + Sync {
    fn open(&self, iface: &str) -> LinkaddrdResult<Box<dyn CaptureHandle>>;
}

// Turn a captured frame into a result, if it holds a usable LLDPDU.
fn handle_packet(
    log: &slog::Logger,
    iface: &str,
    data: &[u8],
) -> Option<DiscoveryResult> {
    let packet = match Packet::parse(data) {
        Ok(Some(packet)) => packet,
        Ok(None) => return None, // non-LLDP packet
        Err(e) => {
            debug!(log, "failed to parse packet: {e:?}");
            return None;
        }
    };

    let lldpdu = match Lldpdu::try_from(&packet.lldp_hdr.lldp_data)
        .map_err(|e| LinkaddrdError::Protocol(format!("{e:#}")))
    {
        Ok(lldpdu) => lldpdu,
        Err(e) => {
            warn!(log, "parsing LLDP packet failed: {e}");
            return None;
        }
    };
    trace!(log, "received LLDPDU"; "lldpdu" => lldpdu.to_string());

    Some(DiscoveryResult {
        name: iface.to_string(),
        error: None,
        peer_mac: lldpdu.peer_mac(),
        system_name: lldpdu.system_name,
        system_description: lldpdu.system_description,
        port_description: lldpdu.port_description.unwrap_or_default(),
        received: Some(Utc::now()),
    })
}

/// Listen on `iface` until the first LLDPDU arrives or `cancel` fires.
/// Cancellation is not an error: it yields `Ok(None)`, meaning no peer was
/// heard from.  The capture is closed on every return path.
pub async fn discover(
    log: &slog::Logger,
    opener: &dyn CaptureOpener,
    iface: &str,
    cancel: &CancellationToken,
) -> LinkaddrdResult<Option<DiscoveryResult>> {
    let log = log.new(slog::o!("iface" => iface.to_string()));
    debug!(log, "opening capture");
    let mut capture = opener.open(iface)?;
    let mut buf = vec![0u8; SNAPLEN];

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(log, "discovery cancelled");
                return Ok(None);
            }
            r = tokio::time::timeout(POLL_INTERVAL, capture.recv(&mut buf)) => r,
        };

        match event {
            Err(_) => trace!(log, "no LLDP traffic yet"),
            Ok(Ok(Some(n))) => {
                if let Some(result) = handle_packet(&log, iface, &buf[..n]) {
                    info!(log, "peer found";
                        "port_description" => &result.port_description,
                        "peer_mac" => result.peer_mac.map(|m| m.to_string()));
                    return Ok(Some(result));
                }
            }
            Ok(Ok(None)) => {
                debug!(log, "capture closed, reopening");
                drop(capture);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(REOPEN_DELAY) => {}
                }
                capture = opener.open(iface)?;
            }
            Ok(Err(e)) => {
                error!(log, "listener died: {e:?}");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::chassis_only_frame;
    use crate::fake::lldp_frame;
    use crate::fake::LogCapture;
    use crate::fake::non_lldp_frame;
    use crate::fake::ScriptedOpener;
    use crate::fake::Step;
    use protocol::MacAddr;

    fn chassis_mac() -> MacAddr {
        MacAddr::new(0xb0, 0x8b, 0xd0, 0x01, 0x02, 0x03)
    }

    fn port_mac() -> MacAddr {
        MacAddr::new(0xb0, 0x8b, 0xd0, 0x01, 0x02, 0x44)
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let opener = ScriptedOpener::new();
        opener.script(
            "eth2",
            vec![
                Step::Frame(non_lldp_frame()),
                Step::Frame(vec![0u8; 6]),
                Step::Frame(lldp_frame(
                    Some(chassis_mac()),
                    None,
                    Some("no-alert 10.210.8.122/30"),
                )),
                Step::Frame(lldp_frame(
                    Some(chassis_mac()),
                    None,
                    Some("no-alert 10.210.9.122/30"),
                )),
            ],
        );

        let log = common::logging::test_logger();
        let cancel = CancellationToken::new();
        let result = discover(&log, &opener, "eth2", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.name, "eth2");
        assert_eq!(result.port_description, "no-alert 10.210.8.122/30");
        assert_eq!(result.peer_mac, Some(chassis_mac()));
        assert_eq!(result.system_name.as_deref(), Some("leaf-07"));
        assert!(result.received.is_some());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_bad_lldpdu_skipped() {
        let opener = ScriptedOpener::new();
        opener.script(
            "eth2",
            vec![
                Step::Frame(chassis_only_frame()),
                Step::Frame(lldp_frame(
                    Some(chassis_mac()),
                    None,
                    Some("no-alert 10.210.8.122/30"),
                )),
            ],
        );
        let logs = LogCapture::default();
        let result =
            discover(&logs.logger(), &opener, "eth2", &CancellationToken::new())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(result.port_description, "no-alert 10.210.8.122/30");

        let lines = logs.lines();
        let bad: Vec<&String> = lines
            .iter()
            .filter(|l| l.contains("parsing LLDP packet failed"))
            .collect();
        assert_eq!(bad.len(), 1);
        assert!(bad[0].starts_with("WARN "), "{}", bad[0]);
        assert!(bad[0].contains("no PortId"), "{}", bad[0]);
    }

    #[tokio::test]
    async fn test_port_mac_preferred() {
        let opener = ScriptedOpener::new();
        opener.script(
            "eth2",
            vec![Step::Frame(lldp_frame(
                Some(chassis_mac()),
                Some(port_mac()),
                Some("no-alert 10.210.8.122/30"),
            ))],
        );
        let log = common::logging::test_logger();
        let result = discover(&log, &opener, "eth2", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.peer_mac, Some(port_mac()));
    }

    #[tokio::test]
    async fn test_no_port_description() {
        let opener = ScriptedOpener::new();
        opener.script("eth2", vec![Step::Frame(lldp_frame(None, None, None))]);
        let log = common::logging::test_logger();
        let result = discover(&log, &opener, "eth2", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.port_description, "");
        assert_eq!(result.peer_mac, None);
    }

    #[tokio::test]
    async fn test_cancel_without_match() {
        let opener = ScriptedOpener::new();
        opener.script("eth2", vec![Step::Frame(non_lldp_frame())]);
        let log = common::logging::test_logger();
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });
        let result = discover(&log, &opener, "eth2", &cancel).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let opener = ScriptedOpener::new();
        opener.script("eth2", vec![Step::Frame(non_lldp_frame()), Step::Closed]);
        opener.script(
            "eth2",
            vec![Step::Frame(lldp_frame(
                Some(chassis_mac()),
                None,
                Some("no-alert 10.210.8.122/30"),
            ))],
        );
        let log = common::logging::test_logger();
        let result = discover(&log, &opener, "eth2", &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.port_description, "no-alert 10.210.8.122/30");
        assert_eq!(opener.opens(), 2);
    }

    #[tokio::test]
    async fn test_capture_failure() {
        let opener = ScriptedOpener::new();
        opener.script("eth2", vec![Step::Fail]);
        let log = common::logging::test_logger();
        match discover(&log, &opener, "eth2", &CancellationToken::new()).await {
            Err(LinkaddrdError::Capture(_)) => {}
            x => panic!("expected a capture error, got {x:?}"),
        }
    }
}
