// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::StreamExt;
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use slog::error;
use slog::info;
use structopt::StructOpt;

pub use errors::LinkaddrdError;
pub use types::LinkaddrdResult;

mod discovery;
mod enumerate;
mod errors;
mod gaudinet;
mod netlink;
mod networkd;
mod nm;
mod orchestrator;
mod plat_linux;
mod readiness;
mod resolve;
mod types;

#[cfg(test)]
mod fake;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "linkaddrd",
    about = "LLDP-driven addressing for accelerator scale-out links"
)]
enum Args {
    /// Discover, and optionally configure, the scale-out interfaces.
    Run(Opt),
}

#[derive(Clone, Debug, StructOpt)]
pub(crate) struct Opt {
    #[structopt(long, about = "log file")]
    log_file: Option<Utf8PathBuf>,

    #[structopt(
        long,
        short = "l",
        default_value = "json",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: common::LogFormat,

    #[structopt(
        long,
        env = "SYSFS_ROOT",
        default_value = "/sys/",
        help = "root of the sysfs tree to search for accelerator NICs"
    )]
    sysfs_root: Utf8PathBuf,

    #[structopt(
        long,
        help = "comma separated list of additional network interfaces"
    )]
    interfaces: Option<String>,

    #[structopt(
        long,
        alias = "layer",
        default_value = "L3",
        help = "L2 or L3"
    )]
    mode: types::Mode,

    #[structopt(long, help = "configure the network discovered with LLDP")]
    configure: bool,

    #[structopt(long, help = "MTU for the interfaces, kept within 1500-9000")]
    mtu: Option<u32>,

    #[structopt(
        long,
        help = "stop NetworkManager from managing the interfaces"
    )]
    disable_network_manager: bool,

    #[structopt(long, help = "gaudinet file path")]
    gaudinet: Option<Utf8PathBuf>,

    #[structopt(long, help = "directory for systemd-networkd units")]
    networkd: Option<Utf8PathBuf>,

    #[structopt(
        long,
        default_value = "30s",
        parse(try_from_str = parse_wait),
        help = "time to wait for LLDP packets"
    )]
    wait: Duration,

    #[structopt(
        long,
        help = "stay running after configuring, and clean up on exit"
    )]
    keep_running: bool,

    #[structopt(
        long,
        help = "node feature label file to write while running"
    )]
    node_label: Option<Utf8PathBuf>,
}

// A bare number is taken as seconds.
fn parse_wait(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s).or_else(|e| {
        humantime::parse_duration(&format!("{s}s")).map_err(|_| e)
    })
}

fn split_interfaces(list: Option<&str>) -> Vec<String> {
    list.map(|l| {
        l.split(',')
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .collect()
    })
    .unwrap_or_default()
}

async fn signal_handler(log: slog::Logger, mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        info!(&log, "caught signal {signal} - exiting");
    }
}

async fn run_linkaddrd(opts: Opt) -> LinkaddrdResult<()> {
    let log = common::log_init(
        "linkaddrd",
        opts.log_file.as_deref(),
        opts.log_format,
    )?;

    let cfg = orchestrator::Config {
        sysfs_root: opts.sysfs_root,
        interfaces: split_interfaces(opts.interfaces.as_deref()),
        mode: opts.mode,
        configure: opts.configure,
        mtu: opts.mtu,
        disable_network_manager: opts.disable_network_manager,
        gaudinet: opts.gaudinet,
        networkd: opts.networkd,
        wait: opts.wait,
        keep_running: opts.keep_running,
        node_label: opts.node_label,
    };
    let daemon = cfg.keep_running && cfg.configure;
    info!(&log, "starting"; "mode" => cfg.mode.to_string(),
        "configure" => cfg.configure, "daemon" => daemon);

    // registered up front so a signal during the pass isn't fatal
    let signals = if daemon {
        Some(Signals::new([SIGTERM, SIGINT, SIGQUIT])?)
    } else {
        None
    };

    let ops = Arc::new(netlink::Netlink::new(&log)?);
    let opener = Arc::new(plat_linux::PcapOpener);
    let mut orch = orchestrator::Orchestrator::new(&log, cfg, ops, opener);

    let summary = orch.run().await?;
    if let Err(e) = summary.ensure_complete() {
        error!(&log, "{e}");
        return Err(e);
    }

    if let Some(signals) = signals {
        let handle = signals.handle();
        orch.run_daemon(signal_handler(log.clone(), signals)).await?;
        handle.close();
    }

    info!(&log, "exiting");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> LinkaddrdResult<()> {
    let args = Args::from_args();

    match args {
        Args::Run(opt) => run_linkaddrd(opt).await,
    }
}

#[test]
fn test_parse_wait() {
    assert_eq!(parse_wait("30s").unwrap(), Duration::from_secs(30));
    assert_eq!(parse_wait("2m").unwrap(), Duration::from_secs(120));
    assert_eq!(parse_wait("45").unwrap(), Duration::from_secs(45));
    assert!(parse_wait("soon").is_err());
}

#[test]
fn test_split_interfaces() {
    assert_eq!(
        split_interfaces(Some("eth2, eth3,,eth4")),
        vec!["eth2".to_string(), "eth3".to_string(), "eth4".to_string()]
    );
    assert!(split_interfaces(None).is_empty());
}

#[test]
fn test_args() {
    let Args::Run(opt) = Args::from_iter_safe([
        "linkaddrd",
        "run",
        "--mode",
        "l2",
        "--interfaces",
        "eth2,eth3",
        "--wait",
        "10",
        "--mtu",
        "8000",
        "--configure",
    ])
    .unwrap();
    assert_eq!(opt.mode, types::Mode::L2);
    assert_eq!(opt.wait, Duration::from_secs(10));
    assert_eq!(opt.mtu, Some(8000));
    assert!(opt.configure);
    assert!(!opt.keep_running);
    assert_eq!(opt.sysfs_root.as_str(), "/sys/");
    assert_eq!(opt.log_format, common::LogFormat::Json);

    let Args::Run(opt) =
        Args::from_iter_safe(["linkaddrd", "run", "--layer=L2"]).unwrap();
    assert_eq!(opt.mode, types::Mode::L2);

    std::env::set_var("SYSFS_ROOT", "/host/sys/");
    let parsed = Args::from_iter_safe(["linkaddrd", "run"]);
    std::env::remove_var("SYSFS_ROOT");
    let Args::Run(opt) = parsed.unwrap();
    assert_eq!(opt.sysfs_root.as_str(), "/host/sys/");
}
