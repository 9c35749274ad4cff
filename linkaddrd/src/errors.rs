// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;

#[derive(Debug, thiserror::Error)]
pub enum LinkaddrdError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("No such resource: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("LLDP protocol error: {0}")]
    Protocol(String),
    /// A netlink request was rejected by the kernel or the connection failed
    #[error("Netlink error: {0}")]
    Netlink(String),
    /// Opening or reading from the packet capture failed
    #[error("Capture error: {0}")]
    Capture(String),
    /// A port description could not be turned into a point-to-point address
    #[error("Address resolution error: {0}")]
    Resolve(String),
    #[error("Export error: {0}")]
    Export(String),
    #[error("error: {0}")]
    Other(String),
}

impl convert::From<std::io::Error> for LinkaddrdError {
    fn from(err: std::io::Error) -> Self {
        LinkaddrdError::Io(err)
    }
}

impl convert::From<nix::Error> for LinkaddrdError {
    fn from(err: nix::Error) -> Self {
        LinkaddrdError::Io(std::io::Error::from(err))
    }
}

impl convert::From<rtnetlink::Error> for LinkaddrdError {
    fn from(err: rtnetlink::Error) -> Self {
        match &err {
            rtnetlink::Error::NetlinkError(msg)
                if msg.code.map(|c| c.get()) == Some(-nix::libc::EEXIST) =>
            {
                LinkaddrdError::Exists(err.to_string())
            }
            _ => LinkaddrdError::Netlink(err.to_string()),
        }
    }
}

impl convert::From<common::CidrError> for LinkaddrdError {
    fn from(err: common::CidrError) -> Self {
        LinkaddrdError::Invalid(err.to_string())
    }
}

impl convert::From<String> for LinkaddrdError {
    fn from(err: String) -> Self {
        LinkaddrdError::Other(err)
    }
}

impl convert::From<&str> for LinkaddrdError {
    fn from(err: &str) -> Self {
        LinkaddrdError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for LinkaddrdError {
    fn from(err: anyhow::Error) -> Self {
        LinkaddrdError::Other(err.to_string())
    }
}
