// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

pub mod logging;
pub mod network;

pub use logging::log_init;
pub use logging::LogFormat;
pub use network::CidrError;
pub use network::Ipv4Cidr;
