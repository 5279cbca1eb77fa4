// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives one virtual machine through its lifecycle on a host
//! virtualization daemon.

pub mod connection;
pub mod daemon;
pub mod guest_agent;
pub mod migrate;
pub mod placement;
pub mod spec;
pub mod vm;
