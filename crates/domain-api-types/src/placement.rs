// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host resource descriptions and the placement constraints derived from them.

use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde_derive::{Deserialize, Serialize};

/// The resolved CPU, NUMA, and cgroup assignment for one VM on its host.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub struct PlacementConstraints {
    /// Host CPUs the domain's vCPUs may run on.
    pub cpuset: BTreeSet<u32>,

    /// One-to-one vCPU pins for VMs with dedicated CPUs.
    #[serde(default)]
    pub vcpu_pins: BTreeMap<u32, u32>,

    /// Host NUMA nodes the domain's memory is bound to.
    #[serde(default)]
    pub numa_nodes: BTreeSet<u32>,

    /// Host CPUs for the emulator's own threads.
    #[serde(default)]
    pub emulator_cpuset: BTreeSet<u32>,

    /// The cgroup partition the domain is placed in.
    #[serde(default)]
    pub cgroup_partition: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NumaNodeCapacity {
    pub id: u32,
    pub cpus: BTreeSet<u32>,
    pub free_memory_mib: u64,
}

/// The resources a host can offer to new VMs.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub struct NodeCapacity {
    pub numa_nodes: Vec<NumaNodeCapacity>,

    /// Host CPUs that must never be handed to guests.
    #[serde(default)]
    pub reserved_cpus: BTreeSet<u32>,
}
