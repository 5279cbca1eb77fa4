// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Computes placement constraints from a host's free capacity.

use std::collections::{BTreeMap, BTreeSet};

use domain_api_types::{
    NodeCapacity, NumaNodeCapacity, PlacementConstraints, VmSpec,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error(
        "insufficient resources: need {vcpus} CPUs and {memory_mib} MiB, \
        host offers {free_cpus} CPUs and {free_memory_mib} MiB"
    )]
    InsufficientResources {
        vcpus: u32,
        memory_mib: u64,
        free_cpus: usize,
        free_memory_mib: u64,
    },
}

fn usable_cpus(
    node: &NumaNodeCapacity,
    reserved: &BTreeSet<u32>,
) -> BTreeSet<u32> {
    node.cpus.difference(reserved).copied().collect()
}

/// Chooses the host CPUs and NUMA nodes for `spec`.
///
/// A VM that fits on one NUMA node is placed on the lowest-numbered node
/// that can hold it. Otherwise nodes are taken in id order until both its
/// CPUs and its memory are covered. VMs with dedicated vCPUs are pinned one
/// to one onto the chosen CPUs and their emulator threads share the first
/// one; shared VMs may float over every CPU of the chosen nodes.
pub fn compute_placement(
    capacity: &NodeCapacity,
    spec: &VmSpec,
) -> Result<PlacementConstraints, PlacementError> {
    let vcpus = spec.cpu.vcpus;
    let memory = spec.memory_mib;

    let mut nodes: Vec<&NumaNodeCapacity> = capacity.numa_nodes.iter().collect();
    nodes.sort_by_key(|n| n.id);

    let insufficient = || {
        let free_cpus = nodes
            .iter()
            .map(|n| usable_cpus(n, &capacity.reserved_cpus).len())
            .sum();
        let free_memory_mib = nodes.iter().map(|n| n.free_memory_mib).sum();
        PlacementError::InsufficientResources {
            vcpus,
            memory_mib: memory,
            free_cpus,
            free_memory_mib,
        }
    };

    let fits = |cpus: usize, mem: u64| {
        mem >= memory && (!spec.cpu.dedicated || cpus >= vcpus as usize)
    };

    let single = nodes.iter().find(|n| {
        let cpus = usable_cpus(n, &capacity.reserved_cpus).len();
        cpus > 0 && fits(cpus, n.free_memory_mib)
    });

    let chosen: Vec<&NumaNodeCapacity> = match single {
        Some(node) => vec![*node],
        None => {
            let mut chosen = Vec::new();
            let (mut cpus, mut mem) = (0usize, 0u64);
            for node in &nodes {
                let usable = usable_cpus(node, &capacity.reserved_cpus).len();
                if usable == 0 {
                    continue;
                }
                chosen.push(*node);
                cpus += usable;
                mem += node.free_memory_mib;
                if fits(cpus, mem) {
                    break;
                }
            }
            if chosen.is_empty() || !fits(cpus, mem) {
                return Err(insufficient());
            }
            chosen
        }
    };

    let cpuset: BTreeSet<u32> = chosen
        .iter()
        .flat_map(|n| usable_cpus(n, &capacity.reserved_cpus))
        .collect();
    let numa_nodes = chosen.iter().map(|n| n.id).collect();

    let (cpuset, vcpu_pins, emulator_cpuset) = if spec.cpu.dedicated {
        let picked: BTreeSet<u32> =
            cpuset.iter().copied().take(vcpus as usize).collect();
        let pins: BTreeMap<u32, u32> = (0..vcpus).zip(picked.iter().copied()).collect();
        let emulator = picked.iter().next().copied().into_iter().collect();
        (picked, pins, emulator)
    } else {
        let emulator = cpuset.clone();
        (cpuset, BTreeMap::new(), emulator)
    };

    Ok(PlacementConstraints {
        cpuset,
        vcpu_pins,
        numa_nodes,
        emulator_cpuset,
        cgroup_partition: Some(format!("/machine/{}", spec.name)),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::test::test_spec;

    fn two_node_host() -> NodeCapacity {
        NodeCapacity {
            numa_nodes: vec![
                NumaNodeCapacity {
                    id: 1,
                    cpus: BTreeSet::from([4, 5, 6, 7]),
                    free_memory_mib: 8192,
                },
                NumaNodeCapacity {
                    id: 0,
                    cpus: BTreeSet::from([0, 1, 2, 3]),
                    free_memory_mib: 1024,
                },
            ],
            reserved_cpus: BTreeSet::from([0]),
        }
    }

    #[test]
    fn prefers_lowest_node_that_fits() {
        let mut spec = test_spec("vm0");
        spec.memory_mib = 512;
        let p = compute_placement(&two_node_host(), &spec).unwrap();
        assert_eq!(p.numa_nodes, BTreeSet::from([0]));
        assert_eq!(p.cpuset, BTreeSet::from([1, 2, 3]));
        assert!(p.vcpu_pins.is_empty());
        assert_eq!(p.cgroup_partition.as_deref(), Some("/machine/vm0"));

        spec.memory_mib = 4096;
        let p = compute_placement(&two_node_host(), &spec).unwrap();
        assert_eq!(p.numa_nodes, BTreeSet::from([1]));
    }

    #[test]
    fn dedicated_vcpus_are_pinned() {
        let mut spec = test_spec("vm0");
        spec.cpu.dedicated = true;
        spec.cpu.vcpus = 3;
        spec.memory_mib = 512;
        let p = compute_placement(&two_node_host(), &spec).unwrap();
        assert_eq!(p.vcpu_pins, BTreeMap::from([(0, 1), (1, 2), (2, 3)]));
        assert_eq!(p.emulator_cpuset, BTreeSet::from([1]));
    }

    #[test]
    fn spreads_across_nodes() {
        let mut spec = test_spec("vm0");
        spec.cpu.dedicated = true;
        spec.cpu.vcpus = 6;
        spec.memory_mib = 512;
        let p = compute_placement(&two_node_host(), &spec).unwrap();
        assert_eq!(p.numa_nodes, BTreeSet::from([0, 1]));
        assert_eq!(p.cpuset, BTreeSet::from([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn rejects_oversubscription() {
        let mut spec = test_spec("vm0");
        spec.memory_mib = 64 * 1024;
        assert!(matches!(
            compute_placement(&two_node_host(), &spec),
            Err(PlacementError::InsufficientResources { free_cpus: 7, .. })
        ));

        let mut spec = test_spec("vm0");
        spec.cpu.dedicated = true;
        spec.cpu.vcpus = 8;
        assert!(compute_placement(&two_node_host(), &spec).is_err());
    }

    #[test]
    fn placement_is_deterministic_and_converts() {
        let spec = test_spec("vm0");
        let host = two_node_host();
        let a = compute_placement(&host, &spec).unwrap();
        let b = compute_placement(&host, &spec).unwrap();
        assert_eq!(a, b);
        assert!(crate::spec::SpecConverter::new().convert(&spec, &a).is_ok());
    }
}
