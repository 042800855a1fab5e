//! Capture-plan derivation.
//!
//! A plan maps an interface name to the ports that should be captured on
//! it; an empty port list means "all traffic on this interface". The plan
//! is recomputed periodically and diffed against the previous snapshot so
//! only interfaces whose port set actually changed are reconfigured.

use std::collections::HashMap;

use ps_config::PcapMode;

/// Derive the interface → ports plan from the configured mode and port
/// lists.
///
/// - `All`, or `Deny` with no ports: every up-interface captures all
///   traffic.
/// - `Deny` with ports: every up-interface gets the global port list, then
///   the per-interface overlay is appended.
/// - `Allow`: up-interfaces get the global port list only when it is
///   non-empty, then the overlay is appended.
///
/// Port lists are deduplicated, first occurrence wins.
pub fn derive_plan(
    mode: PcapMode,
    capture_ports: &[u16],
    overlay: &HashMap<String, Vec<u16>>,
    up_interfaces: &[String],
) -> HashMap<String, Vec<u16>> {
    let mut plan: HashMap<String, Vec<u16>> = HashMap::new();

    match mode {
        PcapMode::All => {
            for name in up_interfaces {
                plan.entry(name.clone()).or_default();
            }
        }
        PcapMode::Deny if capture_ports.is_empty() => {
            for name in up_interfaces {
                plan.entry(name.clone()).or_default();
            }
        }
        PcapMode::Deny => {
            for name in up_interfaces {
                plan.entry(name.clone())
                    .or_default()
                    .extend_from_slice(capture_ports);
            }
            for (name, ports) in overlay {
                plan.entry(name.clone()).or_default().extend_from_slice(ports);
            }
        }
        PcapMode::Allow => {
            if !capture_ports.is_empty() {
                for name in up_interfaces {
                    plan.entry(name.clone())
                        .or_default()
                        .extend_from_slice(capture_ports);
                }
            }
            for (name, ports) in overlay {
                plan.entry(name.clone()).or_default().extend_from_slice(ports);
            }
        }
    }

    for ports in plan.values_mut() {
        dedup_ports(ports);
    }
    plan
}

/// Entries of `new` whose port set differs from `old`, compared as sets.
pub fn diff_plans(
    old: &HashMap<String, Vec<u16>>,
    new: &HashMap<String, Vec<u16>>,
) -> Vec<(String, Vec<u16>)> {
    let mut changed: Vec<(String, Vec<u16>)> = new
        .iter()
        .filter(|(name, ports)| match old.get(*name) {
            Some(old_ports) => !same_port_set(old_ports, ports),
            None => true,
        })
        .map(|(name, ports)| (name.clone(), ports.clone()))
        .collect();
    changed.sort_by(|a, b| a.0.cmp(&b.0));
    changed
}

fn dedup_ports(ports: &mut Vec<u16>) {
    let mut seen = Vec::with_capacity(ports.len());
    ports.retain(|port| {
        if seen.contains(port) {
            false
        } else {
            seen.push(*port);
            true
        }
    });
}

fn same_port_set(a: &[u16], b: &[u16]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|port| b.contains(port))
}
