// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deriving and comparing the switch port above a device.
//!
//! Peer-to-peer transactions are only brokered between functions sitting
//! below the same switch upstream port. That is the one whitelisted shape
//! where peer TLPs verifiably stay inside the switch; anything crossing a
//! root complex has no architectural guarantee of working. The walk is
//! deliberately exactly two hops (function, downstream port, upstream
//! port) rather than a search: nested-switch hierarchies are out of scope,
//! and a two-hop walk inside one lands on an inner port that simply never
//! matches.

use crate::fabric::PciDevice;
use std::sync::Arc;

/// The upstream port of the switch `device` hangs off of: its upstream
/// bridge's upstream bridge. `None` for devices attached directly to a
/// root complex or root port.
pub fn upstream_switch_port(device: &Arc<PciDevice>) -> Option<Arc<PciDevice>> {
    let downstream = device.upstream_bridge()?;
    downstream.upstream_bridge().cloned()
}

/// Whether `a` and `b` hang off the same switch upstream port. False
/// whenever either has none.
pub fn same_switch(a: &Arc<PciDevice>, b: &Arc<PciDevice>) -> bool {
    match (upstream_switch_port(a), upstream_switch_port(b)) {
        (Some(port_a), Some(port_b)) => Arc::ptr_eq(&port_a, &port_b),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::acs_port;
    use crate::test_helpers::endpoint;

    #[test]
    fn two_hops_reach_the_switch_upstream_port() {
        let (root, _) = acs_port("root0", None);
        let (switch_up, _) = acs_port("sw0-up", Some(&root));
        let (downstream, _) = acs_port("sw0-dsp0", Some(&switch_up));
        let dev = endpoint("nvme0", &downstream);

        let port = upstream_switch_port(&dev).unwrap();
        assert!(Arc::ptr_eq(&port, &switch_up));
    }

    #[test]
    fn root_attached_devices_have_no_switch_port() {
        let (root, _) = acs_port("root0", None);
        let dev = endpoint("nvme0", &root);

        assert!(upstream_switch_port(&dev).is_none());
    }

    #[test]
    fn devices_on_one_switch_match() {
        let (root, _) = acs_port("root0", None);
        let (switch_up, _) = acs_port("sw0-up", Some(&root));
        let (dsp0, _) = acs_port("sw0-dsp0", Some(&switch_up));
        let (dsp1, _) = acs_port("sw0-dsp1", Some(&switch_up));
        let a = endpoint("nvme0", &dsp0);
        let b = endpoint("rdma0", &dsp1);

        assert!(same_switch(&a, &b));
    }

    #[test]
    fn devices_on_different_switches_do_not_match() {
        let (root, _) = acs_port("root0", None);
        let (switch0, _) = acs_port("sw0-up", Some(&root));
        let (switch1, _) = acs_port("sw1-up", Some(&root));
        let (dsp0, _) = acs_port("sw0-dsp0", Some(&switch0));
        let (dsp1, _) = acs_port("sw1-dsp0", Some(&switch1));
        let a = endpoint("nvme0", &dsp0);
        let b = endpoint("rdma0", &dsp1);

        assert!(!same_switch(&a, &b));
    }

    #[test]
    fn root_attached_devices_never_match() {
        let (root, _) = acs_port("root0", None);
        let (switch_up, _) = acs_port("sw0-up", Some(&root));
        let (dsp0, _) = acs_port("sw0-dsp0", Some(&switch_up));
        let behind_switch = endpoint("nvme0", &dsp0);
        let at_root = endpoint("rdma0", &root);

        assert!(!same_switch(&behind_switch, &at_root));
        assert!(!same_switch(&at_root, &at_root));
    }
}
