// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Boundary types for the device fabric this crate brokers memory across.
//!
//! The crate does not enumerate buses or own device lifetimes. Embedders
//! hand it [`PciDevice`] objects whose upstream links mirror the real
//! bridge hierarchy, plus a [`ConfigAccess`] implementation for each
//! device's configuration space. [`DeviceNode`] covers the common case of
//! consumers that hold a non-PCI device object (an RDMA queue pair, an NVMe
//! namespace) and need the PCI device it hangs off of.

use crate::Error;
use crate::acs::AcsHold;
use crate::spec::ext_caps;
use crate::spec::ext_caps::ExtendedCapabilityHeader;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Access to a device's PCI Express configuration space.
///
/// Implementations model hardware semantics rather than returning errors:
/// reads that hit nothing return zero or all-ones as the hardware would,
/// writes to unimplemented or read-only registers are dropped.
pub trait ConfigAccess: Send + Sync {
    /// Reads the 32-bit register at `offset`. `offset` is DWORD aligned.
    fn read_u32(&self, offset: u16) -> u32;

    /// Writes the 16-bit register at `offset`. `offset` is WORD aligned.
    fn write_u16(&self, offset: u16, value: u16);

    /// Reads the 16-bit register at `offset`. `offset` is WORD aligned.
    fn read_u16(&self, offset: u16) -> u16 {
        (self.read_u32(offset & !0x3) >> ((offset & 0x2) * 8)) as u16
    }
}

/// The backing resource behind one BAR: where the CPU reaches it, where
/// peers reach it, and how big it is.
///
/// `local_base` is the address the allocator hands out (the mapping
/// established by whatever memory-registration layer sits below this
/// crate). `bus_base` is the address a peer device must emit to hit the
/// same byte; on most hosts the two differ by a fixed per-BAR offset.
#[derive(Debug, Copy, Clone)]
pub struct BarRange {
    /// BAR index, 0-5.
    pub index: u8,
    /// CPU-usable base address of the BAR mapping.
    pub local_base: u64,
    /// Bus address of the same byte, as seen by peer devices.
    pub bus_base: u64,
    /// Length of the BAR in bytes.
    pub len: u64,
}

/// A PCI device (or bridge port) in the fabric.
///
/// Identity is the `Arc` allocation: two handles name the same device iff
/// they are `Arc::ptr_eq`. The upstream link is fixed at construction;
/// this crate never mutates topology.
pub struct PciDevice {
    name: String,
    upstream: Option<Arc<PciDevice>>,
    bars: Vec<BarRange>,
    cfg: Box<dyn ConfigAccess>,
    pub(crate) acs_hold: Mutex<AcsHold>,
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field("name", &self.name)
            .field("bars", &self.bars)
            .finish()
    }
}

impl PciDevice {
    /// Creates a device.
    ///
    /// `upstream` is the immediate upstream bridge port, `None` for devices
    /// and ports attached directly to a root complex. `bars` lists the
    /// BAR-backed resources the device exposes (bridge ports pass none).
    pub fn new(
        name: impl Into<String>,
        upstream: Option<Arc<PciDevice>>,
        bars: Vec<BarRange>,
        cfg: Box<dyn ConfigAccess>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            upstream,
            bars,
            cfg,
            acs_hold: Mutex::new(AcsHold::default()),
        })
    }

    /// The device name, for diagnostics only.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immediate upstream bridge port, if any.
    pub fn upstream_bridge(&self) -> Option<&Arc<PciDevice>> {
        self.upstream.as_ref()
    }

    /// The backing resource for BAR `index`, if the device implements it.
    pub fn bar(&self, index: u8) -> Option<&BarRange> {
        self.bars.iter().find(|bar| bar.index == index)
    }

    pub(crate) fn config(&self) -> &dyn ConfigAccess {
        self.cfg.as_ref()
    }

    /// Walks the extended capability list for a capability with `id`,
    /// returning its configuration space offset.
    ///
    /// Bounded by [`ext_caps::EXTENDED_CAPABILITIES_TTL`] so malformed
    /// lists terminate. A zero or all-ones header ends the walk (devices
    /// without extended config space read all-ones).
    pub fn find_ext_capability(&self, id: u16) -> Option<u16> {
        let mut pos = ext_caps::EXTENDED_CAPABILITIES_START;
        for _ in 0..ext_caps::EXTENDED_CAPABILITIES_TTL {
            let bits = self.cfg.read_u32(pos);
            if bits == 0 || bits == !0 {
                return None;
            }
            let header = ExtendedCapabilityHeader::from_bits(bits);
            if header.id() == id {
                return Some(pos);
            }
            pos = header.next_offset()?;
        }
        None
    }
}

/// A node in the embedder's device tree.
///
/// Consumers of peer-to-peer memory rarely hold the PCI device itself;
/// they hold some leaf object parented (possibly several levels deep)
/// under it. A node either carries a PCI identity or defers to its parent.
pub struct DeviceNode {
    name: String,
    parent: Option<Arc<DeviceNode>>,
    pci: Option<Arc<PciDevice>>,
}

impl fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceNode").field("name", &self.name).finish()
    }
}

impl DeviceNode {
    /// Creates the node for a PCI device itself.
    pub fn new_pci(device: &Arc<PciDevice>) -> Arc<Self> {
        Arc::new(Self {
            name: device.name().to_owned(),
            parent: None,
            pci: Some(device.clone()),
        })
    }

    /// Creates a non-PCI child node under `parent`.
    pub fn new_child(name: impl Into<String>, parent: &Arc<DeviceNode>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Some(parent.clone()),
            pci: None,
        })
    }

    /// Creates a non-PCI node with no parent.
    pub fn new_detached(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: None,
            pci: None,
        })
    }

    /// The node name, for diagnostics only.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finds the PCI device this node hangs off of by walking parent
    /// links, failing if the walk ends without one.
    pub fn resolve_pci(&self) -> Result<Arc<PciDevice>, Error> {
        let mut node = self;
        loop {
            if let Some(pci) = &node.pci {
                return Ok(pci.clone());
            }
            node = node.parent.as_deref().ok_or_else(|| Error::NotPciDevice {
                device: self.name.clone(),
            })?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::ext_caps::CAP_ID_ACS;
    use crate::test_helpers::TestConfigSpace;

    fn device(cfg: TestConfigSpace) -> Arc<PciDevice> {
        PciDevice::new("0000:01:00.0", None, Vec::new(), Box::new(cfg))
    }

    #[test]
    fn resolve_walks_to_pci_ancestor() {
        let pci = device(TestConfigSpace::without_acs());
        let root = DeviceNode::new_pci(&pci);
        let child = DeviceNode::new_child("nvme0n1", &root);
        let grandchild = DeviceNode::new_child("ns1", &child);

        let resolved = grandchild.resolve_pci().unwrap();
        assert!(Arc::ptr_eq(&resolved, &pci));
    }

    #[test]
    fn resolve_fails_without_pci_ancestor() {
        let root = DeviceNode::new_detached("platform");
        let child = DeviceNode::new_child("dma0", &root);

        match child.resolve_pci() {
            Err(Error::NotPciDevice { device }) => assert_eq!(device, "dma0"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn ext_capability_at_list_head() {
        let dev = device(TestConfigSpace::new());
        assert_eq!(dev.find_ext_capability(CAP_ID_ACS), Some(0x100));
    }

    #[test]
    fn ext_capability_behind_another_capability() {
        let dev = device(TestConfigSpace::with_chained_acs());
        assert_eq!(dev.find_ext_capability(CAP_ID_ACS), Some(0x140));
    }

    #[test]
    fn ext_capability_absent() {
        let dev = device(TestConfigSpace::without_acs());
        assert_eq!(dev.find_ext_capability(CAP_ID_ACS), None);
    }
}
