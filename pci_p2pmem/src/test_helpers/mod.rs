// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A fake PCI fabric for exercising the broker without hardware: bridge
//! ports with emulated ACS configuration space, endpoints with canned BAR
//! resources, and a provider registry.
//!
//! Public rather than `cfg(test)` so crates embedding the broker can
//! drive their own tests against the same fakes.

use crate::broker::ProviderSource;
use crate::fabric::BarRange;
use crate::fabric::ConfigAccess;
use crate::fabric::PciDevice;
use crate::provider::P2pProvider;
use crate::spec::acs::ACS_CONTROL_OFFSET;
use crate::spec::acs::AcsCapability;
use crate::spec::acs::AcsControl;
use crate::spec::ext_caps::CAP_ID_ACS;
use crate::spec::ext_caps::EXTENDED_CAPABILITIES_START;
use crate::spec::ext_caps::ExtendedCapabilityHeader;
use parking_lot::Mutex;
use std::sync::Arc;

/// Local (CPU-side) base address test BARs pretend to be mapped at.
pub const TEST_BAR_LOCAL_BASE: u64 = 0x4000_0000;

/// Bus address the same BAR bytes show up at for peer devices.
pub const TEST_BAR_BUS_BASE: u64 = 0x20_0000_0000;

struct CfgInner {
    acs_offset: Option<u16>,
    chain: Vec<(u16, u32)>,
    capability: u16,
    control: u16,
    drop_writes: u32,
    control_writes: u32,
}

/// Emulated extended configuration space with an ACS capability and
/// enough fault injection to reach the unhappy paths.
///
/// Clones share state, so a test can keep a handle while the device owns
/// another.
#[derive(Clone)]
pub struct TestConfigSpace {
    inner: Arc<Mutex<CfgInner>>,
}

impl TestConfigSpace {
    /// ACS at the head of the extended capability list, with source
    /// validation and both peer-redirect bits initially set - the state
    /// firmware commonly leaves downstream ports in.
    pub fn new() -> Self {
        Self::with_acs_at(EXTENDED_CAPABILITIES_START, Vec::new())
    }

    /// ACS behind a vendor-specific capability, for list-walk coverage.
    pub fn with_chained_acs() -> Self {
        let vendor = ExtendedCapabilityHeader::new()
            .with_id(0x000B)
            .with_version(1)
            .with_next(0x140)
            .into_bits();
        Self::with_acs_at(0x140, vec![(EXTENDED_CAPABILITIES_START, vendor)])
    }

    /// No extended capabilities at all.
    pub fn without_acs() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CfgInner {
                acs_offset: None,
                chain: Vec::new(),
                capability: 0,
                control: 0,
                drop_writes: 0,
                control_writes: 0,
            })),
        }
    }

    fn with_acs_at(offset: u16, chain: Vec<(u16, u32)>) -> Self {
        let capability = AcsCapability::new()
            .with_source_validation(true)
            .with_p2p_request_redirect(true)
            .with_p2p_completion_redirect(true)
            .with_upstream_forwarding(true)
            .into_bits();
        let control = AcsControl::new()
            .with_source_validation(true)
            .with_p2p_request_redirect(true)
            .with_p2p_completion_redirect(true)
            .into_bits();
        Self {
            inner: Arc::new(Mutex::new(CfgInner {
                acs_offset: Some(offset),
                chain,
                capability,
                control,
                drop_writes: 0,
                control_writes: 0,
            })),
        }
    }

    /// Current value of the ACS control register.
    pub fn control(&self) -> u16 {
        self.inner.lock().control
    }

    /// Writes the ACS control register has seen, dropped ones included.
    pub fn control_writes(&self) -> u32 {
        self.inner.lock().control_writes
    }

    /// Makes the next `count` control writes disappear, the way a port
    /// with quirked firmware drops them.
    pub fn drop_writes(&self, count: u32) {
        self.inner.lock().drop_writes = count;
    }
}

impl Default for TestConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigAccess for TestConfigSpace {
    fn read_u32(&self, offset: u16) -> u32 {
        let inner = self.inner.lock();
        if let Some((_, header)) = inner.chain.iter().find(|(pos, _)| *pos == offset) {
            return *header;
        }
        if let Some(acs) = inner.acs_offset {
            if offset == acs {
                return ExtendedCapabilityHeader::new()
                    .with_id(CAP_ID_ACS)
                    .with_version(1)
                    .into_bits();
            }
            if offset == acs + 4 {
                return (inner.capability as u32) | ((inner.control as u32) << 16);
            }
        }
        0
    }

    fn write_u16(&self, offset: u16, value: u16) {
        let mut inner = self.inner.lock();
        let Some(acs) = inner.acs_offset else {
            return;
        };
        if offset == acs + ACS_CONTROL_OFFSET {
            inner.control_writes += 1;
            if inner.drop_writes > 0 {
                inner.drop_writes -= 1;
                return;
            }
            inner.control = value;
        }
        // Everything else, the capability register included, is read-only.
    }
}

/// A bridge port with ACS, plus the handle to watch its config space.
pub fn acs_port(
    name: impl Into<String>,
    upstream: Option<&Arc<PciDevice>>,
) -> (Arc<PciDevice>, TestConfigSpace) {
    let cfg = TestConfigSpace::new();
    let device = bridge_with(name, upstream, cfg.clone());
    (device, cfg)
}

/// A bridge port with the given config space.
pub fn bridge_with(
    name: impl Into<String>,
    upstream: Option<&Arc<PciDevice>>,
    cfg: TestConfigSpace,
) -> Arc<PciDevice> {
    PciDevice::new(name, upstream.cloned(), Vec::new(), Box::new(cfg))
}

/// An endpoint with no memory to share.
pub fn endpoint(name: impl Into<String>, upstream: &Arc<PciDevice>) -> Arc<PciDevice> {
    PciDevice::new(
        name,
        Some(upstream.clone()),
        Vec::new(),
        Box::new(TestConfigSpace::without_acs()),
    )
}

/// An endpoint exposing `bar_len` bytes of shareable memory in BAR 0,
/// mapped at [`TEST_BAR_LOCAL_BASE`] and bus-visible at
/// [`TEST_BAR_BUS_BASE`].
pub fn provider_endpoint(
    name: impl Into<String>,
    upstream: &Arc<PciDevice>,
    bar_len: u64,
) -> Arc<PciDevice> {
    PciDevice::new(
        name,
        Some(upstream.clone()),
        vec![BarRange {
            index: 0,
            local_base: TEST_BAR_LOCAL_BASE,
            bus_base: TEST_BAR_BUS_BASE,
            len: bar_len,
        }],
        Box::new(TestConfigSpace::without_acs()),
    )
}

/// Provider registration order stands in for whatever enumeration the
/// embedder has; [`ClientList::find`](crate::broker::ClientList::find)
/// scans it front to back.
#[derive(Default)]
pub struct TestFabric {
    providers: Mutex<Vec<Arc<P2pProvider>>>,
}

impl TestFabric {
    /// An empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a provider to the enumeration order.
    pub fn register_provider(&self, provider: &Arc<P2pProvider>) {
        self.providers.lock().push(provider.clone());
    }
}

impl ProviderSource for TestFabric {
    fn providers(&self) -> Vec<Arc<P2pProvider>> {
        self.providers.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn control_register_latches_and_faults() {
        let cfg = TestConfigSpace::new();
        let initial = cfg.control();
        assert_eq!(
            cfg.read_u16(EXTENDED_CAPABILITIES_START + ACS_CONTROL_OFFSET),
            initial
        );

        cfg.drop_writes(1);
        cfg.write_u16(EXTENDED_CAPABILITIES_START + ACS_CONTROL_OFFSET, 0);
        assert_eq!(cfg.control(), initial);
        cfg.write_u16(EXTENDED_CAPABILITIES_START + ACS_CONTROL_OFFSET, 0);
        assert_eq!(cfg.control(), 0);
        assert_eq!(cfg.control_writes(), 2);
    }
}
