// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The provider side: carving peer-to-peer memory out of a device's BARs,
//! publishing it for discovery, and tearing it down safely.
//!
//! Teardown is the delicate part. Peers may hold allocations when the
//! provider goes away, and the pool must not be destroyed underneath them;
//! [`P2pProvider::shutdown`] fails new allocations immediately, then
//! blocks on a drain barrier until the last outstanding allocation is
//! freed before dropping the pool.

use crate::Error;
use crate::fabric::PciDevice;
use crate::pool::P2pPool;
use event_listener::Event;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Allocation unit for provider pools. BAR-backed memory is always carved
/// out in host-page multiples.
pub const POOL_GRANULARITY: u64 = 4096;

#[derive(Default)]
struct LivenessState {
    outstanding: u64,
    dying: bool,
}

/// Tracks outstanding allocations and gates them off during teardown.
struct Liveness {
    state: Mutex<LivenessState>,
    drained: Event,
}

impl Liveness {
    fn new() -> Self {
        Self {
            state: Mutex::new(LivenessState::default()),
            drained: Event::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.dying {
            return false;
        }
        state.outstanding += 1;
        true
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.outstanding = state
            .outstanding
            .checked_sub(1)
            .expect("freed more than was allocated");
        if state.outstanding == 0 {
            self.drained.notify(usize::MAX);
        }
    }

    fn is_dying(&self) -> bool {
        self.state.lock().dying
    }

    /// Marks the provider dying and blocks until no allocations remain.
    /// The listener is registered before the count is re-checked so a
    /// racing release cannot be missed.
    fn shut_down(&self) {
        loop {
            let listener = self.drained.listen();
            {
                let mut state = self.state.lock();
                state.dying = true;
                if state.outstanding == 0 {
                    return;
                }
            }
            listener.wait();
        }
    }
}

/// Peer-to-peer memory exported by one PCI device.
///
/// Created unpublished and with no pool; [`add_resource`] contributions
/// build the pool, [`publish`] makes it discoverable to
/// [`ClientList::find`].
///
/// [`add_resource`]: Self::add_resource
/// [`publish`]: Self::publish
/// [`ClientList::find`]: crate::broker::ClientList::find
pub struct P2pProvider {
    device: Arc<PciDevice>,
    node_hint: Option<u32>,
    pool: Mutex<Option<Arc<P2pPool>>>,
    published: AtomicBool,
    liveness: Liveness,
}

impl fmt::Debug for P2pProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pProvider")
            .field("device", &self.device.name())
            .field("published", &self.published())
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

impl P2pProvider {
    /// Creates a provider for `device`, with no memory and unpublished.
    ///
    /// `node_hint` names the NUMA node the device hangs off of, recorded
    /// so placement-aware callers can weigh providers; this crate only
    /// reports it.
    pub fn new(device: Arc<PciDevice>, node_hint: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            device,
            node_hint,
            pool: Mutex::new(None),
            published: AtomicBool::new(false),
            liveness: Liveness::new(),
        })
    }

    /// The device exporting the memory.
    pub fn device(&self) -> &Arc<PciDevice> {
        &self.device
    }

    /// The NUMA node hint given at creation.
    pub fn node_hint(&self) -> Option<u32> {
        self.node_hint
    }

    /// Contributes `size` bytes at `offset` within BAR `bar` to the pool,
    /// creating the pool on first use. `size == 0` means everything from
    /// `offset` to the end of the BAR.
    pub fn add_resource(&self, bar: u8, size: u64, offset: u64) -> Result<(), Error> {
        let invalid = |size: u64, len: u64| Error::InvalidRange {
            device: self.device.name().to_owned(),
            bar,
            offset,
            size,
            len,
        };
        let range = match self.device.bar(bar) {
            Some(range) if offset < range.len => *range,
            other => {
                return Err(invalid(size, other.map_or(0, |range| range.len)));
            }
        };
        let size = if size == 0 { range.len - offset } else { size };
        if size > range.len - offset {
            return Err(invalid(size, range.len));
        }
        if self.liveness.is_dying() {
            return Err(Error::ProviderUnavailable {
                device: self.device.name().to_owned(),
            });
        }

        let pool = {
            let mut pool = self.pool.lock();
            pool.get_or_insert_with(|| {
                tracing::debug!(
                    device = self.device.name(),
                    node = self.node_hint,
                    "created peer-to-peer memory pool"
                );
                Arc::new(P2pPool::new(POOL_GRANULARITY, self.node_hint))
            })
            .clone()
        };
        pool.add_region(range.local_base + offset, range.bus_base + offset, size);
        tracing::debug!(
            device = self.device.name(),
            bar,
            offset,
            size,
            "added peer-to-peer memory"
        );
        Ok(())
    }

    /// Marks the provider discoverable (or not) to registries searching
    /// for memory. Publishing a provider that was never given memory is a
    /// warned no-op: there is nothing to discover.
    pub fn publish(&self, publish: bool) {
        if publish && self.pool.lock().is_none() {
            tracing::warn!(
                device = self.device.name(),
                "publishing a provider with no peer-to-peer memory"
            );
            return;
        }
        self.published.store(publish, Ordering::Relaxed);
    }

    /// Whether the provider is currently discoverable.
    pub fn published(&self) -> bool {
        self.published.load(Ordering::Relaxed)
    }

    /// Allocates `size` bytes (rounded up to [`POOL_GRANULARITY`]),
    /// returning the local address. `None` when the pool is exhausted,
    /// absent, or tearing down.
    pub fn alloc(&self, size: u64) -> Option<u64> {
        let pool = self.pool.lock().clone()?;
        if !self.liveness.try_acquire() {
            return None;
        }
        match pool.alloc(size) {
            Some(local_addr) => Some(local_addr),
            None => {
                self.liveness.release();
                None
            }
        }
    }

    /// Returns an allocation. The pair must match a prior
    /// [`alloc`](Self::alloc) exactly.
    pub fn free(&self, local_addr: u64, size: u64) {
        let pool = self
            .pool
            .lock()
            .clone()
            .expect("free against a provider with no pool");
        pool.free(local_addr, size);
        self.liveness.release();
    }

    /// Translates a pool-local address to the bus address peers must DMA
    /// to. Zero translates to zero, as does any address when the provider
    /// has no pool.
    pub fn virt_to_bus(&self, local_addr: u64) -> u64 {
        let Some(pool) = self.pool.lock().clone() else {
            return 0;
        };
        pool.virt_to_bus(local_addr)
    }

    /// Total pool bytes under management, 0 with no pool.
    pub fn size(&self) -> u64 {
        self.pool.lock().clone().map_or(0, |pool| pool.size())
    }

    /// Pool bytes currently free, 0 with no pool.
    pub fn available(&self) -> u64 {
        self.pool.lock().clone().map_or(0, |pool| pool.available())
    }

    /// Tears the provider down: stops discovery, fails new allocations,
    /// waits for outstanding allocations to drain, then drops the pool.
    ///
    /// Blocks the calling thread; idempotent.
    pub fn shutdown(&self) {
        self.published.store(false, Ordering::Relaxed);
        self.liveness.shut_down();
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.clear();
            tracing::debug!(device = self.device.name(), "peer-to-peer memory torn down");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::TEST_BAR_BUS_BASE;
    use crate::test_helpers::TEST_BAR_LOCAL_BASE;
    use crate::test_helpers::acs_port;
    use crate::test_helpers::provider_endpoint;
    use std::time::Duration;

    const PAGE: u64 = POOL_GRANULARITY;

    fn test_provider(bar_len: u64) -> Arc<P2pProvider> {
        let (root, _) = acs_port("root0", None);
        let (downstream, _) = acs_port("sw0-dsp0", Some(&root));
        let device = provider_endpoint("nvme0", &downstream, bar_len);
        P2pProvider::new(device, Some(0))
    }

    #[test]
    fn add_resource_validates_against_the_bar() {
        let provider = test_provider(PAGE * 8);

        // No such BAR.
        let err = provider.add_resource(3, PAGE, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { bar: 3, len: 0, .. }));

        // Offset beyond the BAR.
        let err = provider.add_resource(0, PAGE, PAGE * 8).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));

        // Range runs off the end.
        let err = provider.add_resource(0, PAGE * 8, PAGE).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));

        assert_eq!(provider.size(), 0);
    }

    #[test]
    fn zero_size_means_rest_of_bar() {
        let provider = test_provider(PAGE * 8);
        provider.add_resource(0, 0, PAGE * 2).unwrap();
        assert_eq!(provider.size(), PAGE * 6);
        assert_eq!(provider.available(), PAGE * 6);
    }

    #[test]
    fn publish_without_memory_is_refused() {
        let provider = test_provider(PAGE * 8);
        provider.publish(true);
        assert!(!provider.published());

        provider.add_resource(0, 0, 0).unwrap();
        provider.publish(true);
        assert!(provider.published());
        provider.publish(false);
        assert!(!provider.published());
    }

    #[test]
    fn alloc_and_translation_follow_the_bar_offset() {
        let provider = test_provider(PAGE * 8);
        provider.add_resource(0, PAGE * 4, PAGE).unwrap();

        let local = provider.alloc(PAGE).unwrap();
        assert_eq!(local, TEST_BAR_LOCAL_BASE + PAGE);
        assert_eq!(
            provider.virt_to_bus(local + 16),
            TEST_BAR_BUS_BASE + PAGE + 16
        );
        assert_eq!(provider.available(), PAGE * 3);

        provider.free(local, PAGE);
        assert_eq!(provider.available(), PAGE * 4);
    }

    #[test]
    fn translation_without_a_pool_is_null() {
        let provider = test_provider(PAGE * 8);
        assert_eq!(provider.virt_to_bus(0x1234), 0);
        assert_eq!(provider.virt_to_bus(0), 0);
    }

    #[test]
    fn shutdown_blocks_until_the_last_free() {
        let provider = test_provider(PAGE * 8);
        provider.add_resource(0, 0, 0).unwrap();
        provider.publish(true);
        let local = provider.alloc(PAGE).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let waiter = std::thread::spawn({
            let provider = provider.clone();
            let done = done.clone();
            move || {
                provider.shutdown();
                done.store(true, Ordering::SeqCst);
            }
        });

        // Cannot complete while the allocation is outstanding.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        provider.free(local, PAGE);
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(!provider.published());
        assert_eq!(provider.size(), 0);
    }

    #[test]
    fn nothing_works_after_shutdown() {
        let provider = test_provider(PAGE * 8);
        provider.add_resource(0, 0, 0).unwrap();
        provider.publish(true);
        provider.shutdown();

        assert!(!provider.published());
        assert_eq!(provider.alloc(PAGE), None);
        assert!(matches!(
            provider.add_resource(0, PAGE, 0),
            Err(Error::ProviderUnavailable { .. })
        ));
        provider.publish(true);
        assert!(!provider.published());

        // A second shutdown is fine.
        provider.shutdown();
    }
}
