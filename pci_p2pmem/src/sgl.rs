// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scatter-gather lists over provider memory.
//!
//! The usual consumer flow: allocate a buffer from the bound provider,
//! map it to hand bus addresses to a peer's DMA engine, run the I/O,
//! unmap, drop. Provider memory comes from one pool region, so lists are
//! single-segment today; the shape leaves room for multi-segment
//! allocation without changing consumers.

use crate::Error;
use crate::provider::P2pProvider;
use std::sync::Arc;

/// One contiguous run of provider memory.
#[derive(Debug)]
pub struct SgEntry {
    local_addr: u64,
    len: u64,
    bus_addr: Option<u64>,
}

impl SgEntry {
    /// Pool-local address of the segment.
    pub fn local_addr(&self) -> u64 {
        self.local_addr
    }

    /// Segment length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Bus address peers DMA to, present while the list is mapped.
    pub fn bus_addr(&self) -> Option<u64> {
        self.bus_addr
    }
}

/// A scatter-gather list of provider memory. The memory returns to the
/// pool when the list drops.
#[derive(Debug)]
pub struct P2pSgList {
    provider: Arc<P2pProvider>,
    entries: Vec<SgEntry>,
}

impl P2pSgList {
    /// Allocates `length` bytes of `provider` memory as a single segment.
    pub fn alloc(provider: &Arc<P2pProvider>, length: u64) -> Result<Self, Error> {
        let local_addr = provider
            .alloc(length)
            .ok_or(Error::OutOfMemory { size: length })?;
        Ok(Self {
            provider: provider.clone(),
            entries: vec![SgEntry {
                local_addr,
                len: length,
                bus_addr: None,
            }],
        })
    }

    /// Fills in each segment's bus address, returning the number of
    /// mapped segments.
    pub fn map_for_dma(&mut self) -> usize {
        for entry in &mut self.entries {
            entry.bus_addr = Some(self.provider.virt_to_bus(entry.local_addr));
        }
        self.entries.len()
    }

    /// Clears the bus addresses filled by [`map_for_dma`](Self::map_for_dma).
    pub fn unmap_for_dma(&mut self) {
        for entry in &mut self.entries {
            entry.bus_addr = None;
        }
    }

    /// The segments of the list.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// The provider the memory belongs to.
    pub fn provider(&self) -> &Arc<P2pProvider> {
        &self.provider
    }
}

impl Drop for P2pSgList {
    fn drop(&mut self) {
        for entry in &self.entries {
            self.provider.free(entry.local_addr, entry.len);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::POOL_GRANULARITY;
    use crate::test_helpers::TEST_BAR_BUS_BASE;
    use crate::test_helpers::TEST_BAR_LOCAL_BASE;
    use crate::test_helpers::acs_port;
    use crate::test_helpers::provider_endpoint;

    const PAGE: u64 = POOL_GRANULARITY;

    fn test_provider() -> Arc<P2pProvider> {
        let (root, _) = acs_port("root0", None);
        let (downstream, _) = acs_port("sw0-dsp0", Some(&root));
        let provider = P2pProvider::new(
            provider_endpoint("nvme0", &downstream, PAGE * 4),
            None,
        );
        provider.add_resource(0, 0, 0).unwrap();
        provider
    }

    #[test]
    fn alloc_map_unmap() {
        let provider = test_provider();
        let mut list = P2pSgList::alloc(&provider, PAGE * 2).unwrap();
        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.entries()[0].local_addr(), TEST_BAR_LOCAL_BASE);
        assert_eq!(list.entries()[0].len(), PAGE * 2);
        assert_eq!(list.entries()[0].bus_addr(), None);

        assert_eq!(list.map_for_dma(), 1);
        assert_eq!(list.entries()[0].bus_addr(), Some(TEST_BAR_BUS_BASE));

        list.unmap_for_dma();
        assert_eq!(list.entries()[0].bus_addr(), None);
    }

    #[test]
    fn drop_returns_the_memory() {
        let provider = test_provider();
        let list = P2pSgList::alloc(&provider, PAGE).unwrap();
        assert_eq!(provider.available(), PAGE * 3);
        drop(list);
        assert_eq!(provider.available(), PAGE * 4);

        // With the list gone, teardown has nothing to wait for.
        provider.shutdown();
        assert_eq!(provider.size(), 0);
    }

    #[test]
    fn exhaustion_is_an_error_here() {
        let provider = test_provider();
        let _all = P2pSgList::alloc(&provider, PAGE * 4).unwrap();
        match P2pSgList::alloc(&provider, PAGE) {
            Err(Error::OutOfMemory { size }) => assert_eq!(size, PAGE),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
