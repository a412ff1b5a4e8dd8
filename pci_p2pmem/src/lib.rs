// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Brokering of PCI peer-to-peer DMA memory.
//!
//! Some devices expose a window of their own memory through a BAR for
//! peers to DMA into directly - an NVMe controller memory buffer used as
//! an RDMA target, for example - keeping bulk data off the host memory
//! bus. Using that memory safely takes more than an address:
//!
//! - the bytes a provider contributes must be pooled, allocated, and
//!   translated from CPU-side addresses to the bus addresses peers emit
//!   ([`provider`], [`pool`]);
//! - every device touching a shared buffer must sit below the same PCI
//!   switch as the provider, the one shape where peer TLPs verifiably
//!   avoid the root complex ([`topology`]);
//! - the switch ports involved must have their ACS peer-redirect controls
//!   cleared for the duration, and put back afterwards ([`acs`]);
//! - consumers need all of that stitched together: register the client
//!   devices, find a compatible published provider, bind transactionally
//!   ([`broker`]).
//!
//! The crate is sans-io. Embedders describe their device fabric with
//! [`fabric`] types (upstream links, BAR resources, config-space access)
//! and inject provider enumeration through
//! [`broker::ProviderSource`]; nothing here talks to an OS. The
//! [`test_helpers`] fabric emulates enough of a switch hierarchy,
//! ACS registers included, to exercise every path in tests.

#![forbid(unsafe_code)]

pub mod acs;
pub mod broker;
pub mod fabric;
pub mod pool;
pub mod provider;
pub mod sgl;
pub mod spec;
pub mod test_helpers;
pub mod topology;

use thiserror::Error;

/// Errors surfaced by this crate.
///
/// Absence outcomes are not errors and come back as `None`:
/// [`ClientList::find`](broker::ClientList::find) finding no compatible
/// provider, [`P2pProvider::alloc`](provider::P2pProvider::alloc) finding
/// no free range.
#[derive(Debug, Error)]
pub enum Error {
    /// A contributed range does not fit the BAR backing it.
    #[error("{size:#x} bytes at offset {offset:#x} do not fit bar {bar} of {device} (length {len:#x})")]
    InvalidRange {
        /// The provider device.
        device: String,
        /// The BAR index given.
        bar: u8,
        /// The offset given.
        offset: u64,
        /// The size given (or computed from a zero size).
        size: u64,
        /// The BAR's actual length, 0 if it is not implemented.
        len: u64,
    },
    /// A scatter-gather allocation could not be satisfied.
    #[error("unable to allocate {size:#x} bytes of peer-to-peer memory")]
    OutOfMemory {
        /// The requested length in bytes.
        size: u64,
    },
    /// The node does not descend from a PCI device.
    #[error("{device} is not and does not descend from a pci device")]
    NotPciDevice {
        /// The node that failed to resolve.
        device: String,
    },
    /// The device is not behind a switch, so it cannot reach peers without
    /// crossing a root complex.
    #[error("{device} is not behind a pci switch")]
    NoUpstreamPort {
        /// The device in question.
        device: String,
    },
    /// The device sits behind a different switch than the rest of the
    /// registry.
    #[error("{device} does not share a switch with the registry")]
    TopologyMismatch {
        /// The rejected device.
        device: String,
    },
    /// ACS control needs an upstream port to act on, and the device has
    /// none.
    #[error("{device} has no upstream port to control acs on")]
    NoDownstreamPort {
        /// The device in question.
        device: String,
    },
    /// The port refused the ACS control register update.
    #[error("{port} rejected the acs control update")]
    AcsUpdateRejected {
        /// The port whose register did not take the write.
        port: String,
    },
    /// The provider has begun tearing down.
    #[error("peer-to-peer memory of {device} is shutting down")]
    ProviderUnavailable {
        /// The provider device.
        device: String,
    },
}
