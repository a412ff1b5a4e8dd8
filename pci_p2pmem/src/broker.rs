// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The client registry and provider matching.
//!
//! A consumer stack gathers every device that will touch a shared
//! peer-to-peer buffer into a [`ClientList`], then asks [`ClientList::find`]
//! for a provider all of them can reach switch-locally. Binding is
//! transactional with respect to ACS: either every involved port ends up
//! with peer redirect cleared and held, or none does and the next
//! candidate is tried.
//!
//! The registry is deliberately not self-synchronizing. It belongs to one
//! consumer setup path (probe, teardown) at a time, and every operation
//! takes `&mut self` so the compiler enforces what a lock otherwise would.

use crate::Error;
use crate::acs;
use crate::fabric::DeviceNode;
use crate::fabric::PciDevice;
use crate::provider::P2pProvider;
use crate::topology;
use std::sync::Arc;

/// A source of candidate providers for [`ClientList::find`].
///
/// Implementations enumerate in a stable order. The broker binds the
/// first workable candidate, so enumeration order is preference order.
pub trait ProviderSource: Send + Sync {
    /// The providers currently registered.
    fn providers(&self) -> Vec<Arc<P2pProvider>>;
}

#[derive(Debug)]
struct Client {
    node: Arc<DeviceNode>,
    pci: Arc<PciDevice>,
    provider: Option<Arc<P2pProvider>>,
    acs_engaged: bool,
}

/// The devices that will DMA to one shared peer-to-peer buffer.
#[derive(Debug, Default)]
pub struct ClientList {
    clients: Vec<Client>,
    provider: Option<Arc<P2pProvider>>,
}

impl ClientList {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry has no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The provider bound by [`find`](Self::find), if any.
    pub fn provider(&self) -> Option<&Arc<P2pProvider>> {
        self.provider.as_ref()
    }

    /// Registers the device above `node` as a peer-to-peer client.
    ///
    /// The node must resolve to a PCI device, and that device must share a
    /// switch with whatever the registry is already committed to: the
    /// bound provider if [`find`](Self::find) has run, the existing
    /// clients otherwise. When a provider is bound, the new client's port
    /// engages the ACS gate immediately; on any error nothing is
    /// registered.
    pub fn add_client(&mut self, node: &Arc<DeviceNode>) -> Result<(), Error> {
        let pci = node.resolve_pci()?;

        let reference = if let Some(provider) = &self.provider {
            Some(topology::upstream_switch_port(provider.device()))
        } else {
            self.clients
                .first()
                .map(|client| topology::upstream_switch_port(&client.pci))
        };
        if let Some(reference) = reference {
            let port = topology::upstream_switch_port(&pci).ok_or_else(|| {
                Error::NoUpstreamPort {
                    device: pci.name().to_owned(),
                }
            })?;
            if !reference
                .as_ref()
                .is_some_and(|reference| Arc::ptr_eq(reference, &port))
            {
                return Err(Error::TopologyMismatch {
                    device: pci.name().to_owned(),
                });
            }
        }

        let provider = self.provider.clone();
        let acs_engaged = if provider.is_some() {
            acs::disable(&pci)?;
            true
        } else {
            false
        };
        self.clients.push(Client {
            node: node.clone(),
            pci,
            provider,
            acs_engaged,
        });
        Ok(())
    }

    /// Removes every entry registered for `node`, releasing its ACS
    /// holds. Nodes that were never added are ignored.
    ///
    /// When the last client leaves a bound registry, the provider's own
    /// ACS hold is released and the binding dropped.
    pub fn remove_client(&mut self, node: &Arc<DeviceNode>) {
        let before = self.clients.len();
        self.clients.retain(|client| {
            if Arc::ptr_eq(&client.node, node) {
                if client.acs_engaged {
                    acs::reset(&client.pci);
                }
                false
            } else {
                true
            }
        });
        if self.clients.len() < before && self.clients.is_empty() {
            if let Some(provider) = self.provider.take() {
                acs::reset(provider.device());
            }
        }
    }

    /// Finds a published provider every registered client can reach
    /// through its switch and binds to it, or returns the provider already
    /// bound.
    ///
    /// Binding engages the ACS gate on the provider's port and every
    /// client's port. A failure partway through releases exactly the holds
    /// this candidate took before the next candidate is tried. `None`
    /// means no candidate worked; that is an outcome, not an error.
    pub fn find(&mut self, providers: &dyn ProviderSource) -> Option<Arc<P2pProvider>> {
        if let Some(provider) = &self.provider {
            return Some(provider.clone());
        }
        'candidates: for provider in providers.providers() {
            if !provider.published() {
                continue;
            }
            if topology::upstream_switch_port(provider.device()).is_none() {
                tracing::debug!(
                    device = provider.device().name(),
                    "provider not behind a switch, cannot export peer-to-peer memory"
                );
                continue;
            }
            if !self
                .clients
                .iter()
                .all(|client| topology::same_switch(provider.device(), &client.pci))
            {
                continue;
            }

            if let Err(err) = acs::disable(provider.device()) {
                tracing::warn!(
                    device = provider.device().name(),
                    error = &err as &dyn std::error::Error,
                    "skipping provider, acs update failed"
                );
                continue;
            }
            for engaged in 0..self.clients.len() {
                if let Err(err) = acs::disable(&self.clients[engaged].pci) {
                    tracing::warn!(
                        device = self.clients[engaged].pci.name(),
                        error = &err as &dyn std::error::Error,
                        "skipping provider, client acs update failed"
                    );
                    for client in &self.clients[..engaged] {
                        acs::reset(&client.pci);
                    }
                    acs::reset(provider.device());
                    continue 'candidates;
                }
            }

            for client in &mut self.clients {
                client.provider = Some(provider.clone());
                client.acs_engaged = true;
            }
            self.provider = Some(provider.clone());
            tracing::debug!(
                device = provider.device().name(),
                clients = self.clients.len(),
                "bound peer-to-peer provider"
            );
            return Some(provider);
        }
        None
    }
}

impl Drop for ClientList {
    /// Full-teardown path: releases the provider hold (if bound) and every
    /// client hold.
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            acs::reset(provider.device());
        }
        for client in self.clients.drain(..) {
            if client.acs_engaged {
                acs::reset(&client.pci);
            }
        }
    }
}
