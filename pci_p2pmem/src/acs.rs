// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted control of ACS peer redirect at switch ports.
//!
//! A downstream port with P2P Request Redirect or P2P Completion Redirect
//! set bounces peer TLPs up to the root complex for access checks, which
//! defeats switch-local peer-to-peer entirely. While any brokered binding
//! needs a port, this module holds those two bits clear there, and it puts
//! back exactly the bits it found once the last holder lets go. Ports
//! shared by several bindings are held once; the per-port state doubles as
//! the lock domain, so holders of different ports never contend.

use crate::Error;
use crate::fabric::PciDevice;
use crate::spec::acs::ACS_CONTROL_OFFSET;
use crate::spec::acs::ACS_REDIRECT_BITS;
use crate::spec::ext_caps::CAP_ID_ACS;
use std::sync::Arc;

/// Redirect state for one port. Lives on the port device under its mutex.
#[derive(Debug, Default)]
pub(crate) struct AcsHold {
    /// Holders currently requiring the redirect bits clear.
    count: u32,
    /// Offset of the ACS capability, cached while held. `None` while held
    /// means the port has no ACS and there is nothing to restore.
    cap: Option<u16>,
    /// The redirect bits to put back when the last hold drops.
    saved: u16,
}

/// Clears the peer-redirect bits on the upstream port of `device`,
/// stacking with other holders of the same port.
///
/// A port without an ACS capability cannot redirect, so the hold succeeds
/// without touching hardware. A port that refuses the register update
/// fails with [`Error::AcsUpdateRejected`] and holds nothing.
pub fn disable(device: &Arc<PciDevice>) -> Result<(), Error> {
    let Some(port) = device.upstream_bridge() else {
        return Err(Error::NoDownstreamPort {
            device: device.name().to_owned(),
        });
    };
    let mut hold = port.acs_hold.lock();
    if hold.count == 0 {
        match port.find_ext_capability(CAP_ID_ACS) {
            Some(cap) => {
                let control_offset = cap + ACS_CONTROL_OFFSET;
                let control = port.config().read_u16(control_offset);
                let saved = control & ACS_REDIRECT_BITS;
                port.config()
                    .write_u16(control_offset, control & !ACS_REDIRECT_BITS);
                if port.config().read_u16(control_offset) & ACS_REDIRECT_BITS != 0 {
                    tracing::warn!(
                        port = port.name(),
                        control,
                        "port rejected acs control update"
                    );
                    // A partial update could have cleared one redirect bit;
                    // put the original value back before giving up.
                    port.config().write_u16(control_offset, control);
                    return Err(Error::AcsUpdateRejected {
                        port: port.name().to_owned(),
                    });
                }
                hold.cap = Some(cap);
                hold.saved = saved;
                tracing::debug!(port = port.name(), saved, "cleared acs peer redirect");
            }
            None => {
                tracing::debug!(
                    port = port.name(),
                    "no acs capability, peer redirect not enforced"
                );
            }
        }
    }
    hold.count += 1;
    Ok(())
}

/// Drops one hold on the upstream port of `device`, restoring the saved
/// redirect bits when the last hold goes away.
///
/// Calls beyond the matching [`disable`] count are ignored, as are devices
/// with no upstream port; teardown paths need not track whether engagement
/// happened.
pub fn reset(device: &Arc<PciDevice>) {
    let Some(port) = device.upstream_bridge() else {
        return;
    };
    let mut hold = port.acs_hold.lock();
    if hold.count == 0 {
        return;
    }
    hold.count -= 1;
    if hold.count > 0 {
        return;
    }
    if let Some(cap) = hold.cap.take() {
        let control_offset = cap + ACS_CONTROL_OFFSET;
        let control = port.config().read_u16(control_offset);
        port.config()
            .write_u16(control_offset, control | hold.saved);
        tracing::debug!(
            port = port.name(),
            restored = hold.saved,
            "restored acs peer redirect"
        );
        hold.saved = 0;
    }
}
