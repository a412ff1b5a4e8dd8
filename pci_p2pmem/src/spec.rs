// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI Express spec.
//!
//! Only the slice this crate needs: the extended capability list header
//! and the Access Control Services (ACS) capability.

/// Extended capabilities
pub mod ext_caps {
    use bitfield_struct::bitfield;

    /// Offset of the first extended capability header in configuration
    /// space.
    pub const EXTENDED_CAPABILITIES_START: u16 = 0x100;

    /// Size of PCI Express configuration space.
    pub const EXTENDED_CONFIG_SPACE_SIZE: u16 = 0x1000;

    /// Upper bound on list walks, assuming minimally-sized (8 byte)
    /// capabilities packed into the extended region. Malformed lists
    /// terminate rather than loop.
    pub const EXTENDED_CAPABILITIES_TTL: u16 =
        (EXTENDED_CONFIG_SPACE_SIZE - EXTENDED_CAPABILITIES_START) / 8;

    /// ACS extended capability ID.
    pub const CAP_ID_ACS: u16 = 0x000D;

    /// Extended Capability Header
    ///
    /// See PCIe 4.0 spec - 7.6.3.
    #[bitfield(u32)]
    pub struct ExtendedCapabilityHeader {
        /// Capability ID.
        #[bits(16)]
        pub id: u16,
        /// Capability version.
        #[bits(4)]
        pub version: u8,
        /// Offset of the next capability header, 0 if this is the last.
        #[bits(12)]
        pub next: u16,
    }

    impl ExtendedCapabilityHeader {
        /// Offset of the next capability header, masked to the DWORD
        /// alignment the hardware guarantees, or `None` at the end of the
        /// list.
        pub fn next_offset(&self) -> Option<u16> {
            let next = self.next() & !0x3;
            (next >= EXTENDED_CAPABILITIES_START).then_some(next)
        }
    }
}

/// Access Control Services
pub mod acs {
    use bitfield_struct::bitfield;

    /// Offset of the ACS Capability register from the capability header.
    pub const ACS_CAPABILITY_OFFSET: u16 = 0x04;

    /// Offset of the ACS Control register from the capability header.
    pub const ACS_CONTROL_OFFSET: u16 = 0x06;

    /// ACS Capability Register
    ///
    /// See PCIe 4.0 spec - 7.7.8.2.
    #[bitfield(u16)]
    pub struct AcsCapability {
        /// ACS Source Validation supported.
        pub source_validation: bool,
        /// ACS Translation Blocking supported.
        pub translation_blocking: bool,
        /// ACS P2P Request Redirect supported.
        pub p2p_request_redirect: bool,
        /// ACS P2P Completion Redirect supported.
        pub p2p_completion_redirect: bool,
        /// ACS Upstream Forwarding supported.
        pub upstream_forwarding: bool,
        /// ACS P2P Egress Control supported.
        pub p2p_egress_control: bool,
        /// ACS Direct Translated P2P supported.
        pub direct_translated_p2p: bool,
        _reserved: bool,
        /// Size of the egress control vector, 0 encoding 256 bits.
        pub egress_control_vector_size: u8,
    }

    /// ACS Control Register
    ///
    /// See PCIe 4.0 spec - 7.7.8.3.
    #[bitfield(u16)]
    pub struct AcsControl {
        /// ACS Source Validation enable.
        pub source_validation: bool,
        /// ACS Translation Blocking enable.
        pub translation_blocking: bool,
        /// ACS P2P Request Redirect enable.
        pub p2p_request_redirect: bool,
        /// ACS P2P Completion Redirect enable.
        pub p2p_completion_redirect: bool,
        /// ACS Upstream Forwarding enable.
        pub upstream_forwarding: bool,
        /// ACS P2P Egress Control enable.
        pub p2p_egress_control: bool,
        /// ACS Direct Translated P2P enable.
        pub direct_translated_p2p: bool,
        #[bits(9)]
        _reserved: u16,
    }

    /// The control bits that force peer-to-peer TLPs up to the root complex
    /// for access checks. Peer traffic only flows switch-local while both
    /// are clear.
    pub const ACS_REDIRECT_BITS: u16 = AcsControl::new()
        .with_p2p_request_redirect(true)
        .with_p2p_completion_redirect(true)
        .into_bits();

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn redirect_bits_cover_request_and_completion() {
            assert_eq!(ACS_REDIRECT_BITS, 0b1100);
            let ctrl = AcsControl::from_bits(ACS_REDIRECT_BITS);
            assert!(ctrl.p2p_request_redirect());
            assert!(ctrl.p2p_completion_redirect());
            assert!(!ctrl.source_validation());
            assert!(!ctrl.upstream_forwarding());
        }
    }
}
