//! Mesh addresses.
//!
//! Every network PDU carries a 16-bit source and destination address. The value ranges partition
//! into several kinds with different routing rules, and most validation gates in the network
//! pipeline are expressed in terms of these kinds.

use core::fmt;

/// A 16-bit mesh address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u16);

/// The different kinds of mesh addresses, determined by value range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressKind {
    /// `0x0000`. Never a valid source; as a destination it means "nobody" and is filtered.
    Unassigned,

    /// `0x0001..=0x7FFF`. A single element of a single node.
    Unicast,

    /// `0x8000..=0xBFFF`. Hash of a 128-bit label UUID.
    Virtual,

    /// `0xC000..=0xFEFF`. A dynamically assigned multicast group.
    Group,

    /// `0xFF00..=0xFFFB`. Reserved for future use; PDUs to these are dropped.
    Rfu,

    /// `0xFFFC..=0xFFFF`. All-proxies, all-friends, all-relays and all-nodes.
    FixedGroup,
}

impl Address {
    /// The unassigned address `0x0000`.
    ///
    /// Also doubles as the "no friendship credentials" marker in PDU metadata.
    pub const UNASSIGNED: Self = Address(0x0000);

    /// The all-nodes fixed group address.
    pub const ALL_NODES: Self = Address(0xFFFF);

    /// Returns the kind of this address, determined by its value range.
    pub fn kind(&self) -> AddressKind {
        match self.0 {
            0x0000 => AddressKind::Unassigned,
            0x0001..=0x7FFF => AddressKind::Unicast,
            0x8000..=0xBFFF => AddressKind::Virtual,
            0xC000..=0xFEFF => AddressKind::Group,
            0xFF00..=0xFFFB => AddressKind::Rfu,
            _ => AddressKind::FixedGroup,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.kind() == AddressKind::Unassigned
    }

    pub fn is_unicast(&self) -> bool {
        self.kind() == AddressKind::Unicast
    }

    pub fn is_virtual(&self) -> bool {
        self.kind() == AddressKind::Virtual
    }

    pub fn is_group(&self) -> bool {
        self.kind() == AddressKind::Group
    }

    pub fn is_fixed_group(&self) -> bool {
        self.kind() == AddressKind::FixedGroup
    }

    pub fn is_rfu(&self) -> bool {
        self.kind() == AddressKind::Rfu
    }

    /// Returns whether this address is a valid *destination* for a locally originated PDU.
    ///
    /// Unassigned and RFU destinations are rejected at the network TX entry point.
    pub fn is_valid_destination(&self) -> bool {
        match self.kind() {
            AddressKind::Unicast | AddressKind::Virtual | AddressKind::Group => true,
            AddressKind::FixedGroup => true,
            AddressKind::Unassigned | AddressKind::Rfu => false,
        }
    }

    /// Returns the raw address value.
    pub fn raw(&self) -> u16 {
        self.0
    }
}

impl From<u16> for Address {
    fn from(raw: u16) -> Self {
        Address(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}
