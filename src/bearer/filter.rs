//! Per-interface output filters.
//!
//! Every network interface carries a whitelist or blacklist of destination addresses that is
//! consulted before a network PDU is handed to the bearer. ADV interfaces come up as an empty
//! blacklist (accept everything); GATT interfaces come up as an empty whitelist (drop everything
//! until the proxy client configures it or the server learns source addresses).

use crate::address::Address;
use heapless::Vec;

/// Maximum number of addresses an output filter can hold.
pub const FILTER_CAPACITY: usize = 16;

/// Filter list interpretation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// Only listed addresses pass.
    Whitelist,
    /// Listed addresses are dropped.
    Blacklist,
}

impl FilterKind {
    /// Decodes the one-octet wire representation used by Set Filter Type and Filter Status.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(FilterKind::Whitelist),
            0x01 => Some(FilterKind::Blacklist),
            _ => None,
        }
    }

    pub fn raw(&self) -> u8 {
        match self {
            FilterKind::Whitelist => 0x00,
            FilterKind::Blacklist => 0x01,
        }
    }
}

/// A destination address filter attached to a network interface.
#[derive(Debug)]
pub struct OutputFilter {
    kind: FilterKind,
    addrs: Vec<Address, FILTER_CAPACITY>,
}

impl OutputFilter {
    /// Creates an empty filter of the given kind.
    pub fn new(kind: FilterKind) -> Self {
        Self {
            kind,
            addrs: Vec::new(),
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Number of addresses currently in the list.
    pub fn len(&self) -> u16 {
        self.addrs.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Switches the filter type and clears the address list.
    pub fn set_kind(&mut self, kind: FilterKind) {
        self.kind = kind;
        self.addrs.clear();
    }

    /// Adds an address to the list.
    ///
    /// Unassigned addresses are skipped, re-adding a present address is a no-op, and additions
    /// beyond the capacity are silently dropped (the Filter Status reply then reports the
    /// unchanged size).
    pub fn add(&mut self, addr: Address) {
        if addr.is_unassigned() || self.addrs.contains(&addr) {
            return;
        }
        let _ = self.addrs.push(addr);
    }

    /// Removes an address from the list. Removing an absent address is a no-op.
    pub fn remove(&mut self, addr: Address) {
        if addr.is_unassigned() {
            return;
        }
        if let Some(pos) = self.addrs.iter().position(|a| *a == addr) {
            self.addrs.swap_remove(pos);
        }
    }

    /// Decides whether a PDU to `dst` must be filtered out on this interface.
    ///
    /// An unassigned destination is always filtered.
    pub fn filters_out(&self, dst: Address) -> bool {
        if dst.is_unassigned() {
            return true;
        }

        let in_list = self.addrs.contains(&dst);
        match self.kind {
            FilterKind::Blacklist => in_list,
            FilterKind::Whitelist => !in_list,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_accepts_by_default() {
        let mut f = OutputFilter::new(FilterKind::Blacklist);
        assert!(!f.filters_out(Address(0xC000)));
        f.add(Address(0xC000));
        assert!(f.filters_out(Address(0xC000)));
        assert!(!f.filters_out(Address(0xC001)));
    }

    #[test]
    fn whitelist_drops_by_default() {
        let mut f = OutputFilter::new(FilterKind::Whitelist);
        assert!(f.filters_out(Address(0xC000)));
        f.add(Address(0xC000));
        assert!(!f.filters_out(Address(0xC000)));
        assert!(f.filters_out(Address(0xC001)));
    }

    #[test]
    fn unassigned_always_filtered() {
        let f = OutputFilter::new(FilterKind::Blacklist);
        assert!(f.filters_out(Address::UNASSIGNED));
    }

    #[test]
    fn add_remove_round_trip() {
        let mut f = OutputFilter::new(FilterKind::Whitelist);
        let before = f.len();
        f.add(Address(0xC000));
        f.add(Address(0xC001));
        // Re-adding a present address is a no-op.
        f.add(Address(0xC000));
        assert_eq!(f.len(), 2);
        f.remove(Address(0xC000));
        f.remove(Address(0xC001));
        assert_eq!(f.len(), before);
        // Removing an absent address is a no-op.
        f.remove(Address(0xC005));
        assert_eq!(f.len(), before);
    }

    #[test]
    fn set_kind_clears() {
        let mut f = OutputFilter::new(FilterKind::Whitelist);
        f.add(Address(0xC000));
        f.set_kind(FilterKind::Blacklist);
        assert_eq!(f.len(), 0);
        assert!(!f.filters_out(Address(0xC000)));
    }
}
