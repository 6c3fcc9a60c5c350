//! Network PDU representation: header packing, transmission tags and the PDU arena.
//!
//! # Header format
//!
//! The 9-octet network header is packed big-endian in front of the lower transport PDU and is
//! part of the obfuscated/encrypted region:
//!
//! ```notrust
//! byte 0: IVI(1) | NID(7)
//! byte 1: CTL(1) | TTL(7)
//! byte 2..4: SEQ(24)
//! byte 5..6: SRC(16)
//! byte 7..8: DST(16)
//! ```
//!
//! The NetMIC trailing the payload is 4 octets for access PDUs (CTL = 0) and 8 octets for
//! control PDUs (CTL = 1).
//!
//! # Arena
//!
//! Every live PDU occupies an arena slot addressed by a small [`PduHandle`] carrying a
//! generation counter, so a stale handle held across a free/realloc cycle can never reach the
//! wrong PDU.
//!
//! [`PduHandle`]: struct.PduHandle.html

use crate::address::Address;
use crate::bearer::InterfaceId;
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::time::Instant;
use crate::Error;
use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

/// Length of the packed network header.
pub const NET_HEADER_LEN: usize = 9;

/// Maximum total network PDU length on the advertising bearer.
pub const NET_MAX_PDU: usize = 29;

/// Minimum total network PDU length (header, one transport octet, 4-octet NetMIC).
pub const NET_MIN_PDU: usize = 14;

/// NetMIC length for access PDUs.
pub const NETMIC_ACCESS: usize = 4;

/// NetMIC length for control PDUs.
pub const NETMIC_CONTROL: usize = 8;

/// Largest representable sequence number.
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// Largest valid TTL.
pub const TTL_MAX: u8 = 127;

/// Largest valid global NetKey index.
pub const NET_KEY_INDEX_MAX: u16 = 0x0FFF;

/// Unpacked network PDU header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkHeader {
    pub ivi: bool,
    pub nid: u8,
    pub ctl: bool,
    pub ttl: u8,
    pub seq: u32,
    pub src: Address,
    pub dst: Address,
}

impl NetworkHeader {
    /// NetMIC length selected by the CTL bit.
    pub fn mic_len(&self) -> usize {
        if self.ctl {
            NETMIC_CONTROL
        } else {
            NETMIC_ACCESS
        }
    }

    /// Packs the header into the first 9 octets of `buf`.
    pub fn pack(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= NET_HEADER_LEN);
        debug_assert!(self.nid <= 0x7F && self.ttl <= TTL_MAX && self.seq <= SEQ_MAX);

        buf[0] = (u8::from(self.ivi) << 7) | (self.nid & 0x7F);
        buf[1] = (u8::from(self.ctl) << 7) | (self.ttl & 0x7F);
        BigEndian::write_u24(&mut buf[2..5], self.seq);
        BigEndian::write_u16(&mut buf[5..7], self.src.raw());
        BigEndian::write_u16(&mut buf[7..9], self.dst.raw());
    }

    /// Unpacks a header from the first 9 octets of `buf`.
    pub fn unpack(buf: &[u8]) -> Result<Self, Error> {
        Self::from_bytes(&mut ByteReader::new(buf))
    }

    /// Extracts the 7-bit NID of an obfuscated PDU (the only header field readable before
    /// deobfuscation).
    pub fn peek_nid(pdu: &[u8]) -> u8 {
        pdu[0] & 0x7F
    }

    /// Rewrites the TTL field of a packed header in place.
    pub fn set_ttl(buf: &mut [u8], ttl: u8) {
        buf[1] = (buf[1] & 0x80) | (ttl & 0x7F);
    }
}

impl ToBytes for NetworkHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let header = writer.split_off(NET_HEADER_LEN)?;
        self.pack(header.into_rest());
        Ok(())
    }
}

impl<'a> FromBytes<'a> for NetworkHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let ivi_nid = bytes.read_u8()?;
        let ctl_ttl = bytes.read_u8()?;
        let seq = BigEndian::read_u24(bytes.read_slice(3)?);
        Ok(Self {
            ivi: ivi_nid & 0x80 != 0,
            nid: ivi_nid & 0x7F,
            ctl: ctl_ttl & 0x80 != 0,
            ttl: ctl_ttl & 0x7F,
            seq,
            src: Address(bytes.read_u16_be()?),
            dst: Address(bytes.read_u16_be()?),
        })
    }
}

bitflags! {
    /// Instructions attached to a PDU on how it must be sent.
    ///
    /// Exactly one of `SEND_ON_ADV`/`SEND_ON_GATT`... both are set for locally originated PDUs;
    /// PDUs received from the air carry at most one relay/forward tag.
    pub struct PduTags: u8 {
        /// Originate on advertising bearers, with Network Transmit retransmissions.
        const SEND_ON_ADV = 1 << 0;
        /// Originate on GATT bearers, sent exactly once.
        const SEND_ON_GATT = 1 << 1;
        /// Relay a PDU received on ADV to all advertising bearers, with Relay Retransmit
        /// retransmissions.
        const RELAY_ON_ADV = 1 << 2;
        /// Forward a PDU received on ADV to all bearers (proxy), sent exactly once.
        const FWD_ALL = 1 << 3;
        /// Forward a PDU received on GATT to all bearers except the receiving one, sent exactly
        /// once.
        const FWD_ALL_EXCEPT_RX = 1 << 4;

        /// Tags that direct a PDU at advertising interfaces.
        const ADV_ANY = Self::SEND_ON_ADV.bits
            | Self::RELAY_ON_ADV.bits
            | Self::FWD_ALL.bits
            | Self::FWD_ALL_EXCEPT_RX.bits;
        /// Tags that direct a PDU at GATT interfaces.
        const GATT_ANY = Self::SEND_ON_GATT.bits
            | Self::FWD_ALL.bits
            | Self::FWD_ALL_EXCEPT_RX.bits;
        /// Tags cleared after the first transmission round.
        const SEND_ONCE = Self::SEND_ON_GATT.bits
            | Self::FWD_ALL.bits
            | Self::FWD_ALL_EXCEPT_RX.bits;
    }
}

/// A network PDU with its transmission metadata, stored in the arena.
pub struct PduMeta {
    buf: [u8; NET_MAX_PDU],
    len: u8,

    pub iv_index: u32,
    pub net_key_index: u16,
    /// Unassigned selects master credentials.
    pub friend_lpn_addr: Address,
    /// Destination, kept unpacked for output filtering.
    pub dst: Address,
    pub tags: PduTags,
    /// Interface the PDU was received on; `None` for locally originated PDUs.
    pub received_on: Option<InterfaceId>,
    /// Remaining retransmissions.
    pub retrans_count: u8,
    /// Interval between retransmissions; zero once retransmission is finished.
    pub retrans_interval_ms: u16,
    /// Number of references currently held by bearer queues.
    pub ref_count: u8,
    /// Deadline of the running retransmission (or relay-delay) timer.
    pub retrans_at: Option<Instant>,
}

impl PduMeta {
    fn empty() -> Self {
        Self {
            buf: [0; NET_MAX_PDU],
            len: 0,
            iv_index: 0,
            net_key_index: 0,
            friend_lpn_addr: Address::UNASSIGNED,
            dst: Address::UNASSIGNED,
            tags: PduTags::empty(),
            received_on: None,
            retrans_count: 0,
            retrans_interval_ms: 0,
            ref_count: 0,
            retrans_at: None,
        }
    }

    /// The PDU bytes.
    pub fn pdu(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }

    /// Replaces the PDU bytes.
    pub fn set_pdu(&mut self, pdu: &[u8]) {
        debug_assert!(pdu.len() <= NET_MAX_PDU);
        self.buf[..pdu.len()].copy_from_slice(pdu);
        self.len = pdu.len() as u8;
    }

    /// Mutable access to the PDU bytes (TTL rewrite on relay).
    pub fn pdu_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..usize::from(self.len)]
    }

    /// A PDU is released when nothing references it and no retransmission is outstanding.
    pub fn releasable(&self) -> bool {
        self.ref_count == 0 && self.retrans_count == 0 && self.retrans_interval_ms == 0
    }

    /// Drops a bearer reference.
    pub fn release_ref(&mut self) {
        debug_assert!(self.ref_count > 0, "refcount underflow");
        self.ref_count = self.ref_count.saturating_sub(1);
    }
}

/// Handle to an arena slot. Stale handles (outliving a free) never resolve.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduHandle {
    index: u8,
    generation: u16,
}

/// Fixed-size arena holding every in-flight network PDU.
pub struct PduArena<const N: usize> {
    slots: [Option<PduMeta>; N],
    generations: [u16; N],
}

impl<const N: usize> PduArena<N> {
    pub fn new() -> Self {
        const NONE: Option<PduMeta> = None;
        Self {
            slots: [NONE; N],
            generations: [0; N],
        }
    }

    /// Allocates a fresh slot holding `pdu`.
    pub fn alloc(&mut self, pdu: &[u8]) -> Result<PduHandle, Error> {
        if pdu.len() > NET_MAX_PDU {
            return Err(Error::InvalidLength);
        }

        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::OutOfMemory)?;

        let mut meta = PduMeta::empty();
        meta.set_pdu(pdu);
        self.slots[index] = Some(meta);

        Ok(PduHandle {
            index: index as u8,
            generation: self.generations[index],
        })
    }

    pub fn get(&self, handle: PduHandle) -> Option<&PduMeta> {
        let index = usize::from(handle.index);
        if self.generations.get(index) != Some(&handle.generation) {
            return None;
        }
        self.slots[index].as_ref()
    }

    pub fn get_mut(&mut self, handle: PduHandle) -> Option<&mut PduMeta> {
        let index = usize::from(handle.index);
        if self.generations.get(index) != Some(&handle.generation) {
            return None;
        }
        self.slots[index].as_mut()
    }

    /// Frees a slot, invalidating every copy of its handle.
    pub fn free(&mut self, handle: PduHandle) {
        let index = usize::from(handle.index);
        if self.generations.get(index) == Some(&handle.generation) && self.slots[index].is_some() {
            self.slots[index] = None;
            self.generations[index] = self.generations[index].wrapping_add(1);
        }
    }

    /// Iterates over the handles of all live PDUs.
    pub fn handles(&self) -> impl Iterator<Item = PduHandle> + '_ {
        self.slots.iter().enumerate().filter_map(move |(i, s)| {
            s.as_ref().map(|_| PduHandle {
                index: i as u8,
                generation: self.generations[i],
            })
        })
    }

    /// Number of live PDUs.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
