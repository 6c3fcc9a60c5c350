//! Bearer dispatch.
//!
//! The dispatch owns a fixed table of bearer *interfaces*. Each interface is either an
//! advertising bearer (broadcast, AD-type framed) or a GATT bearer (connection oriented, SAR
//! framed) and carries its own transmit queue and output address filter.
//!
//! Inbound frames are demultiplexed by AD type (ADV) or proxy PDU type (GATT) and routed to the
//! consuming subsystem: network pipeline, secure network beacon, provisioning bearer,
//! provisioning beacon or proxy configuration. Outbound, the dispatch serializes transmissions
//! per interface and reports a *processed* notification for every frame reference it ever
//! accepted, so that the sending module's reference counts terminate even when an interface is
//! torn down with frames still queued.
//!
//! Notifications accumulate in a typed queue that the stack drains after each dispatch call;
//! consumers never register callbacks.

pub mod adv;
pub mod filter;
pub mod gatt;

use crate::address::Address;
use crate::beacon::BeaconHandle;
use crate::bearer::adv::AdvInterface;
use crate::bearer::filter::{FilterKind, OutputFilter};
use crate::bearer::gatt::{GattInterface, GattPduType, GattRx, GATT_MAX_PDU};
use crate::config::Radio;
use crate::net::pdu::PduHandle;
use crate::time::Instant;
use crate::Error;
use heapless::{Deque, Vec};

/// Number of advertising interface slots.
pub const ADV_MAX_INTERFACES: usize = 2;

/// Number of GATT connection slots.
pub const GATT_MAX_INTERFACES: usize = 4;

/// Total size of the interface table.
pub const MAX_INTERFACES: usize = ADV_MAX_INTERFACES + GATT_MAX_INTERFACES;

/// Capacity of the notification out-queue; covers every queue slot in the table plus teardown
/// events.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Bearer interface kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BearerKind {
    Adv,
    Gatt,
}

/// Unique bearer interface identifier.
///
/// The high nibble encodes the bearer kind (ADV = 0, GATT = 1), the low nibble the slot within
/// that bearer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId(u8);

impl InterfaceId {
    /// Reserved invalid identifier.
    pub const INVALID: Self = InterfaceId(0xFF);

    /// Creates the identifier of an advertising interface slot.
    pub fn adv(slot: u8) -> Self {
        debug_assert!(slot < 0x10);
        InterfaceId(slot & 0x0F)
    }

    /// Creates the identifier of a GATT connection slot.
    pub fn gatt(slot: u8) -> Self {
        debug_assert!(slot < 0x10);
        InterfaceId(0x10 | (slot & 0x0F))
    }

    /// Returns the bearer kind encoded in the identifier, or `None` for reserved encodings.
    pub fn kind(&self) -> Option<BearerKind> {
        match self.0 >> 4 {
            0x0 => Some(BearerKind::Adv),
            0x1 => Some(BearerKind::Gatt),
            _ => None,
        }
    }

    /// Returns the slot within the bearer.
    pub fn slot(&self) -> u8 {
        self.0 & 0x0F
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Mesh-related AD types from the Bluetooth assigned numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdType {
    /// PB-ADV provisioning bearer PDU.
    Provisioning = 0x29,
    /// Network PDU.
    MeshMessage = 0x2A,
    /// Mesh beacon (unprovisioned device or secure network).
    MeshBeacon = 0x2B,
}

impl AdType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x29 => Some(AdType::Provisioning),
            0x2A => Some(AdType::MeshMessage),
            0x2B => Some(AdType::MeshBeacon),
            _ => None,
        }
    }

    pub fn raw(&self) -> u8 {
        *self as u8
    }
}

/// Beacon type octet, the first octet of every mesh beacon payload.
pub const BEACON_TYPE_UNPROVISIONED: u8 = 0x00;
pub const BEACON_TYPE_SECURE_NETWORK: u8 = 0x01;

/// Identifies the module-owned buffer behind a queued frame.
///
/// The dispatch never owns PDU storage for network PDUs and beacons; it holds a snapshot of the
/// frame bytes plus this handle, and returns the handle through a [`BearerEvent::Processed`]
/// notification so the owner can decrement its reference count.
///
/// [`BearerEvent::Processed`]: enum.BearerEvent.html#variant.Processed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameSource {
    /// A network PDU in the network pipeline's arena.
    Net(PduHandle),
    /// A secure network beacon in the beacon module's slot table.
    Beacon(BeaconHandle),
    /// A frame whose bytes live only in the queue entry.
    Raw(RawKind),
}

/// What a [`FrameSource::Raw`] frame was.
///
/// [`FrameSource::Raw`]: enum.FrameSource.html#variant.Raw
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RawKind {
    /// Provisioning bearer frame; `opcode` is the first octet of the provisioning PDU (used for
    /// the PB-GATT sent notification).
    Prov { opcode: u8 },
    /// Unprovisioned device beacon.
    UnprovBeacon,
    /// Encrypted proxy configuration PDU.
    ProxyCfg,
}

/// Notifications produced by the dispatch, drained by the stack after every call.
#[derive(Debug, Copy, Clone)]
pub enum BearerEvent {
    /// A frame reference was consumed (delivered to the radio or dropped during teardown).
    Processed {
        iface: InterfaceId,
        source: FrameSource,
    },
    /// An interface was removed; its queue has been drained.
    Closed { iface: InterfaceId, kind: BearerKind },
    /// A GATT connection violated the bearer protocol and must be disconnected by the host.
    DisconnectRequest { iface: InterfaceId },
}

/// Consumer classification of an inbound PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduKind {
    Network,
    SecureBeacon,
    UnprovBeacon,
    Prov,
    ProxyConfig,
}

/// A demultiplexed inbound PDU.
pub struct Routed {
    pub kind: PduKind,
    pub iface: InterfaceId,
    pub pdu: Vec<u8, GATT_MAX_PDU>,
}

/// Per-interface configuration at open time.
#[derive(Debug, Copy, Clone)]
pub enum InterfaceConfig {
    Adv,
    Gatt { mtu: u16 },
}

enum IfState {
    Adv(AdvInterface),
    Gatt(GattInterface),
}

struct Interface {
    id: InterfaceId,
    filter: OutputFilter,
    state: IfState,
}

/// The bearer dispatch table.
pub struct BearerDispatch {
    slots: [Option<Interface>; MAX_INTERFACES],
    events: Deque<BearerEvent, EVENT_QUEUE_DEPTH>,
}

impl BearerDispatch {
    pub fn new() -> Self {
        const NONE: Option<Interface> = None;
        Self {
            slots: [NONE; MAX_INTERFACES],
            events: Deque::new(),
        }
    }

    /// Registers a new interface.
    ///
    /// New ADV interfaces start with an empty blacklist (accept all destinations); GATT
    /// interfaces start with an empty whitelist (drop all until populated).
    pub fn add_interface(&mut self, id: InterfaceId, config: InterfaceConfig) -> Result<(), Error> {
        let kind = id.kind().ok_or(Error::InvalidParam)?;
        match (kind, config) {
            (BearerKind::Adv, InterfaceConfig::Adv) => {}
            (BearerKind::Gatt, InterfaceConfig::Gatt { .. }) => {}
            _ => return Err(Error::InvalidParam),
        }

        if self.find(id).is_some() {
            return Err(Error::Duplicate);
        }

        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(Error::Exhausted)?;

        let (filter, state) = match config {
            InterfaceConfig::Adv => (
                OutputFilter::new(FilterKind::Blacklist),
                IfState::Adv(AdvInterface::new()),
            ),
            InterfaceConfig::Gatt { mtu } => (
                OutputFilter::new(FilterKind::Whitelist),
                IfState::Gatt(GattInterface::new(mtu)),
            ),
        };

        *slot = Some(Interface { id, filter, state });
        info!("bearer: interface {:?} opened", id);
        Ok(())
    }

    /// Removes an interface, draining its queue.
    ///
    /// Every undelivered frame produces a processed notification so reference counts reach zero,
    /// followed by a single closed notification.
    pub fn remove_interface(&mut self, id: InterfaceId) -> Result<(), Error> {
        let idx = self.index_of(id).ok_or(Error::InvalidInterface)?;
        let mut iface = self.slots[idx].take().unwrap();

        match &mut iface.state {
            IfState::Adv(adv) => adv.drain(id, &mut self.events),
            IfState::Gatt(gatt) => gatt.drain(id, &mut self.events),
        }

        let kind = id.kind().unwrap();
        let _ = self.events.push_back(BearerEvent::Closed { iface: id, kind });
        info!("bearer: interface {:?} closed", id);
        Ok(())
    }

    /// Pops the next pending notification.
    pub fn pop_event(&mut self) -> Option<BearerEvent> {
        self.events.pop_front()
    }

    /// Returns whether the interface is registered.
    pub fn contains(&self, id: InterfaceId) -> bool {
        self.find(id).is_some()
    }

    /// Snapshot of all registered interfaces.
    pub fn interfaces(&self) -> Vec<(InterfaceId, BearerKind), MAX_INTERFACES> {
        let mut out = Vec::new();
        for iface in self.slots.iter().flatten() {
            out.push((iface.id, iface.id.kind().unwrap())).unwrap();
        }
        out
    }

    /// Returns the output filter of an interface.
    pub fn filter(&self, id: InterfaceId) -> Option<&OutputFilter> {
        self.find(id).map(|i| &i.filter)
    }

    /// Returns the output filter of an interface for mutation (proxy configuration, source
    /// learning).
    pub fn filter_mut(&mut self, id: InterfaceId) -> Option<&mut OutputFilter> {
        let idx = self.index_of(id)?;
        self.slots[idx].as_mut().map(|i| &mut i.filter)
    }

    /// Returns whether the interface's output filter passes a PDU to `dst`.
    pub fn filter_allows(&self, id: InterfaceId, dst: Address) -> bool {
        match self.find(id) {
            Some(iface) => !iface.filter.filters_out(dst),
            None => false,
        }
    }

    /// Sends a network PDU reference on an interface.
    pub fn send_network<R: Radio>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        pdu: &[u8],
        handle: PduHandle,
    ) -> bool {
        self.send(radio, id, AdType::MeshMessage, GattPduType::Network, pdu, FrameSource::Net(handle))
    }

    /// Sends a secure network beacon reference on an interface.
    pub fn send_beacon<R: Radio>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        beacon: &[u8],
        handle: BeaconHandle,
    ) -> bool {
        self.send(
            radio,
            id,
            AdType::MeshBeacon,
            GattPduType::Beacon,
            beacon,
            FrameSource::Beacon(handle),
        )
    }

    /// Sends an unprovisioned device beacon (ADV interfaces only).
    pub fn send_unprov_beacon<R: Radio>(&mut self, radio: &mut R, id: InterfaceId, beacon: &[u8]) -> bool {
        self.send(
            radio,
            id,
            AdType::MeshBeacon,
            GattPduType::Beacon,
            beacon,
            FrameSource::Raw(RawKind::UnprovBeacon),
        )
    }

    /// Sends a provisioning bearer PDU.
    ///
    /// On ADV interfaces `pdu` is the full PB-ADV frame; on GATT interfaces it is the bare
    /// provisioning PDU and `opcode` is reported back once sent.
    pub fn send_prov<R: Radio>(&mut self, radio: &mut R, id: InterfaceId, pdu: &[u8], opcode: u8) -> bool {
        self.send(
            radio,
            id,
            AdType::Provisioning,
            GattPduType::Provisioning,
            pdu,
            FrameSource::Raw(RawKind::Prov { opcode }),
        )
    }

    /// Sends an encrypted proxy configuration PDU (GATT interfaces only).
    pub fn send_proxy_config<R: Radio>(&mut self, radio: &mut R, id: InterfaceId, pdu: &[u8]) -> bool {
        match self.kind_of(id) {
            Some(BearerKind::Gatt) => self.send(
                radio,
                id,
                AdType::MeshMessage,
                GattPduType::ProxyConfig,
                pdu,
                FrameSource::Raw(RawKind::ProxyCfg),
            ),
            _ => false,
        }
    }

    fn kind_of(&self, id: InterfaceId) -> Option<BearerKind> {
        self.find(id).and_then(|i| i.id.kind())
    }

    fn send<R: Radio>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        ad_type: AdType,
        gatt_type: GattPduType,
        pdu: &[u8],
        source: FrameSource,
    ) -> bool {
        let events = &mut self.events;
        let iface = match self.slots.iter_mut().flatten().find(|i| i.id == id) {
            Some(i) => i,
            None => return false,
        };

        match &mut iface.state {
            IfState::Adv(adv) => adv.send(radio, id, ad_type, pdu, source),
            IfState::Gatt(gatt) => gatt.send(radio, id, gatt_type, pdu, source, events),
        }
    }

    /// Handles the host's per-interface readiness signal.
    pub fn signal_ready<R: Radio>(&mut self, radio: &mut R, id: InterfaceId) {
        let events = &mut self.events;
        if let Some(iface) = self.slots.iter_mut().flatten().find(|i| i.id == id) {
            match &mut iface.state {
                IfState::Adv(adv) => adv.signal_ready(radio, id, events),
                IfState::Gatt(gatt) => gatt.signal_ready(radio, id, events),
            }
        }
    }

    /// Demultiplexes an inbound frame.
    ///
    /// For ADV interfaces `frame` starts with the AD type octet; for GATT interfaces with the
    /// SAR/type octet. Returns the routed PDU once one is complete.
    pub fn process_inbound(&mut self, id: InterfaceId, frame: &[u8], now: Instant) -> Option<Routed> {
        if frame.is_empty() || frame.len() > GATT_MAX_PDU + 1 {
            trace!("bearer: dropping inbound frame of length {}", frame.len());
            return None;
        }

        let events = &mut self.events;
        let iface = self.slots.iter_mut().flatten().find(|i| i.id == id)?;

        match &mut iface.state {
            IfState::Adv(_) => {
                let ad_type = AdType::from_raw(frame[0])?;
                let payload = &frame[1..];
                match ad_type {
                    AdType::MeshMessage => Some(Routed {
                        kind: PduKind::Network,
                        iface: id,
                        pdu: Vec::from_slice(payload).ok()?,
                    }),
                    AdType::Provisioning => Some(Routed {
                        kind: PduKind::Prov,
                        iface: id,
                        pdu: Vec::from_slice(payload).ok()?,
                    }),
                    AdType::MeshBeacon => Self::route_beacon(id, payload),
                }
            }
            IfState::Gatt(gatt) => match gatt.process_frame(frame, now) {
                GattRx::None => None,
                GattRx::Error => {
                    let _ = events.push_back(BearerEvent::DisconnectRequest { iface: id });
                    None
                }
                GattRx::Complete { pdu_type, pdu } => match pdu_type {
                    GattPduType::Network => Some(Routed {
                        kind: PduKind::Network,
                        iface: id,
                        pdu,
                    }),
                    GattPduType::Beacon => Self::route_beacon(id, &pdu),
                    GattPduType::ProxyConfig => Some(Routed {
                        kind: PduKind::ProxyConfig,
                        iface: id,
                        pdu,
                    }),
                    GattPduType::Provisioning => Some(Routed {
                        kind: PduKind::Prov,
                        iface: id,
                        pdu,
                    }),
                },
            },
        }
    }

    fn route_beacon(id: InterfaceId, payload: &[u8]) -> Option<Routed> {
        let kind = match payload.first()? {
            &BEACON_TYPE_UNPROVISIONED => PduKind::UnprovBeacon,
            &BEACON_TYPE_SECURE_NETWORK => PduKind::SecureBeacon,
            _ => return None,
        };
        Some(Routed {
            kind,
            iface: id,
            pdu: Vec::from_slice(payload).ok()?,
        })
    }

    /// Drives the GATT reassembly deadlines; expired connections get a disconnect request.
    pub fn poll(&mut self, now: Instant) {
        let events = &mut self.events;
        for iface in self.slots.iter_mut().flatten() {
            if let IfState::Gatt(gatt) = &mut iface.state {
                if gatt.poll(now) {
                    trace!("bearer: reassembly timeout on {:?}", iface.id);
                    let _ = events.push_back(BearerEvent::DisconnectRequest { iface: iface.id });
                }
            }
        }
    }

    /// The earliest instant at which `poll` needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next = None;
        for iface in self.slots.iter().flatten() {
            if let IfState::Gatt(gatt) = &iface.state {
                next = Instant::earliest(next, gatt.next_timeout());
            }
        }
        next
    }

    fn find(&self, id: InterfaceId) -> Option<&Interface> {
        self.slots.iter().flatten().find(|i| i.id == id)
    }

    fn index_of(&self, id: InterfaceId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |i| i.id == id))
    }
}
