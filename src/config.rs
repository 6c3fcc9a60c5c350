//! Stack configuration trait and host collaborator ports.
//!
//! The mesh stack is runtime and hardware-agnostic. Everything it needs from its surroundings is
//! abstracted behind small traits collected in the [`Config`] bundle:
//!
//! * A millisecond [`Timer`] and a cryptographically secure [`Rng`].
//! * A [`Radio`] that accepts fully framed bearer PDUs.
//! * An asynchronous [`SecurityEngine`] performing the actual AES work.
//! * The local configuration [`Store`] (keys, features, addresses, SEQ allocator).
//! * The [`Replay`] protection list and the optional [`Friends`] module.
//! * An [`EventSink`] receiving everything the stack reports upwards.
//!
//! All trait methods are called from the single event-loop context; implementations must not
//! block.
//!
//! [`Timer`]: ../time/trait.Timer.html
//! [`Rng`]: trait.Config.html#associatedtype.Rng
//! [`Radio`]: trait.Radio.html
//! [`SecurityEngine`]: ../security/trait.SecurityEngine.html
//! [`Store`]: trait.Store.html
//! [`Replay`]: trait.Replay.html
//! [`Friends`]: trait.Friends.html
//! [`EventSink`]: trait.EventSink.html

use crate::address::Address;
use crate::bearer::filter::FilterKind;
use crate::bearer::{BearerKind, InterfaceId};
use crate::prov::CloseReason;
use crate::security::SecurityEngine;
use crate::time::Timer;
use crate::Error;
use rand_core::{CryptoRng, RngCore};

/// Trait for mesh stack configurations.
///
/// This trait defines a number of types to be used throughout the layers of the mesh stack, which
/// define capabilities, data structures, and hardware interface types.
///
/// Every application must define a type implementing this trait and supply it to the stack.
pub trait Config {
    /// A time source with millisecond resolution.
    type Timer: Timer;

    /// Cryptographically secure random number generator.
    ///
    /// Also used for all transmission jitter; the jitter is a correctness requirement of the
    /// broadcast bearers, not an optimization.
    type Rng: RngCore + CryptoRng;

    /// The bearer packet transmitter (radio / GATT driver glue).
    type Radio: Radio;

    /// The asynchronous security engine.
    type Crypto: SecurityEngine;

    /// The local configuration store.
    type Store: Store;

    /// The replay protection list.
    type Replay: Replay;

    /// The friendship module. Use [`NoFriends`] when the feature is absent.
    ///
    /// [`NoFriends`]: struct.NoFriends.html
    type Friends: Friends;

    /// Consumer of stack events and received PDUs.
    type Events: EventSink;
}

/// Host collaborators borrowed by the stack for the duration of one event-loop turn.
///
/// The borrow is released when the stack method returns, so the host is free to hand the same
/// resources to other components in between.
pub struct Context<'a, C: Config> {
    pub radio: &'a mut C::Radio,
    pub crypto: &'a mut C::Crypto,
    pub store: &'a mut C::Store,
    pub replay: &'a mut C::Replay,
    pub friends: &'a mut C::Friends,
    pub events: &'a mut C::Events,
}

/// Trait for bearer packet transmission.
///
/// The stack hands over one fully framed bearer PDU per interface at a time; the host signals
/// completion via `MeshStack::signal_ready`, which releases the next queued frame. For ADV
/// interfaces the frame already carries the AD length/type header; for GATT interfaces it carries
/// the one-octet SAR/type header.
pub trait Radio {
    /// Transmit `frame` on the given interface.
    ///
    /// The frame contents must be consumed (copied) before returning; the buffer is not retained.
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]);
}

/// Key refresh procedure phase of a subnet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyRefreshPhase {
    /// Normal operation, old key in use.
    Normal,
    /// Phase 1: new key distributed, old key still used for transmission.
    First,
    /// Phase 2: new key used for transmission and beacon authentication.
    Second,
}

/// State of an optional node feature.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FeatureState {
    Disabled,
    Enabled,
    NotSupported,
}

impl FeatureState {
    pub fn is_enabled(&self) -> bool {
        *self == FeatureState::Enabled
    }
}

/// The local configuration store.
///
/// Read on the event loop only; the single `&mut` borrow per turn is the serialization point.
pub trait Store {
    /// Number of elements hosted by this node.
    fn element_count(&self) -> u8;

    /// Unicast address of the element with the given index.
    fn element_addr(&self, idx: u8) -> Option<Address>;

    /// Returns whether `addr` is the unicast address of one of this node's elements.
    fn is_local_element(&self, addr: Address) -> bool;

    /// Returns whether `addr` appears in any model's subscription list.
    fn subscription_contains(&self, addr: Address) -> bool;

    /// Iterates over the known NetKey indices.
    ///
    /// `iter` must start at 0; each call returns the next known index and advances `iter`, or
    /// returns `None` when the key list is exhausted.
    fn next_net_key_index(&self, iter: &mut u16) -> Option<u16>;

    /// Returns the key refresh phase of the given subnet, or `None` if the NetKey index is
    /// unknown.
    fn key_refresh_phase(&self, net_key_index: u16) -> Option<KeyRefreshPhase>;

    /// Returns the current IV index and whether an IV update is in progress.
    fn iv_index(&self) -> (u32, bool);

    /// Relay feature state.
    fn relay_state(&self) -> FeatureState;

    /// GATT proxy feature state.
    fn gatt_proxy_state(&self) -> FeatureState;

    /// Secure network beacon broadcast state.
    fn beacon_state(&self) -> FeatureState;

    /// Network Transmit state: transmission count in `0..=7`.
    fn nwk_transmit_count(&self) -> u8;

    /// Network Transmit state: interval steps in `0..=31`; interval is `(steps + 1) * 10` ms.
    fn nwk_transmit_steps(&self) -> u8;

    /// Relay Retransmit state: retransmission count in `0..=7`.
    fn relay_retrans_count(&self) -> u8;

    /// Relay Retransmit state: interval steps in `0..=31`; interval is `(steps + 1) * 10` ms.
    fn relay_retrans_steps(&self) -> u8;

    /// Returns whether node identity advertising is running for the given subnet.
    fn node_identity_running(&self, net_key_index: u16) -> bool;

    /// Allocates the next 24-bit sequence number.
    ///
    /// Fails with [`Error::SeqExhausted`] when the space for the current IV index is used up.
    ///
    /// [`Error::SeqExhausted`]: ../enum.Error.html#variant.SeqExhausted
    fn next_seq_number(&mut self) -> Result<u32, Error>;
}

/// The replay protection list.
pub trait Replay {
    /// Returns `true` if `(src, seq)` was already seen for the given IV index.
    ///
    /// Only consulted for PDUs about to be delivered to the transport layer.
    fn is_replay(&mut self, src: Address, seq: u32, iv_index: u32) -> bool;
}

/// The friendship module ports consumed by the network pipeline.
///
/// All methods default to the "no friendship" behavior.
pub trait Friends {
    /// Returns `true` if at least one befriended LPN is a destination for the PDU.
    fn lpn_is_dst(&self, _dst: Address, _net_key_index: u16) -> bool {
        false
    }

    /// Returns `true` if master-credential PDUs on this subnet must be dropped because a
    /// friendship is established on it.
    fn filter_subnet(&self, _net_key_index: u16) -> bool {
        false
    }

    /// Notifies the LPN module of a PDU received with friendship credentials.
    fn notify_lpn_pdu(&mut self, _info: &NetworkRxInfo<'_>) {}
}

/// A [`Friends`] implementation for nodes without the friendship feature.
///
/// [`Friends`]: trait.Friends.html
pub struct NoFriends;

impl Friends for NoFriends {}

/// Unpacked fields of a received network PDU, delivered to the transport layer.
#[derive(Debug)]
pub struct NetworkRxInfo<'a> {
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub ctl: bool,
    pub seq: u32,
    pub iv_index: u32,
    pub net_key_index: u16,
    /// Friend or LPN address identifying the credentials used on decrypt; unassigned for master
    /// credentials.
    pub friend_lpn_addr: Address,
    /// The lower transport PDU.
    pub ltr_pdu: &'a [u8],
}

/// Contents of an authenticated secure network beacon, reported to network management.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BeaconInfo {
    pub net_key_index: u16,
    /// Whether the new key of a key refresh procedure authenticated the beacon.
    pub new_key_used: bool,
    pub iv_index: u32,
    pub key_refresh: bool,
    pub iv_update: bool,
}

/// Consumer of stack events.
///
/// Every method has an empty default body, so implementations only need to handle the events they
/// care about. Events not listed here are not observable; in particular, dropped duplicates and
/// replays are silent by design.
pub trait EventSink {
    /// A network PDU passed all checks and is handed to the lower transport layer.
    fn network_pdu(&mut self, _info: &NetworkRxInfo<'_>) {}

    /// A bearer interface finished opening.
    fn interface_opened(&mut self, _iface: InterfaceId, _kind: BearerKind) {}

    /// A bearer interface was closed and its queue drained.
    fn interface_closed(&mut self, _iface: InterfaceId) {}

    /// A connection-oriented bearer violated its protocol; the host must close the underlying
    /// GATT connection and report back via `interface_closed`.
    fn disconnect_request(&mut self, _iface: InterfaceId) {}

    /// A provisioning link was established.
    fn link_opened(&mut self) {}

    /// The provisioning link was closed. `by_peer` distinguishes a received Link Close from a
    /// locally initiated one.
    fn link_closed(&mut self, _reason: CloseReason, _by_peer: bool) {}

    /// Link establishment timed out before the link opened (client role).
    fn link_failed(&mut self) {}

    /// A complete provisioning PDU was reassembled and verified.
    fn prov_pdu(&mut self, _pdu: &[u8]) {}

    /// An outgoing provisioning PDU was delivered (transaction acknowledged, or sent on GATT).
    fn prov_pdu_sent(&mut self, _opcode: u8) {}

    /// A provisioning transaction exhausted its 30-second budget.
    fn prov_send_timeout(&mut self) {}

    /// A Proxy Filter Status message arrived (client role).
    fn filter_status(&mut self, _kind: FilterKind, _size: u16) {}

    /// Fresh proxy service data (network id or encrypted node identity) is available.
    fn service_data(&mut self, _data: &[u8]) {}

    /// Service data could not be produced in the current configuration.
    fn service_data_unavailable(&mut self) {}

    /// An authenticated secure network beacon arrived; IV update and key refresh state
    /// transitions are owned by the receiver of this event.
    fn beacon_info(&mut self, _info: &BeaconInfo) {}

    /// An on-demand beacon generation request completed.
    fn beacon_generated(&mut self, _net_key_index: u16, _beacon: &[u8]) {}
}
