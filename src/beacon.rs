//! Secure network beacons.
//!
//! A secure network beacon advertises the state of one subnet:
//!
//! ```notrust
//! +----------+---------+----------------+---------------+----------+
//! |   type   |  flags  |   network id   |   IV index    |   auth   |
//! | (1) 0x01 |   (1)   |      (8)       |    (4, BE)    |   (8)    |
//! +----------+---------+----------------+---------------+----------+
//! ```
//!
//! Flags: bit 0 = key refresh phase 2, bit 1 = IV update in progress. The authentication value
//! comes from the security engine (CMAC under the subnet's beacon key, with the new key once key
//! refresh reaches phase 2).
//!
//! The module runs three flows, each with single-in-flight crypto and its own queue: periodic
//! *broadcast* over every subnet on all advertising interfaces (10-second cycle), *on-demand*
//! generation for a single subnet, and *receive* authentication with an IV-delta prefilter and a
//! bounded queue. Sent beacons stay referenced until every bearer confirms delivery.

use crate::bearer::{BearerDispatch, BearerKind, InterfaceId};
use crate::config::{Config, Context, EventSink, KeyRefreshPhase, Radio, Store};
use crate::security::SecurityEngine;
use crate::security::{BeaconAuthOk, BeaconAuthRequest, BeaconGenRequest};
use crate::time::{Duration, Instant};
use byteorder::{BigEndian, ByteOrder};
use heapless::Deque;

/// Total length of a secure network beacon.
pub const BEACON_LEN: usize = 22;

/// Interval between periodic broadcast cycles.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum accepted difference between a received IV index and the local one (roughly 48 weeks
/// of updates).
pub const BEACON_MAX_IV_DIFF: u32 = 42;

/// Received beacons pending authentication beyond this limit are silently dropped.
pub const BEACON_RX_QUEUE_LIMIT: usize = 4;

/// Number of beacon slots (bounds concurrently outstanding generations).
pub const BEACON_SLOTS: usize = 6;

const FLAG_KEY_REFRESH: u8 = 1 << 0;
const FLAG_IV_UPDATE: u8 = 1 << 1;
const IV_OFFSET: usize = 10;

/// Handle to a beacon slot, carried through the bearer queues and crypto requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BeaconHandle {
    index: u8,
    generation: u16,
}

/// What a generated beacon is for, deciding its fan-out on completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Purpose {
    /// Periodic broadcast cycle: advertising interfaces only, chained over all subnets.
    Broadcast,
    /// Triggered send for one subnet: all interfaces.
    TriggerSingle,
    /// Triggered send chained over all subnets: all interfaces.
    TriggerAll,
    /// On-demand for the application; surfaced as an event.
    OnDemandApp,
    /// On-demand for the proxy server; pushed over one GATT interface.
    OnDemandGatt(InterfaceId),
}

struct Slot {
    beacon: [u8; BEACON_LEN],
    net_key_index: u16,
    purpose: Purpose,
    ref_count: u8,
}

/// Secure network beacon state.
pub struct BeaconState {
    slots: [Option<Slot>; BEACON_SLOTS],
    generations: [u16; BEACON_SLOTS],
    /// Beacons awaiting their turn at the crypto engine.
    tx_queue: Deque<BeaconHandle, BEACON_SLOTS>,
    /// Received beacons awaiting authentication.
    rx_queue: Deque<[u8; BEACON_LEN], BEACON_RX_QUEUE_LIMIT>,
    gen_in_progress: bool,
    auth_in_progress: bool,
    bcast_on: bool,
    bcast_indexer: u16,
    trig_indexer: u16,
    bcast_at: Option<Instant>,
    /// A proxy client never broadcasts beacons of its own.
    is_proxy_client: bool,
}

impl BeaconState {
    pub fn new() -> Self {
        const NONE: Option<Slot> = None;
        Self {
            slots: [NONE; BEACON_SLOTS],
            generations: [0; BEACON_SLOTS],
            tx_queue: Deque::new(),
            rx_queue: Deque::new(),
            gen_in_progress: false,
            auth_in_progress: false,
            bcast_on: false,
            bcast_indexer: 0,
            trig_indexer: 0,
            bcast_at: None,
            is_proxy_client: false,
        }
    }

    pub fn set_proxy_client(&mut self, is_client: bool) {
        self.is_proxy_client = is_client;
    }

    /// Re-evaluates the broadcast state after a beacon/feature state change.
    ///
    /// Broadcasting runs while the beacon state is enabled and the node is not a proxy client.
    pub fn handle_state_changed<C: Config>(&mut self, ctx: &mut Context<'_, C>, now: Instant) {
        let enabled = ctx.store.beacon_state().is_enabled() && !self.is_proxy_client;

        if enabled && !self.bcast_on {
            self.bcast_on = true;
            self.bcast_indexer = 0;
            if !self.generate_next(Purpose::Broadcast, ctx) {
                self.bcast_at = Some(now + BEACON_INTERVAL);
            }
        } else if !enabled {
            self.bcast_on = false;
            self.bcast_at = None;
        }
    }

    /// Generates and sends a beacon for one subnet on all interfaces.
    pub fn trigger_send<C: Config>(&mut self, net_key_index: u16, ctx: &mut Context<'_, C>) {
        self.generate(net_key_index, Purpose::TriggerSingle, ctx);
    }

    /// Generates and sends beacons for every subnet on all interfaces.
    pub fn trigger_send_all<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        self.trig_indexer = 0;
        let _ = self.generate_next(Purpose::TriggerAll, ctx);
    }

    /// Generates a single beacon and reports it through the event sink.
    pub fn generate_on_demand<C: Config>(&mut self, net_key_index: u16, ctx: &mut Context<'_, C>) {
        self.generate(net_key_index, Purpose::OnDemandApp, ctx);
    }

    /// Generates on-demand beacons for every subnet and pushes them over one GATT interface.
    ///
    /// Used by the proxy server when a GATT connection opens.
    pub fn send_all_to_gatt<C: Config>(&mut self, iface: InterfaceId, ctx: &mut Context<'_, C>) {
        let mut indexer = 0;
        while let Some(net_key_index) = ctx.store.next_net_key_index(&mut indexer) {
            self.generate(net_key_index, Purpose::OnDemandGatt(iface), ctx);
        }
    }

    /// Handles an inbound secure network beacon.
    pub fn on_beacon_received<C: Config>(&mut self, pdu: &[u8], ctx: &mut Context<'_, C>) {
        if pdu.len() != BEACON_LEN {
            return;
        }

        // Don't accept more than the defined limit.
        if self.rx_queue.len() >= BEACON_RX_QUEUE_LIMIT {
            trace!("beacon: rx queue full, dropping");
            return;
        }

        // Filter beacons whose IV index is behind ours or implausibly far ahead.
        let rx_iv = BigEndian::read_u32(&pdu[IV_OFFSET..IV_OFFSET + 4]);
        let (local_iv, _) = ctx.store.iv_index();
        if rx_iv < local_iv || rx_iv > local_iv + BEACON_MAX_IV_DIFF {
            return;
        }

        let mut beacon = [0; BEACON_LEN];
        beacon.copy_from_slice(pdu);
        let _ = self.rx_queue.push_back(beacon);
        self.resume_auth(ctx);
    }

    /// Completion of a beacon authentication computation (TX side).
    pub fn on_gen_done<C: Config>(
        &mut self,
        handle: BeaconHandle,
        result: Option<[u8; BEACON_LEN]>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
    ) {
        let purpose = match self.get(handle).map(|s| s.purpose) {
            Some(p) => p,
            None => {
                self.finish_gen(ctx);
                return;
            }
        };

        match purpose {
            Purpose::Broadcast => {
                // Broadcast may have been disabled while the beacon was at the crypto engine.
                if !self.bcast_on {
                    self.free(handle);
                } else {
                    match result {
                        Some(beacon) => {
                            self.get_mut(handle).unwrap().beacon = beacon;
                            self.manage_send(handle, true, false, bearer, ctx.radio);
                        }
                        None => self.free(handle),
                    }

                    if !self.generate_next(Purpose::Broadcast, ctx) {
                        // Full subnet cycle done; restart after the broadcast interval.
                        self.bcast_at = Some(now + BEACON_INTERVAL);
                    }
                }
            }
            Purpose::TriggerSingle | Purpose::TriggerAll => {
                match result {
                    Some(beacon) => {
                        self.get_mut(handle).unwrap().beacon = beacon;
                        self.manage_send(handle, true, true, bearer, ctx.radio);
                    }
                    None => self.free(handle),
                }
                if purpose == Purpose::TriggerAll {
                    let _ = self.generate_next(Purpose::TriggerAll, ctx);
                }
            }
            Purpose::OnDemandApp => {
                if let Some(beacon) = result {
                    let net_key_index = self.get(handle).unwrap().net_key_index;
                    ctx.events.beacon_generated(net_key_index, &beacon);
                }
                self.free(handle);
            }
            Purpose::OnDemandGatt(iface) => {
                match result {
                    Some(beacon) => {
                        self.get_mut(handle).unwrap().beacon = beacon;
                        let sent = bearer.send_beacon(ctx.radio, iface, &beacon, handle);
                        if sent {
                            self.get_mut(handle).unwrap().ref_count += 1;
                        } else {
                            self.free(handle);
                        }
                    }
                    None => self.free(handle),
                }
            }
        }

        self.finish_gen(ctx);
    }

    /// Completion of a received-beacon authentication.
    pub fn on_auth_done<C: Config>(
        &mut self,
        beacon: &[u8; BEACON_LEN],
        result: Option<BeaconAuthOk>,
        ctx: &mut Context<'_, C>,
    ) {
        if let Some(ok) = result {
            let flags = beacon[1];
            let info = crate::config::BeaconInfo {
                net_key_index: ok.net_key_index,
                new_key_used: ok.new_key_used,
                iv_index: BigEndian::read_u32(&beacon[IV_OFFSET..IV_OFFSET + 4]),
                key_refresh: flags & FLAG_KEY_REFRESH != 0,
                iv_update: flags & FLAG_IV_UPDATE != 0,
            };
            // IV update and key refresh transitions are owned by network management.
            ctx.events.beacon_info(&info);
        }

        self.auth_in_progress = false;
        self.resume_auth(ctx);
    }

    /// A bearer consumed one reference of a sent beacon.
    pub fn on_frame_processed(&mut self, handle: BeaconHandle) {
        let release = match self.get_mut(handle) {
            Some(slot) => {
                slot.ref_count = slot.ref_count.saturating_sub(1);
                slot.ref_count == 0
            }
            None => false,
        };
        if release {
            self.free(handle);
        }
    }

    /// Drives the broadcast interval timer.
    pub fn poll<C: Config>(&mut self, now: Instant, ctx: &mut Context<'_, C>) {
        if let Some(at) = self.bcast_at {
            if at.is_at_or_before(now) {
                self.bcast_at = None;
                self.bcast_indexer = 0;
                if !self.generate_next(Purpose::Broadcast, ctx) {
                    self.bcast_at = Some(now + BEACON_INTERVAL);
                }
            }
        }
    }

    /// The earliest instant at which `poll` needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.bcast_at
    }

    /// Starts generation of a beacon for one subnet.
    fn generate<C: Config>(&mut self, net_key_index: u16, purpose: Purpose, ctx: &mut Context<'_, C>) {
        let handle = match self.alloc(net_key_index, purpose, ctx) {
            Some(h) => h,
            None => return,
        };

        if self.gen_in_progress {
            let _ = self.tx_queue.push_back(handle);
            return;
        }

        if self.submit_gen(handle, ctx) {
            self.gen_in_progress = true;
        } else {
            self.free(handle);
        }
    }

    /// Generates the beacon of the next subnet in the indexer's key list.
    ///
    /// Returns `false` when the end of the NetKey list is reached.
    fn generate_next<C: Config>(&mut self, purpose: Purpose, ctx: &mut Context<'_, C>) -> bool {
        loop {
            let mut indexer = match purpose {
                Purpose::Broadcast => self.bcast_indexer,
                _ => self.trig_indexer,
            };
            let net_key_index = match ctx.store.next_net_key_index(&mut indexer) {
                Some(i) => i,
                None => return false,
            };
            match purpose {
                Purpose::Broadcast => self.bcast_indexer = indexer,
                _ => self.trig_indexer = indexer,
            }

            let handle = match self.alloc(net_key_index, purpose, ctx) {
                Some(h) => h,
                // Skip to the next subnet.
                None => continue,
            };

            if self.gen_in_progress {
                let _ = self.tx_queue.push_back(handle);
                return true;
            }

            if self.submit_gen(handle, ctx) {
                self.gen_in_progress = true;
                return true;
            }

            self.free(handle);
        }
    }

    /// Fills in the plaintext beacon fields for a subnet; `None` if the subnet is unknown.
    fn alloc<C: Config>(
        &mut self,
        net_key_index: u16,
        purpose: Purpose,
        ctx: &Context<'_, C>,
    ) -> Option<BeaconHandle> {
        let phase = ctx.store.key_refresh_phase(net_key_index)?;
        let (iv_index, iv_update) = ctx.store.iv_index();

        let mut beacon = [0; BEACON_LEN];
        beacon[0] = crate::bearer::BEACON_TYPE_SECURE_NETWORK;
        let mut flags = 0;
        if iv_update {
            flags |= FLAG_IV_UPDATE;
        }
        if phase == KeyRefreshPhase::Second {
            flags |= FLAG_KEY_REFRESH;
        }
        beacon[1] = flags;
        // Octets 2..10 hold the network id, written by the security engine.
        BigEndian::write_u32(&mut beacon[IV_OFFSET..IV_OFFSET + 4], iv_index);

        let index = self.slots.iter().position(|s| s.is_none())?;
        self.slots[index] = Some(Slot {
            beacon,
            net_key_index,
            purpose,
            ref_count: 0,
        });

        Some(BeaconHandle {
            index: index as u8,
            generation: self.generations[index],
        })
    }

    fn submit_gen<C: Config>(&mut self, handle: BeaconHandle, ctx: &mut Context<'_, C>) -> bool {
        let slot = match self.get(handle) {
            Some(s) => s,
            None => return false,
        };
        let use_new_key =
            ctx.store.key_refresh_phase(slot.net_key_index) == Some(KeyRefreshPhase::Second);

        let req = BeaconGenRequest {
            token: handle,
            beacon: slot.beacon,
            net_key_index: slot.net_key_index,
            use_new_key,
        };
        ctx.crypto.compute_beacon_auth(req).is_ok()
    }

    /// Clears the in-progress flag and feeds the next queued beacon to the crypto engine.
    fn finish_gen<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        self.gen_in_progress = false;
        while let Some(handle) = self.tx_queue.pop_front() {
            if self.submit_gen(handle, ctx) {
                self.gen_in_progress = true;
                return;
            }
            trace!("beacon: dropping queued generation after submit failure");
            self.free(handle);
        }
    }

    fn resume_auth<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        if self.auth_in_progress {
            return;
        }

        while let Some(beacon) = self.rx_queue.pop_front() {
            if ctx.crypto.authenticate_beacon(BeaconAuthRequest { beacon }).is_ok() {
                self.auth_in_progress = true;
                return;
            }
        }
    }

    /// Sends a completed beacon on the requested bearer kinds, tracking references.
    fn manage_send<R: Radio>(
        &mut self,
        handle: BeaconHandle,
        on_adv: bool,
        on_gatt: bool,
        bearer: &mut BearerDispatch,
        radio: &mut R,
    ) {
        let beacon = match self.get(handle) {
            Some(s) => s.beacon,
            None => return,
        };

        let mut sent = 0u8;
        for (id, kind) in bearer.interfaces() {
            let wanted = match kind {
                BearerKind::Adv => on_adv,
                BearerKind::Gatt => on_gatt,
            };
            if wanted && bearer.send_beacon(radio, id, &beacon, handle) {
                sent += 1;
            }
        }

        if sent == 0 {
            self.free(handle);
        } else {
            self.get_mut(handle).unwrap().ref_count = sent;
        }
    }

    fn get(&self, handle: BeaconHandle) -> Option<&Slot> {
        let index = usize::from(handle.index);
        if self.generations.get(index) != Some(&handle.generation) {
            return None;
        }
        self.slots[index].as_ref()
    }

    fn get_mut(&mut self, handle: BeaconHandle) -> Option<&mut Slot> {
        let index = usize::from(handle.index);
        if self.generations.get(index) != Some(&handle.generation) {
            return None;
        }
        self.slots[index].as_mut()
    }

    fn free(&mut self, handle: BeaconHandle) {
        let index = usize::from(handle.index);
        if self.generations.get(index) == Some(&handle.generation) && self.slots[index].is_some() {
            self.slots[index] = None;
            self.generations[index] = self.generations[index].wrapping_add(1);
        }
    }
}
