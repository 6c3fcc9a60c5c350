//! The network pipeline.
//!
//! Encrypts and obfuscates outgoing PDUs, deobfuscates and decrypts incoming ones, applies the
//! duplicate-suppression caches, decides delivery to the transport layer and drives relay and
//! proxy forwarding.
//!
//! The crypto engine accepts one request per direction at a time; pending PDUs wait in FIFO
//! queues (`tx_sec_queue` / `rx_sec_queue`). Every PDU that enters the pipeline lives in the
//! [`PduArena`] until its reference count and retransmission state allow release. The central
//! invariant: a PDU is freed iff `ref_count == 0 && retrans_count == 0 && retrans_interval == 0`.
//!
//! [`PduArena`]: pdu/struct.PduArena.html

pub mod cache;
pub mod pdu;

use crate::address::Address;
use crate::bearer::{BearerDispatch, BearerKind, InterfaceId};
use crate::config::{Config, Context, EventSink, Friends, NetworkRxInfo, Radio, Replay, Store};
use crate::security::SecurityEngine;
use crate::net::cache::{CacheOutcome, NetworkCache};
use crate::net::pdu::{
    NetworkHeader, PduArena, PduHandle, PduMeta, PduTags, NET_HEADER_LEN, NET_KEY_INDEX_MAX,
    NET_MAX_PDU, NET_MIN_PDU, SEQ_MAX, TTL_MAX,
};
use crate::security::{CryptoBuf, CryptoRef, DecryptOk, DecryptRequest, EncryptRequest, NonceKind};
use crate::time::{Duration, Instant};
use crate::utils::rand_range;
use crate::Error;
use heapless::Deque;

/// Number of network PDUs that can be in flight simultaneously.
pub const NET_ARENA_SIZE: usize = 8;

/// L1 (pre-decrypt) duplicate cache capacity.
pub const NET_CACHE_L1_SIZE: usize = 16;

/// L2 (post-decrypt) duplicate cache capacity.
pub const NET_CACHE_L2_SIZE: usize = 16;

/// Maximum random hold applied to a relay-only PDU before its first transmission.
const RELAY_DELAY_MAX_MS: u32 = 20;

/// A PDU with TTL at or below this value is neither relayed nor forwarded.
const TTL_RELAY_FLOOR: u8 = 1;

/// Lower transport PDU handed down for transmission, with addressing and credential selection.
pub struct LtrTxInfo<'a> {
    pub src: Address,
    pub dst: Address,
    pub ttl: u8,
    pub ctl: bool,
    pub seq: u32,
    /// Lower transport header bytes, copied in front of the upper transport PDU.
    pub ltr_hdr: &'a [u8],
    pub utr_pdu: &'a [u8],
    pub net_key_index: u16,
    /// Unassigned selects master credentials.
    pub friend_lpn_addr: Address,
    /// Friendship pass-through: disables network retransmission entirely.
    pub if_passthrough: bool,
    /// Jump the encrypt queue.
    pub priority: bool,
}

/// The bearer-to-transport network pipeline.
pub struct NetworkPipeline {
    arena: PduArena<NET_ARENA_SIZE>,
    cache: NetworkCache<NET_CACHE_L1_SIZE, NET_CACHE_L2_SIZE>,
    tx_sec_queue: Deque<PduHandle, NET_ARENA_SIZE>,
    rx_sec_queue: Deque<PduHandle, NET_ARENA_SIZE>,
    encrypt_in_progress: bool,
    decrypt_in_progress: bool,
    /// Set when this node runs a proxy server; enables source learning on GATT interfaces.
    proxy_server: bool,
}

impl NetworkPipeline {
    pub fn new() -> Self {
        Self {
            arena: PduArena::new(),
            cache: NetworkCache::new(),
            tx_sec_queue: Deque::new(),
            rx_sec_queue: Deque::new(),
            encrypt_in_progress: false,
            decrypt_in_progress: false,
            proxy_server: false,
        }
    }

    /// Enables or disables proxy-server source learning on GATT interfaces.
    pub fn set_proxy_server(&mut self, enabled: bool) {
        self.proxy_server = enabled;
    }

    /// Clears both duplicate caches.
    ///
    /// Must be called when a network key is created and on IV update transitions.
    pub fn clear_caches(&mut self) {
        self.cache.clear();
    }

    /// Number of PDUs currently held by the arena (test and diagnostics hook).
    pub fn live_pdus(&self) -> usize {
        self.arena.live()
    }

    /// Accepts a lower transport PDU for transmission.
    pub fn send_ltr<C: Config>(
        &mut self,
        info: &LtrTxInfo<'_>,
        ctx: &mut Context<'_, C>,
    ) -> Result<(), Error> {
        if !info.src.is_unicast() || !info.dst.is_valid_destination() {
            return Err(Error::InvalidParam);
        }
        if info.ttl > TTL_MAX || info.seq > SEQ_MAX {
            return Err(Error::InvalidParam);
        }
        if info.net_key_index > NET_KEY_INDEX_MAX {
            return Err(Error::InvalidParam);
        }

        let header = NetworkHeader {
            ivi: false,
            nid: 0,
            ctl: info.ctl,
            ttl: info.ttl,
            seq: info.seq,
            src: info.src,
            dst: info.dst,
        };
        let mic_len = header.mic_len();
        let total = NET_HEADER_LEN + info.ltr_hdr.len() + info.utr_pdu.len() + mic_len;
        if total > NET_MAX_PDU {
            return Err(Error::InvalidParam);
        }

        // Assemble the plaintext PDU; IVI and NID stay zero, the security engine sets them.
        let mut pdu = [0u8; NET_MAX_PDU];
        header.pack(&mut pdu);
        pdu[NET_HEADER_LEN..NET_HEADER_LEN + info.ltr_hdr.len()].copy_from_slice(info.ltr_hdr);
        pdu[NET_HEADER_LEN + info.ltr_hdr.len()..total - mic_len].copy_from_slice(info.utr_pdu);

        let handle = self.arena.alloc(&pdu[..total])?;
        let tags = PduTags::SEND_ON_ADV | PduTags::SEND_ON_GATT;
        self.set_meta_info(handle, None, tags, info.dst, info.if_passthrough, ctx);

        {
            let meta = self.arena.get_mut(handle).unwrap();
            meta.net_key_index = info.net_key_index;
            meta.friend_lpn_addr = info.friend_lpn_addr;
            meta.iv_index = tx_iv_index::<C>(ctx);
        }

        if self.encrypt_in_progress {
            if info.priority {
                let _ = self.tx_sec_queue.push_front(handle);
            } else {
                let _ = self.tx_sec_queue.push_back(handle);
            }
            Ok(())
        } else {
            self.encrypt_in_progress = true;
            if self.submit_encrypt(handle, ctx) {
                Ok(())
            } else {
                self.arena.free(handle);
                self.encrypt_in_progress = false;
                Err(Error::Busy)
            }
        }
    }

    /// Accepts a network PDU received from a bearer.
    pub fn on_pdu_received<C: Config>(
        &mut self,
        iface: InterfaceId,
        pdu: &[u8],
        ctx: &mut Context<'_, C>,
    ) {
        if pdu.len() < NET_MIN_PDU || pdu.len() > NET_MAX_PDU {
            return;
        }

        // Cheap prefilter: some stored key must derive a matching NID, otherwise the PDU cannot
        // be ours and would only pollute the cache.
        if !ctx.crypto.nid_exists(NetworkHeader::peek_nid(pdu)) {
            return;
        }

        if self.cache.insert_l1(pdu) == CacheOutcome::AlreadyExists {
            return;
        }

        let handle = match self.arena.alloc(pdu) {
            Ok(h) => h,
            Err(_) => {
                error!("net: arena exhausted, dropping rx PDU");
                return;
            }
        };
        self.arena.get_mut(handle).unwrap().received_on = Some(iface);

        if self.decrypt_in_progress {
            let _ = self.rx_sec_queue.push_back(handle);
        } else {
            self.decrypt_in_progress = true;
            if !self.submit_decrypt(handle, ctx) {
                self.arena.free(handle);
                self.decrypt_in_progress = false;
            }
        }
    }

    /// Completion of a network encrypt request.
    pub fn on_encrypt_done<C: Config>(
        &mut self,
        handle: PduHandle,
        result: Option<CryptoBuf>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        match result {
            None => {
                // Silently abort as there is nothing to do.
                self.arena.free(handle);
            }
            Some(encrypted) => {
                let relay_only = match self.arena.get_mut(handle) {
                    Some(meta) => {
                        meta.set_pdu(&encrypted);
                        meta.tags == PduTags::RELAY_ON_ADV
                    }
                    None => {
                        self.encrypt_in_progress = false;
                        self.pump_encrypt(ctx);
                        return;
                    }
                };

                if relay_only {
                    // Hold a relay-only PDU for a random 1..=20 ms to reduce collisions with
                    // other relays; the hold expiry is not a retransmission.
                    let delay = rand_range(rng, 1, RELAY_DELAY_MAX_MS);
                    let meta = self.arena.get_mut(handle).unwrap();
                    meta.retrans_count += 1;
                    meta.retrans_at = Some(now + Duration::from_millis(delay));
                } else {
                    self.manage_send(handle, bearer, ctx.radio);
                    let release = {
                        let meta = self.arena.get_mut(handle).unwrap();
                        if meta.releasable() {
                            true
                        } else {
                            if meta.tags.intersects(PduTags::SEND_ON_ADV | PduTags::RELAY_ON_ADV)
                                && meta.retrans_interval_ms != 0
                            {
                                meta.retrans_at = Some(
                                    now + Duration::from_millis(u32::from(meta.retrans_interval_ms)),
                                );
                            }
                            false
                        }
                    };
                    if release {
                        self.arena.free(handle);
                    }
                }
            }
        }

        self.encrypt_in_progress = false;
        self.pump_encrypt(ctx);
    }

    /// Completion of a network decrypt request.
    pub fn on_decrypt_done<C: Config>(
        &mut self,
        handle: PduHandle,
        result: Option<DecryptOk>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        match result {
            None => {
                // Decrypt failures drop silently.
                debug!("net: decrypt failed, dropping PDU");
                self.arena.free(handle);
            }
            Some(ok) => {
                let valid = match self.arena.get_mut(handle) {
                    Some(meta) if ok.pdu.len() == meta.pdu().len() => {
                        meta.set_pdu(&ok.pdu);
                        meta.net_key_index = ok.net_key_index;
                        meta.iv_index = ok.iv_index;
                        meta.friend_lpn_addr = ok.friend_lpn_addr;
                        true
                    }
                    _ => false,
                };

                if valid {
                    self.process_rx(handle, bearer, ctx);
                } else {
                    self.arena.free(handle);
                }
            }
        }

        self.decrypt_in_progress = false;
        self.pump_decrypt(ctx);
    }

    /// A bearer consumed (or dropped) one reference of a network PDU.
    pub fn on_frame_processed(&mut self, handle: PduHandle) {
        let release = match self.arena.get_mut(handle) {
            Some(meta) => {
                meta.release_ref();
                meta.releasable()
            }
            None => false,
        };
        if release {
            self.arena.free(handle);
        }
    }

    /// Drives retransmission and relay-hold timers.
    pub fn poll<C: Config>(&mut self, now: Instant, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>) {
        let due: heapless::Vec<PduHandle, NET_ARENA_SIZE> = self
            .arena
            .handles()
            .filter(|h| {
                self.arena
                    .get(*h)
                    .and_then(|m| m.retrans_at)
                    .map_or(false, |at| at.is_at_or_before(now))
            })
            .collect();

        for handle in due {
            let do_send = {
                let meta = match self.arena.get_mut(handle) {
                    Some(m) => m,
                    None => continue,
                };
                meta.retrans_at = None;

                if meta.tags.intersects(PduTags::SEND_ON_ADV | PduTags::RELAY_ON_ADV) {
                    if meta.retrans_count > 0 {
                        meta.retrans_count -= 1;
                        if meta.retrans_count != 0 {
                            meta.retrans_at = Some(
                                now + Duration::from_millis(u32::from(meta.retrans_interval_ms)),
                            );
                        } else {
                            meta.retrans_interval_ms = 0;
                        }
                    }
                    true
                } else {
                    false
                }
            };

            if do_send {
                self.manage_send(handle, bearer, ctx.radio);
            }

            if self.arena.get(handle).map_or(false, |m| m.releasable()) {
                self.arena.free(handle);
            }
        }
    }

    /// The earliest instant at which `poll` needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next = None;
        for handle in self.arena.handles() {
            if let Some(meta) = self.arena.get(handle) {
                next = Instant::earliest(next, meta.retrans_at);
            }
        }
        next
    }

    /// Sends references of the PDU to every interface its tags and the output filters allow.
    ///
    /// Clears send-once tags after the round so timer expirations only retransmit on the
    /// advertising paths.
    fn manage_send<R: Radio>(&mut self, handle: PduHandle, bearer: &mut BearerDispatch, radio: &mut R) {
        let (pdu, len, tags, dst, received_on) = match self.arena.get(handle) {
            Some(meta) => {
                let mut copy = [0u8; NET_MAX_PDU];
                copy[..meta.pdu().len()].copy_from_slice(meta.pdu());
                (copy, meta.pdu().len(), meta.tags, meta.dst, meta.received_on)
            }
            None => return,
        };

        let mut sent = 0u8;
        for (id, kind) in bearer.interfaces() {
            match kind {
                BearerKind::Adv => {
                    if !tags.intersects(PduTags::ADV_ANY) {
                        continue;
                    }
                }
                BearerKind::Gatt => {
                    if !tags.intersects(PduTags::GATT_ANY) {
                        continue;
                    }
                    // Never forward a PDU back onto the interface it came from.
                    if tags.contains(PduTags::FWD_ALL_EXCEPT_RX) && received_on == Some(id) {
                        continue;
                    }
                }
            }

            if !bearer.filter_allows(id, dst) {
                continue;
            }

            if bearer.send_network(radio, id, &pdu[..len], handle) {
                sent += 1;
            }
        }

        if let Some(meta) = self.arena.get_mut(handle) {
            meta.ref_count += sent;
            meta.tags.remove(PduTags::SEND_ONCE);
        }
    }

    /// Reads the received PDU's header, applies the post-decrypt checks and decides delivery and
    /// relay.
    fn process_rx<C: Config>(
        &mut self,
        handle: PduHandle,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        let (header, net_key_index, iv_index, friend_lpn_addr, received_on) = {
            let meta = self.arena.get(handle).unwrap();
            let header = match NetworkHeader::unpack(meta.pdu()) {
                Ok(h) => h,
                Err(_) => {
                    self.arena.free(handle);
                    return;
                }
            };
            (
                header,
                meta.net_key_index,
                meta.iv_index,
                meta.friend_lpn_addr,
                meta.received_on,
            )
        };

        if header.dst.is_rfu() || header.dst.is_unassigned() {
            self.arena.free(handle);
            return;
        }

        let rx_iface = match received_on {
            Some(id) if bearer.contains(id) => id,
            _ => {
                self.arena.free(handle);
                return;
            }
        };
        let rx_kind = rx_iface.kind().unwrap();

        // A proxy server learns source addresses of clients talking through a GATT interface.
        if self.proxy_server && rx_kind == BearerKind::Gatt {
            if let Some(filter) = bearer.filter_mut(rx_iface) {
                match filter.kind() {
                    crate::bearer::filter::FilterKind::Whitelist => filter.add(header.src),
                    crate::bearer::filter::FilterKind::Blacklist => filter.remove(header.src),
                }
            }
        }

        // Master-credential traffic on a subnet with an established friendship is handled by the
        // friend instead.
        if ctx.friends.filter_subnet(net_key_index) && !friend_lpn_addr.is_unicast() {
            self.arena.free(handle);
            return;
        }

        if self.cache.insert_l2(self.arena.get(handle).unwrap().pdu()) == CacheOutcome::AlreadyExists {
            self.arena.free(handle);
            return;
        }

        let (fwd_to_ltr, tags) = self.tag_rx_pdu(&header, rx_kind, net_key_index, iv_index, ctx);

        {
            let meta = self.arena.get(handle).unwrap();
            let mic_len = header.mic_len();
            let ltr_pdu = &meta.pdu()[NET_HEADER_LEN..meta.pdu().len() - mic_len];
            let info = NetworkRxInfo {
                src: header.src,
                dst: header.dst,
                ttl: header.ttl,
                ctl: header.ctl,
                seq: header.seq,
                iv_index,
                net_key_index,
                friend_lpn_addr,
                ltr_pdu,
            };

            if friend_lpn_addr.is_unicast() {
                ctx.friends.notify_lpn_pdu(&info);
            }
            if fwd_to_ltr {
                ctx.events.network_pdu(&info);
            }
        }

        if !tags.is_empty() {
            // Relay or forward: decrement TTL, force master credentials and re-enter the TX flow.
            {
                let meta = self.arena.get_mut(handle).unwrap();
                NetworkHeader::set_ttl(meta.pdu_mut(), header.ttl - 1);
                meta.friend_lpn_addr = Address::UNASSIGNED;
                meta.iv_index = iv_index;
            }
            self.set_meta_info(handle, Some(rx_iface), tags, header.dst, false, ctx);

            if self.encrypt_in_progress {
                let _ = self.tx_sec_queue.push_back(handle);
            } else {
                self.encrypt_in_progress = true;
                if !self.submit_encrypt(handle, ctx) {
                    self.arena.free(handle);
                    self.encrypt_in_progress = false;
                }
            }
        } else {
            self.arena.free(handle);
        }
    }

    /// Decides whether a received PDU is delivered upwards and how it is relayed or forwarded.
    fn tag_rx_pdu<C: Config>(
        &self,
        header: &NetworkHeader,
        rx_kind: BearerKind,
        net_key_index: u16,
        iv_index: u32,
        ctx: &mut Context<'_, C>,
    ) -> (bool, PduTags) {
        let mut fwd_to_ltr = false;
        let mut tags = PduTags::empty();

        if header.dst.is_unicast() {
            fwd_to_ltr = ctx.store.is_local_element(header.dst);
        } else if ctx.store.subscription_contains(header.dst) || header.dst.is_fixed_group() {
            fwd_to_ltr = true;
        }

        // Replay protection applies only to PDUs about to be handed upwards.
        if fwd_to_ltr && ctx.replay.is_replay(header.src, header.seq, iv_index) {
            fwd_to_ltr = false;
        }

        if !fwd_to_ltr && ctx.friends.lpn_is_dst(header.dst, net_key_index) {
            fwd_to_ltr = true;
        }

        if header.ttl <= TTL_RELAY_FLOOR {
            return (fwd_to_ltr, tags);
        }

        // A unicast PDU consumed locally is not repeated.
        if header.dst.is_unicast() && fwd_to_ltr {
            return (fwd_to_ltr, tags);
        }

        match rx_kind {
            BearerKind::Adv => {
                if ctx.store.relay_state().is_enabled() && !ctx.store.is_local_element(header.src) {
                    tags |= PduTags::RELAY_ON_ADV;
                }
                if ctx.store.gatt_proxy_state().is_enabled() {
                    tags |= PduTags::FWD_ALL;
                }
            }
            BearerKind::Gatt => {
                if ctx.store.gatt_proxy_state().is_enabled() {
                    tags |= PduTags::FWD_ALL_EXCEPT_RX;
                }
            }
        }

        (fwd_to_ltr, tags)
    }

    /// Sets tag, filter destination and transmission parameters on a PDU's metadata.
    fn set_meta_info<C: Config>(
        &mut self,
        handle: PduHandle,
        received_on: Option<InterfaceId>,
        tags: PduTags,
        dst: Address,
        if_passthrough: bool,
        ctx: &mut Context<'_, C>,
    ) {
        let (count, interval) = if if_passthrough {
            (0, 0)
        } else {
            read_transmission_params::<C>(tags, ctx)
        };

        if let Some(meta) = self.arena.get_mut(handle) {
            meta.received_on = received_on;
            meta.tags = tags;
            meta.dst = dst;
            meta.retrans_count = count;
            meta.retrans_interval_ms = interval;
            meta.ref_count = 0;
            meta.retrans_at = None;
        }
    }

    fn submit_encrypt<C: Config>(&mut self, handle: PduHandle, ctx: &mut Context<'_, C>) -> bool {
        let meta = match self.arena.get(handle) {
            Some(m) => m,
            None => return false,
        };
        let mic_len = mic_len_of(meta);
        let plaintext = &meta.pdu()[..meta.pdu().len() - mic_len];

        let req = EncryptRequest {
            token: CryptoRef::Net(handle),
            nonce: NonceKind::Network,
            pdu: CryptoBuf::from_slice(plaintext).unwrap(),
            mic_len: mic_len as u8,
            net_key_index: meta.net_key_index,
            iv_index: meta.iv_index,
            friend_lpn_addr: meta.friend_lpn_addr,
        };
        ctx.crypto.encrypt_network(req).is_ok()
    }

    fn submit_decrypt<C: Config>(&mut self, handle: PduHandle, ctx: &mut Context<'_, C>) -> bool {
        let meta = match self.arena.get(handle) {
            Some(m) => m,
            None => return false,
        };
        let req = DecryptRequest {
            token: CryptoRef::Net(handle),
            nonce: NonceKind::Network,
            pdu: CryptoBuf::from_slice(meta.pdu()).unwrap(),
        };
        ctx.crypto.decrypt_network(req).is_ok()
    }

    fn pump_encrypt<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        while !self.encrypt_in_progress {
            let handle = match self.tx_sec_queue.pop_front() {
                Some(h) => h,
                None => break,
            };
            self.encrypt_in_progress = true;
            if !self.submit_encrypt(handle, ctx) {
                warn!("net: encrypt request rejected");
                self.arena.free(handle);
                self.encrypt_in_progress = false;
            }
        }
    }

    fn pump_decrypt<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        while !self.decrypt_in_progress {
            let handle = match self.rx_sec_queue.pop_front() {
                Some(h) => h,
                None => break,
            };
            self.decrypt_in_progress = true;
            if !self.submit_decrypt(handle, ctx) {
                self.arena.free(handle);
                self.decrypt_in_progress = false;
            }
        }
    }
}

/// NetMIC length of a stored PDU, derived from its packed CTL bit.
fn mic_len_of(meta: &PduMeta) -> usize {
    match NetworkHeader::unpack(meta.pdu()) {
        Ok(h) => h.mic_len(),
        Err(_) => crate::net::pdu::NETMIC_ACCESS,
    }
}

/// The IV index used for transmission: during an IV update the previous index stays in use.
fn tx_iv_index<C: Config>(ctx: &Context<'_, C>) -> u32 {
    let (iv, update_in_progress) = ctx.store.iv_index();
    if update_in_progress && iv != 0 {
        iv - 1
    } else {
        iv
    }
}

/// Reads Network Transmit or Relay Retransmit parameters depending on the PDU tag.
fn read_transmission_params<C: Config>(tags: PduTags, ctx: &Context<'_, C>) -> (u8, u16) {
    if tags.contains(PduTags::SEND_ON_ADV) {
        let count = ctx.store.nwk_transmit_count();
        if count == 0 {
            (0, 0)
        } else {
            (count, (u16::from(ctx.store.nwk_transmit_steps()) + 1) * 10)
        }
    } else if tags.contains(PduTags::RELAY_ON_ADV) {
        let count = ctx.store.relay_retrans_count();
        if count == 0 {
            (0, 0)
        } else {
            (count, (u16::from(ctx.store.relay_retrans_steps()) + 1) * 10)
        }
    } else {
        (0, 0)
    }
}
