//! Proxy configuration and node identity advertising.
//!
//! Proxy Configuration messages travel over GATT connections as network PDUs with `CTL = 1`,
//! `TTL = 0` and an unassigned destination, encrypted with the proxy nonce. They manipulate the
//! output filter of the connection they arrive on:
//!
//! | opcode | message         | parameters                      |
//! |--------|-----------------|---------------------------------|
//! | 0x00   | Set Filter Type | filter type (1)                 |
//! | 0x01   | Add Addresses   | list of 16-bit addresses, BE    |
//! | 0x02   | Remove Addresses| list of 16-bit addresses, BE    |
//! | 0x03   | Filter Status   | filter type (1), list size (2)  |
//!
//! The module owns its own single-in-flight encrypt and decrypt pipeline, separate from the main
//! network one, so proxy configuration cannot starve behind relay traffic.
//!
//! It also produces the service data advertised by a proxy server: the plain network id, or the
//! encrypted node identity `hash(8) | random(8)` where `hash` is the second half of
//! `AES-ECB(identity_key, 0^6 | random | primary_addr)`.

use crate::address::Address;
use crate::bearer::filter::FilterKind;
use crate::bearer::{BearerDispatch, InterfaceId};
use crate::bytes::{ByteReader, ByteWriter, ToBytes};
use crate::config::{Config, Context, EventSink, Store};
use crate::security::SecurityEngine;
use crate::net::pdu::{NetworkHeader, NET_HEADER_LEN, NETMIC_CONTROL};
use crate::security::{CryptoBuf, CryptoRef, DecryptOk, DecryptRequest, EncryptRequest, NonceKind};
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use heapless::{Deque, Vec};
use rand_core::RngCore;

/// Largest proxy configuration network PDU.
pub const PROXY_PDU_MAX: usize = 66;

/// Number of proxy PDUs that can be in flight simultaneously.
const PROXY_SLOTS: usize = 4;

const OPCODE_SET_FILTER_TYPE: u8 = 0x00;
const OPCODE_ADD_ADDRESSES: u8 = 0x01;
const OPCODE_REMOVE_ADDRESSES: u8 = 0x02;
const OPCODE_FILTER_STATUS: u8 = 0x03;

const FILTER_STATUS_PARAMS_LEN: usize = 3;

/// Service data identification type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdentificationType {
    /// Plain 8-octet network id.
    NetworkId = 0x00,
    /// Encrypted node identity.
    NodeIdentity = 0x01,
}

/// Handle to a proxy pipeline slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProxyToken {
    index: u8,
    generation: u16,
}

struct Slot {
    pdu: Vec<u8, PROXY_PDU_MAX>,
    iface: InterfaceId,
}

/// Proxy configuration processor and node identity driver.
pub struct Proxy {
    slots: [Option<Slot>; PROXY_SLOTS],
    generations: [u16; PROXY_SLOTS],
    tx_sec_queue: Deque<ProxyToken, PROXY_SLOTS>,
    rx_sec_queue: Deque<ProxyToken, PROXY_SLOTS>,
    encrypt_in_progress: bool,
    decrypt_in_progress: bool,

    /// Node identity AES operation outstanding.
    node_id_in_progress: bool,
    node_id_random: [u8; 8],

    is_server: bool,
}

impl Proxy {
    pub fn new() -> Self {
        const NONE: Option<Slot> = None;
        Self {
            slots: [NONE; PROXY_SLOTS],
            generations: [0; PROXY_SLOTS],
            tx_sec_queue: Deque::new(),
            rx_sec_queue: Deque::new(),
            encrypt_in_progress: false,
            decrypt_in_progress: false,
            node_id_in_progress: false,
            node_id_random: [0; 8],
            is_server: false,
        }
    }

    pub fn set_server(&mut self, is_server: bool) {
        self.is_server = is_server;
    }

    /// Builds, encrypts and sends a Proxy Configuration message on a GATT interface.
    pub fn send_config_message<C: Config>(
        &mut self,
        iface: InterfaceId,
        opcode: u8,
        params: &[u8],
        ctx: &mut Context<'_, C>,
    ) -> Result<(), Error> {
        let src = ctx.store.element_addr(0).ok_or(Error::InvalidConfig)?;
        let seq = ctx.store.next_seq_number()?;
        let mut iter = 0;
        let net_key_index = ctx
            .store
            .next_net_key_index(&mut iter)
            .ok_or(Error::KeyNotFound)?;

        let total = NET_HEADER_LEN + 1 + params.len() + NETMIC_CONTROL;
        if total > PROXY_PDU_MAX {
            return Err(Error::InvalidParam);
        }

        let header = NetworkHeader {
            ivi: false,
            nid: 0,
            ctl: true,
            ttl: 0,
            seq,
            src,
            dst: Address::UNASSIGNED,
        };

        let mut pdu: Vec<u8, PROXY_PDU_MAX> = Vec::new();
        pdu.resize(total, 0).unwrap();
        {
            let mut writer = ByteWriter::new(&mut pdu);
            header.to_bytes(&mut writer)?;
            writer.write_u8(opcode)?;
            writer.write_slice(params)?;
            // The remaining octets are NetMIC space filled by the security engine.
        }

        let token = self.alloc(pdu, iface).ok_or(Error::OutOfMemory)?;

        if self.encrypt_in_progress {
            let _ = self.tx_sec_queue.push_back(token);
            return Ok(());
        }

        self.encrypt_in_progress = true;
        if self.submit_encrypt(token, net_key_index, ctx) {
            Ok(())
        } else {
            self.free(token);
            self.encrypt_in_progress = false;
            Err(Error::Busy)
        }
    }

    /// Handles an encrypted proxy configuration PDU received on a GATT interface.
    pub fn on_pdu_received<C: Config>(&mut self, iface: InterfaceId, pdu: &[u8], ctx: &mut Context<'_, C>) {
        if pdu.len() < NET_HEADER_LEN + 1 + NETMIC_CONTROL || pdu.len() > PROXY_PDU_MAX {
            return;
        }

        let token = match self.alloc(Vec::from_slice(pdu).unwrap(), iface) {
            Some(t) => t,
            None => return,
        };

        if self.decrypt_in_progress {
            let _ = self.rx_sec_queue.push_back(token);
            return;
        }

        self.decrypt_in_progress = true;
        if !self.submit_decrypt(token, ctx) {
            self.free(token);
            self.decrypt_in_progress = false;
        }
    }

    /// Completion of a proxy encrypt request.
    pub fn on_encrypt_done<C: Config>(
        &mut self,
        token: ProxyToken,
        result: Option<CryptoBuf>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        if let (Some(encrypted), Some(slot)) = (result, self.get(token)) {
            let iface = slot.iface;
            bearer.send_proxy_config(ctx.radio, iface, &encrypted);
        }
        self.free(token);

        self.encrypt_in_progress = false;
        self.pump_encrypt(ctx);
    }

    /// Completion of a proxy decrypt request.
    pub fn on_decrypt_done<C: Config>(
        &mut self,
        token: ProxyToken,
        result: Option<DecryptOk>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        let slot_info = self.get(token).map(|s| (s.iface, s.pdu.len()));
        if let (Some(ok), Some((iface, pdu_len))) = (result, slot_info) {
            if ok.pdu.len() == pdu_len {
                if let Ok(header) = NetworkHeader::unpack(&ok.pdu) {
                    // Everything that is not a well-formed proxy configuration PDU is dropped.
                    if header.ctl && header.ttl == 0 && header.dst.is_unassigned() {
                        let msg = &ok.pdu[NET_HEADER_LEN..pdu_len - NETMIC_CONTROL];
                        self.process_config_message(iface, msg, bearer, ctx);
                    }
                }
            }
        }
        self.free(token);

        self.decrypt_in_progress = false;
        self.pump_decrypt(ctx);
    }

    /// Requests fresh service data for the proxy advertising payload.
    ///
    /// Network id data is produced synchronously; node identity data arrives once the AES
    /// operation completes. Configuration errors surface as `service_data_unavailable`.
    pub fn create_service_data<C: Config>(
        &mut self,
        net_key_index: u16,
        id_type: IdentificationType,
        ctx: &mut Context<'_, C>,
        rng: &mut impl RngCore,
    ) {
        match id_type {
            IdentificationType::NetworkId => {
                if !ctx.store.gatt_proxy_state().is_enabled() {
                    ctx.events.service_data_unavailable();
                    return;
                }
                match ctx.crypto.network_id(net_key_index) {
                    Some(network_id) => {
                        let mut data: Vec<u8, 17> = Vec::new();
                        data.push(IdentificationType::NetworkId as u8).unwrap();
                        data.extend_from_slice(&network_id).unwrap();
                        ctx.events.service_data(&data);
                    }
                    None => ctx.events.service_data_unavailable(),
                }
            }
            IdentificationType::NodeIdentity => {
                if !ctx.store.node_identity_running(net_key_index) {
                    ctx.events.service_data_unavailable();
                    return;
                }
                // One node identity computation at a time; the caller waits for the data event.
                if self.node_id_in_progress {
                    return;
                }

                let key = match ctx.crypto.identity_key(net_key_index) {
                    Some(k) => k,
                    None => {
                        ctx.events.service_data_unavailable();
                        return;
                    }
                };

                rng.fill_bytes(&mut self.node_id_random);
                let mut plaintext = [0u8; 16];
                plaintext[6..14].copy_from_slice(&self.node_id_random);
                let addr = ctx.store.element_addr(0).map(|a| a.raw()).unwrap_or(0);
                BigEndian::write_u16(&mut plaintext[14..16], addr);

                if ctx.crypto.aes_ecb(key, plaintext).is_ok() {
                    self.node_id_in_progress = true;
                }
            }
        }
    }

    /// Completion of the node identity AES operation.
    pub fn on_aes_done<C: Config>(&mut self, ciphertext: &[u8; 16], ctx: &mut Context<'_, C>) {
        if !self.node_id_in_progress {
            return;
        }
        self.node_id_in_progress = false;

        let mut data: Vec<u8, 17> = Vec::new();
        data.push(IdentificationType::NodeIdentity as u8).unwrap();
        data.extend_from_slice(&ciphertext[8..16]).unwrap();
        data.extend_from_slice(&self.node_id_random).unwrap();
        ctx.events.service_data(&data);
    }

    /// Applies a decrypted Proxy Configuration message.
    fn process_config_message<C: Config>(
        &mut self,
        iface: InterfaceId,
        msg: &[u8],
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        if msg.is_empty() {
            return;
        }

        let mut send_status = false;
        match msg[0] {
            OPCODE_SET_FILTER_TYPE if self.is_server => {
                if msg.len() == 2 {
                    if let Some(kind) = FilterKind::from_raw(msg[1]) {
                        if let Some(filter) = bearer.filter_mut(iface) {
                            filter.set_kind(kind);
                            send_status = true;
                        }
                    }
                }
            }
            OPCODE_ADD_ADDRESSES if self.is_server => {
                if (msg.len() - 1) % 2 == 0 {
                    if let Some(filter) = bearer.filter_mut(iface) {
                        let mut addrs = ByteReader::new(&msg[1..]);
                        while let Ok(raw) = addrs.read_u16_be() {
                            filter.add(Address(raw));
                        }
                        send_status = true;
                    }
                }
            }
            OPCODE_REMOVE_ADDRESSES if self.is_server => {
                if (msg.len() - 1) % 2 == 0 {
                    if let Some(filter) = bearer.filter_mut(iface) {
                        let mut addrs = ByteReader::new(&msg[1..]);
                        while let Ok(raw) = addrs.read_u16_be() {
                            filter.remove(Address(raw));
                        }
                        send_status = true;
                    }
                }
            }
            OPCODE_FILTER_STATUS if !self.is_server => {
                if msg.len() == 1 + FILTER_STATUS_PARAMS_LEN {
                    let mut params = ByteReader::new(&msg[1..]);
                    let kind = params.read_u8().ok().and_then(FilterKind::from_raw);
                    if let (Some(kind), Ok(size)) = (kind, params.read_u16_be()) {
                        ctx.events.filter_status(kind, size);
                    }
                }
            }
            _ => {
                // RFU opcodes are ignored.
            }
        }

        if send_status {
            let (kind, size) = match bearer.filter(iface) {
                Some(f) => (f.kind(), f.len()),
                None => return,
            };
            let mut params = [0u8; FILTER_STATUS_PARAMS_LEN];
            params[0] = kind.raw();
            BigEndian::write_u16(&mut params[1..3], size);
            let _ = self.send_config_message(iface, OPCODE_FILTER_STATUS, &params, ctx);
        }
    }

    fn submit_encrypt<C: Config>(
        &mut self,
        token: ProxyToken,
        net_key_index: u16,
        ctx: &mut Context<'_, C>,
    ) -> bool {
        let slot = match self.get(token) {
            Some(s) => s,
            None => return false,
        };
        let plaintext = &slot.pdu[..slot.pdu.len() - NETMIC_CONTROL];

        let req = EncryptRequest {
            token: CryptoRef::Proxy(token),
            nonce: NonceKind::Proxy,
            pdu: CryptoBuf::from_slice(plaintext).unwrap(),
            mic_len: NETMIC_CONTROL as u8,
            net_key_index,
            iv_index: tx_iv_index::<C>(ctx),
            friend_lpn_addr: Address::UNASSIGNED,
        };
        ctx.crypto.encrypt_network(req).is_ok()
    }

    fn submit_decrypt<C: Config>(&mut self, token: ProxyToken, ctx: &mut Context<'_, C>) -> bool {
        let slot = match self.get(token) {
            Some(s) => s,
            None => return false,
        };
        let req = DecryptRequest {
            token: CryptoRef::Proxy(token),
            nonce: NonceKind::Proxy,
            pdu: CryptoBuf::from_slice(&slot.pdu).unwrap(),
        };
        ctx.crypto.decrypt_network(req).is_ok()
    }

    fn pump_encrypt<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        while !self.encrypt_in_progress {
            let token = match self.tx_sec_queue.pop_front() {
                Some(t) => t,
                None => break,
            };
            // Encrypt queue entries always use the primary subnet.
            let mut iter = 0;
            let net_key_index = match ctx.store.next_net_key_index(&mut iter) {
                Some(i) => i,
                None => {
                    self.free(token);
                    continue;
                }
            };
            self.encrypt_in_progress = true;
            if !self.submit_encrypt(token, net_key_index, ctx) {
                self.free(token);
                self.encrypt_in_progress = false;
            }
        }
    }

    fn pump_decrypt<C: Config>(&mut self, ctx: &mut Context<'_, C>) {
        while !self.decrypt_in_progress {
            let token = match self.rx_sec_queue.pop_front() {
                Some(t) => t,
                None => break,
            };
            self.decrypt_in_progress = true;
            if !self.submit_decrypt(token, ctx) {
                self.free(token);
                self.decrypt_in_progress = false;
            }
        }
    }

    fn alloc(&mut self, pdu: Vec<u8, PROXY_PDU_MAX>, iface: InterfaceId) -> Option<ProxyToken> {
        let index = self.slots.iter().position(|s| s.is_none())?;
        self.slots[index] = Some(Slot { pdu, iface });
        Some(ProxyToken {
            index: index as u8,
            generation: self.generations[index],
        })
    }

    fn get(&self, token: ProxyToken) -> Option<&Slot> {
        let index = usize::from(token.index);
        if self.generations.get(index) != Some(&token.generation) {
            return None;
        }
        self.slots[index].as_ref()
    }

    fn free(&mut self, token: ProxyToken) {
        let index = usize::from(token.index);
        if self.generations.get(index) == Some(&token.generation) && self.slots[index].is_some() {
            self.slots[index] = None;
            self.generations[index] = self.generations[index].wrapping_add(1);
        }
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
