//! The provisioning bearer (PB-ADV and the PB-GATT pass-through).
//!
//! PB-ADV layers link establishment and a transaction-based segmentation protocol over the
//! advertising bearer. Every frame starts with the 32-bit link id and an 8-bit transaction
//! number, followed by a Generic Provisioning PDU whose first octet carries a 2-bit GPCF code:
//!
//! | GPCF | Name         | Header fields                                   |
//! |------|--------------|-------------------------------------------------|
//! | 0b00 | Start        | SegN(6), total length(16), FCS(8), payload      |
//! | 0b01 | Ack          | padding(6) = 0                                  |
//! | 0b10 | Continuation | SegIndex(6), payload                            |
//! | 0b11 | Control      | opcode(6): Link Open / Link Ack / Link Close    |
//!
//! The advertising bearer is lossy, so everything here is paced and retried with random jitter:
//! segments go out 20–50 ms apart, transaction ACKs are delayed 20–50 ms so the peer can stop
//! in-flight retransmissions first, and Link Ack/Link Close control PDUs are repeated three
//! times. A transaction that is not acknowledged within its 30-second budget tears the link down
//! with reason *timeout*.
//!
//! Over PB-GATT the GATT bearer's own segmentation applies and provisioning PDUs pass through
//! unmodified.

pub mod beacon;
pub mod fcs;

use crate::bearer::{BearerDispatch, BearerKind, InterfaceId};
use crate::config::{Config, Context, EventSink};
use crate::prov::beacon::UnprovBeacon;
use crate::time::{Duration, Instant};
use crate::utils::rand_range;
use byteorder::{BigEndian, ByteOrder};
use heapless::Vec;
use rand_core::RngCore;
use uuid::Uuid;

/// Maximum provisioning PDU length carried by a transaction.
pub const PROV_MAX_PDU: usize = 64;

/// Link establishment timeout.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(60);

/// Total wall-time budget of one TX transaction.
pub const TRAN_TIMEOUT_MS: u32 = 30_000;

/// Transmission jitter bounds.
const TX_DELAY_MIN_MS: u32 = 20;
const TX_DELAY_MAX_MS: u32 = 50;

/// Number of repetitions for Link Ack and Link Close control PDUs.
const CTL_RETRY_COUNT: u8 = 3;

/// Payload capacity of the Start segment.
const SEG0_CAP: usize = 20;

/// Payload capacity of every continuation segment.
const SEGX_CAP: usize = 23;

/// PB-ADV header: link id (4) + transaction number (1).
const PBADV_HDR: usize = 5;

/// Start segment header: GPCF/SegN (1) + total length (2) + FCS (1).
const SEG0_HDR: usize = 4;

/// First transaction number used by each role, and the wrap targets.
const SR_TRAN_START: u8 = 0x80;
const CL_TRAN_START: u8 = 0x00;

/// A Provisioning Failed PDU must not preempt a running transaction.
const PDU_FAILED_OPCODE: u8 = 0x09;

const GPCF_START: u8 = 0b00;
const GPCF_ACK: u8 = 0b01;
const GPCF_CONTINUATION: u8 = 0b10;
const GPCF_CONTROL: u8 = 0b11;

const OPCODE_LINK_OPEN: u8 = 0x00;
const OPCODE_LINK_ACK: u8 = 0x01;
const OPCODE_LINK_CLOSE: u8 = 0x02;

const LINK_OPEN_LEN: usize = 17;
const LINK_ACK_LEN: usize = 1;
const LINK_CLOSE_LEN: usize = 2;

/// Link Close reason codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Success = 0x00,
    Timeout = 0x01,
    Fail = 0x02,
}

impl CloseReason {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => CloseReason::Success,
            0x01 => CloseReason::Timeout,
            _ => CloseReason::Fail,
        }
    }
}

/// Provisioning role of the local node on this bearer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Role {
    /// The device being provisioned.
    Server,
    /// The provisioner.
    Client,
}

/// Control PDU being retried with jitter.
#[derive(Debug, Copy, Clone)]
enum CtlPdu {
    LinkAck,
    LinkClose(CloseReason),
}

struct CtlRetry {
    pdu: CtlPdu,
    retries_left: u8,
    at: Instant,
}

struct TxTransaction {
    buf: Vec<u8, PROV_MAX_PDU>,
    next_seg: u8,
    seg_n: u8,
    timeout_ms_left: u32,
}

struct RxTransaction {
    buf: [u8; PROV_MAX_PDU],
    seg_mask: u64,
    seg_n: u8,
    total_len: u16,
    fcs: u8,
}

/// The provisioning bearer state machine.
pub struct ProvBearer {
    role: Role,
    adv_iface: Option<InterfaceId>,
    gatt_iface: Option<InterfaceId>,

    link_id: u32,
    link_open: bool,
    local_tran: u8,
    peer_tran: u8,
    last_rx_opcode: Option<u8>,

    /// Device UUID the client wants to provision; cleared once the link opens.
    target_uuid: Option<Uuid>,

    tx: Option<TxTransaction>,
    rx: Option<RxTransaction>,
    rx_acked: bool,

    /// Unprovisioned device beacon broadcast (server role).
    pub(crate) unprov_beacon: UnprovBeacon,

    tx_at: Option<Instant>,
    ack_at: Option<Instant>,
    link_at: Option<Instant>,
    ctl_retry: Option<CtlRetry>,
}

impl ProvBearer {
    pub fn new() -> Self {
        Self {
            role: Role::Server,
            adv_iface: None,
            gatt_iface: None,
            link_id: 0,
            link_open: false,
            local_tran: 0,
            peer_tran: 0,
            last_rx_opcode: None,
            target_uuid: None,
            tx: None,
            rx: None,
            rx_acked: false,
            unprov_beacon: UnprovBeacon::new(),
            tx_at: None,
            ack_at: None,
            link_at: None,
            ctl_retry: None,
        }
    }

    /// Enables PB-ADV server operation: broadcast unprovisioned device beacons and await a Link
    /// Open.
    pub fn enable_adv_server<C: Config>(
        &mut self,
        iface: InterfaceId,
        beacon_interval: Duration,
        uuid: &Uuid,
        oob_info: u16,
        uri: Option<&[u8]>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
    ) {
        self.role = Role::Server;
        self.link_open = false;
        self.target_uuid = None;
        self.adv_iface = Some(iface);
        self.unprov_beacon
            .start(iface, beacon_interval, uuid, oob_info, uri, bearer, ctx, now);
    }

    /// Enables PB-GATT server operation on an open GATT connection.
    pub fn enable_gatt_server(&mut self, iface: InterfaceId) {
        self.unprov_beacon.stop();
        self.role = Role::Server;
        self.gatt_iface = Some(iface);
    }

    /// Enables PB-ADV client operation: scan unprovisioned beacons, open links on demand.
    pub fn enable_adv_client(&mut self, iface: InterfaceId) {
        self.role = Role::Client;
        self.link_open = false;
        self.target_uuid = None;
        self.adv_iface = Some(iface);
    }

    /// Enables PB-GATT client operation on an open GATT connection.
    pub fn enable_gatt_client(&mut self, iface: InterfaceId) {
        self.role = Role::Client;
        self.gatt_iface = Some(iface);
    }

    /// Client: requests a PB-ADV link with the device carrying `uuid`.
    ///
    /// The Link Open goes out when a matching unprovisioned beacon is seen; establishment is
    /// bounded by the 60-second link timer.
    pub fn open_link(&mut self, uuid: Uuid, rng: &mut impl RngCore, now: Instant) {
        self.target_uuid = Some(uuid);
        self.link_id = rng.next_u32();
        self.link_at = Some(now + LINK_TIMEOUT);
    }

    /// Closes the provisioning link, sending a Link Close on PB-ADV.
    ///
    /// No `link_closed` event is emitted; the caller initiated the closure.
    pub fn close_link<C: Config>(
        &mut self,
        reason: CloseReason,
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        self.close_internal(reason, false, ctx, now, rng);
    }

    /// Closes the provisioning link without sending a Link Close (provisioning complete).
    pub fn close_link_silent<C: Config>(&mut self, ctx: &mut Context<'_, C>, now: Instant, rng: &mut C::Rng) {
        self.close_internal(CloseReason::Fail, true, ctx, now, rng);
    }

    /// Sends a provisioning PDU over the enabled bearer.
    ///
    /// On PB-ADV this starts a new transaction, cancelling an unacknowledged one (except that a
    /// Provisioning Failed PDU never preempts). Returns `false` if the PDU cannot be sent.
    pub fn send_pdu<C: Config>(
        &mut self,
        pdu: &[u8],
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) -> bool {
        if pdu.is_empty() || pdu.len() > PROV_MAX_PDU {
            return false;
        }

        // PB-GATT takes precedence; the GATT bearer handles segmentation.
        if let Some(iface) = self.gatt_iface {
            return bearer.send_prov(ctx.radio, iface, pdu, pdu[0]);
        }

        if !self.link_open {
            return false;
        }

        if self.tx.is_some() {
            if pdu[0] == PDU_FAILED_OPCODE {
                // Cannot send Provisioning Failed at this moment.
                return false;
            }
            // The new transaction takes priority; consider the old one complete.
            let _ = self.end_tx_transaction();
        }

        let seg0_len = pdu.len().min(SEG0_CAP);
        let rest = pdu.len() - seg0_len;
        let seg_n = (rest / SEGX_CAP + usize::from(rest % SEGX_CAP > 0)) as u8;

        let delay = rand_range(rng, TX_DELAY_MIN_MS, TX_DELAY_MAX_MS);
        self.tx = Some(TxTransaction {
            buf: Vec::from_slice(pdu).unwrap(),
            next_seg: 0,
            seg_n,
            timeout_ms_left: TRAN_TIMEOUT_MS - delay,
        });
        self.tx_at = Some(now + Duration::from_millis(delay));

        true
    }

    /// Handles a provisioning bearer PDU from the dispatch.
    pub fn on_pdu<C: Config>(
        &mut self,
        iface: InterfaceId,
        pdu: &[u8],
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        if self.adv_iface != Some(iface) && self.gatt_iface != Some(iface) {
            return;
        }

        // PB-GATT passes straight through to the provisioning protocol.
        if iface.kind() == Some(BearerKind::Gatt) {
            if !pdu.is_empty() {
                self.last_rx_opcode = Some(pdu[0]);
                ctx.events.prov_pdu(pdu);
            }
            return;
        }

        if pdu.len() <= PBADV_HDR {
            return;
        }

        let link_id = BigEndian::read_u32(&pdu[0..4]);
        let tran_num = pdu[4];
        let gen_pdu = &pdu[PBADV_HDR..];

        match gen_pdu[0] & 0x03 {
            GPCF_START => {
                if !self.validates_link(link_id) {
                    return;
                }

                if self.is_new_pdu(tran_num) {
                    // A new inbound transaction means the peer saw our last one through, even if
                    // we lost the ACK.
                    if self.link_open && self.tx.is_some() {
                        let _ = self.end_tx_transaction();
                    }
                } else if gen_pdu.len() > SEG0_HDR
                    && Some(gen_pdu[SEG0_HDR]) == self.last_rx_opcode
                    && self.peer_tran == tran_num
                {
                    // Retransmitted Start of a completed transaction: only the ACK was lost.
                    self.prepare_ack(now, rng);
                    return;
                }

                self.peer_tran = tran_num;
                self.start_rx_transaction(gen_pdu, ctx, now, rng);
            }
            GPCF_ACK => {
                if self.link_open
                    && self.link_id == link_id
                    && self.local_tran == tran_num
                    && gen_pdu[0] >> 2 == 0
                {
                    if let Some(opcode) = self.end_tx_transaction() {
                        ctx.events.prov_pdu_sent(opcode);
                    }
                }
            }
            GPCF_CONTINUATION => {
                if self.validates_link(link_id) && gen_pdu.len() > 1 {
                    self.continue_rx_transaction(gen_pdu, ctx, now, rng);
                }
            }
            _ => match self.role {
                Role::Server => self.sr_process_ctl(link_id, gen_pdu, ctx, now, rng),
                Role::Client => self.cl_process_ctl(link_id, gen_pdu, ctx),
            },
        }
    }

    /// Handles an unprovisioned device beacon (client role: send Link Open on a match).
    pub fn on_unprov_beacon<C: Config>(
        &mut self,
        iface: InterfaceId,
        beacon: &[u8],
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        if self.adv_iface != Some(iface) {
            return;
        }
        if beacon.len() != beacon::UNPROV_BEACON_LEN && beacon.len() != beacon::UNPROV_BEACON_URI_LEN {
            return;
        }

        let matches = match (&self.target_uuid, self.link_open) {
            (Some(uuid), false) => &beacon[1..17] == uuid.as_bytes(),
            _ => false,
        };

        if matches {
            self.send_link_open(bearer, ctx);
        }
    }

    /// A GATT interface carrying the provisioning link went away.
    pub fn on_interface_closed(&mut self, iface: InterfaceId) {
        if self.gatt_iface == Some(iface) {
            self.gatt_iface = None;
        }
        if self.adv_iface == Some(iface) {
            self.adv_iface = None;
        }
    }

    /// Drives all PB-ADV timers.
    pub fn poll<C: Config>(
        &mut self,
        now: Instant,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        rng: &mut C::Rng,
    ) {
        self.unprov_beacon.poll(now, bearer, ctx);

        if self.ack_at.map_or(false, |at| at.is_at_or_before(now)) {
            self.ack_at = None;
            self.send_ack(bearer, ctx);
        }

        if self.tx_at.map_or(false, |at| at.is_at_or_before(now)) {
            self.tx_at = None;
            self.tx_timer_fired(bearer, ctx, now, rng);
        }

        if self.link_at.map_or(false, |at| at.is_at_or_before(now)) {
            self.link_at = None;
            if self.link_open {
                self.close_internal(CloseReason::Timeout, false, ctx, now, rng);
                ctx.events.link_closed(CloseReason::Timeout, false);
            } else {
                self.target_uuid = None;
                ctx.events.link_failed();
            }
        }

        if self
            .ctl_retry
            .as_ref()
            .map_or(false, |r| r.at.is_at_or_before(now))
        {
            self.ctl_retry_fired(bearer, ctx, now, rng);
        }
    }

    /// The earliest instant at which `poll` needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next = self.unprov_beacon.next_timeout();
        next = Instant::earliest(next, self.tx_at);
        next = Instant::earliest(next, self.ack_at);
        next = Instant::earliest(next, self.link_at);
        next = Instant::earliest(next, self.ctl_retry.as_ref().map(|r| r.at));
        next
    }

    fn validates_link(&self, link_id: u32) -> bool {
        self.link_open && self.link_id == link_id
    }

    /// Transaction-number freshness rule: the first PDU on a link is accepted unconditionally,
    /// afterwards only transaction numbers above the last seen one are new. A reassembly that has
    /// not been acknowledged yet pins the current transaction.
    fn is_new_pdu(&self, tran_num: u8) -> bool {
        if self.rx.is_some() && !self.rx_acked {
            return false;
        }
        if self.last_rx_opcode.is_none() {
            return true;
        }
        tran_num > self.peer_tran
    }

    fn start_rx_transaction<C: Config>(
        &mut self,
        gen_pdu: &[u8],
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        if gen_pdu.len() <= SEG0_HDR {
            return;
        }

        // A Start for a different transaction abandons an in-progress reassembly; a duplicate of
        // the one being reassembled is ignored.
        let duplicate_of_current = match &self.rx {
            Some(rx) => !self.rx_acked && rx.buf[0] == gen_pdu[SEG0_HDR],
            None => false,
        };
        if duplicate_of_current {
            return;
        }
        self.rx = None;

        let seg_n = gen_pdu[0] >> 2;
        let total_len = BigEndian::read_u16(&gen_pdu[1..3]);
        let rx_fcs = gen_pdu[3];
        let payload = &gen_pdu[SEG0_HDR..];

        if total_len == 0 || usize::from(total_len) > PROV_MAX_PDU {
            return;
        }

        if seg_n == 0 {
            // Single-segment transaction: deliver immediately after the FCS check.
            if usize::from(total_len) == payload.len() && fcs::check(payload, rx_fcs) {
                self.prepare_ack(now, rng);
                self.rx_acked = true;
                self.last_rx_opcode = Some(payload[0]);

                // Any received provisioning PDU proves the peer is alive.
                self.link_at = None;

                ctx.events.prov_pdu(payload);
            }
        } else {
            if payload.len() > SEG0_CAP || usize::from(total_len) <= payload.len() {
                return;
            }

            // SegN must agree with the declared total length, which also bounds the mask width.
            let tail = usize::from(total_len) - SEG0_CAP;
            let expected_seg_n = (tail / SEGX_CAP + usize::from(tail % SEGX_CAP > 0)) as u8;
            if seg_n != expected_seg_n {
                return;
            }

            let mut rx = RxTransaction {
                buf: [0; PROV_MAX_PDU],
                seg_mask: 1,
                seg_n,
                total_len,
                fcs: rx_fcs,
            };
            rx.buf[..payload.len()].copy_from_slice(payload);
            self.rx = Some(rx);
            self.rx_acked = false;
        }
    }

    fn continue_rx_transaction<C: Config>(
        &mut self,
        gen_pdu: &[u8],
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        // A continuation before the Start segment cannot be placed: the total length is unknown.
        let (seg_n, total_len, mask) = match &self.rx {
            Some(rx) => (rx.seg_n, rx.total_len, rx.seg_mask),
            None => return,
        };

        let seg_x = gen_pdu[0] >> 2;
        if seg_x == 0 || seg_x > seg_n {
            return;
        }

        if mask & (1 << seg_x) != 0 {
            // Segment already received; if the transaction completed, the peer missed the ACK.
            if self.rx_acked {
                self.prepare_ack(now, rng);
            }
            return;
        }

        let payload = &gen_pdu[1..];
        let offset = SEG0_CAP + (usize::from(seg_x) - 1) * SEGX_CAP;
        if offset + payload.len() > usize::from(total_len) {
            return;
        }

        let complete = {
            let rx = self.rx.as_mut().unwrap();
            rx.seg_mask |= 1 << seg_x;
            rx.buf[offset..offset + payload.len()].copy_from_slice(payload);

            let complete_mask = (1u64 << (u64::from(seg_n) + 1)) - 1;
            rx.seg_mask & complete_mask == complete_mask
        };

        if complete {
            let fcs_ok = {
                let rx = self.rx.as_ref().unwrap();
                fcs::check(&rx.buf[..usize::from(rx.total_len)], rx.fcs)
            };

            if fcs_ok {
                self.last_rx_opcode = Some(self.rx.as_ref().unwrap().buf[0]);
                self.prepare_ack(now, rng);
                self.link_at = None;

                {
                    let rx = self.rx.as_ref().unwrap();
                    ctx.events.prov_pdu(&rx.buf[..usize::from(rx.total_len)]);
                }
                self.rx_acked = true;
            }
        }
    }

    /// Ends the running TX transaction, advancing the local transaction number.
    ///
    /// Returns the opcode of the PDU that was being sent.
    fn end_tx_transaction(&mut self) -> Option<u8> {
        let opcode = self.tx.take().map(|tx| tx.buf[0]);
        self.tx_at = None;

        self.local_tran = match self.role {
            Role::Server => {
                if self.local_tran == 0xFF {
                    SR_TRAN_START
                } else {
                    self.local_tran + 1
                }
            }
            Role::Client => {
                if self.local_tran == 0x7F {
                    CL_TRAN_START
                } else {
                    self.local_tran + 1
                }
            }
        };

        opcode
    }

    fn tx_timer_fired<C: Config>(
        &mut self,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        let timed_out = match &self.tx {
            Some(tx) => tx.timeout_ms_left == 0,
            None => return,
        };
        if timed_out {
            self.close_internal(CloseReason::Timeout, false, ctx, now, rng);
            ctx.events.prov_send_timeout();
            return;
        }

        {
            let tx = self.tx.as_mut().unwrap();
            if tx.next_seg > tx.seg_n {
                // All segments sent and no ACK arrived: retransmit from segment zero.
                tx.next_seg = 0;
            }
        }

        self.send_next_segment(bearer, ctx);

        let tx = self.tx.as_mut().unwrap();
        let delay = if tx.next_seg > tx.seg_n {
            // Wait out the peer's maximum ACK delay, both ways.
            2 * TX_DELAY_MAX_MS
        } else {
            rand_range(rng, TX_DELAY_MIN_MS, TX_DELAY_MAX_MS)
        };
        tx.timeout_ms_left = tx.timeout_ms_left.saturating_sub(delay);
        self.tx_at = Some(now + Duration::from_millis(delay));
    }

    fn send_next_segment<C: Config>(&mut self, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>) {
        let iface = match self.adv_iface {
            Some(i) => i,
            None => return,
        };

        let mut frame: Vec<u8, 29> = Vec::new();
        {
            let tx = match &self.tx {
                Some(t) => t,
                None => return,
            };

            frame.extend_from_slice(&self.link_id.to_be_bytes()).unwrap();
            frame.push(self.local_tran).unwrap();

            if tx.next_seg == 0 {
                let seg_len = tx.buf.len().min(SEG0_CAP);
                frame.push(GPCF_START | (tx.seg_n << 2)).unwrap();
                frame
                    .extend_from_slice(&(tx.buf.len() as u16).to_be_bytes())
                    .unwrap();
                frame.push(fcs::fcs(&tx.buf)).unwrap();
                frame.extend_from_slice(&tx.buf[..seg_len]).unwrap();
            } else {
                let offset = SEG0_CAP + (usize::from(tx.next_seg) - 1) * SEGX_CAP;
                let seg_len = SEGX_CAP.min(tx.buf.len() - offset);
                frame.push(GPCF_CONTINUATION | (tx.next_seg << 2)).unwrap();
                frame.extend_from_slice(&tx.buf[offset..offset + seg_len]).unwrap();
            }
        }

        if bearer.send_prov(ctx.radio, iface, &frame, 0) {
            self.tx.as_mut().unwrap().next_seg += 1;
        }
    }

    fn sr_process_ctl<C: Config>(
        &mut self,
        link_id: u32,
        ctl: &[u8],
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        match ctl[0] >> 2 {
            OPCODE_LINK_OPEN => {
                if ctl.len() != LINK_OPEN_LEN || !self.unprov_beacon.matches(&ctl[1..17]) {
                    return;
                }

                if !self.link_open {
                    self.unprov_beacon.stop();

                    self.link_id = link_id;
                    self.link_open = true;
                    self.link_at = Some(now + LINK_TIMEOUT);
                    self.local_tran = SR_TRAN_START;
                    self.last_rx_opcode = None;

                    self.prepare_link_ack(now, rng);
                    ctx.events.link_opened();
                } else if self.link_id == link_id && self.last_rx_opcode.is_none() {
                    // The peer may have missed our Link Ack; answer again.
                    self.prepare_link_ack(now, rng);
                }
            }
            OPCODE_LINK_CLOSE => {
                if self.validates_link(link_id) && ctl.len() == LINK_CLOSE_LEN {
                    self.link_at = None;
                    self.ack_at = None;
                    let _ = self.end_tx_transaction();
                    self.rx = None;
                    self.link_open = false;
                    self.local_tran = 0;

                    ctx.events.link_closed(CloseReason::from_raw(ctl[1]), true);
                }
            }
            _ => {
                trace!("PB-ADV: invalid control opcode {}", ctl[0] >> 2);
            }
        }
    }

    fn cl_process_ctl<C: Config>(&mut self, link_id: u32, ctl: &[u8], ctx: &mut Context<'_, C>) {
        match ctl[0] >> 2 {
            OPCODE_LINK_ACK => {
                if !self.link_open && self.link_id == link_id && ctl.len() == LINK_ACK_LEN {
                    self.link_open = true;
                    self.target_uuid = None;
                    self.link_at = None;
                    self.local_tran = CL_TRAN_START;
                    self.last_rx_opcode = None;

                    ctx.events.link_opened();
                }
            }
            OPCODE_LINK_CLOSE => {
                if self.validates_link(link_id) && ctl.len() == LINK_CLOSE_LEN {
                    let _ = self.end_tx_transaction();
                    self.rx = None;
                    self.link_open = false;
                    self.target_uuid = None;
                    self.local_tran = 0;
                    self.link_at = None;
                    self.ack_at = None;

                    ctx.events.link_closed(CloseReason::from_raw(ctl[1]), true);
                }
            }
            _ => {
                trace!("PB-ADV: invalid control opcode {}", ctl[0] >> 2);
            }
        }
    }

    fn close_internal<C: Config>(
        &mut self,
        reason: CloseReason,
        silent: bool,
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        if !self.link_open && self.gatt_iface.is_none() {
            return;
        }

        self.rx = None;
        // A pending transaction ACK stays armed; the Link Close is anchored behind it.
        self.link_at = None;

        if self.link_open {
            let _ = self.end_tx_transaction();

            if !silent {
                self.prepare_link_close(reason, now, rng);
            }

            self.link_open = false;
            self.local_tran = 0;
        } else if let Some(iface) = self.gatt_iface.take() {
            // The host owns the GATT connection; ask it to tear the link down.
            ctx.events.disconnect_request(iface);
        }
    }

    fn ctl_retry_fired<C: Config>(
        &mut self,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
        rng: &mut C::Rng,
    ) {
        let retry = match self.ctl_retry.take() {
            Some(r) => r,
            None => return,
        };

        match retry.pdu {
            CtlPdu::LinkAck => self.send_link_ack(bearer, ctx),
            CtlPdu::LinkClose(reason) => self.send_link_close(reason, bearer, ctx),
        }

        if retry.retries_left > 0 {
            let delay = rand_range(rng, TX_DELAY_MIN_MS, TX_DELAY_MAX_MS);
            self.ctl_retry = Some(CtlRetry {
                pdu: retry.pdu,
                retries_left: retry.retries_left - 1,
                at: now + Duration::from_millis(delay),
            });
        }
    }

    fn prepare_link_ack(&mut self, now: Instant, rng: &mut impl rand_core::RngCore) {
        let delay = rand_range(rng, TX_DELAY_MIN_MS, TX_DELAY_MAX_MS);
        self.ctl_retry = Some(CtlRetry {
            pdu: CtlPdu::LinkAck,
            retries_left: CTL_RETRY_COUNT,
            at: now + Duration::from_millis(delay),
        });
    }

    fn prepare_link_close(&mut self, reason: CloseReason, now: Instant, rng: &mut impl rand_core::RngCore) {
        let delay = rand_range(rng, TX_DELAY_MIN_MS, TX_DELAY_MAX_MS);
        // Anchor behind a pending transaction ACK so the Close cannot overtake it.
        let base = match self.ack_at {
            Some(at) => at,
            None => now,
        };
        self.ctl_retry = Some(CtlRetry {
            pdu: CtlPdu::LinkClose(reason),
            retries_left: CTL_RETRY_COUNT,
            at: base + Duration::from_millis(delay),
        });
    }

    fn prepare_ack(&mut self, now: Instant, rng: &mut impl rand_core::RngCore) {
        let delay = rand_range(rng, TX_DELAY_MIN_MS, TX_DELAY_MAX_MS);
        self.ack_at = Some(now + Duration::from_millis(delay));
    }

    fn send_ack<C: Config>(&mut self, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>) {
        let iface = match self.adv_iface {
            Some(i) => i,
            None => return,
        };
        let mut frame: Vec<u8, 29> = Vec::new();
        frame.extend_from_slice(&self.link_id.to_be_bytes()).unwrap();
        frame.push(self.peer_tran).unwrap();
        frame.push(GPCF_ACK).unwrap();
        bearer.send_prov(ctx.radio, iface, &frame, 0);
    }

    fn send_link_open<C: Config>(&mut self, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>) {
        let (iface, uuid) = match (self.adv_iface, &self.target_uuid) {
            (Some(i), Some(u)) => (i, *u),
            _ => return,
        };
        let mut frame: Vec<u8, 29> = Vec::new();
        frame.extend_from_slice(&self.link_id.to_be_bytes()).unwrap();
        frame.push(0x00).unwrap();
        frame.push(GPCF_CONTROL | (OPCODE_LINK_OPEN << 2)).unwrap();
        frame.extend_from_slice(uuid.as_bytes()).unwrap();
        bearer.send_prov(ctx.radio, iface, &frame, 0);
    }

    fn send_link_ack<C: Config>(&mut self, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>) {
        let iface = match self.adv_iface {
            Some(i) => i,
            None => return,
        };
        let mut frame: Vec<u8, 29> = Vec::new();
        frame.extend_from_slice(&self.link_id.to_be_bytes()).unwrap();
        frame.push(0x00).unwrap();
        frame.push(GPCF_CONTROL | (OPCODE_LINK_ACK << 2)).unwrap();
        bearer.send_prov(ctx.radio, iface, &frame, 0);
    }

    fn send_link_close<C: Config>(
        &mut self,
        reason: CloseReason,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
    ) {
        let iface = match self.adv_iface {
            Some(i) => i,
            None => return,
        };
        let mut frame: Vec<u8, 29> = Vec::new();
        frame.extend_from_slice(&self.link_id.to_be_bytes()).unwrap();
        frame.push(0x00).unwrap();
        frame.push(GPCF_CONTROL | (OPCODE_LINK_CLOSE << 2)).unwrap();
        frame.push(reason as u8).unwrap();
        bearer.send_prov(ctx.radio, iface, &frame, 0);
    }
}
