//! The GATT bearer interface with segmentation and reassembly (SAR).
//!
//! Every PDU exchanged over a GATT connection starts with a one-octet header:
//!
//! ```notrust
//! MSB                    LSB
//! +---------+--------------+
//! |   SAR   |   PDU type   |
//! | (2 bits)|   (6 bits)   |
//! +---------+--------------+
//! ```
//!
//! `SAR` encodes Complete=0 / First=1 / Continuation=2 / Last=3; the PDU type selects the
//! consumer and its reassembly size limit. A connection only ever reassembles one PDU at a time
//! and is closed on any protocol violation, including a reassembly that takes longer than 20
//! seconds.

use crate::bearer::{BearerEvent, FrameSource, InterfaceId};
use crate::config::Radio;
use crate::time::{Duration, Instant};
use heapless::{Deque, Vec};

/// Depth of the per-connection transmit queue.
pub const GATT_QUEUE_DEPTH: usize = 5;

/// Largest PDU that can be reassembled on a GATT connection (proxy configuration).
pub const GATT_MAX_PDU: usize = 66;

/// Reassembly deadline per connection.
pub const GATT_RX_TIMEOUT: Duration = Duration::from_secs(20);

/// SAR field values (high 2 bits of the header octet).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Sar {
    Complete = 0,
    First = 1,
    Continuation = 2,
    Last = 3,
}

impl Sar {
    fn from_raw(raw: u8) -> Self {
        match raw & 0x03 {
            0 => Sar::Complete,
            1 => Sar::First,
            2 => Sar::Continuation,
            _ => Sar::Last,
        }
    }
}

/// PDU type carried in the low 6 bits of the header octet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GattPduType {
    Network = 0x00,
    Beacon = 0x01,
    ProxyConfig = 0x02,
    Provisioning = 0x03,
}

impl GattPduType {
    /// Decodes the 6-bit type field; RFU values yield `None` and the message is ignored.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw & 0x3F {
            0x00 => Some(GattPduType::Network),
            0x01 => Some(GattPduType::Beacon),
            0x02 => Some(GattPduType::ProxyConfig),
            0x03 => Some(GattPduType::Provisioning),
            _ => None,
        }
    }

    /// Maximum reassembled PDU length for this type.
    pub fn max_len(&self) -> usize {
        match self {
            GattPduType::Network => 29,
            GattPduType::Beacon => 22,
            GattPduType::ProxyConfig => GATT_MAX_PDU,
            GattPduType::Provisioning => GATT_MAX_PDU,
        }
    }

    fn header(&self, sar: Sar) -> u8 {
        ((sar as u8) << 6) | (*self as u8)
    }
}

/// Result of feeding one inbound GATT frame into the interface.
pub enum GattRx {
    /// Frame consumed (reassembly in progress, or silently ignored).
    None,
    /// A full PDU is available.
    Complete {
        pdu_type: GattPduType,
        pdu: Vec<u8, GATT_MAX_PDU>,
    },
    /// Protocol violation; the connection must be closed.
    Error,
}

struct Reassembly {
    pdu_type: GattPduType,
    buf: Vec<u8, GATT_MAX_PDU>,
    deadline: Instant,
}

struct QueuedFrame {
    frame: Vec<u8, { GATT_MAX_PDU + 1 }>,
    /// Present on Complete and Last segments; the sender's reference is released when the frame
    /// is handed to the radio.
    notify: Option<FrameSource>,
}

/// State of one GATT connection acting as a mesh bearer interface.
pub struct GattInterface {
    mtu: u16,
    rx: Option<Reassembly>,
    queue: Deque<QueuedFrame, GATT_QUEUE_DEPTH>,
    busy: bool,
}

impl GattInterface {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            rx: None,
            queue: Deque::new(),
            busy: false,
        }
    }

    /// Usable payload octets per frame, after the SAR/type header.
    fn seg_capacity(&self) -> usize {
        usize::from(self.mtu).saturating_sub(1).max(1)
    }

    /// Enqueues a PDU, segmenting when it does not fit the connection MTU.
    ///
    /// Returns `false` when the PDU is oversized for its type or the queue cannot hold all
    /// segments that need queueing.
    pub fn send<R: Radio, const N: usize>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        pdu_type: GattPduType,
        payload: &[u8],
        source: FrameSource,
        events: &mut Deque<BearerEvent, N>,
    ) -> bool {
        if payload.is_empty() || payload.len() > pdu_type.max_len() {
            return false;
        }

        if payload.len() + 1 <= usize::from(self.mtu) {
            // Single Complete frame.
            let frame = Self::frame(pdu_type.header(Sar::Complete), payload);
            if !self.busy {
                radio.transmit(id, &frame);
                self.busy = true;
                let _ = events.push_back(BearerEvent::Processed { iface: id, source });
                return true;
            }
            return self
                .queue
                .push_back(QueuedFrame {
                    frame,
                    notify: Some(source),
                })
                .is_ok();
        }

        self.send_segmented(radio, id, pdu_type, payload, source)
    }

    fn send_segmented<R: Radio>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        pdu_type: GattPduType,
        payload: &[u8],
        source: FrameSource,
    ) -> bool {
        let cap = self.seg_capacity();
        let segments = (payload.len() + cap - 1) / cap;

        // Every segment except a first one that can go straight to the radio needs a queue slot.
        let needed = if self.busy { segments } else { segments - 1 };
        if self.queue.len() + needed > GATT_QUEUE_DEPTH {
            trace!("GATT bearer: cannot queue {} segments on {:?}", needed, id);
            return false;
        }

        let mut offset = 0;
        while offset < payload.len() {
            let len = cap.min(payload.len() - offset);
            let sar = if offset == 0 {
                Sar::First
            } else if offset + len >= payload.len() {
                Sar::Last
            } else {
                Sar::Continuation
            };
            let frame = Self::frame(pdu_type.header(sar), &payload[offset..offset + len]);

            if offset == 0 && !self.busy {
                radio.transmit(id, &frame);
                self.busy = true;
            } else {
                let notify = if sar == Sar::Last { Some(source) } else { None };
                self.queue.push_back(QueuedFrame { frame, notify }).ok().unwrap();
            }

            offset += len;
        }

        true
    }

    fn frame(header: u8, payload: &[u8]) -> Vec<u8, { GATT_MAX_PDU + 1 }> {
        let mut frame = Vec::new();
        frame.push(header).unwrap();
        frame.extend_from_slice(payload).unwrap();
        frame
    }

    /// Handles the host's readiness signal and transmits the next queued frame.
    pub fn signal_ready<R: Radio, const N: usize>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        events: &mut Deque<BearerEvent, N>,
    ) {
        self.busy = false;

        if let Some(entry) = self.queue.pop_front() {
            radio.transmit(id, &entry.frame);
            self.busy = true;
            if let Some(source) = entry.notify {
                let _ = events.push_back(BearerEvent::Processed { iface: id, source });
            }
        }
    }

    /// Feeds an inbound frame (starting with the SAR/type octet) into the RX state machine.
    pub fn process_frame(&mut self, frame: &[u8], now: Instant) -> GattRx {
        if frame.len() <= 1 {
            return GattRx::Error;
        }

        let pdu_type = match GattPduType::from_raw(frame[0]) {
            Some(t) => t,
            // RFU message type: ignore.
            None => return GattRx::None,
        };
        let sar = Sar::from_raw(frame[0] >> 6);
        let payload = &frame[1..];

        let rx = match self.rx.take() {
            None => {
                // No transaction pending: expect a full PDU or a first segment.
                return match sar {
                    Sar::Complete => {
                        if payload.len() <= pdu_type.max_len() {
                            let mut pdu = Vec::new();
                            pdu.extend_from_slice(payload).unwrap();
                            GattRx::Complete { pdu_type, pdu }
                        } else {
                            GattRx::Error
                        }
                    }
                    Sar::First => {
                        // A first segment equal to the allowed maximum cannot be continued.
                        if payload.len() < pdu_type.max_len() {
                            let mut buf = Vec::new();
                            buf.extend_from_slice(payload).unwrap();
                            self.rx = Some(Reassembly {
                                pdu_type,
                                buf,
                                deadline: now + GATT_RX_TIMEOUT,
                            });
                            GattRx::None
                        } else {
                            GattRx::Error
                        }
                    }
                    Sar::Continuation | Sar::Last => GattRx::Error,
                };
            }
            Some(rx) => rx,
        };

        // Transaction pending: the type must match and the buffer must not overflow.
        if pdu_type != rx.pdu_type || rx.buf.len() + payload.len() > pdu_type.max_len() {
            return GattRx::Error;
        }

        let mut rx = rx;
        match sar {
            Sar::Continuation => {
                rx.buf.extend_from_slice(payload).unwrap();
                self.rx = Some(rx);
                GattRx::None
            }
            Sar::Last => {
                rx.buf.extend_from_slice(payload).unwrap();
                GattRx::Complete {
                    pdu_type: rx.pdu_type,
                    pdu: rx.buf,
                }
            }
            Sar::Complete | Sar::First => GattRx::Error,
        }
    }

    /// Returns `true` when the reassembly deadline has expired and the connection must close.
    pub fn poll(&mut self, now: Instant) -> bool {
        match &self.rx {
            Some(rx) if rx.deadline.is_at_or_before(now) => {
                self.rx = None;
                true
            }
            _ => false,
        }
    }

    /// The earliest instant at which `poll` needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.rx.as_ref().map(|rx| rx.deadline)
    }

    /// Drains the queue without transmitting, reporting Complete/Last entries as processed.
    pub fn drain<const N: usize>(&mut self, id: InterfaceId, events: &mut Deque<BearerEvent, N>) {
        while let Some(entry) = self.queue.pop_front() {
            if let Some(source) = entry.notify {
                let _ = events.push_back(BearerEvent::Processed { iface: id, source });
            }
        }
        self.rx = None;
        self.busy = false;
    }
}
