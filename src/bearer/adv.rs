//! The advertising bearer interface.
//!
//! Outgoing PDUs are framed with a one-byte AD length prefix and a one-byte AD type and handed to
//! the host radio one at a time. The interface keeps a FIFO of pending frames; the frame at the
//! head of the queue is the one currently in flight. When the host signals readiness, the head is
//! reported as processed (releasing the sender's reference) and the next frame goes out.
//!
//! The interface performs no retransmission of its own; retransmission belongs to the network
//! pipeline.

use crate::bearer::{AdType, BearerEvent, FrameSource, InterfaceId};
use crate::config::Radio;
use heapless::{Deque, Vec};

/// Depth of the per-interface transmit queue.
pub const ADV_QUEUE_DEPTH: usize = 10;

/// Maximum framed PDU size on the advertising bearer (AD length + AD type + payload).
pub const ADV_MAX_FRAME: usize = 31;

/// Maximum payload size after framing overhead.
pub const ADV_MAX_PAYLOAD: usize = ADV_MAX_FRAME - 2;

/// One queued outgoing frame.
struct QueuedFrame {
    ad_type: AdType,
    payload: Vec<u8, ADV_MAX_PAYLOAD>,
    source: FrameSource,
}

/// State of one advertising interface.
pub struct AdvInterface {
    queue: Deque<QueuedFrame, ADV_QUEUE_DEPTH>,
    busy: bool,
}

impl AdvInterface {
    pub fn new() -> Self {
        Self {
            queue: Deque::new(),
            busy: false,
        }
    }

    /// Enqueues a PDU and transmits it immediately if the interface is idle.
    ///
    /// Returns `false` if the payload is oversized or the queue is full; the caller keeps
    /// ownership of the PDU in that case and no processed event will fire for it.
    pub fn send<R: Radio>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        ad_type: AdType,
        payload: &[u8],
        source: FrameSource,
    ) -> bool {
        if payload.is_empty() || payload.len() > ADV_MAX_PAYLOAD {
            trace!("ADV bearer: rejecting PDU of length {}", payload.len());
            return false;
        }

        let mut copy = Vec::new();
        copy.extend_from_slice(payload).unwrap();
        let frame = QueuedFrame {
            ad_type,
            payload: copy,
            source,
        };

        if self.queue.push_back(frame).is_err() {
            trace!("ADV bearer: queue full on {:?}", id);
            return false;
        }

        if !self.busy {
            // The new frame is the only one in the queue; it stays at the head while in flight.
            self.transmit_head(radio, id);
        }

        true
    }

    /// Handles the host's readiness signal: reports the in-flight frame as processed and starts
    /// the next transmission.
    pub fn signal_ready<R: Radio, const N: usize>(
        &mut self,
        radio: &mut R,
        id: InterfaceId,
        events: &mut Deque<BearerEvent, N>,
    ) {
        if let Some(sent) = self.queue.pop_front() {
            let _ = events.push_back(BearerEvent::Processed {
                iface: id,
                source: sent.source,
            });
        }

        if self.queue.is_empty() {
            self.busy = false;
        } else {
            self.transmit_head(radio, id);
        }
    }

    /// Drains the queue without transmitting, reporting every entry as processed.
    ///
    /// Used when the interface closes so that reference counts of undelivered PDUs still reach
    /// zero.
    pub fn drain<const N: usize>(&mut self, id: InterfaceId, events: &mut Deque<BearerEvent, N>) {
        while let Some(entry) = self.queue.pop_front() {
            let _ = events.push_back(BearerEvent::Processed {
                iface: id,
                source: entry.source,
            });
        }
        self.busy = false;
    }

    fn transmit_head<R: Radio>(&mut self, radio: &mut R, id: InterfaceId) {
        let head = match self.queue.front() {
            Some(f) => f,
            None => return,
        };

        let mut frame: Vec<u8, ADV_MAX_FRAME> = Vec::new();
        frame.push(head.payload.len() as u8 + 1).unwrap();
        frame.push(head.ad_type.raw()).unwrap();
        frame.extend_from_slice(&head.payload).unwrap();

        radio.transmit(id, &frame);
        self.busy = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::RawKind;

    struct RecRadio(std::vec::Vec<std::vec::Vec<u8>>);

    impl Radio for RecRadio {
        fn transmit(&mut self, _iface: InterfaceId, frame: &[u8]) {
            self.0.push(frame.to_vec());
        }
    }

    fn raw_source() -> FrameSource {
        FrameSource::Raw(RawKind::Prov { opcode: 0 })
    }

    #[test]
    fn frames_with_ad_header() {
        let mut radio = RecRadio(std::vec::Vec::new());
        let mut adv = AdvInterface::new();
        let id = InterfaceId::adv(0);

        assert!(adv.send(&mut radio, id, AdType::MeshMessage, &[0xAA, 0xBB], raw_source()));
        assert_eq!(radio.0.len(), 1);
        assert_eq!(radio.0[0], &[0x03, 0x2A, 0xAA, 0xBB]);
    }

    #[test]
    fn serializes_transmissions() {
        let mut radio = RecRadio(std::vec::Vec::new());
        let mut events: Deque<BearerEvent, 16> = Deque::new();
        let mut adv = AdvInterface::new();
        let id = InterfaceId::adv(0);

        assert!(adv.send(&mut radio, id, AdType::MeshMessage, &[1], raw_source()));
        assert!(adv.send(&mut radio, id, AdType::MeshBeacon, &[2], raw_source()));
        // Second frame is queued, not transmitted.
        assert_eq!(radio.0.len(), 1);

        adv.signal_ready(&mut radio, id, &mut events);
        assert_eq!(radio.0.len(), 2);
        assert_eq!(radio.0[1], &[0x02, 0x2B, 0x02]);
        // One processed event for the first frame.
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn rejects_oversize_and_overflow() {
        let mut radio = RecRadio(std::vec::Vec::new());
        let mut adv = AdvInterface::new();
        let id = InterfaceId::adv(0);

        assert!(!adv.send(&mut radio, id, AdType::MeshMessage, &[0; 30], raw_source()));

        for _ in 0..ADV_QUEUE_DEPTH {
            assert!(adv.send(&mut radio, id, AdType::MeshMessage, &[0; 8], raw_source()));
        }
        assert!(!adv.send(&mut radio, id, AdType::MeshMessage, &[0; 8], raw_source()));
    }

    #[test]
    fn drain_reports_all_entries() {
        let mut radio = RecRadio(std::vec::Vec::new());
        let mut events: Deque<BearerEvent, 16> = Deque::new();
        let mut adv = AdvInterface::new();
        let id = InterfaceId::adv(0);

        for _ in 0..4 {
            assert!(adv.send(&mut radio, id, AdType::MeshMessage, &[0; 8], raw_source()));
        }
        adv.drain(id, &mut events);
        assert_eq!(events.len(), 4);
    }
}
