//! Unprovisioned device beacons.
//!
//! While a device awaits provisioning over PB-ADV it broadcasts its device UUID:
//!
//! ```notrust
//! +----------+------------+---------------+-------------------+
//! |   type   |    uuid    |   OOB info    |  URI hash (opt.)  |
//! | (1) 0x00 |    (16)    |    (2, BE)    |        (4)        |
//! +----------+------------+---------------+-------------------+
//! ```
//!
//! The optional URI hash is the first four octets of `s1(uri)`, computed by the security engine;
//! beaconing starts once the hash arrives. Stopping the beacon while the hash is still being
//! computed discards the result.

use crate::bearer::{BearerDispatch, InterfaceId};
use crate::config::{Config, Context};
use crate::security::SecurityEngine;
use crate::time::{Duration, Instant};
use heapless::Vec;
use uuid::Uuid;

/// Beacon length without the URI hash.
pub const UNPROV_BEACON_LEN: usize = 19;

/// Beacon length with the URI hash.
pub const UNPROV_BEACON_URI_LEN: usize = 23;

const UUID_OFFSET: usize = 1;
const OOB_OFFSET: usize = 17;
const URI_HASH_OFFSET: usize = 19;
const URI_HASH_LEN: usize = 4;

/// Broadcaster state for the unprovisioned device beacon.
pub struct UnprovBeacon {
    /// Beacon frame; empty while beaconing is stopped.
    pdu: Vec<u8, UNPROV_BEACON_URI_LEN>,
    iface: InterfaceId,
    interval: Duration,
    next_at: Option<Instant>,
    /// Set while the URI hash is outstanding at the crypto engine.
    hash_pending: bool,
}

impl UnprovBeacon {
    pub fn new() -> Self {
        Self {
            pdu: Vec::new(),
            iface: InterfaceId::INVALID,
            interval: Duration::from_millis(0),
            next_at: None,
            hash_pending: false,
        }
    }

    /// Starts beaconing on `iface` with the given period.
    ///
    /// With a URI present, the first beacon goes out once the hash computation completes.
    pub fn start<C: Config>(
        &mut self,
        iface: InterfaceId,
        interval: Duration,
        uuid: &Uuid,
        oob_info: u16,
        uri: Option<&[u8]>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
    ) {
        self.next_at = None;
        self.iface = iface;
        self.interval = interval;

        self.pdu.clear();
        self.pdu.push(crate::bearer::BEACON_TYPE_UNPROVISIONED).unwrap();
        self.pdu.extend_from_slice(uuid.as_bytes()).unwrap();
        self.pdu.extend_from_slice(&oob_info.to_be_bytes()).unwrap();

        match uri {
            None => {
                self.broadcast(bearer, ctx, now);
            }
            Some(uri) => {
                self.pdu.resize(UNPROV_BEACON_URI_LEN, 0).unwrap();
                if ctx.crypto.s1(uri).is_ok() {
                    self.hash_pending = true;
                } else {
                    trace!("prov beacon: URI hash request failed");
                    self.pdu.clear();
                }
            }
        }
    }

    /// Completion of the URI hash computation.
    pub fn on_s1_done<C: Config>(
        &mut self,
        hash: Option<[u8; 16]>,
        bearer: &mut BearerDispatch,
        ctx: &mut Context<'_, C>,
        now: Instant,
    ) {
        if !self.hash_pending {
            return;
        }
        self.hash_pending = false;

        // The beacon may have been stopped while the hash was being computed.
        if self.pdu.is_empty() {
            return;
        }

        match hash {
            Some(hash) => {
                self.pdu[URI_HASH_OFFSET..URI_HASH_OFFSET + URI_HASH_LEN]
                    .copy_from_slice(&hash[..URI_HASH_LEN]);
                self.broadcast(bearer, ctx, now);
            }
            None => {
                trace!("prov beacon: URI hash failed");
                self.pdu.clear();
            }
        }
    }

    /// Stops beaconing.
    pub fn stop(&mut self) {
        self.pdu.clear();
        self.next_at = None;
    }

    /// Returns whether `uuid` equals the UUID being beaconed.
    pub fn matches(&self, uuid: &[u8]) -> bool {
        self.pdu.len() >= OOB_OFFSET && &self.pdu[UUID_OFFSET..OOB_OFFSET] == uuid
    }

    pub fn is_active(&self) -> bool {
        !self.pdu.is_empty()
    }

    /// Re-broadcasts when the beacon period elapsed.
    pub fn poll<C: Config>(&mut self, now: Instant, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>) {
        if let Some(at) = self.next_at {
            if at.is_at_or_before(now) {
                self.broadcast(bearer, ctx, now);
            }
        }
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.next_at
    }

    fn broadcast<C: Config>(&mut self, bearer: &mut BearerDispatch, ctx: &mut Context<'_, C>, now: Instant) {
        if self.pdu.is_empty() {
            return;
        }
        bearer.send_unprov_beacon(ctx.radio, self.iface, &self.pdu);
        self.next_at = Some(now + self.interval);
    }
}
